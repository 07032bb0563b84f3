//! Core configuration types.
//!
//! [`Config`] carries everything the bridge needs at runtime: the identity it
//! announces to controllers, the two listening ports, the background task
//! intervals, and the renderer backend selection. The headless server binary
//! builds one of these from its own YAML/CLI configuration.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{DEFAULT_BEACON_PORT, DEFAULT_COMPANION_PORT};

/// Identity the bridge announces on the beacon, the device descriptor and
/// every response header set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human-readable name shown in controller device pickers.
    pub title: String,
    /// Product name reported to controllers.
    pub product: String,
    /// Platform string reported to controllers.
    pub platform: String,
    /// Platform version reported to controllers.
    pub platform_version: String,
    /// Bridge version reported to controllers.
    pub version: String,
    /// Stable client identifier; controllers key subscriptions on it.
    pub client_id: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        let title = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "Player".to_string());
        Self {
            title,
            product: "Overtone Bridge".to_string(),
            platform: std::env::consts::OS.to_string(),
            platform_version: env!("CARGO_PKG_VERSION").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Which renderer backend to drive, selected at startup.
///
/// One implementation per backend behind the fixed [`Renderer`] contract;
/// there is no runtime backend switching.
///
/// [`Renderer`]: crate::renderer::Renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RendererBackend {
    /// A standard UPnP AVTransport/RenderingControl device.
    Upnp {
        /// IP address of the renderer device.
        device_ip: String,
    },
}

/// Per-renderer URL rewrite rules.
///
/// Some devices cannot speak TLS or resolve the catalog server's advertised
/// host; media URLs handed to the renderer are rewritten accordingly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteRules {
    /// Force `http` as the scheme of media URLs.
    #[serde(default)]
    pub rewrite_http: bool,
    /// Replace the host of media URLs with this address.
    #[serde(default)]
    pub rewrite_host: Option<String>,
}

/// Configuration for the bridge.
///
/// All fields have sensible defaults except the renderer backend, which the
/// caller must select explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity announced to controllers.
    #[serde(default)]
    pub identity: DeviceIdentity,

    /// Port for the companion HTTP surface.
    pub companion_port: u16,

    /// Local port the discovery beacon binds.
    pub beacon_port: u16,

    /// Interval between subscriber notification ticks (milliseconds).
    pub notify_interval_ms: u64,

    /// Interval the renderer monitor polls transport state at (milliseconds).
    pub monitor_interval_ms: u64,

    /// Renderer backend selection.
    pub renderer: RendererBackend,

    /// Media URL rewrite rules applied before handing URLs to the renderer.
    #[serde(default)]
    pub rewrite: RewriteRules,
}

impl Config {
    /// Creates a configuration with defaults for the given renderer backend.
    pub fn for_renderer(renderer: RendererBackend) -> Self {
        Self {
            identity: DeviceIdentity::default(),
            companion_port: DEFAULT_COMPANION_PORT,
            beacon_port: DEFAULT_BEACON_PORT,
            notify_interval_ms: 500,
            monitor_interval_ms: 300,
            renderer,
            rewrite: RewriteRules::default(),
        }
    }
}
