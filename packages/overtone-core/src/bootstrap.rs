//! Application bootstrap and dependency wiring.
//!
//! The composition root: the single place where the catalog client, the
//! renderer backend, the coordinator, the fanout and the beacon are
//! instantiated and wired together. Background tasks (beacon, notify loop,
//! renderer monitor, track-ended forwarder) are spawned separately through
//! [`BootstrappedServices::start_background_tasks`] so construction itself
//! never needs a runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, PollTracker};
use crate::beacon::DiscoveryBeacon;
use crate::catalog::{Catalog, CatalogClient};
use crate::coordinator::PlaybackCoordinator;
use crate::error::BridgeResult;
use crate::fanout::SubscriptionManager;
use crate::protocol_constants::CATALOG_TIMEOUT_SECS;
use crate::renderer::upnp::UpnpRenderer;
use crate::renderer::{Renderer, RendererEvent};
use crate::state::{Config, DeviceIdentity, RendererBackend};

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// Serializes every playback command.
    pub coordinator: Arc<PlaybackCoordinator>,
    /// Subscriber registry and notification fanout.
    pub subscriptions: Arc<SubscriptionManager>,
    /// Long-poll waiter bookkeeping.
    pub poll_tracker: Arc<PollTracker>,
    /// Identity announced to controllers.
    pub identity: Arc<DeviceIdentity>,
    /// Cancellation token observed by every background loop.
    pub cancel_token: CancellationToken,
    /// Companion port the protocol server should bind.
    pub companion_port: u16,

    notify_interval: Duration,
    renderer_backend: Arc<UpnpRenderer>,
    beacon: Mutex<Option<DiscoveryBeacon>>,
    renderer_events: Mutex<Option<mpsc::Receiver<RendererEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BootstrappedServices {
    /// Builds the state handed to the protocol server.
    pub fn app_state(&self) -> AppState {
        AppState {
            coordinator: Arc::clone(&self.coordinator),
            subscriptions: Arc::clone(&self.subscriptions),
            poll_tracker: Arc::clone(&self.poll_tracker),
            identity: Arc::clone(&self.identity),
        }
    }

    /// Spawns the beacon, the notify loop, the renderer monitor and the
    /// track-ended forwarder. Must run inside a tokio runtime; idempotent
    /// only in the sense that later calls find nothing left to start.
    pub fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();

        if let Some(beacon) = self.beacon.lock().take() {
            let cancel = self.cancel_token.clone();
            tasks.push(tokio::spawn(beacon.run(cancel)));
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let interval = self.notify_interval;
        let cancel = self.cancel_token.clone();
        tasks.push(tokio::spawn(subscriptions.run(interval, cancel)));

        self.renderer_backend.start_monitor();

        if let Some(mut events) = self.renderer_events.lock().take() {
            let coordinator = Arc::clone(&self.coordinator);
            let cancel = self.cancel_token.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Some(RendererEvent::TrackEnded) => coordinator.auto_next().await,
                            None => break,
                        },
                    }
                }
            }));
        }

        log::info!("Background tasks started");
    }

    /// Initiates graceful shutdown of all services.
    ///
    /// Cancels the token (the beacon broadcasts its farewell on the way
    /// out), stops and kills the renderer, then joins the background
    /// loops. The protocol server drains on the same token.
    pub async fn shutdown(&self) {
        log::info!("Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.coordinator.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }
        log::info!("Shutdown complete");
    }
}

/// Creates the shared HTTP client for catalog, subscriber and renderer
/// traffic. A single client pools connections across all three.
fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(CATALOG_TIMEOUT_SECS))
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all services with their dependencies.
///
/// Wiring order follows the dependency chain: shared infrastructure, then
/// catalog and renderer, then the coordinator that owns both, then the
/// fanout and beacon that observe the coordinator.
pub fn bootstrap_services(config: &Config) -> BridgeResult<BootstrappedServices> {
    let http_client = create_http_client();
    let cancel_token = CancellationToken::new();
    let identity = Arc::new(config.identity.clone());

    let catalog = Arc::new(CatalogClient::new(http_client.clone()));

    let RendererBackend::Upnp { device_ip } = &config.renderer;
    let (renderer_backend, renderer_events) = UpnpRenderer::new(
        http_client.clone(),
        device_ip.clone(),
        config.monitor_interval_ms,
        cancel_token.clone(),
    );

    let coordinator = Arc::new(PlaybackCoordinator::new(
        Arc::clone(&renderer_backend) as Arc<dyn Renderer>,
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        config.rewrite.clone(),
    ));

    let subscriptions = Arc::new(SubscriptionManager::new(
        Arc::clone(&coordinator),
        catalog as Arc<dyn Catalog>,
        http_client,
        config.identity.clone(),
    ));

    let beacon = DiscoveryBeacon::new(&config.identity, config.beacon_port, config.companion_port);

    Ok(BootstrappedServices {
        coordinator,
        subscriptions,
        poll_tracker: Arc::new(PollTracker::new()),
        identity,
        cancel_token,
        companion_port: config.companion_port,
        notify_interval: Duration::from_millis(config.notify_interval_ms),
        renderer_backend,
        beacon: Mutex::new(Some(beacon)),
        renderer_events: Mutex::new(Some(renderer_events)),
        tasks: Mutex::new(Vec::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::for_renderer(RendererBackend::Upnp {
            device_ip: "192.168.1.50".to_string(),
        })
    }

    #[test]
    fn bootstrap_wires_all_services() {
        let services = bootstrap_services(&config()).unwrap();
        assert_eq!(services.companion_port, config().companion_port);
        assert!(!services.cancel_token.is_cancelled());
        assert_eq!(services.subscriptions.subscriber_count(), 0);

        let state = services.app_state();
        assert_eq!(state.identity.client_id, services.identity.client_id);
    }

    #[test]
    fn cancellation_reaches_background_tasks() {
        let services = bootstrap_services(&config()).unwrap();
        let observer = services.cancel_token.child_token();
        services.cancel_token.cancel();
        assert!(observer.is_cancelled());
    }
}
