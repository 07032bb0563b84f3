//! Subscriber registry and notification fanout.
//!
//! Controllers that subscribe receive a timeline document on every tick of
//! the notify loop; the upstream catalog server receives a level-triggered
//! report while playing and exactly one stop notification per
//! playing-to-stopped transition. Subscribers that fail delivery are dropped
//! on the spot, so the registry heals itself without bookkeeping.
//!
//! The long-poll channel shares two flags with this module: the
//! `is_playing` flag flipped by every rendered snapshot, and the
//! stop-to-web edge flag that makes sure web controllers see one stopped
//! timeline per transition (independent of the upstream edge flag).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::coordinator::{PlaybackCoordinator, StateSnapshot, UpstreamSnapshot};
use crate::protocol_constants::{HEADER_CLIENT_ID, SUBSCRIBER_TIMELINE_PATH, SUBSCRIBER_TIMEOUT_SECS};
use crate::state::DeviceIdentity;
use crate::timeline::{TimelineSnapshot, TransportState};

/// A controller registered for timeline pushes.
///
/// Identity key is the client id; controllers that never sent one are keyed
/// (and removable) by host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub id: String,
    pub command_id: u64,
}

impl Subscriber {
    fn timeline_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, SUBSCRIBER_TIMELINE_PATH
        )
    }
}

/// What the upstream notification step should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamAction {
    /// Nothing to report (stop edge already delivered).
    Skip,
    /// First tick after the transition to stopped: send once.
    SendStopped,
    /// Playing or paused: report every tick.
    SendPlaying,
}

/// Picks the upstream action for a tick.
///
/// Edge-triggered for stopped, level-triggered otherwise.
fn decide_upstream(state: TransportState, stop_already_sent: bool) -> UpstreamAction {
    if state == TransportState::Stopped {
        if stop_already_sent {
            UpstreamAction::Skip
        } else {
            UpstreamAction::SendStopped
        }
    } else {
        UpstreamAction::SendPlaying
    }
}

/// Whether a delivery outcome disqualifies the subscriber.
fn drops_subscriber(status: Option<reqwest::StatusCode>) -> bool {
    match status {
        None => true,
        Some(status) => !status.is_success(),
    }
}

/// Maintains the subscriber set and runs the periodic notification loop.
pub struct SubscriptionManager {
    subscribers: DashMap<String, Subscriber>,
    coordinator: Arc<PlaybackCoordinator>,
    catalog: Arc<dyn Catalog>,
    http: Client,
    identity: DeviceIdentity,
    is_playing: AtomicBool,
    stop_to_web_sent: AtomicBool,
    stop_to_server_sent: AtomicBool,
    last_upstream: Mutex<Vec<(String, String)>>,
}

impl SubscriptionManager {
    /// Creates the manager. The notify loop is started separately through
    /// [`run`](Self::run).
    pub fn new(
        coordinator: Arc<PlaybackCoordinator>,
        catalog: Arc<dyn Catalog>,
        http: Client,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            subscribers: DashMap::new(),
            coordinator,
            catalog,
            http,
            identity,
            is_playing: AtomicBool::new(false),
            // signal stop once per transition; starts in the delivered state
            stop_to_web_sent: AtomicBool::new(true),
            stop_to_server_sent: AtomicBool::new(true),
            last_upstream: Mutex::new(Vec::new()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriber Registry
    // ─────────────────────────────────────────────────────────────────────

    /// Registers or refreshes a subscriber; last write wins.
    pub fn add_subscriber(
        &self,
        protocol: Option<&str>,
        host: &str,
        port: u16,
        id: Option<&str>,
        command_id: Option<&str>,
    ) {
        let subscriber = Subscriber {
            protocol: protocol.unwrap_or("http").to_string(),
            host: host.to_string(),
            port,
            id: id.unwrap_or(host).to_string(),
            command_id: command_id.and_then(|c| c.parse().ok()).unwrap_or(0),
        };
        log::debug!("Add or update subscriber: {}", subscriber.host);
        self.subscribers.insert(subscriber.id.clone(), subscriber);
    }

    /// Removes a subscriber by client id, falling back to host matching for
    /// controllers that never sent an id.
    pub fn remove_subscriber(&self, id_or_host: &str) {
        self.subscribers.retain(|_, s| {
            let matches = s.id == id_or_host || s.host == id_or_host;
            if matches {
                log::debug!("Remove subscriber: {}", s.host);
            }
            !matches
        });
    }

    /// Best-effort refresh of the command id echoed back to a subscriber.
    /// No-op when the id is unknown or the value absent.
    pub fn update_command_id(&self, id: &str, command_id: Option<&str>) {
        let Some(command_id) = command_id.and_then(|c| c.parse().ok()) else {
            return;
        };
        if let Some(mut subscriber) = self.subscribers.get_mut(id) {
            subscriber.command_id = command_id;
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Flags Shared with the Long-poll Channel
    // ─────────────────────────────────────────────────────────────────────

    /// Whether the last rendered snapshot was playing.
    pub fn playing(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }

    /// Whether the stop edge has already been delivered to web pollers.
    pub fn stop_sent_to_web(&self) -> bool {
        self.stop_to_web_sent.load(Ordering::SeqCst)
    }

    /// Marks the stop edge as delivered to web pollers.
    pub fn mark_stop_sent_to_web(&self) {
        self.stop_to_web_sent.store(true, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Snapshot Rendering
    // ─────────────────────────────────────────────────────────────────────

    /// Builds the shared timeline snapshot and updates the playing/stop-edge
    /// flags from it.
    pub async fn render_snapshot(&self) -> TimelineSnapshot {
        match self.coordinator.state_snapshot().await {
            Some(state) => {
                self.is_playing.store(true, Ordering::SeqCst);
                self.stop_to_web_sent.store(false, Ordering::SeqCst);
                TimelineSnapshot::Playing(timeline_attributes(&state))
            }
            None => {
                self.is_playing.store(false, Ordering::SeqCst);
                TimelineSnapshot::Stopped
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Notification Loop
    // ─────────────────────────────────────────────────────────────────────

    /// Runs the periodic notification loop until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        log::debug!("Notification loop started");
        loop {
            self.notify().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::debug!("Notification loop stopped");
    }

    /// One notification tick: upstream report plus subscriber pushes.
    pub async fn notify(&self) {
        self.notify_upstream().await;

        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.render_snapshot().await;
        let targets: Vec<Subscriber> =
            self.subscribers.iter().map(|s| s.value().clone()).collect();
        for subscriber in targets {
            self.push_to_subscriber(&subscriber, &snapshot).await;
        }
    }

    async fn push_to_subscriber(&self, subscriber: &Subscriber, snapshot: &TimelineSnapshot) {
        let body = snapshot.render(&subscriber.command_id.to_string());
        let url = subscriber.timeline_url();
        let result = self
            .http
            .post(&url)
            .header("Content-Type", "application/xml")
            .header(HEADER_CLIENT_ID, &self.identity.client_id)
            .header("X-Device-Name", &self.identity.product)
            .header("X-Device-Platform", &self.identity.platform)
            .header("X-Device-Product", &self.identity.title)
            .header("X-Device-Version", &self.identity.version)
            .body(body)
            .timeout(Duration::from_secs(SUBSCRIBER_TIMEOUT_SECS))
            .send()
            .await;

        let status = match result {
            Ok(response) => Some(response.status()),
            Err(e) => {
                log::error!("Could not send update to subscriber: {}", e);
                None
            }
        };
        if drops_subscriber(status) {
            if let Some(status) = status {
                log::error!(
                    "Could not send update to subscriber, response code: {}",
                    status
                );
            }
            self.remove_subscriber(&subscriber.id);
        } else {
            log::debug!("Sent update to subscriber: {}", subscriber.host);
        }
    }

    /// Reports playback state to the catalog server.
    ///
    /// Level-triggered while playing; the transition to stopped re-sends the
    /// last playing parameter set with its state overridden, exactly once.
    async fn notify_upstream(&self) {
        let Some(snapshot) = self.coordinator.upstream_snapshot().await else {
            return;
        };
        let action = decide_upstream(snapshot.state, self.stop_to_server_sent.load(Ordering::SeqCst));
        match action {
            UpstreamAction::Skip => {}
            UpstreamAction::SendStopped => {
                log::info!("Send stop notification to catalog server");
                self.stop_to_server_sent.store(true, Ordering::SeqCst);
                let mut params = self.last_upstream.lock().clone();
                set_param(&mut params, "state", TransportState::Stopped.as_str());
                self.send_upstream(params).await;
            }
            UpstreamAction::SendPlaying => {
                self.stop_to_server_sent.store(false, Ordering::SeqCst);
                let params = self.upstream_params(&snapshot);
                *self.last_upstream.lock() = params.clone();
                self.send_upstream(params).await;
            }
        }
    }

    fn upstream_params(&self, snapshot: &UpstreamSnapshot) -> Vec<(String, String)> {
        let mut params = vec![
            ("state".to_string(), snapshot.state.as_str().to_string()),
            ("ratingKey".to_string(), snapshot.track.rating_key.clone()),
            ("key".to_string(), snapshot.track.key.clone()),
            ("time".to_string(), snapshot.time_ms.to_string()),
            (
                "duration".to_string(),
                snapshot.track.duration_ms.to_string(),
            ),
            (
                "playQueueItemID".to_string(),
                snapshot.track.item_id.clone(),
            ),
            ("token".to_string(), snapshot.token.clone()),
            (
                "shuffle".to_string(),
                u8::from(snapshot.shuffle).to_string(),
            ),
            ("repeat".to_string(), snapshot.repeat.as_wire().to_string()),
            (
                "containerKey".to_string(),
                snapshot.track.container_key.clone(),
            ),
        ];
        params.extend([
            (HEADER_CLIENT_ID.to_string(), self.identity.client_id.clone()),
            ("X-Device-Name".to_string(), self.identity.product.clone()),
            (
                "X-Device-Platform".to_string(),
                self.identity.platform.clone(),
            ),
            ("X-Device-Product".to_string(), self.identity.title.clone()),
            ("X-Device-Version".to_string(), self.identity.version.clone()),
        ]);
        params
    }

    async fn send_upstream(&self, params: Vec<(String, String)>) {
        let url = match self.catalog.timeline_url() {
            Ok(url) => url,
            Err(e) => {
                log::debug!("No catalog server to notify: {}", e);
                return;
            }
        };
        match self.http.get(&url).query(&params).send().await {
            Ok(_) => log::debug!("Sent catalog notification to {}", url),
            Err(e) => log::error!("Could not notify catalog server: {}", e),
        }
    }
}

/// Flattens a state snapshot into the ordered timeline attribute list.
fn timeline_attributes(state: &StateSnapshot) -> Vec<(String, String)> {
    vec![
        ("time".to_string(), state.time_ms.to_string()),
        ("volume".to_string(), state.volume.to_string()),
        ("mute".to_string(), u8::from(state.muted).to_string()),
        ("state".to_string(), state.state.as_str().to_string()),
        ("shuffle".to_string(), u8::from(state.shuffle).to_string()),
        ("repeat".to_string(), state.repeat.as_wire().to_string()),
        (
            "duration".to_string(),
            state.track.duration_ms.to_string(),
        ),
        ("key".to_string(), state.track.key.clone()),
        ("ratingKey".to_string(), state.track.rating_key.clone()),
        (
            "containerKey".to_string(),
            state.track.container_key.clone(),
        ),
        ("playQueueID".to_string(), state.track.queue_id.clone()),
        (
            "playQueueVersion".to_string(),
            state.track.queue_version.clone(),
        ),
        (
            "playQueueItemID".to_string(),
            state.track.item_id.clone(),
        ),
        ("protocol".to_string(), state.server.protocol.clone()),
        ("address".to_string(), state.server.address.clone()),
        ("port".to_string(), state.server.port.clone()),
        (
            "machineIdentifier".to_string(),
            state.server.machine_id.clone(),
        ),
        ("itemType".to_string(), "music".to_string()),
    ]
}

fn set_param(params: &mut Vec<(String, String)>, name: &str, value: &str) {
    match params.iter_mut().find(|(k, _)| k == name) {
        Some(entry) => entry.1 = value.to_string(),
        None => params.push((name.to_string(), value.to_string())),
    }
}
