//! Companion protocol HTTP surface.
//!
//! - [`http`]: router and request handlers
//! - [`poll`]: long-poll waiter bookkeeping

pub mod http;
pub mod poll;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::coordinator::PlaybackCoordinator;
use crate::error::{BridgeError, BridgeResult};
use crate::fanout::SubscriptionManager;
use crate::state::DeviceIdentity;

pub use poll::PollTracker;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PlaybackCoordinator>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub poll_tracker: Arc<PollTracker>,
    pub identity: Arc<DeviceIdentity>,
}

/// Binds the companion port and serves until the token is cancelled.
///
/// In-flight requests drain before the future resolves.
pub async fn start_server(
    state: AppState,
    port: u16,
    cancel: CancellationToken,
) -> BridgeResult<()> {
    let router = http::create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| BridgeError::Server(format!("Could not bind port {}: {}", port, e)))?;
    log::info!("Companion server listening on port {}", port);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .map_err(|e| BridgeError::Server(e.to_string()))
}
