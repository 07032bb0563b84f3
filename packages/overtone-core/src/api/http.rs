//! HTTP route handlers for the companion surface.
//!
//! All handlers are thin: parsing and response shaping here, state changes
//! in the coordinator and the subscription manager. The protocol is
//! fire-and-forget; playback commands are acknowledged with an empty body
//! whatever their outcome, because controllers have no error channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{connect_info::ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use quick_xml::escape::escape;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::AppState;
use crate::protocol_constants::{
    DEVICE_CLASS, HEADER_CLIENT_ID, POLL_TICK_MS, POLL_WAIT_HINT_MS, PROTOCOL_CAPABILITIES,
    PROTOCOL_NAME, PROTOCOL_VERSION, XML_HEADER, XML_OK,
};
use crate::state::DeviceIdentity;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the axum router for the companion surface.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static("x-client-id")])
        .max_age(Duration::from_secs(1_209_600));

    Router::new()
        .route("/version", get(version))
        .route("/verify", get(verify))
        .route("/resources", get(resources))
        .route("/subscribe", get(subscribe))
        .route("/unsubscribe", get(unsubscribe))
        .route("/mirror", get(mirror))
        .route("/player/timeline/poll", get(timeline_poll))
        .route("/player/playback/{command}", get(playback_command))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed header set carried by every response.
fn device_headers(identity: &DeviceIdentity) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    set("x-client-id", &identity.client_id);
    set("x-device", &identity.product);
    set("x-device-name", &identity.title);
    set("x-device-platform", &identity.platform);
    set("x-device-platform-version", &identity.platform_version);
    set("x-device-version", &identity.version);
    set("x-provides", "client,player,pubsub-player");
    headers
}

fn plain(identity: &DeviceIdentity, body: &str) -> Response {
    (device_headers(identity), body.to_string()).into_response()
}

fn xml(identity: &DeviceIdentity, body: String) -> Response {
    let mut headers = device_headers(identity);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/xml;charset=utf-8"),
    );
    (headers, body).into_response()
}

/// Client identity of a request: the client id header, or the source host
/// for controllers that never send one.
fn requester_id(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get(HEADER_CLIENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Every request refreshes the echoed command id of its subscriber, keyed
/// like [`requester_id`].
fn refresh_command_id(
    state: &AppState,
    headers: &HeaderMap,
    addr: &SocketAddr,
    params: &HashMap<String, String>,
) {
    state
        .subscriptions
        .update_command_id(&requester_id(headers, addr), params.get("commandID").map(String::as_str));
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn version(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    plain(&state.identity, "Overtone Bridge: Running")
}

async fn verify(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    plain(&state.identity, "Connection Test: OK")
}

/// Device descriptor advertised to controllers that probe us directly.
async fn resources(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    let identity = &state.identity;
    let body = format!(
        "{}<MediaContainer>\n<Player title=\"{}\" protocol=\"{}\" protocolVersion=\"{}\" \
         protocolCapabilities=\"{}\" machineIdentifier=\"{}\" product=\"{}\" platform=\"{}\" \
         platformVersion=\"{}\" version=\"{}\" deviceClass=\"{}\"/>\n</MediaContainer>\n",
        XML_HEADER,
        escape(identity.title.as_str()),
        PROTOCOL_NAME,
        PROTOCOL_VERSION,
        PROTOCOL_CAPABILITIES,
        identity.client_id,
        escape(identity.product.as_str()),
        escape(identity.platform.as_str()),
        identity.platform_version,
        identity.version,
        DEVICE_CLASS,
    );
    xml(identity, body)
}

async fn subscribe(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    let host = addr.ip().to_string();
    let client_id = headers
        .get(HEADER_CLIENT_ID)
        .and_then(|v| v.to_str().ok());
    match params.get("port").and_then(|p| p.parse::<u16>().ok()) {
        Some(port) => {
            state.subscriptions.add_subscriber(
                params.get("protocol").map(String::as_str),
                &host,
                port,
                client_id,
                params.get("commandID").map(String::as_str),
            );
        }
        None => log::warn!("Subscribe from {} without a callback port", host),
    }
    xml(&state.identity, XML_OK.to_string())
}

async fn unsubscribe(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let id = requester_id(&headers, &addr);
    state.subscriptions.remove_subscriber(&id);
    xml(&state.identity, XML_OK.to_string())
}

async fn mirror(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    plain(&state.identity, "")
}

/// All `/player/playback/*` commands: dispatch and acknowledge.
async fn playback_command(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(command): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);
    let path = format!("/player/playback/{}", command);
    log::info!("Request path: {} (origin {})", path, addr.ip());
    state
        .coordinator
        .handle_command(&addr.ip().to_string(), &path, &params)
        .await;
    plain(&state.identity, "")
}

/// Long-poll timeline channel for web controllers.
///
/// Blocks while nothing is playing, the stop edge has already been
/// delivered, and this waiter is not the forced-release victim of a full
/// backlog. See [`PollTracker`](crate::api::poll::PollTracker) for the
/// backlog bound.
async fn timeline_poll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    refresh_command_id(&state, &headers, &addr, &params);

    // Controllers that ask to wait get a grace sleep so a command they just
    // issued lands in the snapshot they receive.
    if params.get("wait").map(String::as_str) == Some("1") {
        tokio::time::sleep(Duration::from_millis(POLL_WAIT_HINT_MS)).await;
    }

    state.poll_tracker.register(addr);
    loop {
        let blocked = !state.coordinator.is_playing()
            && state.subscriptions.stop_sent_to_web()
            && !state.poll_tracker.is_forced_release(addr);
        if !blocked {
            break;
        }
        tokio::time::sleep(Duration::from_millis(POLL_TICK_MS)).await;
    }
    state.poll_tracker.unregister(addr);

    let snapshot = state.subscriptions.render_snapshot().await;
    let command_id = params
        .get("commandID")
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    let body = snapshot.render(&command_id);

    if state.subscriptions.playing() {
        log::debug!("Send current state to web poller {}", addr.ip());
        xml(&state.identity, body)
    } else if !state.subscriptions.stop_sent_to_web() {
        log::info!("Signal stop to web pollers once");
        state.subscriptions.mark_stop_sent_to_web();
        xml(&state.identity, body)
    } else {
        // Connection has been open too long with nothing new to report.
        log::info!("Close connection to web poller {}", addr.ip());
        let mut response = xml(&state.identity, "Close connection".to_string());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}
