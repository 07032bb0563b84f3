//! Wire-level constants for the companion protocol and discovery beacon.
//!
//! Everything a controller observes on the wire is defined here: the
//! multicast rendezvous, the fixed header names, the capability string and
//! the XML skeletons shared by acknowledgements and the device descriptor.

/// Multicast group the discovery beacon announces itself on.
pub const BEACON_MULTICAST_ADDR: &str = "239.0.0.250";

/// Multicast port the discovery beacon announces itself on.
pub const BEACON_MULTICAST_PORT: u16 = 32413;

/// Default local port the beacon binds for receiving discovery probes.
pub const DEFAULT_BEACON_PORT: u16 = 32412;

/// Default port for the companion HTTP surface.
pub const DEFAULT_COMPANION_PORT: u16 = 32005;

/// Request line suffix shared by HELLO and BYE announcements.
pub const BEACON_HEADER: &str = "* HTTP/1.0";

/// Prefix of a discovery probe from a controller.
pub const SEARCH_PREFIX: &str = "M-SEARCH * HTTP/1.";

/// Header carrying the controller's (or our) client identifier.
pub const HEADER_CLIENT_ID: &str = "X-Client-Id";

/// Commands we advertise as controllable on the timeline.
pub const CONTROLLABLE: &str =
    "playPause,stop,volume,shuffle,repeat,seekTo,skipPrevious,skipNext,stepBack,stepForward";

/// Capability set announced by the beacon and the device descriptor.
pub const PROTOCOL_CAPABILITIES: &str = "timeline,playback,playqueues";

/// Protocol name announced to controllers.
pub const PROTOCOL_NAME: &str = "companion";

/// Protocol version announced to controllers.
pub const PROTOCOL_VERSION: &str = "1";

/// Device class announced to controllers.
pub const DEVICE_CLASS: &str = "stb";

/// Path on the upstream catalog server that receives timeline reports.
pub const UPSTREAM_TIMELINE_PATH: &str = "/:/timeline";

/// Path on a subscriber that receives pushed timeline documents.
pub const SUBSCRIBER_TIMELINE_PATH: &str = "/:/timeline";

/// XML declaration prepended to document responses.
pub const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Body of the positive acknowledgement returned by subscribe/unsubscribe.
pub const XML_OK: &str =
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response code=\"200\" status=\"OK\"/>";

/// Timeout for outbound notification requests to subscribers.
pub const SUBSCRIBER_TIMEOUT_SECS: u64 = 2;

/// Timeout for requests to the upstream catalog server.
pub const CATALOG_TIMEOUT_SECS: u64 = 10;

/// Timeout for SOAP control requests to the renderer device.
pub const SOAP_TIMEOUT_SECS: u64 = 5;

/// How many concurrent long-poll waiters one address may queue before the
/// oldest is forced out.
pub const POLL_BACKLOG_BOUND: usize = 3;

/// Granularity of the long-poll blocking loop.
pub const POLL_TICK_MS: u64 = 1000;

/// Pre-sleep applied when a poller asks for `wait=1`.
pub const POLL_WAIT_HINT_MS: u64 = 950;
