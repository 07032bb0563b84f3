//! Discovery beacon.
//!
//! Announces the bridge on the fixed multicast group and answers discovery
//! probes from controllers. HELLO goes out once on startup, BYE on shutdown;
//! in between the beacon answers every `M-SEARCH` probe with the same
//! key-value payload a controller needs to reach the companion surface.
//! Probes originating from this host (loopback or our own address) are
//! ignored so the bridge does not discover itself.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::{
    BEACON_HEADER, BEACON_MULTICAST_ADDR, BEACON_MULTICAST_PORT, DEVICE_CLASS,
    PROTOCOL_CAPABILITIES, PROTOCOL_NAME, PROTOCOL_VERSION, SEARCH_PREFIX,
};
use crate::state::DeviceIdentity;

/// UDP multicast presence announcer and discovery responder.
pub struct DiscoveryBeacon {
    beacon_port: u16,
    payload: String,
    local_ip: Option<IpAddr>,
}

impl DiscoveryBeacon {
    /// Creates a beacon announcing the given identity and companion port.
    pub fn new(identity: &DeviceIdentity, beacon_port: u16, companion_port: u16) -> Self {
        let local_ip = local_ip_address::local_ip().ok();
        Self {
            beacon_port,
            payload: beacon_payload(identity, companion_port),
            local_ip,
        }
    }

    fn group(&self) -> SocketAddr {
        SocketAddr::new(
            BEACON_MULTICAST_ADDR.parse::<IpAddr>().expect("fixed group address"),
            BEACON_MULTICAST_PORT,
        )
    }

    fn hello(&self) -> String {
        format!("HELLO {}\n{}", BEACON_HEADER, self.payload)
    }

    fn bye(&self) -> String {
        format!("BYE {}\n{}", BEACON_HEADER, self.payload)
    }

    fn search_response(&self) -> String {
        format!("HTTP/1.0 200 OK\n{}", self.payload)
    }

    /// Whether a received packet is a discovery probe worth answering.
    fn should_answer(&self, data: &str, src: &SocketAddr) -> bool {
        if !data.contains(SEARCH_PREFIX) {
            return false;
        }
        if src.ip().is_loopback() {
            return false;
        }
        if Some(src.ip()) == self.local_ip {
            return false;
        }
        true
    }

    fn create_socket(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            log::warn!("Failed to set SO_REUSEADDR on beacon socket: {}", e);
        }
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], self.beacon_port)).into())?;
        socket.set_multicast_ttl_v4(255)?;
        let group: Ipv4Addr = BEACON_MULTICAST_ADDR.parse().expect("fixed group address");
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }

    /// Runs the beacon until the token is cancelled.
    ///
    /// Socket setup failures are logged and end the task; every other error
    /// is logged and the loop carries on.
    pub async fn run(self, cancel: CancellationToken) {
        let socket = match self.create_socket() {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Unable to bind beacon port {}: {}", self.beacon_port, e);
                return;
            }
        };

        // Initial presence announcement.
        if let Err(e) = socket.send_to(self.hello().as_bytes(), self.group()).await {
            log::error!("Unable to send registration message: {}", e);
        }
        log::info!("Discovery beacon running on port {}", self.beacon_port);

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            log::error!("Beacon receive error: {}", e);
                            continue;
                        }
                    };
                    let data = String::from_utf8_lossy(&buf[..len]);
                    log::debug!("Received UDP packet from {}: {}", src, data.trim());
                    if self.should_answer(&data, &src) {
                        log::info!("Detected client discovery request from {}", src);
                        if let Err(e) = socket
                            .send_to(self.search_response().as_bytes(), src)
                            .await
                        {
                            log::error!("Unable to answer discovery request: {}", e);
                        }
                    }
                }
            }
        }

        // Farewell announcement on the way out.
        if let Err(e) = socket.send_to(self.bye().as_bytes(), self.group()).await {
            log::error!("Unable to send farewell message: {}", e);
        }
        log::info!("Discovery beacon stopped");
    }
}

/// Key-value body shared by announcements and probe responses.
fn beacon_payload(identity: &DeviceIdentity, companion_port: u16) -> String {
    format!(
        "Content-Type: media-player\n\
         Resource-Identifier: {}\n\
         Name: {}\n\
         Port: {}\n\
         Product: {}\n\
         Version: {}\n\
         Protocol: {}\n\
         Protocol-Version: {}\n\
         Protocol-Capabilities: {}\n\
         Device-Class: {}\n",
        identity.client_id,
        identity.title,
        companion_port,
        identity.product,
        identity.version,
        PROTOCOL_NAME,
        PROTOCOL_VERSION,
        PROTOCOL_CAPABILITIES,
        DEVICE_CLASS.to_uppercase(),
    )
}
