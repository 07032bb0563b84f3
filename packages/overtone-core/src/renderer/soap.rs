//! Low-level SOAP protocol implementation for UPnP renderer control.
//!
//! Handles the raw SOAP envelope building, HTTP transport and fault
//! extraction. High-level transport commands live in [`super::upnp`].

use std::time::Duration;

use quick_xml::escape::escape;
use reqwest::Client;
use thiserror::Error;

use crate::protocol_constants::SOAP_TIMEOUT_SECS;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during SOAP operations with a renderer device.
#[derive(Debug, Error)]
pub enum SoapError {
    /// HTTP request to the device failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Device returned a non-success HTTP status without a SOAP fault.
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// Device returned a SOAP fault response.
    #[error("SOAP fault: {0}")]
    Fault(String),
}

/// Convenient Result alias for SOAP operations.
pub type SoapResult<T> = Result<T, SoapError>;

impl SoapError {
    /// Returns true if this error is transient and the operation should be
    /// retried.
    ///
    /// Transient UPnP AVTransport fault codes:
    /// - 701: Transition not available (device changing states)
    /// - 714: Illegal seek target (previous source still loading)
    /// - 716: Resource not found (device busy initializing)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SoapError::Fault(msg) => {
                msg.contains("701")
                    || msg.contains("714")
                    || msg.contains("716")
                    || msg.to_lowercase().contains("transition")
            }
            SoapError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UPnP Services
// ─────────────────────────────────────────────────────────────────────────────

/// UPnP services the bridge talks to on a MediaRenderer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpService {
    /// Transport control: load, play, pause, stop, seek, position.
    AVTransport,
    /// Volume and mute control.
    RenderingControl,
}

impl UpnpService {
    /// Control endpoint path on the device.
    pub fn control_path(self) -> &'static str {
        match self {
            Self::AVTransport => "/MediaRenderer/AVTransport/Control",
            Self::RenderingControl => "/MediaRenderer/RenderingControl/Control",
        }
    }

    /// Service URN used in the SOAPAction header and envelope.
    pub fn urn(self) -> &'static str {
        match self {
            Self::AVTransport => "urn:schemas-upnp-org:service:AVTransport:1",
            Self::RenderingControl => "urn:schemas-upnp-org:service:RenderingControl:1",
        }
    }
}

/// Default control port of UPnP MediaRenderer devices.
const DEFAULT_CONTROL_PORT: u16 = 1400;

/// Builds the control URL for a device endpoint.
///
/// `device` is the device's IP address, with an optional `:port` suffix for
/// devices that expose their control surface on a non-default port.
pub fn build_device_url(device: &str, path: &str) -> String {
    if device.contains(':') {
        format!("http://{}{}", device, path)
    } else {
        format!("http://{}:{}{}", device, DEFAULT_CONTROL_PORT, path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SOAP Request/Response
// ─────────────────────────────────────────────────────────────────────────────

/// Sends a SOAP request to a renderer device.
///
/// Builds the SOAP envelope, posts it and handles SOAP faults in the
/// response. Argument order is preserved in the envelope.
pub async fn send_soap_request(
    client: &Client,
    ip: &str,
    service: UpnpService,
    action: &str,
    args: &[(&str, &str)],
) -> SoapResult<String> {
    let url = build_device_url(ip, service.control_path());

    // The envelope must be a single line with no leading whitespace; some
    // device SOAP parsers reject XML with anything before the root element.
    let mut body = format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{} xmlns:u="{}">"#,
        action,
        service.urn()
    );

    for (k, v) in args {
        body.push_str(&format!("<{k}>{}</{k}>", escape(*v)));
    }

    body.push_str(&format!(r#"</u:{}></s:Body></s:Envelope>"#, action));

    log::debug!("[SOAP] {} -> {} (body: {} bytes)", action, url, body.len());

    let res = client
        .post(&url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPAction", format!("\"{}#{}\"", service.urn(), action))
        .body(body)
        .timeout(Duration::from_secs(SOAP_TIMEOUT_SECS))
        .send()
        .await?;

    let status = res.status();
    let response_text = res.text().await?;

    // SOAP faults may arrive with a 500 status; check the body first.
    if response_text.contains("<s:Fault>") || response_text.contains("<soap:Fault>") {
        let fault_msg = extract_fault_string(&response_text)
            .unwrap_or_else(|| "Unknown SOAP fault".to_string());
        return Err(SoapError::Fault(fault_msg));
    }

    if !status.is_success() {
        return Err(SoapError::HttpStatus(status.as_u16(), response_text));
    }

    Ok(response_text)
}

/// Extracts the text content of the first `<tag>...</tag>` pair in `xml`.
///
/// Good enough for the flat response bodies UPnP renderers produce; no
/// namespace handling required.
pub fn extract_xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

/// Extracts the faultstring from a SOAP fault response.
fn extract_fault_string(xml: &str) -> Option<String> {
    extract_xml_text(xml, "faultstring")
        .or_else(|| extract_xml_text(xml, "errorCode"))
}

/// Formats minimal DIDL-Lite metadata for an audio item.
///
/// Sent once with the transport URI so devices with a display can show the
/// track artwork; everything else the device needs is in the stream itself.
pub fn format_didl_audio_item(media_url: &str, title: &str, artwork_url: &str) -> String {
    let mut didl = String::from(
        r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/">"#,
    );
    didl.push_str(r#"<item id="0" parentID="-1" restricted="true">"#);
    didl.push_str(&format!("<dc:title>{}</dc:title>", escape(title)));
    if !artwork_url.is_empty() {
        didl.push_str(&format!(
            "<upnp:albumArtURI>{}</upnp:albumArtURI>",
            escape(artwork_url)
        ));
    }
    didl.push_str("<upnp:class>object.item.audioItem.musicTrack</upnp:class>");
    didl.push_str(&format!(
        r#"<res protocolInfo="http-get:*:*:*">{}</res>"#,
        escape(media_url)
    ));
    didl.push_str("</item>");
    didl.push_str("</DIDL-Lite>");
    didl
}
