//! UPnP MediaRenderer backend.
//!
//! Drives a standard AVTransport/RenderingControl device over SOAP. A
//! monitor task polls the transport state and reports the end of a track the
//! bridge started through the renderer event channel; whether the bridge is
//! waiting for such an end is tracked in the `awaiting_end` flag, which is
//! armed when playback is confirmed and cleared by an explicit stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::soap::{send_soap_request, SoapResult, UpnpService};
use super::{Renderer, RendererError, RendererEvent, RendererResult};

/// Retry delays for transient SOAP errors (exponential backoff).
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// How long `play` waits for the device to reach the playing state.
const START_POLL_ATTEMPTS: u32 = 40;
const START_POLL_INTERVAL_MS: u64 = 250;

/// Executes a SOAP request with retry logic for transient errors.
async fn with_retry<F, Fut>(action: &str, mut operation: F) -> SoapResult<String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SoapResult<String>>,
{
    let mut last_error = None;
    for (attempt, &delay_ms) in std::iter::once(&0)
        .chain(RETRY_DELAYS_MS.iter())
        .enumerate()
    {
        if attempt > 0 {
            log::info!(
                "[UPnP] Retrying {} (attempt {}/{}) after {}ms",
                action,
                attempt + 1,
                RETRY_DELAYS_MS.len() + 1,
                delay_ms
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match operation().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() => {
                log::warn!("[UPnP] {} transient error: {}", action, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.expect("retry loop should have set last_error"))
}

/// Renderer backend driving a UPnP MediaRenderer device.
pub struct UpnpRenderer {
    http: Client,
    device: String,
    monitor_interval: Duration,
    awaiting_end: AtomicBool,
    events_tx: mpsc::Sender<RendererEvent>,
    cancel: CancellationToken,
}

impl UpnpRenderer {
    /// Creates the backend together with the receiving end of its event
    /// channel.
    ///
    /// The monitor task is not running yet; call
    /// [`start_monitor`](Self::start_monitor) once the runtime is up.
    pub fn new(
        http: Client,
        device: String,
        monitor_interval_ms: u64,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<RendererEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let renderer = Arc::new(Self {
            http,
            device,
            monitor_interval: Duration::from_millis(monitor_interval_ms),
            awaiting_end: AtomicBool::new(false),
            events_tx,
            cancel: cancel.child_token(),
        });
        (renderer, events_rx)
    }

    /// Spawns the transport monitor task.
    pub fn start_monitor(self: &Arc<Self>) {
        let renderer = Arc::clone(self);
        tokio::spawn(async move {
            renderer.monitor_loop().await;
        });
    }

    async fn monitor_loop(&self) {
        log::debug!("[UPnP] Transport monitor started for {}", self.device);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.monitor_interval) => {}
            }

            if !self.awaiting_end.load(Ordering::SeqCst) {
                continue;
            }
            match self.transport_state().await {
                Ok(state) if state == "STOPPED" => {
                    // Swap guards against a concurrent stop() racing us here.
                    if self.awaiting_end.swap(false, Ordering::SeqCst) {
                        log::debug!("[UPnP] Track finished on {}", self.device);
                        if self.events_tx.send(RendererEvent::TrackEnded).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!("[UPnP] Transport poll failed: {}", e),
            }
        }
        log::debug!("[UPnP] Transport monitor stopped for {}", self.device);
    }

    async fn soap(&self, service: UpnpService, action: &str, args: &[(&str, &str)]) -> SoapResult<String> {
        send_soap_request(&self.http, &self.device, service, action, args).await
    }

    /// Current transport state of the device (PLAYING, PAUSED_PLAYBACK, ...).
    async fn transport_state(&self) -> SoapResult<String> {
        let body = self
            .soap(
                UpnpService::AVTransport,
                "GetTransportInfo",
                &[("InstanceID", "0")],
            )
            .await?;
        Ok(super::soap::extract_xml_text(&body, "CurrentTransportState").unwrap_or_default())
    }

    async fn wait_for_playing(&self) -> RendererResult<()> {
        for _ in 0..START_POLL_ATTEMPTS {
            match self.transport_state().await {
                Ok(state) if state == "PLAYING" => return Ok(()),
                Ok(_) | Err(_) => {}
            }
            tokio::time::sleep(Duration::from_millis(START_POLL_INTERVAL_MS)).await;
        }
        Err(RendererError::StartTimeout)
    }
}

#[async_trait]
impl Renderer for UpnpRenderer {
    async fn play(&self, media_url: &str, artwork_url: &str) -> RendererResult<()> {
        log::info!("[UPnP] Play: {}", media_url);
        let metadata =
            super::soap::format_didl_audio_item(media_url, "Overtone Bridge", artwork_url);

        let set_uri_args = [
            ("InstanceID", "0"),
            ("CurrentURI", media_url),
            ("CurrentURIMetaData", metadata.as_str()),
        ];
        with_retry("SetAVTransportURI", || {
            self.soap(UpnpService::AVTransport, "SetAVTransportURI", &set_uri_args)
        })
        .await?;

        let play_args = [("InstanceID", "0"), ("Speed", "1")];
        with_retry("Play", || {
            self.soap(UpnpService::AVTransport, "Play", &play_args)
        })
        .await?;

        self.wait_for_playing().await?;
        self.awaiting_end.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> RendererResult<()> {
        self.soap(UpnpService::AVTransport, "Pause", &[("InstanceID", "0")])
            .await?;
        Ok(())
    }

    async fn resume(&self) -> RendererResult<()> {
        self.soap(
            UpnpService::AVTransport,
            "Play",
            &[("InstanceID", "0"), ("Speed", "1")],
        )
        .await?;
        Ok(())
    }

    async fn stop(&self) -> RendererResult<()> {
        self.awaiting_end.store(false, Ordering::SeqCst);
        self.soap(UpnpService::AVTransport, "Stop", &[("InstanceID", "0")])
            .await?;
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> RendererResult<()> {
        let target = format_hms(position_ms);
        self.soap(
            UpnpService::AVTransport,
            "Seek",
            &[("InstanceID", "0"), ("Unit", "REL_TIME"), ("Target", &target)],
        )
        .await?;
        Ok(())
    }

    async fn set_volume(&self, volume: u8) -> RendererResult<()> {
        let volume = volume.min(100).to_string();
        self.soap(
            UpnpService::RenderingControl,
            "SetVolume",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("DesiredVolume", &volume),
            ],
        )
        .await?;
        Ok(())
    }

    async fn volume(&self) -> RendererResult<u8> {
        let body = self
            .soap(
                UpnpService::RenderingControl,
                "GetVolume",
                &[("InstanceID", "0"), ("Channel", "Master")],
            )
            .await?;
        Ok(super::soap::extract_xml_text(&body, "CurrentVolume")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn is_muted(&self) -> RendererResult<bool> {
        let body = self
            .soap(
                UpnpService::RenderingControl,
                "GetMute",
                &[("InstanceID", "0"), ("Channel", "Master")],
            )
            .await?;
        Ok(super::soap::extract_xml_text(&body, "CurrentMute").as_deref() == Some("1"))
    }

    async fn elapsed_ms(&self) -> RendererResult<u64> {
        let body = self
            .soap(
                UpnpService::AVTransport,
                "GetPositionInfo",
                &[("InstanceID", "0")],
            )
            .await?;
        Ok(super::soap::extract_xml_text(&body, "RelTime")
            .and_then(|t| parse_hms(&t))
            .unwrap_or(0))
    }

    async fn is_ready(&self) -> bool {
        self.transport_state().await.is_ok()
    }

    async fn wait_until_ready(&self) {
        while !self.is_ready().await {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            log::warn!("[UPnP] Stop during shutdown failed: {}", e);
        }
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Time Formatting
// ─────────────────────────────────────────────────────────────────────────────

/// Formats milliseconds as the `H:MM:SS` form AVTransport expects.
fn format_hms(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}

/// Parses an AVTransport `H:MM:SS` time into milliseconds.
///
/// Devices report `NOT_IMPLEMENTED` or garbage while idle; those parse to
/// None and degrade to an elapsed time of 0 upstream.
fn parse_hms(value: &str) -> Option<u64> {
    let mut parts = value.split(':').rev();
    let secs: f64 = parts.next()?.parse().ok()?;
    let mins: u64 = parts.next().map_or(Ok(0), str::parse).ok()?;
    let hours: u64 = parts.next().map_or(Ok(0), str::parse).ok()?;
    Some(((hours * 3600 + mins * 60) * 1000) + (secs * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hms() {
        assert_eq!(format_hms(0), "0:00:00");
        assert_eq!(format_hms(61_000), "0:01:01");
        assert_eq!(format_hms(3_723_000), "1:02:03");
    }

    #[test]
    fn parses_hms() {
        assert_eq!(parse_hms("0:00:00"), Some(0));
        assert_eq!(parse_hms("0:01:01"), Some(61_000));
        assert_eq!(parse_hms("1:02:03"), Some(3_723_000));
        assert_eq!(parse_hms("0:00:12.500"), Some(12_500));
        assert_eq!(parse_hms("NOT_IMPLEMENTED"), None);
    }

    #[test]
    fn hms_round_trip() {
        for ms in [0, 1_000, 59_000, 60_000, 3_599_000, 3_600_000, 7_425_000] {
            assert_eq!(parse_hms(&format_hms(ms)), Some(ms));
        }
    }
}
