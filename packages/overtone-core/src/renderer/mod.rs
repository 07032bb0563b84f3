//! Renderer backends.
//!
//! The coordinator drives playback exclusively through the [`Renderer`]
//! capability contract; the concrete backend is chosen once at startup from
//! configuration. Backends report the end of a track they were asked to play
//! through a [`RendererEvent`] channel handed out at construction; the
//! bootstrap wires it to the coordinator's automatic-advance path.

pub mod soap;
pub mod upnp;

#[cfg(test)]
pub(crate) mod test_fixtures;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur driving a renderer device.
#[derive(Debug, Error)]
pub enum RendererError {
    /// Control request to the device failed.
    #[error("Renderer control request failed: {0}")]
    Soap(#[from] soap::SoapError),

    /// The device accepted the command but never reached the playing state.
    #[error("Renderer did not start playback in time")]
    StartTimeout,
}

/// Convenient Result alias for renderer operations.
pub type RendererResult<T> = Result<T, RendererError>;

/// Events emitted by a renderer's monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererEvent {
    /// A track the bridge started has finished playing on its own.
    TrackEnded,
}

/// Capability contract every renderer backend implements.
///
/// `play` blocks its caller until the device confirms playback has started.
/// All other transport operations return as soon as the device acknowledges
/// the command.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Loads and plays a media URL, with artwork for devices that display it.
    async fn play(&self, media_url: &str, artwork_url: &str) -> RendererResult<()>;

    /// Pauses playback.
    async fn pause(&self) -> RendererResult<()>;

    /// Resumes paused playback.
    async fn resume(&self) -> RendererResult<()>;

    /// Stops playback.
    async fn stop(&self) -> RendererResult<()>;

    /// Seeks to an absolute position in the current track.
    async fn seek(&self, position_ms: u64) -> RendererResult<()>;

    /// Sets the output volume (0-100).
    async fn set_volume(&self, volume: u8) -> RendererResult<()>;

    /// Current output volume (0-100).
    async fn volume(&self) -> RendererResult<u8>;

    /// Whether the device output is muted.
    async fn is_muted(&self) -> RendererResult<bool>;

    /// Elapsed time of the current track in milliseconds.
    async fn elapsed_ms(&self) -> RendererResult<u64>;

    /// Whether the device is reachable and ready to accept commands.
    async fn is_ready(&self) -> bool;

    /// Blocks until the device is ready, polling once per second.
    async fn wait_until_ready(&self);

    /// Stops playback and tears down background workers.
    async fn shutdown(&self);
}
