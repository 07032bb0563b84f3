//! Shared renderer test double.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Renderer, RendererResult};

/// Records every call made through the [`Renderer`] contract.
#[derive(Default)]
pub(crate) struct MockRenderer {
    pub calls: Mutex<Vec<String>>,
    pub elapsed: AtomicU64,
    pub volume: AtomicU8,
    pub muted: AtomicBool,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    /// Number of recorded calls whose name matches `name` (arguments ignored).
    pub fn call_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split('(').next() == Some(name))
            .count()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn play(&self, media_url: &str, _artwork_url: &str) -> RendererResult<()> {
        self.record(format!("play({})", media_url));
        Ok(())
    }

    async fn pause(&self) -> RendererResult<()> {
        self.record("pause()");
        Ok(())
    }

    async fn resume(&self) -> RendererResult<()> {
        self.record("resume()");
        Ok(())
    }

    async fn stop(&self) -> RendererResult<()> {
        self.record("stop()");
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> RendererResult<()> {
        self.record(format!("seek({})", position_ms));
        Ok(())
    }

    async fn set_volume(&self, volume: u8) -> RendererResult<()> {
        self.record(format!("set_volume({})", volume));
        self.volume.store(volume, Ordering::SeqCst);
        Ok(())
    }

    async fn volume(&self) -> RendererResult<u8> {
        Ok(self.volume.load(Ordering::SeqCst))
    }

    async fn is_muted(&self) -> RendererResult<bool> {
        Ok(self.muted.load(Ordering::SeqCst))
    }

    async fn elapsed_ms(&self) -> RendererResult<u64> {
        Ok(self.elapsed.load(Ordering::SeqCst))
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn wait_until_ready(&self) {}

    async fn shutdown(&self) {
        self.record("shutdown()");
    }
}
