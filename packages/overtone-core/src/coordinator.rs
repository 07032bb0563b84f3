//! Playback coordinator.
//!
//! The only place that touches the play queue, the renderer and the playback
//! flags. Every inbound command funnels through [`handle_command`]; the
//! renderer's track-ended signal arrives through [`auto_next`]. Lock
//! acquisition follows a fixed global order (playback flags, then queue,
//! then server info, then renderer) and no synchronous lock is ever held
//! across an await. The renderer sits behind an async mutex that IS held
//! across device I/O; that is what serializes transport commands.
//!
//! The protocol has no error channel back to controllers, so command
//! handlers log failures and return normally; nothing here is fatal.
//!
//! [`handle_command`]: PlaybackCoordinator::handle_command
//! [`auto_next`]: PlaybackCoordinator::auto_next

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::catalog::{Catalog, ServerInfo};
use crate::queue::{CurrentTrackInfo, PlayQueue, RepeatMode};
use crate::renderer::Renderer;
use crate::state::RewriteRules;
use crate::timeline::TransportState;

/// Playback flags plus the per-origin command dedup map.
///
/// Dedup is keyed by origin host only; distinct controllers behind one
/// address share a slot. Kept that way deliberately to match controller
/// expectations (commands are re-sent with the same id on retries from the
/// same host).
#[derive(Default)]
struct PlaybackFlags {
    is_playing: bool,
    is_paused: bool,
    last_command_ids: HashMap<String, String>,
}

/// Snapshot of the controller-facing playback state.
///
/// Produced only while something is playing; `None` is the stopped sentinel.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub time_ms: u64,
    pub volume: u8,
    pub muted: bool,
    pub state: TransportState,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub track: CurrentTrackInfo,
    pub server: ServerInfo,
}

/// Snapshot reported to the upstream catalog server.
///
/// Produced whenever a queue is installed, playing or not; `None` means no
/// queue.
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub state: TransportState,
    pub time_ms: u64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub token: String,
    pub track: CurrentTrackInfo,
}

/// Serializes all access to queue, renderer and playback state.
pub struct PlaybackCoordinator {
    flags: Mutex<PlaybackFlags>,
    queue: Mutex<PlayQueue>,
    catalog: Arc<dyn Catalog>,
    renderer: AsyncMutex<Arc<dyn Renderer>>,
    rewrite: RewriteRules,
}

impl PlaybackCoordinator {
    /// Creates a coordinator owning an empty queue.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        catalog: Arc<dyn Catalog>,
        rewrite: RewriteRules,
    ) -> Self {
        Self {
            flags: Mutex::new(PlaybackFlags::default()),
            queue: Mutex::new(PlayQueue::new()),
            catalog,
            renderer: AsyncMutex::new(renderer),
            rewrite,
        }
    }

    /// Whether anything is playing (paused counts as playing).
    pub fn is_playing(&self) -> bool {
        self.flags.lock().is_playing
    }

    /// Controller-facing transport state.
    pub fn transport_state(&self) -> TransportState {
        let flags = self.flags.lock();
        if flags.is_playing && flags.is_paused {
            TransportState::Paused
        } else if flags.is_playing {
            TransportState::Playing
        } else {
            TransportState::Stopped
        }
    }

    /// Entry point for every playback command from the protocol server.
    ///
    /// Refreshes the upstream server identity from the parameters, drops
    /// duplicate (origin, commandID) pairs, then dispatches on the path.
    pub async fn handle_command(
        &self,
        origin: &str,
        path: &str,
        params: &HashMap<String, String>,
    ) {
        self.catalog.update_server_info(params);

        if let Some(command_id) = params.get("commandID") {
            let mut flags = self.flags.lock();
            if flags.last_command_ids.get(origin) == Some(command_id) {
                log::info!("Detected same command id -> skip this command");
                return;
            }
            flags
                .last_command_ids
                .insert(origin.to_string(), command_id.clone());
        }

        match path {
            "/player/playback/playMedia" => {
                let media_type = params.get("type").map(String::as_str).unwrap_or_default();
                let Some(container_key) = params.get("containerKey") else {
                    log::warn!("playMedia without containerKey");
                    return;
                };
                self.play_media(media_type, container_key).await;
            }
            "/player/playback/refreshPlayQueue" => {
                let Some(queue_id) = params.get("playQueueID") else {
                    log::warn!("refreshPlayQueue without playQueueID");
                    return;
                };
                self.refresh_queue(&format!("/playQueues/{}", queue_id)).await;
            }
            "/player/playback/seekTo" => {
                let Some(offset) = params.get("offset").and_then(|o| o.parse().ok()) else {
                    log::warn!("seekTo without valid offset");
                    return;
                };
                self.seek(offset).await;
            }
            "/player/playback/pause" => self.pause().await,
            "/player/playback/play" => self.play().await,
            "/player/playback/stop" => self.stop().await,
            "/player/playback/skipNext" => self.skip_next().await,
            "/player/playback/skipPrevious" => self.skip_previous().await,
            "/player/playback/skipTo" => {
                let Some(key) = params.get("key") else {
                    log::warn!("skipTo without key");
                    return;
                };
                self.skip_to(key).await;
            }
            "/player/playback/setParameters" => self.set_parameters(params).await,
            _ => log::warn!("Not implemented: {}", path),
        }
    }

    /// Installs a fresh queue and starts playback.
    ///
    /// Only music queues are accepted; anything else stops playback and is
    /// logged as an error.
    pub async fn play_media(&self, media_type: &str, container_key: &str) {
        if media_type != "music" {
            log::error!("Items in the queue are not of type music");
            self.stop().await;
            return;
        }
        let document = match self.catalog.fetch_queue(container_key).await {
            Ok(document) => document,
            Err(e) => {
                log::error!("Could not fetch play queue {}: {}", container_key, e);
                return;
            }
        };
        {
            let mut queue = self.queue.lock();
            queue.reset();
            queue.update(document, false);
        }
        self.play().await;
    }

    /// Re-fetches the active queue after a server-side edit, keeping the
    /// cursor on the remembered current track.
    pub async fn refresh_queue(&self, container_key: &str) {
        let document = match self.catalog.fetch_queue(container_key).await {
            Ok(document) => document,
            Err(e) => {
                log::error!("Could not refresh play queue {}: {}", container_key, e);
                return;
            }
        };
        self.queue.lock().update(document, true);
    }

    /// Starts or resumes playback.
    ///
    /// Paused-while-playing resumes on the renderer. Everything else
    /// (stopped, or already playing after a cursor move) reloads the current
    /// track and issues a fresh play. All paths end playing and unpaused.
    pub async fn play(&self) {
        let resume = {
            let mut flags = self.flags.lock();
            let resume = flags.is_playing && flags.is_paused;
            flags.is_playing = true;
            flags.is_paused = false;
            resume
        };
        if resume {
            let renderer = self.renderer.lock().await;
            if let Err(e) = renderer.resume().await {
                log::error!("Could not resume playback: {}", e);
            }
        } else {
            self.load_play().await;
        }
    }

    /// Resolves the current track into URLs and hands it to the renderer.
    async fn load_play(&self) {
        let (media_path, thumb) = {
            let mut queue = self.queue.lock();
            queue.record_played();
            match (queue.media_path(), queue.thumb()) {
                (Some(media_path), thumb) => (media_path, thumb.unwrap_or_default()),
                _ => {
                    log::warn!("Play requested with no track under the cursor");
                    return;
                }
            }
        };

        let track_url = match self.catalog.build_url(&media_path, true, &self.rewrite) {
            Ok(url) => url,
            Err(e) => {
                log::error!("Could not build media URL: {}", e);
                return;
            }
        };
        let thumb_url = self
            .catalog
            .build_url(&thumb, true, &self.rewrite)
            .unwrap_or_default();

        let renderer = self.renderer.lock().await;
        if let Err(e) = renderer.play(&track_url, &thumb_url).await {
            log::error!("Could not start playback: {}", e);
        }
    }

    /// Pauses playback. Idempotent: only the first call while unpaused
    /// reaches the renderer.
    pub async fn pause(&self) {
        let newly_paused = {
            let mut flags = self.flags.lock();
            if flags.is_paused {
                false
            } else {
                flags.is_paused = true;
                true
            }
        };
        if newly_paused {
            let renderer = self.renderer.lock().await;
            if let Err(e) = renderer.pause().await {
                log::error!("Could not pause playback: {}", e);
            }
        }
    }

    /// Stops playback, clears the flags and the queue history. Always
    /// succeeds, whatever the prior state.
    pub async fn stop(&self) {
        {
            let mut flags = self.flags.lock();
            flags.is_playing = false;
            flags.is_paused = false;
        }
        self.queue.lock().reset();
        let renderer = self.renderer.lock().await;
        if let Err(e) = renderer.stop().await {
            log::error!("Could not stop renderer: {}", e);
        }
    }

    /// Manual skip to the next track; stops when the queue is exhausted.
    pub async fn skip_next(&self) {
        let advanced = self.queue.lock().advance(false);
        if advanced {
            self.play().await;
        } else {
            self.stop().await;
        }
    }

    /// Renderer-driven advance when a track ends on its own.
    pub async fn auto_next(&self) {
        let advanced = self.queue.lock().advance(true);
        if advanced {
            self.play().await;
        } else {
            self.stop().await;
        }
    }

    /// Skips back to the previous track.
    pub async fn skip_previous(&self) {
        self.queue.lock().retreat();
        self.play().await;
    }

    /// Jumps to a specific queue item.
    pub async fn skip_to(&self, key: &str) {
        self.queue.lock().set_position(key);
        self.play().await;
    }

    /// Seeks within the current track.
    pub async fn seek(&self, offset_ms: u64) {
        let renderer = self.renderer.lock().await;
        if let Err(e) = renderer.seek(offset_ms).await {
            log::error!("Could not seek: {}", e);
        }
    }

    /// Applies a `setParameters` command (repeat, volume or shuffle).
    pub async fn set_parameters(&self, params: &HashMap<String, String>) {
        if let Some(repeat) = params.get("repeat") {
            let mode = RepeatMode::from_wire(repeat.parse().unwrap_or(0));
            self.queue.lock().set_repeat(mode);
        } else if let Some(volume) = params.get("volume") {
            let Ok(volume) = volume.parse::<u8>() else {
                log::warn!("setParameters with invalid volume: {}", volume);
                return;
            };
            let renderer = self.renderer.lock().await;
            if let Err(e) = renderer.set_volume(volume).await {
                log::error!("Could not set volume: {}", e);
            }
        } else if let Some(shuffle) = params.get("shuffle") {
            let on = shuffle.parse::<u32>().unwrap_or(0) != 0;
            self.queue.lock().set_shuffle(on);
        } else {
            log::warn!("Not implemented: setParameters {:?}", params);
        }
    }

    /// Controller-facing snapshot for timelines; `None` while stopped.
    ///
    /// Renderer read failures degrade to zeroed transport values instead of
    /// propagating.
    pub async fn state_snapshot(&self) -> Option<StateSnapshot> {
        if !self.is_playing() {
            return None;
        }
        let state = self.transport_state();
        let (track, shuffle, repeat) = {
            let queue = self.queue.lock();
            (queue.current_track_info()?, queue.shuffle(), queue.repeat())
        };
        let server = self.catalog.server_info();
        let (time_ms, volume, muted) = {
            let renderer = self.renderer.lock().await;
            (
                renderer.elapsed_ms().await.unwrap_or(0),
                renderer.volume().await.unwrap_or(0),
                renderer.is_muted().await.unwrap_or(false),
            )
        };
        Some(StateSnapshot {
            time_ms,
            volume,
            muted,
            state,
            shuffle,
            repeat,
            track,
            server,
        })
    }

    /// Upstream-facing snapshot; `None` while no queue is installed.
    pub async fn upstream_snapshot(&self) -> Option<UpstreamSnapshot> {
        let state = self.transport_state();
        let playing = self.is_playing();
        let (track, shuffle, repeat) = {
            let queue = self.queue.lock();
            if queue.is_empty() {
                return None;
            }
            (queue.current_track_info()?, queue.shuffle(), queue.repeat())
        };
        let token = self.catalog.server_info().token;
        let time_ms = if playing {
            let renderer = self.renderer.lock().await;
            renderer.elapsed_ms().await.unwrap_or(0)
        } else {
            0
        };
        Some(UpstreamSnapshot {
            state,
            time_ms,
            shuffle,
            repeat,
            token,
            track,
        })
    }

    /// Whether the renderer is ready to accept commands.
    pub async fn is_ready(&self) -> bool {
        self.renderer.lock().await.is_ready().await
    }

    /// Blocks until the renderer is ready.
    pub async fn wait_until_ready(&self) {
        let renderer = Arc::clone(&*self.renderer.lock().await);
        renderer.wait_until_ready().await;
    }

    /// Stops playback and tears the renderer down.
    pub async fn shutdown(&self) {
        self.renderer.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::MockCatalog;
    use crate::queue::{QueueDocument, TrackEntry};
    use crate::renderer::test_fixtures::MockRenderer;

    fn document(count: usize, selected: usize) -> QueueDocument {
        QueueDocument {
            queue_id: "42".to_string(),
            version: "1".to_string(),
            selected_offset: selected,
            tracks: (0..count)
                .map(|n| TrackEntry {
                    rating_key: format!("rk{}", n),
                    key: format!("/library/metadata/rk{}", n),
                    title: format!("Track {}", n),
                    duration_ms: 120_000,
                    thumb: format!("/library/metadata/rk{}/thumb", n),
                    item_id: format!("item{}", n),
                    media_path: format!("/library/parts/{}/file.flac", n),
                })
                .collect(),
        }
    }

    fn coordinator_with(
        document: Option<QueueDocument>,
    ) -> (Arc<PlaybackCoordinator>, Arc<MockRenderer>, Arc<MockCatalog>) {
        let renderer = Arc::new(MockRenderer::new());
        let catalog = match document {
            Some(doc) => Arc::new(MockCatalog::with_document(doc)),
            None => Arc::new(MockCatalog::default()),
        };
        let coordinator = Arc::new(PlaybackCoordinator::new(
            Arc::clone(&renderer) as Arc<dyn Renderer>,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            RewriteRules::default(),
        ));
        (coordinator, renderer, catalog)
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn play_media_rejects_non_music() {
        let (coordinator, renderer, _catalog) = coordinator_with(None);
        coordinator.play_media("video", "/playQueues/1").await;
        assert_eq!(renderer.call_count("stop"), 1);
        assert_eq!(renderer.call_count("play"), 0);
        assert!(!coordinator.is_playing());
    }

    #[tokio::test]
    async fn play_media_installs_queue_and_plays() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(5, 2)));
        coordinator.play_media("music", "/playQueues/42").await;
        assert!(coordinator.is_playing());
        assert_eq!(coordinator.queue.lock().position(), 2);
        let calls = renderer.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("play(http://catalog.test:32400/library/parts/2/"));
    }

    #[tokio::test]
    async fn skip_next_stops_when_exhausted() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(5, 2)));
        coordinator.play_media("music", "/playQueues/42").await;

        coordinator.skip_next().await;
        assert_eq!(coordinator.queue.lock().position(), 3);
        coordinator.skip_next().await;
        assert_eq!(coordinator.queue.lock().position(), 4);
        coordinator.skip_next().await;

        assert!(!coordinator.is_playing());
        assert_eq!(renderer.call_count("play"), 3);
        assert_eq!(renderer.call_count("stop"), 1);
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator.play_media("music", "/playQueues/42").await;
        coordinator.pause().await;
        coordinator.pause().await;
        assert_eq!(renderer.call_count("pause"), 1);
        assert_eq!(coordinator.transport_state(), TransportState::Paused);
    }

    #[tokio::test]
    async fn play_after_pause_resumes() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator.play_media("music", "/playQueues/42").await;
        coordinator.pause().await;
        coordinator.play().await;
        assert_eq!(renderer.call_count("resume"), 1);
        // The original load at playMedia time stays the only play call.
        assert_eq!(renderer.call_count("play"), 1);
        assert_eq!(coordinator.transport_state(), TransportState::Playing);
    }

    #[tokio::test]
    async fn duplicate_command_ids_from_one_origin_are_dropped() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator.play_media("music", "/playQueues/42").await;

        let p = params(&[("commandID", "7")]);
        coordinator
            .handle_command("10.0.0.9", "/player/playback/pause", &p)
            .await;
        coordinator
            .handle_command("10.0.0.9", "/player/playback/pause", &p)
            .await;
        assert_eq!(renderer.call_count("pause"), 1);

        // Same command id from a different origin still applies.
        coordinator
            .handle_command("10.0.0.10", "/player/playback/play", &p)
            .await;
        assert_eq!(renderer.call_count("resume"), 1);
    }

    #[tokio::test]
    async fn stop_always_clears_state() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(3, 1)));
        coordinator.play_media("music", "/playQueues/42").await;
        coordinator.pause().await;
        coordinator.stop().await;
        assert_eq!(coordinator.transport_state(), TransportState::Stopped);
        assert_eq!(coordinator.queue.lock().position(), 0);
        assert!(renderer.call_count("stop") >= 1);

        // Stopping again from stopped is still fine.
        coordinator.stop().await;
        assert_eq!(coordinator.transport_state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn auto_next_with_repeat_one_replays_current() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(3, 1)));
        coordinator.play_media("music", "/playQueues/42").await;
        coordinator
            .set_parameters(&params(&[("repeat", "1")]))
            .await;
        coordinator.auto_next().await;
        assert_eq!(coordinator.queue.lock().position(), 1);
        assert_eq!(renderer.call_count("play"), 2);
    }

    #[tokio::test]
    async fn seek_command_reaches_renderer() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator
            .handle_command(
                "10.0.0.9",
                "/player/playback/seekTo",
                &params(&[("offset", "95000"), ("commandID", "1")]),
            )
            .await;
        assert_eq!(renderer.calls(), vec!["seek(95000)"]);
    }

    #[tokio::test]
    async fn set_parameters_routes_volume_and_shuffle() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator
            .set_parameters(&params(&[("volume", "35")]))
            .await;
        assert_eq!(renderer.calls(), vec!["set_volume(35)"]);

        coordinator
            .set_parameters(&params(&[("shuffle", "1")]))
            .await;
        assert!(coordinator.queue.lock().shuffle());

        // Unknown keys are logged and ignored.
        coordinator
            .set_parameters(&params(&[("bassBoost", "11")]))
            .await;
        assert_eq!(renderer.calls().len(), 1);
    }

    #[tokio::test]
    async fn unknown_path_changes_nothing() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator
            .handle_command("10.0.0.9", "/player/playback/teleport", &params(&[]))
            .await;
        assert!(renderer.calls().is_empty());
        assert!(!coordinator.is_playing());
    }

    #[tokio::test]
    async fn state_snapshot_is_none_while_stopped() {
        let (coordinator, _renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        assert!(coordinator.state_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn state_snapshot_reflects_renderer() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 1)));
        coordinator.play_media("music", "/playQueues/42").await;
        renderer
            .elapsed
            .store(45_000, std::sync::atomic::Ordering::SeqCst);
        renderer
            .volume
            .store(60, std::sync::atomic::Ordering::SeqCst);

        let snapshot = coordinator.state_snapshot().await.unwrap();
        assert_eq!(snapshot.time_ms, 45_000);
        assert_eq!(snapshot.volume, 60);
        assert_eq!(snapshot.state, TransportState::Playing);
        assert_eq!(snapshot.track.rating_key, "rk1");
        assert_eq!(snapshot.track.container_key, "/playQueues/42");
    }

    #[tokio::test]
    async fn upstream_snapshot_reports_zero_elapsed_while_stopped() {
        let (coordinator, renderer, _catalog) = coordinator_with(Some(document(2, 0)));
        coordinator.play_media("music", "/playQueues/42").await;
        renderer
            .elapsed
            .store(10_000, std::sync::atomic::Ordering::SeqCst);
        coordinator.stop().await;

        let snapshot = coordinator.upstream_snapshot().await.unwrap();
        assert_eq!(snapshot.state, TransportState::Stopped);
        assert_eq!(snapshot.time_ms, 0);
    }

    #[tokio::test]
    async fn upstream_snapshot_is_none_without_queue() {
        let (coordinator, _renderer, _catalog) = coordinator_with(None);
        assert!(coordinator.upstream_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn refresh_keeps_current_track() {
        let (coordinator, _renderer, catalog) = coordinator_with(Some(document(4, 2)));
        coordinator.play_media("music", "/playQueues/42").await;

        // Server reorders the queue; rk2 moves to the front.
        let mut reordered = document(4, 0);
        reordered.tracks.swap(0, 2);
        *catalog.document.lock() = Some(reordered);

        coordinator.refresh_queue("/playQueues/42").await;
        assert_eq!(coordinator.queue.lock().position(), 0);
        assert_eq!(
            coordinator.queue.lock().current_track().unwrap().rating_key,
            "rk2"
        );
    }

    #[tokio::test]
    async fn failed_fetch_leaves_state_untouched() {
        let (coordinator, renderer, _catalog) = coordinator_with(None);
        coordinator.play_media("music", "/playQueues/42").await;
        assert!(renderer.calls().is_empty());
        assert!(!coordinator.is_playing());
        assert!(coordinator.queue.lock().is_empty());
    }
}
