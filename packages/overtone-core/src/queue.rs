//! Ordered play queue with a position cursor, shuffle/repeat modes and
//! bidirectional history.
//!
//! The queue never talks to the network: it holds the last
//! [`QueueDocument`] fetched from the upstream catalog and answers cursor
//! movements on it. Shuffle avoids repeating tracks by tracking the set of
//! already-played rating keys instead of pre-computing a permutation: the
//! track set can change mid-play through a queue refresh, which would
//! invalidate any up-front shuffle order.

use std::collections::HashSet;
use std::fmt;

use rand::seq::IndexedRandom;

/// Repeat behavior of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    /// Stop when the queue is exhausted.
    #[default]
    Off,
    /// Replay the current track when it ends on its own.
    One,
    /// Restart the queue when exhausted.
    All,
}

impl RepeatMode {
    /// Parses the wire representation (0/1/2) used by `setParameters`.
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::One,
            2 => Self::All,
            _ => Self::Off,
        }
    }

    /// Wire representation reported on timelines.
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::One => 1,
            Self::All => 2,
        }
    }
}

/// One track of a queue document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEntry {
    /// Stable identifier of the track in the catalog.
    pub rating_key: String,
    /// Catalog metadata path of the track.
    pub key: String,
    /// Display title (used only for logging).
    pub title: String,
    /// Track duration in milliseconds.
    pub duration_ms: u64,
    /// Catalog path of the artwork.
    pub thumb: String,
    /// Identifier of this entry within the queue.
    pub item_id: String,
    /// Catalog path of the playable media part.
    pub media_path: String,
}

/// Immutable queue contents as fetched from the upstream catalog.
///
/// Replaced wholesale on every fetch or refresh; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDocument {
    /// Identifier of the queue on the catalog server.
    pub queue_id: String,
    /// Version counter, bumped by the server on every edit.
    pub version: String,
    /// Index of the track the controller selected when creating the queue.
    pub selected_offset: usize,
    /// Ordered track list.
    pub tracks: Vec<TrackEntry>,
}

impl QueueDocument {
    /// Number of tracks in the document.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Returns true if the document holds no tracks.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Snapshot of the current track used when building timelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTrackInfo {
    pub rating_key: String,
    pub key: String,
    pub duration_ms: u64,
    pub item_id: String,
    pub queue_id: String,
    pub queue_version: String,
    pub container_key: String,
}

/// Play queue state machine.
pub struct PlayQueue {
    document: Option<QueueDocument>,
    position: usize,
    played: HashSet<String>,
    history: Vec<String>,
    current_key: String,
    shuffle: bool,
    repeat: RepeatMode,
}

impl Default for PlayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            document: None,
            position: 0,
            played: HashSet::new(),
            history: Vec::new(),
            current_key: String::new(),
            shuffle: false,
            repeat: RepeatMode::Off,
        }
    }

    /// Returns true while no document has been installed.
    pub fn is_empty(&self) -> bool {
        self.document.is_none()
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Installs a new document.
    ///
    /// On a refresh the cursor is recomputed by locating the remembered
    /// current track inside the new document; if the track vanished the
    /// cursor clamps to 0 and the queue is dumped to the log. On an initial
    /// install the cursor comes from the document's selected offset and the
    /// track under it becomes the remembered current track.
    pub fn update(&mut self, document: QueueDocument, is_refresh: bool) {
        self.document = Some(document);
        if is_refresh {
            match self.find_position(&self.current_key.clone()) {
                Some(pos) => self.position = pos,
                None => {
                    log::error!(
                        "Could not find track position after refresh: {}",
                        self.current_key
                    );
                    log::error!("Current play queue: {}", self);
                    self.position = 0;
                }
            }
        } else {
            let doc = self.document.as_ref().expect("document just installed");
            self.position = if doc.selected_offset < doc.len() {
                doc.selected_offset
            } else {
                log::error!(
                    "Selected offset {} outside queue of {} tracks",
                    doc.selected_offset,
                    doc.len()
                );
                0
            };
            self.current_key = self
                .current_track()
                .map(|t| t.rating_key.clone())
                .unwrap_or_default();
        }
        log::info!("Current position: {}", self.position);
        log::info!("Current play queue: {}", self);
    }

    /// Clears history state and rewinds the cursor. Keeps the document.
    pub fn reset(&mut self) {
        self.played.clear();
        self.history.clear();
        self.position = 0;
    }

    /// Moves the cursor to the next track.
    ///
    /// `is_automatic` marks an advance triggered by the renderer finishing a
    /// track on its own, which is the only case repeat-one holds the cursor
    /// in place. Returns false when the queue is exhausted and no repeat
    /// mode applies; the cursor is left unchanged in that case.
    pub fn advance(&mut self, is_automatic: bool) -> bool {
        let len = self.document.as_ref().map(QueueDocument::len).unwrap_or(0);
        if self.shuffle {
            if self.played.len() < len {
                if !(self.repeat == RepeatMode::One && is_automatic) {
                    if let Some(pos) = self.random_unplayed_position() {
                        self.position = pos;
                    }
                }
                true
            } else if self.played.len() == len {
                match self.repeat {
                    RepeatMode::One if is_automatic => true,
                    RepeatMode::All => {
                        self.played.clear();
                        if let Some(pos) = self.random_unplayed_position() {
                            self.position = pos;
                        }
                        !self.is_document_empty()
                    }
                    _ => false,
                }
            } else {
                log::error!("Unknown state to get the next track (shuffled)");
                false
            }
        } else if self.position + 1 < len {
            if !(self.repeat == RepeatMode::One && is_automatic) {
                self.position += 1;
            }
            true
        } else if self.position + 1 == len {
            match self.repeat {
                RepeatMode::One if is_automatic => true,
                RepeatMode::All => {
                    self.played.clear();
                    self.position = 0;
                    true
                }
                _ => false,
            }
        } else {
            log::error!("Unknown state to get the next track");
            false
        }
    }

    /// Moves the cursor to the previous track.
    ///
    /// In shuffle mode the cursor follows the history stack: the entry for
    /// the current track and the one before it are popped and the cursor
    /// lands on the latter (no-op with fewer than two entries). In
    /// sequential mode the cursor simply decrements, saturating at 0.
    pub fn retreat(&mut self) {
        if self.shuffle {
            if self.history.len() > 1 {
                self.history.pop();
                if let Some(prior) = self.history.pop() {
                    match self.find_position(&prior) {
                        Some(pos) => self.position = pos,
                        None => {
                            log::error!("Could not find track position: {}", prior);
                            log::error!("Current play queue: {}", self);
                        }
                    }
                }
            }
        } else if self.position > 0 {
            self.position -= 1;
        }
    }

    /// Resolves a queue-relative key (last path segment = rating key) and
    /// moves the cursor there. Unknown keys are logged and leave the cursor
    /// unchanged.
    pub fn set_position(&mut self, item_key: &str) {
        let rating_key = item_key.rsplit('/').next().unwrap_or(item_key);
        match self.find_position(rating_key) {
            Some(pos) => self.position = pos,
            None => {
                log::error!("Could not find track position: {}", rating_key);
                log::error!("Current play queue: {}", self);
            }
        }
    }

    /// Marks the track under the cursor as played.
    ///
    /// Called when playback of the track actually starts: remembers its
    /// rating key, adds it to the shuffle exhaustion set and pushes it onto
    /// the history stack unless it already sits on top.
    pub fn record_played(&mut self) {
        let Some(track) = self.current_track() else {
            return;
        };
        let rating_key = track.rating_key.clone();
        self.current_key = rating_key.clone();
        self.played.insert(rating_key.clone());
        if self.history.last() != Some(&rating_key) {
            self.history.push(rating_key);
        }
    }

    /// Track under the cursor, if a document is installed.
    pub fn current_track(&self) -> Option<&TrackEntry> {
        self.document.as_ref()?.tracks.get(self.position)
    }

    /// Catalog path of the current track's media part.
    pub fn media_path(&self) -> Option<String> {
        self.current_track().map(|t| t.media_path.clone())
    }

    /// Catalog path of the current track's artwork.
    pub fn thumb(&self) -> Option<String> {
        self.current_track().map(|t| t.thumb.clone())
    }

    /// Container key of the active queue on the catalog server.
    pub fn container_key(&self) -> Option<String> {
        self.document
            .as_ref()
            .map(|d| format!("/playQueues/{}", d.queue_id))
    }

    /// Snapshot of the current track for timeline reporting.
    pub fn current_track_info(&self) -> Option<CurrentTrackInfo> {
        let doc = self.document.as_ref()?;
        let track = doc.tracks.get(self.position)?;
        Some(CurrentTrackInfo {
            rating_key: track.rating_key.clone(),
            key: track.key.clone(),
            duration_ms: track.duration_ms,
            item_id: track.item_id.clone(),
            queue_id: doc.queue_id.clone(),
            queue_version: doc.version.clone(),
            container_key: format!("/playQueues/{}", doc.queue_id),
        })
    }

    fn is_document_empty(&self) -> bool {
        self.document.as_ref().map(QueueDocument::is_empty).unwrap_or(true)
    }

    fn find_position(&self, rating_key: &str) -> Option<usize> {
        self.document
            .as_ref()?
            .tracks
            .iter()
            .position(|t| t.rating_key == rating_key)
    }

    fn random_unplayed_position(&self) -> Option<usize> {
        let doc = self.document.as_ref()?;
        let candidates: Vec<usize> = (0..doc.len())
            .filter(|&i| !self.played.contains(&doc.tracks[i].rating_key))
            .collect();
        candidates.choose(&mut rand::rng()).copied()
    }
}

impl fmt::Display for PlayQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.document {
            None => write!(f, "<empty>"),
            Some(doc) => {
                for (pos, track) in doc.tracks.iter().enumerate() {
                    if pos > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}: {} [{}]", pos, track.title, track.rating_key)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(n: usize) -> TrackEntry {
        TrackEntry {
            rating_key: format!("rk{}", n),
            key: format!("/library/metadata/rk{}", n),
            title: format!("Track {}", n),
            duration_ms: 60_000 + n as u64,
            thumb: format!("/library/metadata/rk{}/thumb", n),
            item_id: format!("item{}", n),
            media_path: format!("/library/parts/{}/file.flac", n),
        }
    }

    fn document(count: usize, selected: usize) -> QueueDocument {
        QueueDocument {
            queue_id: "77".to_string(),
            version: "1".to_string(),
            selected_offset: selected,
            tracks: (0..count).map(track).collect(),
        }
    }

    fn queue_of(count: usize, selected: usize) -> PlayQueue {
        let mut queue = PlayQueue::new();
        queue.update(document(count, selected), false);
        queue
    }

    #[test]
    fn initial_install_uses_selected_offset() {
        let queue = queue_of(5, 2);
        assert_eq!(queue.position(), 2);
        assert_eq!(queue.current_track().unwrap().rating_key, "rk2");
    }

    #[test]
    fn sequential_advance_increases_until_exhausted() {
        let mut queue = queue_of(3, 0);
        assert!(queue.advance(false));
        assert_eq!(queue.position(), 1);
        assert!(queue.advance(false));
        assert_eq!(queue.position(), 2);
        // Exhausted without repeat: reports false, cursor untouched.
        assert!(!queue.advance(false));
        assert_eq!(queue.position(), 2);
        assert!(!queue.advance(false));
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn sequential_repeat_all_wraps_to_zero() {
        let mut queue = queue_of(2, 0);
        queue.set_repeat(RepeatMode::All);
        assert!(queue.advance(false));
        assert_eq!(queue.position(), 1);
        assert!(queue.advance(false));
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn repeat_one_automatic_holds_position() {
        let mut queue = queue_of(3, 1);
        queue.set_repeat(RepeatMode::One);
        assert!(queue.advance(true));
        assert_eq!(queue.position(), 1);
        assert!(queue.advance(true));
        assert_eq!(queue.position(), 1);
    }

    #[test]
    fn repeat_one_manual_skip_still_advances() {
        let mut queue = queue_of(3, 1);
        queue.set_repeat(RepeatMode::One);
        assert!(queue.advance(false));
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn repeat_one_automatic_replays_after_exhaustion() {
        let mut queue = queue_of(1, 0);
        queue.set_repeat(RepeatMode::One);
        queue.record_played();
        assert!(queue.advance(true));
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn shuffle_never_repeats_within_a_window() {
        let mut queue = queue_of(6, 0);
        queue.set_shuffle(true);
        queue.record_played();
        let mut seen = vec![queue.current_track().unwrap().rating_key.clone()];
        for _ in 0..5 {
            assert!(queue.advance(false));
            queue.record_played();
            let key = queue.current_track().unwrap().rating_key.clone();
            assert!(!seen.contains(&key), "repeated {} within window", key);
            seen.push(key);
        }
        // All six played: exhausted without repeat.
        assert!(!queue.advance(false));
    }

    #[test]
    fn shuffle_repeat_all_resets_played_set() {
        let mut queue = queue_of(4, 0);
        queue.set_shuffle(true);
        queue.set_repeat(RepeatMode::All);
        queue.record_played();
        for _ in 0..3 {
            assert!(queue.advance(false));
            queue.record_played();
        }
        // Exhausted: the next advance clears the played set and picks again.
        assert!(queue.advance(false));
        queue.record_played();
        assert_eq!(queue.played.len(), 1);
    }

    #[test]
    fn retreat_sequential_saturates_at_zero() {
        let mut queue = queue_of(3, 1);
        queue.retreat();
        assert_eq!(queue.position(), 0);
        queue.retreat();
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn retreat_shuffle_follows_history() {
        let mut queue = queue_of(5, 0);
        queue.set_shuffle(true);
        queue.record_played(); // rk0
        queue.set_position("/library/metadata/rk3");
        queue.record_played(); // rk3
        queue.retreat();
        assert_eq!(queue.current_track().unwrap().rating_key, "rk0");
    }

    #[test]
    fn retreat_shuffle_noop_without_enough_history() {
        let mut queue = queue_of(5, 2);
        queue.set_shuffle(true);
        queue.record_played();
        queue.retreat();
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn record_played_dedups_history_top() {
        let mut queue = queue_of(3, 1);
        queue.record_played();
        queue.record_played();
        assert_eq!(queue.history.len(), 1);
    }

    #[test]
    fn set_position_with_unknown_key_leaves_cursor() {
        let mut queue = queue_of(3, 1);
        queue.set_position("/library/metadata/rk99");
        assert_eq!(queue.position(), 1);
    }

    #[test]
    fn refresh_relocates_remembered_track() {
        let mut queue = queue_of(4, 2);
        // Same tracks in a different order: rk2 moves to the front.
        let mut doc = document(4, 0);
        doc.tracks.swap(0, 2);
        doc.version = "2".to_string();
        queue.update(doc, true);
        assert_eq!(queue.position(), 0);
        assert_eq!(queue.current_track().unwrap().rating_key, "rk2");
    }

    #[test]
    fn refresh_with_vanished_track_clamps_to_zero() {
        let mut queue = queue_of(4, 3);
        let mut doc = document(4, 0);
        doc.tracks.remove(3);
        queue.update(doc, true);
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn reset_keeps_document() {
        let mut queue = queue_of(3, 2);
        queue.record_played();
        queue.reset();
        assert_eq!(queue.position(), 0);
        assert!(queue.played.is_empty());
        assert!(queue.history.is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn current_track_info_carries_queue_ids() {
        let queue = queue_of(3, 1);
        let info = queue.current_track_info().unwrap();
        assert_eq!(info.queue_id, "77");
        assert_eq!(info.container_key, "/playQueues/77");
        assert_eq!(info.rating_key, "rk1");
    }

    #[test]
    fn empty_queue_advance_reports_exhausted() {
        let mut queue = PlayQueue::new();
        assert!(!queue.advance(false));
        queue.set_shuffle(true);
        assert!(!queue.advance(false));
    }

    #[test]
    fn repeat_mode_wire_round_trip() {
        assert_eq!(RepeatMode::from_wire(0), RepeatMode::Off);
        assert_eq!(RepeatMode::from_wire(1), RepeatMode::One);
        assert_eq!(RepeatMode::from_wire(2), RepeatMode::All);
        assert_eq!(RepeatMode::from_wire(9), RepeatMode::Off);
        assert_eq!(RepeatMode::All.as_wire(), 2);
    }
}
