//! Playback position tracking and readiness state machine.
//!
//! The cursor owns the player's read offset inside the selected file and
//! derives the urgent piece window the scheduler must satisfy first.

use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::Serialize;

use crate::events::{EngineEvent, EventSender};
use crate::torrent::{FileEntry, InfoHash, PieceBitmap, TorrentDescriptor};

/// Readiness of the playback head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Initial state and after an uncovered seek; playback not allowed
    Buffering,
    /// Every piece of the lookahead window is verified
    Ready,
    /// Playback reached unverified data
    Stalled,
    /// The whole selected file is verified
    Finished,
}

/// Pieces the scheduler must serve before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrgentWindow {
    /// Piece indices intersecting `[offset, offset + lookahead)`
    pub pieces: RangeInclusive<u32>,
    /// Playback is stalled and waiting on these pieces
    pub stalled: bool,
}

impl UrgentWindow {
    /// True when the piece lies in the window.
    pub fn contains(&self, piece: u32) -> bool {
        self.pieces.contains(&piece)
    }
}

/// Current read position and lookahead, in bytes relative to the file start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackWindow {
    pub offset: u64,
    pub lookahead: u64,
}

/// Per-torrent playback state machine.
#[derive(Debug)]
pub struct PlaybackCursor {
    info_hash: InfoHash,
    descriptor: Arc<TorrentDescriptor>,
    file: FileEntry,
    window: PlaybackWindow,
    state: PlaybackState,
    events: EventSender,
}

impl PlaybackCursor {
    /// Creates a cursor at the start of the selected file, in `Buffering`.
    pub fn new(descriptor: Arc<TorrentDescriptor>, lookahead: u64, events: EventSender) -> Self {
        let file = descriptor.selected_file().clone();
        Self {
            info_hash: descriptor.info_hash,
            descriptor,
            file,
            window: PlaybackWindow {
                offset: 0,
                lookahead: lookahead.max(1),
            },
            state: PlaybackState::Buffering,
            events,
        }
    }

    /// Current readiness state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Current read position and lookahead.
    pub fn window(&self) -> PlaybackWindow {
        self.window
    }

    /// The file being played.
    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    /// Changes the lookahead; takes effect on the next evaluation.
    pub fn set_lookahead(&mut self, lookahead: u64) {
        self.window.lookahead = lookahead.max(1);
    }

    /// Urgent pieces for the scheduler, `None` once playback reached the end.
    pub fn urgent_window(&self) -> Option<UrgentWindow> {
        let (start, end) = self.byte_window();
        self.descriptor
            .pieces_for_range(start, end)
            .map(|pieces| UrgentWindow {
                pieces,
                stalled: self.state == PlaybackState::Stalled,
            })
    }

    /// Pieces covering the selected file.
    pub fn file_pieces(&self) -> Option<RangeInclusive<u32>> {
        self.descriptor
            .pieces_for_range(self.file.offset, self.file.end())
    }

    /// Re-evaluates readiness after a verification.
    pub fn on_coverage_changed(&mut self, coverage: &PieceBitmap) -> PlaybackState {
        self.evaluate(coverage, false)
    }

    /// Steady playback progressed to `offset` (bytes into the file).
    pub fn update_position(&mut self, offset: u64, coverage: &PieceBitmap) -> PlaybackState {
        self.window.offset = offset.min(self.file.length);
        self.evaluate(coverage, false)
    }

    /// Player jumped to `offset`; the window is rebuilt from scratch.
    ///
    /// Reverts to `Buffering` unless the new region is already covered.
    pub fn seek(&mut self, offset: u64, coverage: &PieceBitmap) -> PlaybackState {
        self.window.offset = offset.min(self.file.length);
        if self.state != PlaybackState::Finished {
            self.state = PlaybackState::Buffering;
        }
        tracing::debug!(
            "seek: torrent={} offset={} lookahead={}",
            self.info_hash,
            self.window.offset,
            self.window.lookahead
        );
        self.evaluate(coverage, true)
    }

    fn byte_window(&self) -> (u64, u64) {
        let start = self.file.offset + self.window.offset;
        let end = start
            .saturating_add(self.window.lookahead)
            .min(self.file.end());
        (start, end)
    }

    fn window_covered(&self, coverage: &PieceBitmap) -> bool {
        let (start, end) = self.byte_window();
        match self.descriptor.pieces_for_range(start, end) {
            Some(pieces) => coverage.has_all(*pieces.start(), *pieces.end()),
            None => true,
        }
    }

    fn file_covered(&self, coverage: &PieceBitmap) -> bool {
        match self.file_pieces() {
            Some(pieces) => coverage.has_all(*pieces.start(), *pieces.end()),
            None => true,
        }
    }

    fn evaluate(&mut self, coverage: &PieceBitmap, always_emit: bool) -> PlaybackState {
        let next = if self.file_covered(coverage) {
            PlaybackState::Finished
        } else if self.window_covered(coverage) {
            PlaybackState::Ready
        } else {
            match self.state {
                PlaybackState::Buffering => PlaybackState::Buffering,
                PlaybackState::Ready | PlaybackState::Stalled | PlaybackState::Finished => {
                    PlaybackState::Stalled
                }
            }
        };

        let changed = next != self.state;
        if changed {
            tracing::info!(
                "playback {}: {:?} -> {:?} at offset {}",
                self.info_hash,
                self.state,
                next,
                self.window.offset
            );
            self.state = next;
        }
        if changed || always_emit {
            self.events.emit(EngineEvent::Readiness {
                info_hash: self.info_hash,
                state: next,
            });
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::events::event_channel;
    use crate::torrent::PieceIndex;

    const PIECE: u32 = 1024;

    fn ten_piece_cursor(lookahead_pieces: u64) -> (PlaybackCursor, PieceBitmap) {
        let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &[0u8; PIECE as usize * 10]);
        let cursor = PlaybackCursor::new(
            Arc::new(descriptor),
            lookahead_pieces * PIECE as u64,
            EventSender::detached(),
        );
        (cursor, PieceBitmap::new(10))
    }

    fn verify(bitmap: &mut PieceBitmap, pieces: &[u32]) {
        for &piece in pieces {
            bitmap.set(PieceIndex::new(piece));
        }
    }

    #[test]
    fn test_cursor_first_three_verified_reports_ready() {
        let (mut cursor, mut coverage) = ten_piece_cursor(3);
        assert_eq!(cursor.state(), PlaybackState::Buffering);

        verify(&mut coverage, &[0, 1]);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Buffering);

        verify(&mut coverage, &[2]);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Ready);
        assert_eq!(cursor.urgent_window().unwrap().pieces, 0..=2);
    }

    #[test]
    fn test_cursor_advance_into_missing_piece_stalls() {
        let (mut cursor, mut coverage) = ten_piece_cursor(3);
        verify(&mut coverage, &[0, 1, 2]);
        cursor.on_coverage_changed(&coverage);

        let state = cursor.update_position(3 * PIECE as u64 + 10, &coverage);
        assert_eq!(state, PlaybackState::Stalled);
        let window = cursor.urgent_window().unwrap();
        assert!(window.stalled);
        assert_eq!(*window.pieces.start(), 3);

        verify(&mut coverage, &[3, 4, 5, 6]);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Ready);
    }

    #[test]
    fn test_cursor_single_missing_piece_keeps_buffering() {
        let (mut cursor, mut coverage) = ten_piece_cursor(3);
        verify(&mut coverage, &[0, 2, 3, 4]);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Buffering);
    }

    #[test]
    fn test_cursor_seek_uncovered_region_reverts_to_buffering() {
        let (mut cursor, mut coverage) = ten_piece_cursor(2);
        verify(&mut coverage, &[0, 1]);
        cursor.on_coverage_changed(&coverage);
        assert_eq!(cursor.state(), PlaybackState::Ready);

        assert_eq!(cursor.seek(6 * PIECE as u64, &coverage), PlaybackState::Buffering);
        assert_eq!(cursor.urgent_window().unwrap().pieces, 6..=7);

        verify(&mut coverage, &[6, 7]);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Ready);
        assert_eq!(cursor.seek(0, &coverage), PlaybackState::Ready);
    }

    #[test]
    fn test_cursor_all_pieces_verified_finished() {
        let (mut cursor, _) = ten_piece_cursor(3);
        let coverage = PieceBitmap::full(10);
        assert_eq!(cursor.on_coverage_changed(&coverage), PlaybackState::Finished);
        assert_eq!(cursor.seek(5000, &coverage), PlaybackState::Finished);
    }

    #[test]
    fn test_cursor_window_clamped_to_file_end() {
        let (mut cursor, mut coverage) = ten_piece_cursor(4);
        verify(&mut coverage, &[8, 9]);
        cursor.seek(8 * PIECE as u64, &coverage);
        assert_eq!(cursor.urgent_window().unwrap().pieces, 8..=9);
        assert_eq!(cursor.state(), PlaybackState::Ready);
    }

    #[test]
    fn test_cursor_multi_file_offsets_relative_to_selected_file() {
        let descriptor = TorrentDescriptor::new(
            InfoHash::new([4; 20]),
            "pack",
            PIECE,
            vec![[0; 20]; 6],
            vec![
                (PathBuf::from("pack/sample.mkv"), 1500),
                (PathBuf::from("pack/feature.mkv"), 4500),
            ],
        )
        .unwrap();
        let cursor = PlaybackCursor::new(Arc::new(descriptor), 100, EventSender::detached());

        assert_eq!(cursor.file().path, PathBuf::from("pack/feature.mkv"));
        assert_eq!(cursor.urgent_window().unwrap().pieces, 1..=1);
        assert_eq!(cursor.file_pieces(), Some(1..=5));
    }

    #[tokio::test]
    async fn test_cursor_transitions_emit_readiness_events() {
        let descriptor = TorrentDescriptor::for_content("m.mkv", PIECE, &[0u8; PIECE as usize * 4]);
        let info_hash = descriptor.info_hash;
        let (events, mut receiver) = event_channel();
        let mut cursor = PlaybackCursor::new(Arc::new(descriptor), PIECE as u64, events);

        let mut coverage = PieceBitmap::new(4);
        coverage.set(PieceIndex::new(0));
        cursor.on_coverage_changed(&coverage);
        cursor.on_coverage_changed(&coverage);
        cursor.seek(0, &coverage);

        let ready = EngineEvent::Readiness {
            info_hash,
            state: PlaybackState::Ready,
        };
        assert_eq!(receiver.recv().await, Some(ready.clone()));
        assert_eq!(receiver.recv().await, Some(ready));
        assert!(receiver.try_recv().is_err());
    }
}
