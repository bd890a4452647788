//! Typed events from the engine to the player/UI collaborator.
//!
//! Delivery is at-least-once: the same readiness state or coverage change can
//! be reported more than once, so consumers must apply events idempotently.

use tokio::sync::mpsc;

use crate::playback::PlaybackState;
use crate::torrent::{InfoHash, PieceIndex};

/// Notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Playback readiness changed (or was re-confirmed).
    Readiness {
        info_hash: InfoHash,
        state: PlaybackState,
    },
    /// Periodic transfer progress.
    Progress {
        info_hash: InfoHash,
        progress_percent: f64,
        download_kbps: f64,
        upload_kbps: f64,
        peers: usize,
        seeds: usize,
    },
    /// A piece finished verification.
    CoverageChanged {
        info_hash: InfoHash,
        piece: PieceIndex,
    },
    /// The torrent hit a fatal storage error and stopped.
    TorrentErrored { info_hash: InfoHash, reason: String },
    /// Every discovery source failed; the torrent is stalled, not failed.
    SourcesExhausted { info_hash: InfoHash },
}

impl EngineEvent {
    /// Torrent the event refers to.
    pub fn info_hash(&self) -> InfoHash {
        match self {
            Self::Readiness { info_hash, .. }
            | Self::Progress { info_hash, .. }
            | Self::CoverageChanged { info_hash, .. }
            | Self::TorrentErrored { info_hash, .. }
            | Self::SourcesExhausted { info_hash } => *info_hash,
        }
    }
}

/// Receiving end handed to the external collaborator.
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Cloneable sending end shared by engine components.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSender {
    /// Publishes an event. A dropped receiver is not an error for the engine.
    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event receiver dropped; discarding event");
        }
    }

    /// Sender whose events go nowhere, for components used standalone.
    pub fn detached() -> Self {
        let (sender, _receiver) = mpsc::unbounded_channel();
        Self { sender }
    }
}

/// Creates a connected sender/receiver pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel_delivers_in_order() {
        let (sender, mut receiver) = event_channel();
        let info_hash = InfoHash::new([3; 20]);

        sender.emit(EngineEvent::SourcesExhausted { info_hash });
        sender.emit(EngineEvent::Readiness {
            info_hash,
            state: PlaybackState::Ready,
        });

        assert_eq!(
            receiver.recv().await,
            Some(EngineEvent::SourcesExhausted { info_hash })
        );
        let next = receiver.recv().await.unwrap();
        assert_eq!(next.info_hash(), info_hash);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let sender = EventSender::detached();
        sender.emit(EngineEvent::SourcesExhausted {
            info_hash: InfoHash::new([0; 20]),
        });
    }
}
