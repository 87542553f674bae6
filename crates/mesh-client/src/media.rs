//! Local and remote media descriptors, and the local media seam.
//!
//! The mesh never touches media samples. It only needs to know which local
//! tracks to attach to each transport and when that set changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Outbound track handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

impl LocalTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
        }
    }
}

/// Inbound track received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Inbound media of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add `track`, replacing any track with the same id.
    pub(crate) fn upsert(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }
}

/// Whether two track lists differ in membership (ids or kinds), ignoring
/// enabled flags.
#[must_use]
pub fn track_set_changed(before: &[LocalTrack], after: &[LocalTrack]) -> bool {
    let key = |tracks: &[LocalTrack]| {
        let mut k: Vec<(String, TrackKind)> =
            tracks.iter().map(|t| (t.id.clone(), t.kind)).collect();
        k.sort_by(|a, b| a.0.cmp(&b.0));
        k
    };
    key(before) != key(after)
}

/// Source of outbound tracks.
pub trait LocalMedia: Send + Sync {
    /// Tracks to attach to a new session.
    fn current_tracks(&self) -> Vec<LocalTrack>;

    /// Change notifications; the value is the full current track list.
    fn subscribe(&self) -> watch::Receiver<Vec<LocalTrack>>;
}

/// `LocalMedia` backed by a watch channel.
#[derive(Debug)]
pub struct LocalMediaSource {
    tracks: watch::Sender<Vec<LocalTrack>>,
}

impl Default for LocalMediaSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LocalMediaSource {
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        let (tx, _rx) = watch::channel(tracks);
        Self { tracks: tx }
    }

    /// One enabled audio track and one enabled video track.
    #[must_use]
    pub fn camera_and_microphone() -> Self {
        Self::new(vec![
            LocalTrack::new("microphone", TrackKind::Audio),
            LocalTrack::new("camera", TrackKind::Video),
        ])
    }

    /// Add a track, replacing one with the same id.
    pub fn add_track(&self, track: LocalTrack) {
        self.tracks.send_modify(|tracks| {
            tracks.retain(|t| t.id != track.id);
            tracks.push(track);
        });
    }

    /// Remove a track by id. Returns whether it was present.
    pub fn remove_track(&self, id: &str) -> bool {
        let mut removed = false;
        self.tracks.send_if_modified(|tracks| {
            let before = tracks.len();
            tracks.retain(|t| t.id != id);
            removed = tracks.len() != before;
            removed
        });
        removed
    }

    /// Flip every track of `kind`. Returns the new state, or `None` if no
    /// track of that kind exists.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let mut state = None;
        self.tracks.send_if_modified(|tracks| {
            for track in tracks.iter_mut().filter(|t| t.kind == kind) {
                track.enabled = !track.enabled;
                state = Some(track.enabled);
            }
            state.is_some()
        });

        if let Some(enabled) = state {
            debug!(target: "mesh.media", kind = %kind, enabled, "Toggled local tracks");
        }
        state
    }

    /// Mute or unmute the microphone. Returns the new state.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Turn the camera on or off. Returns the new state.
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }
}

impl LocalMedia for LocalMediaSource {
    fn current_tracks(&self) -> Vec<LocalTrack> {
        self.tracks.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<LocalTrack>> {
        self.tracks.subscribe()
    }
}
