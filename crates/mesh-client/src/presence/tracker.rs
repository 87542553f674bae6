//! Presence tracker.
//!
//! Merges a point-in-time snapshot of active participants with the relay's
//! presence feed and turns them into de-duplicated join/leave events. The
//! feed is opened before the snapshot is fetched, so nothing that changes
//! between the two reads is lost.

use crate::errors::MeshError;
use crate::observability::metrics;
use crate::presence::{PresenceEvent, PresenceRecord};
use crate::signaling::relay::{PresenceFeed, Relay};
use common::types::{ParticipantId, RoomId};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tracks active remote participants of one room.
pub struct PresenceTracker {
    relay: Arc<dyn Relay>,
    room_id: RoomId,
    local_id: ParticipantId,
    tracked: BTreeMap<ParticipantId, PresenceRecord>,
    pending: VecDeque<PresenceEvent>,
    /// `None` while degraded.
    feed: Option<PresenceFeed>,
}

impl PresenceTracker {
    /// Subscribe to the room's presence feed and load the initial snapshot.
    ///
    /// Every active remote participant in the snapshot is queued as a
    /// `Joined` event.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if either the subscription or
    /// the snapshot query fails.
    pub async fn start(
        relay: Arc<dyn Relay>,
        room_id: RoomId,
        local_id: ParticipantId,
    ) -> Result<Self, MeshError> {
        let mut tracker = Self {
            relay,
            room_id,
            local_id,
            tracked: BTreeMap::new(),
            pending: VecDeque::new(),
            feed: None,
        };
        tracker.sync().await?;

        info!(
            target: "mesh.presence",
            room_id = %tracker.room_id,
            active = tracker.tracked.len(),
            "Presence tracker started"
        );
        Ok(tracker)
    }

    /// Next membership event.
    ///
    /// Cancel safe. After a `Degraded` event this never resolves until
    /// [`resubscribe`](Self::resubscribe) succeeds.
    pub async fn next_event(&mut self) -> PresenceEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                metrics::record_presence_event(event.label());
                return event;
            }

            let Some(feed) = self.feed.as_mut() else {
                return std::future::pending().await;
            };

            match feed.recv().await {
                Some(Ok(record)) => self.apply(record),
                Some(Err(e)) => self.degrade(e.to_string()),
                None => self.degrade("presence feed closed".to_string()),
            }
        }
    }

    /// Re-open the feed after degradation and reconcile with a fresh
    /// snapshot.
    ///
    /// Untracked active participants are queued as `Joined`; tracked ones
    /// missing from the snapshot are queued as `Left`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable`; the tracker stays degraded.
    pub async fn resubscribe(&mut self) -> Result<(), MeshError> {
        self.sync().await?;

        info!(
            target: "mesh.presence",
            room_id = %self.room_id,
            active = self.tracked.len(),
            "Presence feed restored"
        );
        Ok(())
    }

    /// Active remote participants ordered by participant id.
    #[must_use]
    pub fn list_active(&self) -> Vec<PresenceRecord> {
        self.tracked.values().cloned().collect()
    }

    /// Display name of a tracked participant.
    #[must_use]
    pub fn display_name(&self, participant_id: &ParticipantId) -> Option<&str> {
        self.tracked
            .get(participant_id)
            .map(|r| r.display_name.as_str())
    }

    #[must_use]
    pub fn is_tracked(&self, participant_id: &ParticipantId) -> bool {
        self.tracked.contains_key(participant_id)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.feed.is_none()
    }

    async fn sync(&mut self) -> Result<(), MeshError> {
        let feed = self
            .relay
            .subscribe_presence(&self.room_id)
            .await
            .map_err(|e| MeshError::RelayUnavailable(e.to_string()))?;

        let snapshot = self
            .relay
            .query_active(&self.room_id)
            .await
            .map_err(|e| MeshError::RelayUnavailable(e.to_string()))?;

        self.reconcile(snapshot);
        self.feed = Some(feed);
        Ok(())
    }

    fn reconcile(&mut self, snapshot: Vec<PresenceRecord>) {
        let mut seen = HashSet::new();
        for record in snapshot {
            if record.active && self.is_relevant(&record) {
                seen.insert(record.participant_id.clone());
                self.apply(record);
            }
        }

        let gone: Vec<ParticipantId> = self
            .tracked
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for participant_id in gone {
            self.tracked.remove(&participant_id);
            self.pending.push_back(PresenceEvent::Left(participant_id));
        }
    }

    fn is_relevant(&self, record: &PresenceRecord) -> bool {
        record.room_id == self.room_id && record.participant_id != self.local_id
    }

    fn apply(&mut self, record: PresenceRecord) {
        if !self.is_relevant(&record) {
            return;
        }

        if record.active {
            let participant_id = record.participant_id.clone();
            if self.tracked.insert(participant_id.clone(), record.clone()).is_none() {
                debug!(
                    target: "mesh.presence",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    "Participant joined"
                );
                self.pending.push_back(PresenceEvent::Joined(record));
            }
        } else if self.tracked.remove(&record.participant_id).is_some() {
            debug!(
                target: "mesh.presence",
                room_id = %self.room_id,
                participant_id = %record.participant_id,
                "Participant left"
            );
            self.pending
                .push_back(PresenceEvent::Left(record.participant_id));
        }
    }

    fn degrade(&mut self, reason: String) {
        warn!(
            target: "mesh.presence",
            room_id = %self.room_id,
            reason = %reason,
            "Presence feed degraded"
        );
        self.feed = None;
        self.pending.push_back(PresenceEvent::Degraded(reason));
    }
}
