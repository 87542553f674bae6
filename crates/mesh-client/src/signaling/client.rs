//! Signaling relay client.
//!
//! Ships addressed signals through the relay and delivers the ones
//! addressed to the local participant. Payloads are tagged by kind only;
//! decoding happens in the peer session that consumes them.

use crate::errors::MeshError;
use crate::observability::metrics;
use crate::presence::PresenceRecord;
use crate::signaling::message::{Signal, SignalingMessage};
use crate::signaling::relay::{Relay, SignalFeed};
use common::types::{ParticipantId, RoomId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Relay client scoped to one room membership.
#[derive(Clone)]
pub struct SignalingClient {
    relay: Arc<dyn Relay>,
    room_id: RoomId,
    local_id: ParticipantId,
    /// Last record announced by `mark_active`.
    announced: Arc<Mutex<Option<PresenceRecord>>>,
}

impl SignalingClient {
    #[must_use]
    pub fn new(relay: Arc<dyn Relay>, room_id: RoomId, local_id: ParticipantId) -> Self {
        Self {
            relay,
            room_id,
            local_id,
            announced: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Send `signal` to `to`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if the relay insert fails.
    pub async fn send(&self, to: &ParticipantId, signal: &Signal) -> Result<(), MeshError> {
        let kind = signal.kind();
        let message = SignalingMessage::new(
            self.room_id.clone(),
            self.local_id.clone(),
            to.clone(),
            signal,
        )?;

        debug!(
            target: "mesh.signaling",
            room_id = %self.room_id,
            to = %to,
            kind = %kind,
            "Sending signal"
        );

        match self.relay.insert(message).await {
            Ok(()) => {
                metrics::record_signal_sent(kind.as_str(), "success");
                Ok(())
            }
            Err(e) => {
                metrics::record_signal_sent(kind.as_str(), "error");
                Err(match e {
                    MeshError::RelayUnavailable(_) => e,
                    other => MeshError::RelayUnavailable(other.to_string()),
                })
            }
        }
    }

    /// Subscribe to signals addressed to the local participant.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if the relay refuses the
    /// subscription.
    pub async fn subscribe(&self) -> Result<SignalStream, MeshError> {
        let feed = self
            .relay
            .subscribe(&self.room_id, &self.local_id)
            .await
            .map_err(|e| MeshError::RelayUnavailable(e.to_string()))?;

        Ok(SignalStream {
            feed,
            room_id: self.room_id.clone(),
            local_id: self.local_id.clone(),
        })
    }

    /// Announce the local participant as active.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if the upsert fails.
    pub async fn mark_active(&self, display_name: &str) -> Result<(), MeshError> {
        let record = PresenceRecord::joined(
            self.local_id.clone(),
            self.room_id.clone(),
            display_name,
        );

        self.relay
            .upsert_presence(record.clone())
            .await
            .map_err(|e| MeshError::RelayUnavailable(e.to_string()))?;

        debug!(
            target: "mesh.signaling",
            room_id = %self.room_id,
            participant_id = %self.local_id,
            "Marked active"
        );

        *self.announced.lock().await = Some(record);
        Ok(())
    }

    /// Mark the local participant inactive, recording `left_at`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if the upsert fails.
    pub async fn mark_departed(&self) -> Result<(), MeshError> {
        let record = match self.announced.lock().await.as_ref() {
            Some(record) => record.departed(),
            None => PresenceRecord::joined(
                self.local_id.clone(),
                self.room_id.clone(),
                self.local_id.as_str(),
            )
            .departed(),
        };

        self.relay
            .upsert_presence(record)
            .await
            .map_err(|e| MeshError::RelayUnavailable(e.to_string()))?;

        debug!(
            target: "mesh.signaling",
            room_id = %self.room_id,
            participant_id = %self.local_id,
            "Marked departed"
        );
        Ok(())
    }
}

/// Inbound signals addressed to the local participant.
pub struct SignalStream {
    feed: SignalFeed,
    room_id: RoomId,
    local_id: ParticipantId,
}

impl SignalStream {
    /// Next message for the local participant.
    ///
    /// Messages for other recipients or rooms are skipped. Returns `None`
    /// once the feed has closed. Cancel safe.
    pub async fn recv(&mut self) -> Option<Result<SignalingMessage, MeshError>> {
        loop {
            match self.feed.recv().await? {
                Ok(message) => {
                    if message.to_peer_id != self.local_id || message.room_id != self.room_id {
                        warn!(
                            target: "mesh.signaling",
                            room_id = %message.room_id,
                            to = %message.to_peer_id,
                            "Relay delivered a signal for another recipient, skipping"
                        );
                        continue;
                    }

                    debug!(
                        target: "mesh.signaling",
                        room_id = %self.room_id,
                        from = %message.from_peer_id,
                        kind = %message.kind,
                        "Received signal"
                    );
                    return Some(Ok(message));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
