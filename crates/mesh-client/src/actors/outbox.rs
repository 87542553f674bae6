//! `Outbox` - per-peer relay sender.
//!
//! Each peer session gets one outbox so a slow or stalled relay insert for
//! one peer never holds up the coordinator or any other peer. Signals for
//! one peer are sent in the order they were enqueued. Delivery is
//! fire-and-forget: a failed or timed-out send is logged and dropped.

use crate::observability::metrics;
use crate::signaling::{Signal, SignalingClient};

use common::types::ParticipantId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Default channel buffer size for an outbox.
pub(crate) const OUTBOX_CHANNEL_BUFFER: usize = 64;

/// Handle to an `Outbox` task.
pub(crate) struct OutboxHandle {
    sender: mpsc::Sender<Signal>,
    cancel_token: CancellationToken,
    peer_id: ParticipantId,
}

impl OutboxHandle {
    /// Queue `signal` for delivery without waiting.
    pub(crate) fn enqueue(&self, signal: Signal) {
        match self.sender.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => {
                warn!(
                    target: "mesh.actor.outbox",
                    peer_id = %self.peer_id,
                    kind = %signal.kind(),
                    "Outbox full, dropping signal"
                );
                metrics::record_signal_dropped("backpressure");
            }
            Err(TrySendError::Closed(signal)) => {
                debug!(
                    target: "mesh.actor.outbox",
                    peer_id = %self.peer_id,
                    kind = %signal.kind(),
                    "Outbox closed, dropping signal"
                );
            }
        }
    }

    /// Stop the outbox, abandoning queued and in-flight sends.
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Sends one peer's signals through the relay.
pub(crate) struct Outbox {
    peer_id: ParticipantId,
    receiver: mpsc::Receiver<Signal>,
    cancel_token: CancellationToken,
    client: SignalingClient,
    send_timeout: Duration,
}

impl Outbox {
    /// Spawn an outbox for `peer_id`.
    ///
    /// `cancel_token` should be a child of the coordinator's token.
    pub(crate) fn spawn(
        peer_id: ParticipantId,
        client: SignalingClient,
        send_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> (OutboxHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(OUTBOX_CHANNEL_BUFFER);

        let outbox = Self {
            peer_id: peer_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            client,
            send_timeout,
        };
        let task_handle = tokio::spawn(outbox.run());

        let handle = OutboxHandle {
            sender,
            cancel_token,
            peer_id,
        };
        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.actor.outbox", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(target: "mesh.actor.outbox", peer_id = %self.peer_id, "Outbox started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => break,

                signal = self.receiver.recv() => {
                    match signal {
                        Some(signal) => self.deliver(signal).await,
                        None => break,
                    }
                }
            }
        }

        debug!(target: "mesh.actor.outbox", peer_id = %self.peer_id, "Outbox stopped");
    }

    async fn deliver(&self, signal: Signal) {
        let kind = signal.kind();
        let send = tokio::time::timeout(self.send_timeout, self.client.send(&self.peer_id, &signal));

        tokio::select! {
            biased;

            () = self.cancel_token.cancelled() => {
                debug!(
                    target: "mesh.actor.outbox",
                    peer_id = %self.peer_id,
                    kind = %kind,
                    "Send abandoned on cancellation"
                );
            }

            result = send => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.actor.outbox",
                        peer_id = %self.peer_id,
                        kind = %kind,
                        error = %e,
                        "Signal send failed"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "mesh.actor.outbox",
                        peer_id = %self.peer_id,
                        kind = %kind,
                        timeout_ms = self.send_timeout.as_millis(),
                        "Signal send timed out"
                    );
                    metrics::record_signal_sent(kind.as_str(), "timeout");
                }
            },
        }
    }
}
