//! Mesh Client Library
//!
//! Peer-mesh connection orchestration for a small-room video call: every
//! participant holds one direct media session to every other participant.
//! The library tracks who is in the room, decides which side of each pair
//! starts negotiation, relays negotiation messages and drives each per-peer
//! session through its lifecycle.
//!
//! # Architecture
//!
//! ```text
//! presentation layer
//!        │  MeshCoordinatorHandle (list peers, toggle tracks, leave)
//!        ▼
//! MeshCoordinator ──► PresenceTracker ──┐
//!        │         ──► SignalingClient ─┼──► Relay (embedder-provided)
//!        ▼                              │
//! PeerActor per peer ──► Outbox ────────┘
//!        │
//!        └──► PeerSession ──► PeerTransport (TransportFactory)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Deterministic initiator**: the lower participant id offers
//! - **One task per peer**: the coordinator serializes room state, and each
//!   peer's session runs on its own actor so one stalled transport cannot
//!   hold up the others
//! - **Injected collaborators**: relay, transport factory and local media
//!   are traits handed to `MeshCoordinator::spawn`
//!
//! # Modules
//!
//! - [`actors`] - Coordinator actor, handle and messages
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`media`] - Track descriptors and the local media seam
//! - [`observability`] - Metrics
//! - [`presence`] - Presence records and tracker
//! - [`session`] - Per-peer session state machine
//! - [`signaling`] - Wire types, relay seam and relay client
//! - [`transport`] - Transport seam (and the `webrtc` backend behind its feature)

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use actors::{
    MeshCoordinator, MeshCoordinatorHandle, MeshEvent, MeshSnapshot, Membership, PeerView,
};
pub use config::Config;
pub use errors::MeshError;
pub use media::{LocalMedia, LocalMediaSource, LocalTrack, TrackKind};
pub use signaling::Relay;
pub use transport::TransportFactory;
