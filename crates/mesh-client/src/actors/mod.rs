//! Actor model for one room membership.
//!
//! ```text
//! MeshCoordinator (one per room membership)
//! ├── owns presence tracker and signal stream
//! └── supervises N PeerActors (one per remote participant)
//!     ├── owns one PeerSession and its transport
//!     └── supervises one Outbox (relay sends)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Room state on one task**: presence, routing and the session map live
//!   on the coordinator, which never waits on a transport
//! - **Session state on its own task**: a stalled transport only stalls its
//!   own `PeerActor`
//! - **CancellationToken propagation**: peer actors and outboxes get child
//!   tokens
//! - **Message passing**: handles talk to the coordinator via `tokio::sync::mpsc`
//!
//! # Modules
//!
//! - [`coordinator`] - `MeshCoordinator` and its handle
//! - [`messages`] - Message and view types
//! - `peer` - Per-peer session actor
//! - `outbox` - Per-peer relay sender

pub mod coordinator;
pub mod messages;
mod outbox;
mod peer;

pub use coordinator::{is_initiator, MeshCoordinator, MeshCoordinatorHandle, Membership};
pub use messages::*;
