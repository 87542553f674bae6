//! # Mesh Test Utilities
//!
//! Shared test utilities for the mesh client.
//!
//! The in-memory relay and scripted transport live in `mesh_client::testing`
//! (behind its `test-utils` feature); this crate layers fixtures and a
//! multi-participant harness on top of them.
//!
//! ## Modules
//!
//! - `fixtures` - Rooms, participants, track sets and a fast test config
//! - `harness` - `MeshHarness`, several coordinators sharing one relay
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let mut mesh = MeshHarness::new();
//!     let a = mesh.join("a-1").await;
//!     let b = mesh.join("b-2").await;
//!
//!     eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;
//!     b.handle.leave().await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
