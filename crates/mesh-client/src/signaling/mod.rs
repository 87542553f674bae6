//! Signaling: wire types, the relay seam and the relay client.

pub mod client;
pub mod message;
pub mod relay;

pub use client::{SignalStream, SignalingClient};
pub use message::{
    IceCandidate, SdpType, SessionDescription, Signal, SignalKind, SignalingMessage,
};
pub use relay::{PresenceFeed, Relay, SignalFeed};
