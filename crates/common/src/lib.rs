//! Common utilities and types shared across Meshcall components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for tracing subscriber setup
pub mod observability;
