//! Rusty Comet - a persistent-connection push gateway node
//!
//! Clients hold long-lived TCP or WebSocket connections; the node
//! authenticates them through a control plane, tracks them in sharded
//! buckets and rooms, and pushes messages to single sessions, rooms or
//! everyone.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod logic;

// Re-export main components
pub use config::*;
pub use constants::*;
