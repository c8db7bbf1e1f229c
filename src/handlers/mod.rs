//! Transports and the connection lifecycle they share

pub mod connection;
pub mod operation;
pub mod tcp;
pub mod websocket;

// Re-export the listener entry points
pub use tcp::init_tcp;
pub use websocket::init_websocket;
