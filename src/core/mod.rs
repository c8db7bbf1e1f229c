//! Core functionality for the comet node

pub mod bucket;
pub mod channel;
pub mod connection;
pub mod hash;
pub mod operation;
pub mod pool;
pub mod proto;
pub mod ring;
pub mod room;
pub mod round;
pub mod server;
pub mod timer;

// Re-export main components for convenience
pub use bucket::Bucket;
pub use channel::{Channel, Signal};
pub use connection::Closer;
pub use proto::Proto;
pub use ring::Ring;
pub use room::Room;
pub use round::Round;
pub use server::{Server, SharedServer};
pub use timer::Timer;
