use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum CometError {
    // Protocol errors
    PackLength(i32),
    HeaderLength(i16),
    NotAuthenticated(i32),
    UnknownOperation(i32),
    MalformedFrame(String),

    // Backpressure
    RingFull,

    // Directory errors
    RoomDropped,

    // Control plane errors
    ControlPlane(String),
    Timeout,

    // Transport errors
    Io(io::Error),
    WebSocket(String),
    ConnectionClosed,

    // Configuration errors
    ConfigError(String),
}

impl CometError {
    /// True for terminations that are part of a normal disconnect
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl fmt::Display for CometError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PackLength(len) => write!(f, "Invalid pack length: {}", len),
            Self::HeaderLength(len) => write!(f, "Invalid header length: {}", len),
            Self::NotAuthenticated(op) => {
                write!(f, "Operation {} received before auth", op)
            }
            Self::UnknownOperation(op) => write!(f, "Unknown operation: {}", op),
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            Self::RingFull => write!(f, "Client ring buffer full"),
            Self::RoomDropped => write!(f, "Room is draining"),
            Self::ControlPlane(msg) => write!(f, "Control plane error: {}", msg),
            Self::Timeout => write!(f, "Control plane call timed out"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for CometError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CometError {
    fn from(err: io::Error) -> Self {
        CometError::Io(err)
    }
}

// Generic result type for the gateway
pub type Result<T> = std::result::Result<T, CometError>;
