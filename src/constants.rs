// Fundamental configuration constants
pub const DEFAULT_TCP_BIND: &str = "0.0.0.0:3101";
pub const DEFAULT_WEBSOCKET_BIND: &str = "0.0.0.0:3102";
pub const WS_PATH: &str = "sub";

// TCP socket and accept configuration
pub const DEFAULT_TCP_SNDBUF: u32 = 4096;
pub const DEFAULT_TCP_RCVBUF: u32 = 4096;
pub const DEFAULT_ACCEPT_TASKS: usize = 4;

// Round: buffer pools and timer shards
pub const DEFAULT_READER_POOLS: usize = 32;
pub const DEFAULT_READ_BUF: usize = 1024;
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;
pub const DEFAULT_WRITER_POOLS: usize = 32;
pub const DEFAULT_WRITE_BUF: usize = 1024;
pub const DEFAULT_WRITE_BUF_SIZE: usize = 8192;
pub const DEFAULT_TIMER_SHARDS: usize = 32;
pub const DEFAULT_TIMER_SIZE: usize = 2048;

// Protocol
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 90;
pub const DEFAULT_CLI_PROTO: usize = 5;
pub const DEFAULT_SVR_PROTO: usize = 10;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1 << 12;

// Bucket configuration
pub const DEFAULT_BUCKET_SIZE: usize = 32;
pub const DEFAULT_BUCKET_CHANNEL: usize = 1024;
pub const DEFAULT_BUCKET_ROOM: usize = 1024;
pub const DEFAULT_ROUTINE_AMOUNT: usize = 32;
pub const DEFAULT_ROUTINE_SIZE: usize = 1024;

// Control plane
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_ONLINE_TICK_SECS: u64 = 10;

// Control plane heartbeat window, in seconds
pub const MIN_SERVER_HEARTBEAT_SECS: u64 = 600;
pub const MAX_SERVER_HEARTBEAT_SECS: u64 = 1200;
