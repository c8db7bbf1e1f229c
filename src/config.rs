//! Server configuration module
//! Handles dynamic configuration parameters for the comet gateway

use crate::constants::*;
use crate::error::{CometError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration parameters
#[derive(Debug, Clone)]
pub struct CometConfig {
    /// Addresses the binary TCP transport listens on
    pub tcp_bind: Vec<String>,
    /// Addresses the WebSocket transport listens on
    pub websocket_bind: Vec<String>,
    pub tcp_keepalive: bool,
    pub tcp_sndbuf: u32,
    pub tcp_rcvbuf: u32,
    /// Number of accept tasks spawned per TCP listener
    pub accept_tasks: usize,

    /// Number of read buffer pools in the round
    pub reader_pools: usize,
    /// Buffers preallocated per read pool
    pub read_buf: usize,
    pub read_buf_size: usize,
    pub writer_pools: usize,
    pub write_buf: usize,
    pub write_buf_size: usize,
    /// Number of timer heap shards in the round
    pub timer_shards: usize,
    /// Timer entries preallocated per shard
    pub timer_size: usize,

    pub handshake_timeout: Duration,
    /// Heartbeat interval used when the control plane does not negotiate one
    pub heartbeat_interval: Duration,
    /// Depth of the inbound ring per connection
    pub cli_proto: usize,
    /// Depth of the outbound delivery queue per connection
    pub svr_proto: usize,
    pub max_body_size: usize,

    pub bucket_size: usize,
    pub bucket_channel: usize,
    pub bucket_room: usize,
    /// Room broadcast workers per bucket
    pub routine_amount: usize,
    /// Queue depth of each room broadcast worker
    pub routine_size: usize,

    pub rpc_timeout: Duration,
    pub online_tick: Duration,

    /// Server id reported to the control plane; derived from the host when unset
    pub server_id: Option<String>,
    /// Per-frame debug logging
    pub debug: bool,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            tcp_bind: vec![DEFAULT_TCP_BIND.to_string()],
            websocket_bind: vec![DEFAULT_WEBSOCKET_BIND.to_string()],
            tcp_keepalive: false,
            tcp_sndbuf: DEFAULT_TCP_SNDBUF,
            tcp_rcvbuf: DEFAULT_TCP_RCVBUF,
            accept_tasks: DEFAULT_ACCEPT_TASKS,
            reader_pools: DEFAULT_READER_POOLS,
            read_buf: DEFAULT_READ_BUF,
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            writer_pools: DEFAULT_WRITER_POOLS,
            write_buf: DEFAULT_WRITE_BUF,
            write_buf_size: DEFAULT_WRITE_BUF_SIZE,
            timer_shards: DEFAULT_TIMER_SHARDS,
            timer_size: DEFAULT_TIMER_SIZE,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            cli_proto: DEFAULT_CLI_PROTO,
            svr_proto: DEFAULT_SVR_PROTO,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_channel: DEFAULT_BUCKET_CHANNEL,
            bucket_room: DEFAULT_BUCKET_ROOM,
            routine_amount: DEFAULT_ROUTINE_AMOUNT,
            routine_size: DEFAULT_ROUTINE_SIZE,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            online_tick: Duration::from_secs(DEFAULT_ONLINE_TICK_SECS),
            server_id: None,
            debug: false,
        }
    }
}

impl CometConfig {
    /// Small, fast configuration for tests: loopback binds on ephemeral ports
    pub fn for_testing() -> Self {
        Self {
            tcp_bind: vec!["127.0.0.1:0".to_string()],
            websocket_bind: vec!["127.0.0.1:0".to_string()],
            accept_tasks: 1,
            reader_pools: 2,
            read_buf: 4,
            read_buf_size: 1024,
            writer_pools: 2,
            write_buf: 4,
            write_buf_size: 1024,
            timer_shards: 2,
            timer_size: 16,
            handshake_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            bucket_size: 4,
            bucket_channel: 16,
            bucket_room: 16,
            routine_amount: 2,
            routine_size: 16,
            online_tick: Duration::from_secs(60),
            server_id: Some("comet-test".to_string()),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            tcp_bind: env_list("COMET_TCP_BIND").unwrap_or(defaults.tcp_bind),
            websocket_bind: env_list("COMET_WEBSOCKET_BIND").unwrap_or(defaults.websocket_bind),
            tcp_keepalive: env_flag("COMET_TCP_KEEPALIVE").unwrap_or(defaults.tcp_keepalive),
            tcp_sndbuf: env_or("COMET_TCP_SNDBUF", defaults.tcp_sndbuf),
            tcp_rcvbuf: env_or("COMET_TCP_RCVBUF", defaults.tcp_rcvbuf),
            accept_tasks: env_or("COMET_ACCEPT_TASKS", defaults.accept_tasks),
            reader_pools: env_or("COMET_READER_POOLS", defaults.reader_pools),
            read_buf: env_or("COMET_READ_BUF", defaults.read_buf),
            read_buf_size: env_or("COMET_READ_BUF_SIZE", defaults.read_buf_size),
            writer_pools: env_or("COMET_WRITER_POOLS", defaults.writer_pools),
            write_buf: env_or("COMET_WRITE_BUF", defaults.write_buf),
            write_buf_size: env_or("COMET_WRITE_BUF_SIZE", defaults.write_buf_size),
            timer_shards: env_or("COMET_TIMER_SHARDS", defaults.timer_shards),
            timer_size: env_or("COMET_TIMER_SIZE", defaults.timer_size),
            handshake_timeout: Duration::from_secs(env_or(
                "COMET_HANDSHAKE_TIMEOUT",
                DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            )),
            heartbeat_interval: Duration::from_secs(env_or(
                "COMET_HEARTBEAT",
                DEFAULT_HEARTBEAT_SECS,
            )),
            cli_proto: env_or("COMET_CLI_PROTO", defaults.cli_proto),
            svr_proto: env_or("COMET_SVR_PROTO", defaults.svr_proto),
            max_body_size: env_or("COMET_MAX_BODY_SIZE", defaults.max_body_size),
            bucket_size: env_or("COMET_BUCKET_SIZE", defaults.bucket_size),
            bucket_channel: env_or("COMET_BUCKET_CHANNEL", defaults.bucket_channel),
            bucket_room: env_or("COMET_BUCKET_ROOM", defaults.bucket_room),
            routine_amount: env_or("COMET_ROUTINE_AMOUNT", defaults.routine_amount),
            routine_size: env_or("COMET_ROUTINE_SIZE", defaults.routine_size),
            rpc_timeout: Duration::from_secs(env_or("COMET_RPC_TIMEOUT", DEFAULT_RPC_TIMEOUT_SECS)),
            online_tick: Duration::from_secs(env_or("COMET_ONLINE_TICK", DEFAULT_ONLINE_TICK_SECS)),
            server_id: env::var("COMET_SERVER_ID").ok().filter(|s| !s.is_empty()),
            debug: env_flag("COMET_DEBUG").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tcp_bind.is_empty() && self.websocket_bind.is_empty() {
            return Err(CometError::ConfigError(
                "at least one of COMET_TCP_BIND or COMET_WEBSOCKET_BIND must be set".to_string(),
            ));
        }

        let counts = [
            ("bucket_size", self.bucket_size),
            ("routine_amount", self.routine_amount),
            ("routine_size", self.routine_size),
            ("reader_pools", self.reader_pools),
            ("writer_pools", self.writer_pools),
            ("timer_shards", self.timer_shards),
            ("cli_proto", self.cli_proto),
            ("svr_proto", self.svr_proto),
            ("accept_tasks", self.accept_tasks),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(CometError::ConfigError(format!("{} must be greater than zero", name)));
            }
        }

        if self.handshake_timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(CometError::ConfigError(
                "handshake timeout and heartbeat interval must be non-zero".to_string(),
            ));
        }

        if self.max_body_size > i32::MAX as usize - 16 {
            return Err(CometError::ConfigError(format!(
                "max_body_size {} does not fit a frame header",
                self.max_body_size
            )));
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
