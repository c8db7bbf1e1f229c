//! Control plane interface
//!
//! The comet node authenticates sessions, reports presence and forwards
//! business messages through a `ControlPlane`. Deployments plug in their
//! own backend; `TokenControlPlane` is a self-contained one.

pub mod token;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::proto::Proto;
use crate::error::Result;

pub use token::TokenControlPlane;

/// Session identity granted by a successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub mid: i64,
    pub key: String,
    /// Empty for no room
    pub room_id: String,
    pub platform: String,
    /// Ops this session wants pushed
    pub accepts: Vec<i32>,
    /// Heartbeat deadline; zero means the node default
    pub heartbeat: Duration,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Authenticate an auth frame body. `server_key` is a fresh key the
    /// backend may assign when the token carries none.
    async fn connect(
        &self,
        server: &str,
        server_key: &str,
        cookie: &str,
        token: &[u8],
    ) -> Result<ConnectReply>;

    async fn disconnect(&self, server: &str, mid: i64, key: &str) -> Result<()>;

    async fn heartbeat(&self, server: &str, mid: i64, key: &str) -> Result<()>;

    /// Report local room counts and receive cluster-wide counts
    async fn renew_online(
        &self,
        server: &str,
        room_counts: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>>;

    /// Forward a business-range frame from a client
    async fn receive(&self, mid: i64, proto: Proto) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}
