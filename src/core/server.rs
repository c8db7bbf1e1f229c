//! Comet node: bucket directory, per-connection resources and the control
//! plane, shared by every listener

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::config::CometConfig;
use crate::constants::{MAX_SERVER_HEARTBEAT_SECS, MIN_SERVER_HEARTBEAT_SECS};
use crate::core::bucket::{Bucket, RoomBroadcast};
use crate::core::hash::murmur3_32;
use crate::core::proto::Proto;
use crate::core::round::Round;
use crate::error::{CometError, Result};
use crate::logic::{ConnectReply, ControlPlane};

pub struct Server {
    config: CometConfig,
    round: Round,
    buckets: Vec<Bucket>,
    control_plane: Arc<dyn ControlPlane>,
    server_id: String,
}

/// Shared handle used by listeners and connection tasks
pub type SharedServer = Arc<Server>;

impl Server {
    /// Build buckets and the round. Spawns timer and room workers, so it
    /// must be called inside a tokio runtime.
    pub fn new(config: CometConfig, control_plane: Arc<dyn ControlPlane>) -> Self {
        let round = Round::new(&config);
        let buckets: Vec<Bucket> = (0..config.bucket_size.max(1))
            .map(|_| Bucket::new(&config))
            .collect();
        let server_id = config
            .server_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        log::info!(
            "comet server {} using {} buckets, control plane: {}",
            server_id,
            buckets.len(),
            control_plane.name()
        );

        Self {
            config,
            round,
            buckets,
            control_plane,
            server_id,
        }
    }

    pub fn config(&self) -> &CometConfig {
        &self.config
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// The bucket owning `key`
    pub fn bucket(&self, key: &str) -> &Bucket {
        let idx = murmur3_32(key.as_bytes(), 0) as usize % self.buckets.len();
        &self.buckets[idx]
    }

    /// Fresh key offered to the control plane at connect
    pub fn next_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Interval between control plane heartbeats for one connection,
    /// jittered so sessions accepted together do not report together
    pub fn rand_server_heartbeat(&self) -> Duration {
        let secs = rand::thread_rng().gen_range(MIN_SERVER_HEARTBEAT_SECS..MAX_SERVER_HEARTBEAT_SECS);
        Duration::from_secs(secs)
    }

    async fn rpc<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.rpc_timeout, fut)
            .await
            .map_err(|_| CometError::Timeout)?
    }

    pub async fn connect(&self, cookie: &str, token: &[u8]) -> Result<ConnectReply> {
        let server_key = self.next_key();
        let mut reply = self
            .rpc(
                self.control_plane
                    .connect(&self.server_id, &server_key, cookie, token),
            )
            .await?;
        if reply.heartbeat.is_zero() {
            reply.heartbeat = self.config.heartbeat_interval;
        }
        Ok(reply)
    }

    pub async fn disconnect(&self, mid: i64, key: &str) -> Result<()> {
        self.rpc(self.control_plane.disconnect(&self.server_id, mid, key))
            .await
    }

    pub async fn heartbeat(&self, mid: i64, key: &str) -> Result<()> {
        self.rpc(self.control_plane.heartbeat(&self.server_id, mid, key))
            .await
    }

    pub async fn receive(&self, mid: i64, proto: Proto) -> Result<()> {
        self.rpc(self.control_plane.receive(mid, proto)).await
    }

    /// Push to the given session keys on this node. Returns the number of
    /// sessions the message was queued for.
    pub fn push_keys(&self, keys: &[String], op: i32, proto: Proto) -> usize {
        let proto = Arc::new(proto);
        keys.iter()
            .filter_map(|key| self.bucket(key).channel(key))
            .filter(|ch| ch.needs_push(op) && ch.deliver(Arc::clone(&proto)))
            .count()
    }

    /// Push to every session on this node watching `op`
    pub fn broadcast(&self, op: i32, proto: Proto) -> usize {
        let proto = Arc::new(proto);
        self.buckets
            .iter()
            .map(|bucket| bucket.broadcast(&proto, op))
            .sum()
    }

    /// Queue a room push in every bucket. Returns how many buckets accepted it.
    pub fn broadcast_room(&self, room_id: &str, proto: Proto) -> usize {
        let proto = Arc::new(proto);
        self.buckets
            .iter()
            .filter(|bucket| {
                bucket.broadcast_room(RoomBroadcast {
                    room_id: room_id.to_string(),
                    proto: Arc::clone(&proto),
                })
            })
            .count()
    }

    /// Ids of every non-empty room on this node
    pub fn rooms(&self) -> HashSet<String> {
        self.buckets.iter().flat_map(|b| b.rooms()).collect()
    }

    /// Local online count per room, summed over buckets
    pub fn room_counts(&self) -> HashMap<String, i32> {
        let mut counts = HashMap::new();
        for bucket in &self.buckets {
            for (room, online) in bucket.rooms_count() {
                *counts.entry(room).or_insert(0) += online;
            }
        }
        counts
    }

    pub fn channel_count(&self) -> usize {
        self.buckets.iter().map(Bucket::channel_count).sum()
    }

    /// Report room counts and apply the cluster-wide answer
    pub async fn renew_online(&self) -> Result<()> {
        let counts = self.room_counts();
        let all = self
            .rpc(self.control_plane.renew_online(&self.server_id, counts))
            .await?;
        for bucket in &self.buckets {
            bucket.up_rooms_count(&all);
        }
        Ok(())
    }

    /// Periodically renew online counts until the server is dropped
    pub fn start_online_task(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::downgrade(self);
        let tick = self.config.online_tick;
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let server = match server.upgrade() {
                    Some(server) => server,
                    None => break,
                };
                if let Err(e) = server.renew_online().await {
                    log::error!("renew online error: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{Channel, Signal};
    use crate::logic::TokenControlPlane;

    fn server() -> Server {
        Server::new(CometConfig::for_testing(), Arc::new(TokenControlPlane::new()))
    }

    fn register(server: &Server, key: &str, room: &str, ops: &[i32]) -> tokio::sync::mpsc::Receiver<Signal> {
        let (ch, rx) = Channel::new(1, key.to_string(), "127.0.0.1".to_string(), 4, 8);
        ch.watch(ops);
        server.bucket(key).put(room, Arc::new(ch)).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_bucket_selection_is_stable() {
        let server = server();
        let a = server.bucket("some-key") as *const Bucket;
        let b = server.bucket("some-key") as *const Bucket;
        assert_eq!(a, b);
        assert_eq!(server.server_id(), "comet-test");
    }

    #[tokio::test]
    async fn test_heartbeat_jitter_in_window() {
        let server = server();
        for _ in 0..100 {
            let d = server.rand_server_heartbeat().as_secs();
            assert!((MIN_SERVER_HEARTBEAT_SECS..MAX_SERVER_HEARTBEAT_SECS).contains(&d));
        }
    }

    #[tokio::test]
    async fn test_connect_applies_default_heartbeat() {
        let server = server();
        let reply = server.connect("", b"1|k|r|web|1").await.unwrap();
        assert_eq!(reply.heartbeat, server.config().heartbeat_interval);
        assert!(server.connect("", b"bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_push_keys_respects_watch() {
        let server = server();
        let mut a = register(&server, "a", "", &[5]);
        let mut b = register(&server, "b", "", &[]);

        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        assert_eq!(server.push_keys(&keys, 5, Proto::new(5, "hi")), 1);
        assert!(matches!(a.try_recv(), Ok(Signal::Data(_))));
        assert!(b.try_recv().is_err());

        assert_eq!(server.broadcast(5, Proto::new(5, "all")), 1);
    }

    #[tokio::test]
    async fn test_renew_online_updates_rooms() {
        let server = server();
        let _a = register(&server, "a", "lobby", &[]);
        let _b = register(&server, "b", "lobby", &[]);
        let _c = register(&server, "c", "side", &[]);

        let counts = server.room_counts();
        assert_eq!(counts.get("lobby"), Some(&2));
        assert_eq!(server.rooms().len(), 2);
        assert_eq!(server.channel_count(), 3);

        server.renew_online().await.unwrap();
        let room = server.bucket("a").channel("a").unwrap().room().unwrap();
        assert_eq!(room.online_num(), 2);
    }
}
