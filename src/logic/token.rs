//! Self-contained control plane driven by the auth token itself
//!
//! Token layout, `|` separated:
//!
//! ```text
//! mid|key|room|platform|op,op,...[|heartbeat_secs]
//! ```
//!
//! An empty key takes the server-assigned key and an empty room means the
//! session starts outside any room.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::core::operation::parse_ops;
use crate::core::proto::Proto;
use crate::error::{CometError, Result};
use crate::logic::{ConnectReply, ControlPlane};

/// Business frames kept for inspection; older ones are evicted
pub const RECEIVED_CAPACITY: usize = 1024;

pub struct TokenControlPlane {
    /// key -> mid for every connected session
    sessions: Mutex<HashMap<String, i64>>,
    /// server id -> last reported room counts
    servers: Mutex<HashMap<String, HashMap<String, i32>>>,
    received: Mutex<VecDeque<(i64, Proto)>>,
}

impl TokenControlPlane {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            received: Mutex::new(VecDeque::new()),
        }
    }

    pub fn parse_token(token: &[u8], server_key: &str) -> Result<ConnectReply> {
        let text = std::str::from_utf8(token)
            .map_err(|_| CometError::ControlPlane("token is not utf-8".to_string()))?;
        let fields: Vec<&str> = text.split('|').collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(CometError::ControlPlane(format!(
                "token has {} fields, expected 5 or 6",
                fields.len()
            )));
        }

        let mid = fields[0]
            .trim()
            .parse::<i64>()
            .map_err(|_| CometError::ControlPlane(format!("invalid mid: {}", fields[0])))?;
        let key = match fields[1].trim() {
            "" => server_key.to_string(),
            key => key.to_string(),
        };
        let accepts = parse_ops(fields[4])
            .ok_or_else(|| CometError::ControlPlane(format!("invalid accepts: {}", fields[4])))?;
        let heartbeat = match fields.get(5) {
            Some(secs) => Duration::from_secs(secs.trim().parse::<u64>().map_err(|_| {
                CometError::ControlPlane(format!("invalid heartbeat: {}", secs))
            })?),
            None => Duration::ZERO,
        };

        Ok(ConnectReply {
            mid,
            key,
            room_id: fields[2].trim().to_string(),
            platform: fields[3].trim().to_string(),
            accepts,
            heartbeat,
        })
    }

    pub fn is_online(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Most recent business frames, oldest first
    pub fn received(&self) -> Vec<(i64, Proto)> {
        self.received.lock().iter().cloned().collect()
    }
}

impl Default for TokenControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for TokenControlPlane {
    async fn connect(
        &self,
        server: &str,
        server_key: &str,
        _cookie: &str,
        token: &[u8],
    ) -> Result<ConnectReply> {
        let reply = Self::parse_token(token, server_key)?;
        self.sessions.lock().insert(reply.key.clone(), reply.mid);
        log::debug!(
            "server: {} connected mid: {} key: {} room: {}",
            server,
            reply.mid,
            reply.key,
            reply.room_id
        );
        Ok(reply)
    }

    async fn disconnect(&self, server: &str, mid: i64, key: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        // A newer session may have taken the key over
        if sessions.get(key) == Some(&mid) {
            sessions.remove(key);
        }
        log::debug!("server: {} disconnected mid: {} key: {}", server, mid, key);
        Ok(())
    }

    async fn heartbeat(&self, _server: &str, mid: i64, key: &str) -> Result<()> {
        if self.sessions.lock().contains_key(key) {
            Ok(())
        } else {
            Err(CometError::ControlPlane(format!(
                "heartbeat for unknown session mid: {} key: {}",
                mid, key
            )))
        }
    }

    async fn renew_online(
        &self,
        server: &str,
        room_counts: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>> {
        let mut servers = self.servers.lock();
        servers.insert(server.to_string(), room_counts);

        let mut all: HashMap<String, i32> = HashMap::new();
        for counts in servers.values() {
            for (room, count) in counts {
                *all.entry(room.clone()).or_insert(0) += count;
            }
        }
        Ok(all)
    }

    async fn receive(&self, mid: i64, proto: Proto) -> Result<()> {
        log::debug!("mid: {} sent op: {} ({} bytes)", mid, proto.op, proto.body.len());
        let mut received = self.received.lock();
        if received.len() == RECEIVED_CAPACITY {
            received.pop_front();
        }
        received.push_back((mid, proto));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "token"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        let reply = TokenControlPlane::parse_token(b"42|k1|room7|web|1,2,3", "srv").unwrap();
        assert_eq!(reply.mid, 42);
        assert_eq!(reply.key, "k1");
        assert_eq!(reply.room_id, "room7");
        assert_eq!(reply.platform, "web");
        assert_eq!(reply.accepts, vec![1, 2, 3]);
        assert_eq!(reply.heartbeat, Duration::ZERO);

        let reply = TokenControlPlane::parse_token(b"7||||1000|30", "srv").unwrap();
        assert_eq!(reply.key, "srv");
        assert!(reply.room_id.is_empty());
        assert_eq!(reply.accepts, vec![1000]);
        assert_eq!(reply.heartbeat, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_token_rejects_garbage() {
        assert!(TokenControlPlane::parse_token(b"hello", "srv").is_err());
        assert!(TokenControlPlane::parse_token(b"x|k|r|p|1", "srv").is_err());
        assert!(TokenControlPlane::parse_token(b"1|k|r|p|a,b", "srv").is_err());
        assert!(TokenControlPlane::parse_token(&[0xff, 0xfe], "srv").is_err());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let cp = TokenControlPlane::new();
        cp.connect("s1", "sk", "", b"1|k|r|web|").await.unwrap();
        assert!(cp.is_online("k"));
        cp.heartbeat("s1", 1, "k").await.unwrap();

        // Superseding session with another mid survives the old disconnect
        cp.connect("s1", "sk", "", b"2|k|r|web|").await.unwrap();
        cp.disconnect("s1", 1, "k").await.unwrap();
        assert!(cp.is_online("k"));
        cp.disconnect("s1", 2, "k").await.unwrap();
        assert!(!cp.is_online("k"));
        assert!(cp.heartbeat("s1", 2, "k").await.is_err());
    }

    #[tokio::test]
    async fn test_renew_online_sums_servers() {
        let cp = TokenControlPlane::new();
        let mut a = HashMap::new();
        a.insert("r1".to_string(), 2);
        let mut b = HashMap::new();
        b.insert("r1".to_string(), 3);
        b.insert("r2".to_string(), 1);

        cp.renew_online("s1", a).await.unwrap();
        let all = cp.renew_online("s2", b).await.unwrap();
        assert_eq!(all.get("r1"), Some(&5));
        assert_eq!(all.get("r2"), Some(&1));
    }

    #[tokio::test]
    async fn test_received_frames_are_bounded() {
        let cp = TokenControlPlane::new();
        for seq in 0..(RECEIVED_CAPACITY as i32 + 10) {
            let mut proto = Proto::new(1000, "x");
            proto.seq = seq;
            cp.receive(7, proto).await.unwrap();
        }

        let received = cp.received();
        assert_eq!(received.len(), RECEIVED_CAPACITY);
        // The oldest frames were evicted
        assert_eq!(received[0].1.seq, 10);
        assert_eq!(received.last().unwrap().1.seq, RECEIVED_CAPACITY as i32 + 9);
    }
}
