//! Client operations other than heartbeat

use bytes::Bytes;
use std::sync::Arc;

use crate::core::bucket::Bucket;
use crate::core::channel::Channel;
use crate::core::operation::{
    is_business, parse_ops, OP_CHANGE_ROOM, OP_CHANGE_ROOM_REPLY, OP_SUB, OP_SUB_REPLY, OP_UNSUB,
    OP_UNSUB_REPLY,
};
use crate::core::proto::Proto;
use crate::core::server::Server;
use crate::error::{CometError, Result};

/// Apply one client frame and turn `proto` into its reply in place.
/// An error ends the connection.
pub async fn operate(
    server: &Server,
    proto: &mut Proto,
    ch: &Arc<Channel>,
    bucket: &Bucket,
) -> Result<()> {
    match proto.op {
        OP_CHANGE_ROOM => {
            let room_id = String::from_utf8_lossy(&proto.body).into_owned();
            if let Err(e) = bucket.change_room(&room_id, ch) {
                log::error!("key: {} change room {} error: {}", ch.key, room_id, e);
                return Err(e);
            }
            proto.op = OP_CHANGE_ROOM_REPLY;
        }
        OP_SUB => {
            match parse_ops(&String::from_utf8_lossy(&proto.body)) {
                Some(ops) => ch.watch(&ops),
                None => log::warn!("key: {} bad sub body", ch.key),
            }
            proto.op = OP_SUB_REPLY;
        }
        OP_UNSUB => {
            match parse_ops(&String::from_utf8_lossy(&proto.body)) {
                Some(ops) => ch.unwatch(&ops),
                None => log::warn!("key: {} bad unsub body", ch.key),
            }
            proto.op = OP_UNSUB_REPLY;
        }
        op if is_business(op) => {
            if let Err(e) = server.receive(ch.mid, proto.clone()).await {
                log::error!("key: {} mid: {} op: {} receive error: {}", ch.key, ch.mid, op, e);
            }
            proto.body = Bytes::new();
        }
        op => return Err(CometError::UnknownOperation(op)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CometConfig;
    use crate::logic::TokenControlPlane;

    fn setup() -> (Server, Arc<TokenControlPlane>, Arc<Channel>) {
        let cp = Arc::new(TokenControlPlane::new());
        let server = Server::new(CometConfig::for_testing(), cp.clone());
        let (ch, _rx) = Channel::new(9, "k".to_string(), "127.0.0.1".to_string(), 4, 4);
        (server, cp, Arc::new(ch))
    }

    #[tokio::test]
    async fn test_sub_unsub() {
        let (server, _cp, ch) = setup();
        let bucket = server.bucket(&ch.key);

        let mut p = Proto::new(OP_SUB, "1000,1001");
        operate(&server, &mut p, &ch, bucket).await.unwrap();
        assert_eq!(p.op, OP_SUB_REPLY);
        assert!(ch.needs_push(1000) && ch.needs_push(1001));

        let mut p = Proto::new(OP_UNSUB, "1000");
        operate(&server, &mut p, &ch, bucket).await.unwrap();
        assert_eq!(p.op, OP_UNSUB_REPLY);
        assert!(!ch.needs_push(1000));
        assert!(ch.needs_push(1001));
    }

    #[tokio::test]
    async fn test_change_room() {
        let (server, _cp, ch) = setup();
        let bucket = server.bucket(&ch.key);
        bucket.put("", Arc::clone(&ch)).unwrap();

        let mut p = Proto::new(OP_CHANGE_ROOM, "lobby");
        operate(&server, &mut p, &ch, bucket).await.unwrap();
        assert_eq!(p.op, OP_CHANGE_ROOM_REPLY);
        assert_eq!(ch.room().unwrap().id, "lobby");

        let mut p = Proto::new(OP_CHANGE_ROOM, "");
        operate(&server, &mut p, &ch, bucket).await.unwrap();
        assert!(ch.room().is_none());
        assert!(bucket.room("lobby").is_none());
    }

    #[tokio::test]
    async fn test_business_op_forwarded_and_echoed() {
        let (server, cp, ch) = setup();
        let bucket = server.bucket(&ch.key);

        let mut p = Proto::new(1500, "payload");
        p.seq = 3;
        operate(&server, &mut p, &ch, bucket).await.unwrap();
        assert_eq!(p.op, 1500);
        assert_eq!(p.seq, 3);
        assert!(p.body.is_empty());

        let received = cp.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, 9);
        assert_eq!(&received[0].1.body[..], b"payload");
    }

    #[tokio::test]
    async fn test_unknown_op_is_fatal() {
        let (server, _cp, ch) = setup();
        let bucket = server.bucket(&ch.key);
        let mut p = Proto::new(999, "");
        assert!(matches!(
            operate(&server, &mut p, &ch, bucket).await,
            Err(CometError::UnknownOperation(999))
        ));
    }
}
