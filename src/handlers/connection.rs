//! Connection lifecycle shared by the TCP and WebSocket transports
//!
//! A connection is served by two tasks. The reader (the task running
//! `serve_connection`) handles the handshake, heartbeats and client
//! operations, and queues replies in the channel ring. The writer
//! (`dispatch`) drains the outbound queue and the ring onto the socket.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::channel::{Channel, Signal};
use crate::core::connection::Closer;
use crate::core::operation::{OP_AUTH, OP_AUTH_REPLY, OP_HEARTBEAT, OP_HEARTBEAT_REPLY};
use crate::core::proto::Proto;
use crate::core::server::SharedServer;
use crate::error::{CometError, Result};
use crate::handlers::operation::operate;
use crate::logic::ConnectReply;

/// Source of decoded frames
#[async_trait]
pub trait ProtoReader: Send {
    async fn read_proto(&mut self) -> Result<Proto>;
}

/// Sink for frames; writes may be buffered until `flush`
#[async_trait]
pub trait ProtoWriter: Send {
    async fn write_proto(&mut self, proto: &Proto) -> Result<()>;

    /// Heartbeat replies carry the room's online count as their body
    async fn write_heartbeat_reply(&mut self, proto: &Proto, online: i32) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;
}

/// Peer details known before the handshake
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: String,
    pub cookie: String,
    /// Index into the server's round
    pub round_index: usize,
}

pub async fn serve_connection<R, W>(server: SharedServer, mut reader: R, mut writer: W, peer: Peer)
where
    R: ProtoReader,
    W: ProtoWriter + 'static,
{
    let timer = Arc::clone(server.round().timer(peer.round_index));
    let closer = Closer::new();

    let deadline = {
        let closer = closer.clone();
        let ip = peer.ip.clone();
        timer.add(server.config().handshake_timeout, "", move || {
            log::info!("remote ip: {} deadline exceeded, closing", ip);
            closer.close();
        })
    };

    let reply = match closer
        .guard(handshake(&server, &mut reader, &mut writer, &peer.cookie))
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            timer.del(deadline);
            closer.close();
            if e.is_disconnect() {
                log::debug!("remote ip: {} closed during handshake", peer.ip);
            } else {
                log::error!("remote ip: {} handshake error: {}", peer.ip, e);
            }
            return;
        }
    };

    let cfg = server.config();
    let (ch, rx) = Channel::new(
        reply.mid,
        reply.key.clone(),
        peer.ip.clone(),
        cfg.cli_proto,
        cfg.svr_proto,
    );
    let ch = Arc::new(ch);
    ch.watch(&reply.accepts);

    let bucket = server.bucket(&ch.key);
    if let Err(e) = bucket.put(&reply.room_id, Arc::clone(&ch)) {
        log::error!("key: {} register error: {}", ch.key, e);
        bucket.del(&ch);
        timer.del(deadline);
        closer.close();
        if let Err(e) = server.disconnect(ch.mid, &ch.key).await {
            log::error!("key: {} mid: {} disconnect error: {}", ch.key, ch.mid, e);
        }
        return;
    }

    timer.set_key(deadline, &ch.key);
    timer.set(deadline, reply.heartbeat);
    if cfg.debug {
        log::info!(
            "connected key: {} mid: {} room: {} platform: {} accepts: {:?}",
            ch.key,
            ch.mid,
            reply.room_id,
            reply.platform,
            reply.accepts
        );
    }

    tokio::spawn(dispatch(
        Arc::clone(&server),
        writer,
        Arc::clone(&ch),
        rx,
        closer.clone(),
    ));

    let server_heartbeat = server.rand_server_heartbeat();
    let mut last_heartbeat = Instant::now();

    let result: Result<()> = loop {
        let mut proto = match closer.guard(reader.read_proto()).await {
            Ok(proto) => proto,
            Err(e) => break Err(e),
        };

        if proto.op == OP_HEARTBEAT {
            timer.set(deadline, reply.heartbeat);
            proto.op = OP_HEARTBEAT_REPLY;
            proto.body = Bytes::new();
            if last_heartbeat.elapsed() > server_heartbeat {
                match server.heartbeat(ch.mid, &ch.key).await {
                    Ok(()) => last_heartbeat = Instant::now(),
                    Err(e) => log::debug!("key: {} control plane heartbeat error: {}", ch.key, e),
                }
            }
            if cfg.debug {
                log::info!("key: {} receive heartbeat", ch.key);
            }
        } else if let Err(e) = operate(&server, &mut proto, &ch, bucket).await {
            break Err(e);
        }

        if let Err(e) = ch.push_inbound(proto) {
            break Err(e);
        }
        ch.wake();
    };

    match &result {
        Err(e) if !e.is_disconnect() => log::error!("key: {} reader error: {}", ch.key, e),
        _ => {}
    }

    bucket.del(&ch);
    timer.del(deadline);
    closer.close();
    ch.close();
    drop(reader);

    if let Err(e) = server.disconnect(ch.mid, &ch.key).await {
        log::error!("key: {} mid: {} disconnect error: {}", ch.key, ch.mid, e);
    }
    if cfg.debug {
        log::info!("key: {} disconnected", ch.key);
    }
}

/// Read the auth frame, authenticate it and answer with an empty auth reply
async fn handshake<R, W>(
    server: &SharedServer,
    reader: &mut R,
    writer: &mut W,
    cookie: &str,
) -> Result<ConnectReply>
where
    R: ProtoReader,
    W: ProtoWriter,
{
    let mut proto = reader.read_proto().await?;
    if proto.op != OP_AUTH {
        return Err(CometError::NotAuthenticated(proto.op));
    }

    let reply = server.connect(cookie, &proto.body).await?;

    proto.op = OP_AUTH_REPLY;
    proto.body = Bytes::new();
    writer.write_proto(&proto).await?;
    writer.flush().await?;
    Ok(reply)
}

/// Writer loop. Exits on `Finish`; on a write failure it closes the
/// connection and keeps draining the queue until `Finish` arrives, so no
/// sender ever waits on a dead writer.
pub async fn dispatch<W>(
    server: SharedServer,
    mut writer: W,
    ch: Arc<Channel>,
    mut rx: mpsc::Receiver<Signal>,
    closer: Closer,
) where
    W: ProtoWriter,
{
    let debug = server.config().debug;
    let mut finished = false;

    let result: Result<()> = loop {
        let signal = match rx.recv().await {
            Some(signal) => signal,
            None => {
                finished = true;
                break Ok(());
            }
        };

        match signal {
            Signal::Finish => {
                finished = true;
                break Ok(());
            }
            Signal::Ready => ch.clear_wake(),
            Signal::Data(proto) => {
                if debug {
                    log::info!("key: {} push op: {}", ch.key, proto.op);
                }
                if let Err(e) = closer.guard(writer.write_proto(&proto)).await {
                    break Err(e);
                }
            }
        }

        if let Err(e) = closer.guard(drain_ring(&mut writer, &ch)).await {
            break Err(e);
        }
        if let Err(e) = closer.guard(writer.flush()).await {
            break Err(e);
        }
    };

    match &result {
        Err(e) if !e.is_disconnect() => log::error!("key: {} dispatch error: {}", ch.key, e),
        _ => {}
    }

    closer.close();
    drop(writer);

    while !finished {
        match rx.recv().await {
            Some(Signal::Finish) | None => finished = true,
            Some(_) => {}
        }
    }
    if debug {
        log::info!("key: {} writer exit", ch.key);
    }
}

async fn drain_ring<W: ProtoWriter>(writer: &mut W, ch: &Channel) -> Result<()> {
    while let Some(proto) = ch.pop_inbound() {
        if proto.op == OP_HEARTBEAT_REPLY {
            let online = ch.room().map(|room| room.online_num()).unwrap_or(0);
            writer.write_heartbeat_reply(&proto, online).await?;
        } else {
            writer.write_proto(&proto).await?;
        }
    }
    Ok(())
}
