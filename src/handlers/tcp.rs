//! Raw TCP transport

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::core::pool::PooledBuffer;
use crate::core::proto::Proto;
use crate::core::server::SharedServer;
use crate::error::{CometError, Result};
use crate::handlers::connection::{serve_connection, Peer, ProtoReader, ProtoWriter};

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpProtoReader {
    stream: OwnedReadHalf,
    buf: PooledBuffer,
    max_body: usize,
}

#[async_trait]
impl ProtoReader for TcpProtoReader {
    async fn read_proto(&mut self) -> Result<Proto> {
        loop {
            if let Some(proto) = Proto::decode(&mut self.buf, self.max_body)? {
                return Ok(proto);
            }
            if self.stream.read_buf(&mut *self.buf).await? == 0 {
                return Err(CometError::ConnectionClosed);
            }
        }
    }
}

pub struct TcpProtoWriter {
    stream: OwnedWriteHalf,
    buf: PooledBuffer,
}

#[async_trait]
impl ProtoWriter for TcpProtoWriter {
    async fn write_proto(&mut self, proto: &Proto) -> Result<()> {
        proto.encode(&mut self.buf);
        Ok(())
    }

    async fn write_heartbeat_reply(&mut self, proto: &Proto, online: i32) -> Result<()> {
        proto.encode_heartbeat_reply(online, &mut self.buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.stream.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }
}

/// Bind every configured TCP address and start the accept tasks.
/// Returns the bound addresses.
pub async fn init_tcp(server: SharedServer) -> Result<Vec<SocketAddr>> {
    let cfg = server.config();
    let mut bound = Vec::with_capacity(cfg.tcp_bind.len());

    for bind in &cfg.tcp_bind {
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| CometError::ConfigError(format!("invalid tcp bind {}: {}", bind, e)))?;
        let listener = Arc::new(listen(&server, addr)?);
        let local = listener.local_addr()?;
        log::info!("start tcp listen: {}", local);

        for _ in 0..cfg.accept_tasks.max(1) {
            tokio::spawn(accept_tcp(Arc::clone(&server), Arc::clone(&listener)));
        }
        bound.push(local);
    }
    Ok(bound)
}

fn listen(server: &SharedServer, addr: SocketAddr) -> Result<TcpListener> {
    let cfg = server.config();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(cfg.tcp_keepalive)?;
    socket.set_recv_buffer_size(cfg.tcp_rcvbuf)?;
    socket.set_send_buffer_size(cfg.tcp_sndbuf)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

async fn accept_tcp(server: SharedServer, listener: Arc<TcpListener>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!("conn.set_nodelay() error: {}", e);
                }
                let index = server.round().next_index();
                tokio::spawn(serve_tcp(Arc::clone(&server), stream, peer, index));
            }
            Err(e) => {
                // Usually descriptor exhaustion; give the process room to recover
                log::error!("listener.accept() error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn serve_tcp(server: SharedServer, stream: TcpStream, peer: SocketAddr, index: usize) {
    if server.config().debug {
        log::info!("start tcp serve \"{}\"", peer);
    }
    let (rd, wr) = stream.into_split();
    let reader = TcpProtoReader {
        stream: rd,
        buf: server.round().reader(index).get(),
        max_body: server.config().max_body_size,
    };
    let writer = TcpProtoWriter {
        stream: wr,
        buf: server.round().writer(index).get(),
    };
    let peer = Peer {
        ip: peer.ip().to_string(),
        cookie: String::new(),
        round_index: index,
    };
    serve_connection(server, reader, writer, peer).await;
}
