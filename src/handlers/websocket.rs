//! WebSocket transport
//!
//! Binary messages carry exactly one frame in the TCP wire format. Text
//! messages carry the JSON form of a frame; a connection that authenticates
//! with a text message is answered in text for its whole life.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::constants::WS_PATH;
use crate::core::pool::PooledBuffer;
use crate::core::proto::Proto;
use crate::core::server::SharedServer;
use crate::error::{CometError, Result};
use crate::handlers::connection::{serve_connection, Peer, ProtoReader, ProtoWriter};

pub struct WsProtoReader {
    stream: SplitStream<WebSocket>,
    text_mode: Arc<AtomicBool>,
    first: bool,
    max_body: usize,
}

#[async_trait]
impl ProtoReader for WsProtoReader {
    async fn read_proto(&mut self) -> Result<Proto> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(CometError::WebSocket(e.to_string())),
                None => return Err(CometError::ConnectionClosed),
            };

            let (proto, is_text) = if msg.is_binary() {
                (Proto::decode_frame(msg.as_bytes(), self.max_body)?, false)
            } else if msg.is_text() {
                let text = msg
                    .to_str()
                    .map_err(|_| CometError::MalformedFrame("invalid text message".to_string()))?;
                let proto = Proto::decode_json(text)?;
                if proto.body.len() > self.max_body {
                    return Err(CometError::PackLength(proto.body.len() as i32));
                }
                (proto, true)
            } else if msg.is_close() {
                return Err(CometError::ConnectionClosed);
            } else {
                // ping and pong are answered by the websocket layer
                continue;
            };

            if self.first {
                self.first = false;
                self.text_mode.store(is_text, Ordering::Relaxed);
            }
            return Ok(proto);
        }
    }
}

pub struct WsProtoWriter {
    sink: SplitSink<WebSocket, Message>,
    text_mode: Arc<AtomicBool>,
    buf: PooledBuffer,
}

impl WsProtoWriter {
    async fn feed(&mut self, msg: Message) -> Result<()> {
        self.sink
            .feed(msg)
            .await
            .map_err(|e| CometError::WebSocket(e.to_string()))
    }

    fn take_frame(&mut self) -> Vec<u8> {
        let frame = self.buf.to_vec();
        self.buf.clear();
        frame
    }
}

#[async_trait]
impl ProtoWriter for WsProtoWriter {
    async fn write_proto(&mut self, proto: &Proto) -> Result<()> {
        let msg = if self.text_mode.load(Ordering::Relaxed) {
            Message::text(proto.to_json())
        } else {
            proto.encode(&mut self.buf);
            Message::binary(self.take_frame())
        };
        self.feed(msg).await
    }

    async fn write_heartbeat_reply(&mut self, proto: &Proto, online: i32) -> Result<()> {
        let msg = if self.text_mode.load(Ordering::Relaxed) {
            Message::text(proto.heartbeat_reply_json(online))
        } else {
            proto.encode_heartbeat_reply(online, &mut self.buf);
            Message::binary(self.take_frame())
        };
        self.feed(msg).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.sink
            .flush()
            .await
            .map_err(|e| CometError::WebSocket(e.to_string()))
    }
}

// Helper function to include the server in request handlers
fn with_server(server: SharedServer) -> impl Filter<Extract = (SharedServer,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&server))
}

/// `GET /sub` upgrades to a comet session
pub fn ws_route(server: SharedServer) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path(WS_PATH)
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("cookie"))
        .and(with_server(server))
        .map(
            |ws: warp::ws::Ws, remote: Option<SocketAddr>, cookie: Option<String>, server: SharedServer| {
                ws.on_upgrade(move |socket| serve_websocket(server, socket, remote, cookie.unwrap_or_default()))
            },
        )
}

pub fn health_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("health").and(warp::path::end()).map(|| "OK")
}

/// Bind every configured WebSocket address. Returns the bound addresses.
pub async fn init_websocket(server: SharedServer) -> Result<Vec<SocketAddr>> {
    let mut bound = Vec::with_capacity(server.config().websocket_bind.len());

    for bind in &server.config().websocket_bind {
        let addr: SocketAddr = bind.parse().map_err(|e| {
            CometError::ConfigError(format!("invalid websocket bind {}: {}", bind, e))
        })?;
        let routes = ws_route(Arc::clone(&server)).or(health_route());
        let (local, serving) = warp::serve(routes)
            .try_bind_ephemeral(addr)
            .map_err(|e| CometError::ConfigError(format!("websocket bind {}: {}", addr, e)))?;
        log::info!("start websocket listen: {}", local);
        tokio::spawn(serving);
        bound.push(local);
    }
    Ok(bound)
}

async fn serve_websocket(server: SharedServer, socket: WebSocket, remote: Option<SocketAddr>, cookie: String) {
    let index = server.round().next_index();
    if server.config().debug {
        log::info!("start websocket serve {:?}", remote);
    }

    let (sink, stream) = socket.split();
    let text_mode = Arc::new(AtomicBool::new(false));
    let reader = WsProtoReader {
        stream,
        text_mode: Arc::clone(&text_mode),
        first: true,
        max_body: server.config().max_body_size,
    };
    let writer = WsProtoWriter {
        sink,
        text_mode,
        buf: server.round().writer(index).get(),
    };
    let peer = Peer {
        ip: remote.map(|addr| addr.ip().to_string()).unwrap_or_default(),
        cookie,
        round_index: index,
    };
    serve_connection(server, reader, writer, peer).await;
}
