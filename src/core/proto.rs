//! Wire codec for the comet frame
//!
//! ```text
//! |-------------|-------------|---------|-----------|----------|---------|
//! | packet len  | header len  | version | operation | sequence |  body   |
//! |   int32     |   int16     |  int16  |   int32   |  int32   | n bytes |
//! |-------------|-------------|---------|-----------|----------|---------|
//! ```
//!
//! All integers are big-endian. `header len` is always 16 and
//! `packet len - header len` is the body length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::operation::OP_RAW;
use crate::error::{CometError, Result};

pub const HEADER_SIZE: usize = 16;
const HEARTBEAT_BODY_SIZE: usize = 4;

/// One decoded message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proto {
    pub ver: i16,
    pub op: i32,
    pub seq: i32,
    pub body: Bytes,
}

struct Header {
    pack_len: i32,
    ver: i16,
    op: i32,
    seq: i32,
}

fn parse_header(mut header: &[u8], max_body: usize) -> Result<Header> {
    let pack_len = header.get_i32();
    let header_len = header.get_i16();
    let ver = header.get_i16();
    let op = header.get_i32();
    let seq = header.get_i32();

    if pack_len < HEADER_SIZE as i32 || pack_len as usize > max_body + HEADER_SIZE {
        return Err(CometError::PackLength(pack_len));
    }
    if header_len != HEADER_SIZE as i16 {
        return Err(CometError::HeaderLength(header_len));
    }
    Ok(Header { pack_len, ver, op, seq })
}

fn put_header(out: &mut BytesMut, pack_len: usize, ver: i16, op: i32, seq: i32) {
    out.put_i32(pack_len as i32);
    out.put_i16(HEADER_SIZE as i16);
    out.put_i16(ver);
    out.put_i32(op);
    out.put_i32(seq);
}

impl Proto {
    pub fn new(op: i32, body: impl Into<Bytes>) -> Self {
        Self {
            ver: 1,
            op,
            seq: 0,
            body: body.into(),
        }
    }

    /// Move the contents out, leaving an empty slot behind
    pub fn take(&mut self) -> Proto {
        std::mem::take(self)
    }

    /// Decode one frame from the front of a stream buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole frame.
    /// The header is validated as soon as it is available so an oversized
    /// frame is rejected before its body arrives.
    pub fn decode(buf: &mut BytesMut, max_body: usize) -> Result<Option<Proto>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = parse_header(&buf[..HEADER_SIZE], max_body)?;
        let pack_len = header.pack_len as usize;
        if buf.len() < pack_len {
            buf.reserve(pack_len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(pack_len).freeze();
        Ok(Some(Proto {
            ver: header.ver,
            op: header.op,
            seq: header.seq,
            body: frame.slice(HEADER_SIZE..),
        }))
    }

    /// Decode a complete frame carried in a single transport message
    pub fn decode_frame(data: &[u8], max_body: usize) -> Result<Proto> {
        if data.len() < HEADER_SIZE {
            return Err(CometError::PackLength(data.len() as i32));
        }
        let header = parse_header(&data[..HEADER_SIZE], max_body)?;
        let pack_len = header.pack_len as usize;
        if pack_len != data.len() {
            return Err(CometError::MalformedFrame(format!(
                "packet length {} does not match message length {}",
                pack_len,
                data.len()
            )));
        }
        Ok(Proto {
            ver: header.ver,
            op: header.op,
            seq: header.seq,
            body: Bytes::copy_from_slice(&data[HEADER_SIZE..pack_len]),
        })
    }

    /// Append the framed message; `OP_RAW` bodies are written verbatim
    pub fn encode(&self, out: &mut BytesMut) {
        if self.op == OP_RAW {
            out.put_slice(&self.body);
            return;
        }
        out.reserve(HEADER_SIZE + self.body.len());
        put_header(out, HEADER_SIZE + self.body.len(), self.ver, self.op, self.seq);
        out.put_slice(&self.body);
    }

    /// Append a heartbeat reply whose body is the room online number
    pub fn encode_heartbeat_reply(&self, online: i32, out: &mut BytesMut) {
        out.reserve(HEADER_SIZE + HEARTBEAT_BODY_SIZE);
        put_header(out, HEADER_SIZE + HEARTBEAT_BODY_SIZE, self.ver, self.op, self.seq);
        out.put_i32(online);
    }

    /// Decode a JSON text frame: `{"ver":1,"op":7,"seq":1,"body":"..."}`
    pub fn decode_json(text: &str) -> Result<Proto> {
        let frame: JsonFrame = serde_json::from_str(text)
            .map_err(|e| CometError::MalformedFrame(format!("invalid json frame: {}", e)))?;
        let body = match frame.body {
            Value::Null => Bytes::new(),
            Value::String(s) => Bytes::from(s),
            other => Bytes::from(other.to_string()),
        };
        Ok(Proto {
            ver: frame.ver,
            op: frame.op,
            seq: frame.seq,
            body,
        })
    }

    pub fn to_json(&self) -> String {
        let body = if self.body.is_empty() {
            Value::Null
        } else {
            match std::str::from_utf8(&self.body) {
                Ok(s) => serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.to_string())),
                Err(_) => Value::String(String::from_utf8_lossy(&self.body).into_owned()),
            }
        };
        json_frame(self, body)
    }

    pub fn heartbeat_reply_json(&self, online: i32) -> String {
        json_frame(self, Value::from(online))
    }
}

#[derive(Serialize, Deserialize)]
struct JsonFrame {
    #[serde(default)]
    ver: i16,
    op: i32,
    #[serde(default)]
    seq: i32,
    #[serde(default)]
    body: Value,
}

fn json_frame(p: &Proto, body: Value) -> String {
    let frame = JsonFrame {
        ver: p.ver,
        op: p.op,
        seq: p.seq,
        body,
    };
    // Serializing plain integers and a Value cannot fail
    serde_json::to_string(&frame).unwrap_or_default()
}
