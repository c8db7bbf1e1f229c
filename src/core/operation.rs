//! Operation codes carried in the frame header

pub const OP_HANDSHAKE: i32 = 0;
pub const OP_HANDSHAKE_REPLY: i32 = 1;

pub const OP_HEARTBEAT: i32 = 2;
pub const OP_HEARTBEAT_REPLY: i32 = 3;

pub const OP_SEND_MSG: i32 = 4;
pub const OP_SEND_MSG_REPLY: i32 = 5;

pub const OP_DISCONNECT_REPLY: i32 = 6;

pub const OP_AUTH: i32 = 7;
pub const OP_AUTH_REPLY: i32 = 8;

/// Body is written verbatim, without a frame header
pub const OP_RAW: i32 = 9;

// Internal signalling, never sent on the wire
pub const OP_PROTO_READY: i32 = 10;
pub const OP_PROTO_FINISH: i32 = 11;

pub const OP_CHANGE_ROOM: i32 = 12;
pub const OP_CHANGE_ROOM_REPLY: i32 = 13;

pub const OP_SUB: i32 = 14;
pub const OP_SUB_REPLY: i32 = 15;

pub const OP_UNSUB: i32 = 16;
pub const OP_UNSUB_REPLY: i32 = 17;

// Business pass-through range, forwarded to the control plane
pub const MIN_BUSINESS_OP: i32 = 1000;
pub const MAX_BUSINESS_OP: i32 = 10000;

pub fn is_business(op: i32) -> bool {
    (MIN_BUSINESS_OP..=MAX_BUSINESS_OP).contains(&op)
}

/// Parse a comma-separated list of operation codes, e.g. `"1,2,3"`
pub fn parse_ops(s: &str) -> Option<Vec<i32>> {
    if s.trim().is_empty() {
        return Some(Vec::new());
    }
    s.split(',').map(|op| op.trim().parse().ok()).collect()
}
