//! Per-connection session state

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::proto::Proto;
use crate::core::ring::Ring;
use crate::core::room::Room;
use crate::error::{CometError, Result};

/// Items on a channel's outbound queue
#[derive(Debug, Clone)]
pub enum Signal {
    /// A server push to write as-is
    Data(Arc<Proto>),
    /// Inbound replies are waiting in the ring
    Ready,
    /// Stop the writer
    Finish,
}

/// The room a channel is linked into and its node slot there
pub(crate) struct Membership {
    pub room: Arc<Room>,
    pub slot: usize,
}

/// One authenticated connection.
///
/// Identity is fixed once the handshake succeeds. The reader task owns the
/// producer side of the ring, the writer task owns the consumer side and the
/// outbound queue receiver.
pub struct Channel {
    pub mid: i64,
    pub key: String,
    pub ip: String,
    ring: Mutex<Ring>,
    signal: mpsc::Sender<Signal>,
    wake_pending: AtomicBool,
    watch_ops: RwLock<HashSet<i32>>,
    pub(crate) membership: Mutex<Option<Membership>>,
}

impl Channel {
    /// Create a channel with a ring of `cli_proto` slots and an outbound
    /// queue of `svr_proto` entries. The receiver goes to the writer task.
    pub fn new(
        mid: i64,
        key: String,
        ip: String,
        cli_proto: usize,
        svr_proto: usize,
    ) -> (Self, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(svr_proto.max(1));
        let channel = Self {
            mid,
            key,
            ip,
            ring: Mutex::new(Ring::new(cli_proto)),
            signal: tx,
            wake_pending: AtomicBool::new(false),
            watch_ops: RwLock::new(HashSet::new()),
            membership: Mutex::new(None),
        };
        (channel, rx)
    }

    pub fn watch(&self, ops: &[i32]) {
        self.watch_ops.write().extend(ops.iter().copied());
    }

    pub fn unwatch(&self, ops: &[i32]) {
        let mut watched = self.watch_ops.write();
        for op in ops {
            watched.remove(op);
        }
    }

    pub fn needs_push(&self, op: i32) -> bool {
        self.watch_ops.read().contains(&op)
    }

    /// Queue a push without waiting. Returns false when the queue is full
    /// or the writer has gone away; the message is dropped in that case.
    pub fn deliver(&self, proto: Arc<Proto>) -> bool {
        match self.signal.try_send(Signal::Data(proto)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("key: {} outbound queue full, dropping push", self.key);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Tell the writer that the ring has entries. Collapses repeated wakes
    /// into a single queued `Ready`.
    pub fn wake(&self) {
        if self.wake_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.signal.try_send(Signal::Ready).is_err() {
            // A full queue still has entries ahead, and the writer drains
            // the ring after every one of them
            self.wake_pending.store(false, Ordering::Release);
        }
    }

    /// Called by the writer before draining the ring
    pub fn clear_wake(&self) {
        self.wake_pending.store(false, Ordering::Release);
    }

    /// Ask the writer to stop. Never blocks the caller.
    pub fn close(&self) {
        match self.signal.try_send(Signal::Finish) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                let tx = self.signal.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = tx.send(Signal::Finish).await;
                        });
                    }
                    Err(_) => log::warn!("key: {} cannot queue finish outside a runtime", self.key),
                }
            }
        }
    }

    /// Store a decoded inbound frame for the writer
    pub fn push_inbound(&self, proto: Proto) -> Result<()> {
        let mut ring = self.ring.lock();
        let slot = ring.try_reserve_write().ok_or(CometError::RingFull)?;
        *slot = proto;
        ring.commit_write();
        Ok(())
    }

    pub fn pop_inbound(&self) -> Option<Proto> {
        let mut ring = self.ring.lock();
        let proto = ring.try_reserve_read()?.take();
        ring.commit_read();
        Some(proto)
    }

    /// The room this channel currently belongs to, if any
    pub fn room(&self) -> Option<Arc<Room>> {
        self.membership
            .lock()
            .as_ref()
            .map(|m| Arc::clone(&m.room))
    }
}
