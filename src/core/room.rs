//! Room membership list
//!
//! Members live in a slab of nodes linked into a doubly linked list, so
//! join and leave are O(1) given the slot the channel remembers. Nodes only
//! hold weak references; a channel is owned by its connection tasks and
//! its bucket, never by a room.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use crate::core::channel::{Channel, Membership};
use crate::core::proto::Proto;
use crate::error::{CometError, Result};

struct Node {
    channel: Weak<Channel>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct Members {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    online: i32,
    /// Set when the last member leaves; a dropped room accepts no joins
    dropped: bool,
}

impl Members {
    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn link(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn link_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.link(cursor?)?;
            cursor = node.next;
            Some(node)
        })
    }
}

/// A named group of channels
pub struct Room {
    pub id: String,
    members: RwLock<Members>,
    /// Cluster-wide count from the last online renewal
    all_online: AtomicI32,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(Members::default()),
            all_online: AtomicI32::new(0),
        }
    }

    /// Link a channel at the head of the list and record the membership on
    /// the channel. Fails with `RoomDropped` once the room has emptied.
    pub fn join(self: &Arc<Self>, ch: &Arc<Channel>) -> Result<()> {
        let mut membership = ch.membership.lock();
        debug_assert!(membership.is_none(), "channel already in a room");

        let mut members = self.members.write();
        if members.dropped {
            return Err(CometError::RoomDropped);
        }
        let head = members.head;
        let slot = members.alloc(Node {
            channel: Arc::downgrade(ch),
            prev: None,
            next: head,
        });
        if let Some(node) = head.and_then(|h| members.link_mut(h)) {
            node.prev = Some(slot);
        }
        members.head = Some(slot);
        members.online += 1;

        *membership = Some(Membership {
            room: Arc::clone(self),
            slot,
        });
        Ok(())
    }

    /// Unlink a channel. Returns true when this leave emptied the room,
    /// which also marks it dropped. A channel that is not a member of this
    /// room is left untouched.
    pub fn leave(&self, ch: &Channel) -> bool {
        let mut membership = ch.membership.lock();
        let slot = match membership.as_ref() {
            Some(m) if std::ptr::eq(Arc::as_ptr(&m.room), self) => m.slot,
            _ => return false,
        };
        *membership = None;

        let mut members = self.members.write();
        let node = match members.nodes.get_mut(slot).and_then(Option::take) {
            Some(node) => node,
            None => return false,
        };
        if let Some(next) = node.next.and_then(|n| members.link_mut(n)) {
            next.prev = node.prev;
        }
        match node.prev {
            Some(p) => {
                if let Some(prev) = members.link_mut(p) {
                    prev.next = node.next;
                }
            }
            None => members.head = node.next,
        }
        members.free.push(slot);
        members.online -= 1;
        members.dropped = members.online == 0;
        members.dropped
    }

    /// Offer `proto` to every member watching its op. Never blocks; members
    /// with a full queue miss the message. Returns the number queued.
    pub fn broadcast(&self, proto: &Arc<Proto>) -> usize {
        let members = self.members.read();
        members
            .iter()
            .filter_map(|node| node.channel.upgrade())
            .filter(|ch| ch.needs_push(proto.op) && ch.deliver(Arc::clone(proto)))
            .count()
    }

    /// Send a finish signal to every member
    pub fn close(&self) {
        let members = self.members.read();
        for ch in members.iter().filter_map(|node| node.channel.upgrade()) {
            ch.close();
        }
    }

    /// Live members, most recent first
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.members
            .read()
            .iter()
            .filter_map(|node| node.channel.upgrade())
            .collect()
    }

    /// Local member count
    pub fn online(&self) -> i32 {
        self.members.read().online
    }

    /// Count reported to clients: the cluster-wide count when known
    pub fn online_num(&self) -> i32 {
        let all = self.all_online.load(Ordering::Relaxed);
        if all > 0 {
            all
        } else {
            self.online()
        }
    }

    pub fn set_all_online(&self, count: i32) {
        self.all_online.store(count, Ordering::Relaxed);
    }

    pub fn is_dropped(&self) -> bool {
        self.members.read().dropped
    }

    /// Walk the list checking link consistency; returns the node count
    pub fn linked_len(&self) -> usize {
        let members = self.members.read();
        let mut prev = None;
        let mut len = 0;
        let mut cursor = members.head;
        while let Some(slot) = cursor {
            let node = match members.link(slot) {
                Some(node) => node,
                None => break,
            };
            assert_eq!(node.prev, prev, "broken back link at slot {}", slot);
            prev = Some(slot);
            cursor = node.next;
            len += 1;
        }
        len
    }
}
