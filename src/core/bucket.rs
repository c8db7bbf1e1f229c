//! Bucket: one shard of the session and room directory
//!
//! Keys are spread over buckets by hash so that no single lock covers every
//! session. Each bucket also owns a small pool of room broadcast workers fed
//! round-robin through bounded queues.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::CometConfig;
use crate::core::channel::Channel;
use crate::core::proto::Proto;
use crate::core::room::Room;
use crate::error::{CometError, Result};

/// Attempts to join a room that keeps getting dropped underneath us
const MAX_JOIN_ATTEMPTS: usize = 3;

/// A queued room push
#[derive(Debug, Clone)]
pub struct RoomBroadcast {
    pub room_id: String,
    pub proto: Arc<Proto>,
}

#[derive(Default)]
struct Directory {
    chs: HashMap<String, Arc<Channel>>,
    rooms: HashMap<String, Arc<Room>>,
    ip_counts: HashMap<String, i32>,
}

pub struct Bucket {
    dir: Arc<RwLock<Directory>>,
    routines: Vec<mpsc::Sender<RoomBroadcast>>,
    routine_num: AtomicU64,
}

impl Bucket {
    /// Create a bucket and spawn its room workers on the current runtime
    pub fn new(config: &CometConfig) -> Self {
        let dir = Arc::new(RwLock::new(Directory {
            chs: HashMap::with_capacity(config.bucket_channel),
            rooms: HashMap::with_capacity(config.bucket_room),
            ip_counts: HashMap::new(),
        }));

        let routines = (0..config.routine_amount.max(1))
            .map(|worker_id| {
                let (tx, rx) = mpsc::channel(config.routine_size.max(1));
                tokio::spawn(Self::room_worker(worker_id, Arc::clone(&dir), rx));
                tx
            })
            .collect();

        Self {
            dir,
            routines,
            routine_num: AtomicU64::new(0),
        }
    }

    async fn room_worker(
        worker_id: usize,
        dir: Arc<RwLock<Directory>>,
        mut rx: mpsc::Receiver<RoomBroadcast>,
    ) {
        while let Some(task) = rx.recv().await {
            let room = dir.read().rooms.get(&task.room_id).cloned();
            if let Some(room) = room {
                let sent = room.broadcast(&task.proto);
                log::debug!(
                    "Worker {} pushed op {} to {} members of room {}",
                    worker_id,
                    task.proto.op,
                    sent,
                    task.room_id
                );
            }
        }
        log::debug!("Room worker {} shutting down", worker_id);
    }

    /// Register a channel under its key and join it to `room_id` (empty for
    /// none). A different channel already registered under the key is
    /// closed and replaced.
    pub fn put(&self, room_id: &str, ch: Arc<Channel>) -> Result<()> {
        {
            let mut dir = self.dir.write();
            if let Some(old) = dir.chs.get(&ch.key) {
                if !Arc::ptr_eq(old, &ch) {
                    log::info!("key: {} superseded by a new connection", ch.key);
                    old.close();
                }
            }
            dir.chs.insert(ch.key.clone(), Arc::clone(&ch));
            *dir.ip_counts.entry(ch.ip.clone()).or_insert(0) += 1;
        }

        if room_id.is_empty() {
            return Ok(());
        }
        self.join_room(room_id, &ch)
    }

    /// Unregister a channel and leave its room. Only removes the key if it
    /// still maps to this exact channel.
    pub fn del(&self, ch: &Arc<Channel>) {
        {
            let mut dir = self.dir.write();
            if dir.chs.get(&ch.key).is_some_and(|c| Arc::ptr_eq(c, ch)) {
                dir.chs.remove(&ch.key);
            }
            if let Some(count) = dir.ip_counts.get_mut(&ch.ip) {
                *count -= 1;
                if *count <= 0 {
                    dir.ip_counts.remove(&ch.ip);
                }
            }
        }

        if let Some(room) = ch.room() {
            if room.leave(ch) {
                self.del_room(&room);
            }
        }
    }

    /// Move a channel to another room. An empty id just leaves the current one.
    pub fn change_room(&self, room_id: &str, ch: &Arc<Channel>) -> Result<()> {
        if let Some(old) = ch.room() {
            if old.id == room_id {
                return Ok(());
            }
            if old.leave(ch) {
                self.del_room(&old);
            }
        }
        if room_id.is_empty() {
            return Ok(());
        }
        self.join_room(room_id, ch)
    }

    fn join_room(&self, room_id: &str, ch: &Arc<Channel>) -> Result<()> {
        let mut room = self.room_or_create(room_id);
        for _ in 0..MAX_JOIN_ATTEMPTS {
            match room.join(ch) {
                Err(CometError::RoomDropped) => room = self.replace_dropped(&room),
                res => return res,
            }
        }
        Err(CometError::RoomDropped)
    }

    fn room_or_create(&self, room_id: &str) -> Arc<Room> {
        if let Some(room) = self.dir.read().rooms.get(room_id) {
            return Arc::clone(room);
        }
        let mut dir = self.dir.write();
        Arc::clone(
            dir.rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Room::new(room_id))),
        )
    }

    /// Swap a dropped room for a fresh one unless someone already did
    fn replace_dropped(&self, dropped: &Arc<Room>) -> Arc<Room> {
        let mut dir = self.dir.write();
        match dir.rooms.get(&dropped.id) {
            Some(current) if !Arc::ptr_eq(current, dropped) => Arc::clone(current),
            _ => {
                let fresh = Arc::new(Room::new(dropped.id.clone()));
                dir.rooms.insert(dropped.id.clone(), Arc::clone(&fresh));
                fresh
            }
        }
    }

    /// Remove an emptied room, unless the id already maps to a newer room
    pub fn del_room(&self, room: &Arc<Room>) {
        let mut dir = self.dir.write();
        if dir.rooms.get(&room.id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            dir.rooms.remove(&room.id);
        }
    }

    /// Remove a room and finish every member's writer
    pub fn close_room(&self, room_id: &str) -> bool {
        let room = self.dir.write().rooms.remove(room_id);
        match room {
            Some(room) => {
                room.close();
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.dir.read().chs.get(key).cloned()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.dir.read().rooms.get(room_id).cloned()
    }

    /// Push to every channel in the bucket watching `op`
    pub fn broadcast(&self, proto: &Arc<Proto>, op: i32) -> usize {
        let dir = self.dir.read();
        dir.chs
            .values()
            .filter(|ch| ch.needs_push(op) && ch.deliver(Arc::clone(proto)))
            .count()
    }

    /// Queue a room push on the next worker. Dropped with a warning when
    /// that worker's queue is full.
    pub fn broadcast_room(&self, task: RoomBroadcast) -> bool {
        let num = self.routine_num.fetch_add(1, Ordering::Relaxed);
        let idx = (num % self.routines.len() as u64) as usize;
        match self.routines[idx].try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                log::warn!(
                    "room worker {} queue full, dropping push to room {}",
                    idx,
                    task.room_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.dir.read().chs.len()
    }

    pub fn room_count(&self) -> usize {
        self.dir.read().rooms.len()
    }

    /// Local online count of every non-empty room
    pub fn rooms_count(&self) -> HashMap<String, i32> {
        self.dir
            .read()
            .rooms
            .iter()
            .filter_map(|(id, room)| {
                let online = room.online();
                (online > 0).then(|| (id.clone(), online))
            })
            .collect()
    }

    /// Ids of every non-empty room
    pub fn rooms(&self) -> HashSet<String> {
        self.dir
            .read()
            .rooms
            .iter()
            .filter(|(_, room)| room.online() > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply cluster-wide counts; rooms missing from `counts` are reset
    pub fn up_rooms_count(&self, counts: &HashMap<String, i32>) {
        let dir = self.dir.read();
        for (id, room) in dir.rooms.iter() {
            room.set_all_online(counts.get(id).copied().unwrap_or(0));
        }
    }

    /// Distinct client IPs with at least one live connection
    pub fn ips(&self) -> HashSet<String> {
        self.dir.read().ip_counts.keys().cloned().collect()
    }

    pub fn ip_count(&self, ip: &str) -> i32 {
        self.dir.read().ip_counts.get(ip).copied().unwrap_or(0)
    }
}
