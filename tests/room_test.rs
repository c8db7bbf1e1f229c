use proptest::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

use rusty_comet::config::CometConfig;
use rusty_comet::core::bucket::{Bucket, RoomBroadcast};
use rusty_comet::core::channel::{Channel, Signal};
use rusty_comet::core::proto::Proto;
use rusty_comet::core::room::Room;

fn channel(key: &str, svr_proto: usize) -> (Arc<Channel>, mpsc::Receiver<Signal>) {
    let (ch, rx) = Channel::new(1, key.to_string(), "192.168.0.1".to_string(), 4, svr_proto);
    (Arc::new(ch), rx)
}

fn drain_data(rx: &mut mpsc::Receiver<Signal>) -> usize {
    let mut n = 0;
    while let Ok(signal) = rx.try_recv() {
        if matches!(signal, Signal::Data(_)) {
            n += 1;
        }
    }
    n
}

#[test]
fn test_room_membership_list() {
    let room = Arc::new(Room::new("lobby"));
    let chans: Vec<_> = (0..5).map(|i| channel(&format!("k{}", i), 4)).collect();

    for (ch, _) in &chans {
        room.join(ch).unwrap();
    }
    assert_eq!(room.online(), 5);
    assert_eq!(room.channels().len(), 5);

    // Most recent member is at the head
    assert_eq!(room.channels()[0].key, "k4");

    room.leave(&chans[2].0);
    room.leave(&chans[0].0);
    assert_eq!(room.online(), 3);
    assert_eq!(room.linked_len(), 3);
    let keys: Vec<_> = room.channels().iter().map(|c| c.key.clone()).collect();
    assert_eq!(keys, vec!["k4", "k3", "k1"]);
}

#[test]
fn test_room_push_skips_non_watchers() {
    let room = Arc::new(Room::new("room7"));
    let mut receivers = Vec::new();
    for i in 0..3 {
        let (ch, rx) = channel(&format!("w{}", i), 4);
        ch.watch(&[42]);
        room.join(&ch).unwrap();
        receivers.push((ch, rx));
    }
    let (idle, mut idle_rx) = channel("idle", 4);
    room.join(&idle).unwrap();

    let sent = room.broadcast(&Arc::new(Proto::new(42, "hello")));
    assert_eq!(sent, 3);
    for (_, rx) in receivers.iter_mut() {
        assert_eq!(drain_data(rx), 1);
    }
    assert_eq!(drain_data(&mut idle_rx), 0);
}

#[test]
fn test_room_push_never_blocks_on_full_queues() {
    let room = Arc::new(Room::new("busy"));
    let mut members = Vec::new();
    for i in 0..6 {
        let (ch, rx) = channel(&format!("m{}", i), 1);
        ch.watch(&[1000]);
        room.join(&ch).unwrap();
        members.push((ch, rx));
    }
    // Fill two members' queues
    for (ch, _) in members.iter().take(2) {
        assert!(ch.deliver(Arc::new(Proto::new(1000, "stuck"))));
    }

    let sent = room.broadcast(&Arc::new(Proto::new(1000, "fresh")));
    assert_eq!(sent, 4);
}

#[tokio::test]
async fn test_bucket_broadcast_never_blocks_on_full_queues() {
    let bucket = Bucket::new(&CometConfig::for_testing());
    let mut members = Vec::new();
    for i in 0..6 {
        let (ch, rx) = channel(&format!("b{}", i), 1);
        ch.watch(&[1000]);
        bucket.put("", Arc::clone(&ch)).unwrap();
        members.push((ch, rx));
    }
    for (ch, _) in members.iter().take(2) {
        assert!(ch.deliver(Arc::new(Proto::new(1000, "stuck"))));
    }

    let sent = bucket.broadcast(&Arc::new(Proto::new(1000, "fresh")), 1000);
    assert_eq!(sent, 4);
    let delivered: usize = members.iter_mut().map(|(_, rx)| drain_data(rx)).sum();
    assert_eq!(delivered, 6);
}

#[tokio::test]
async fn test_bucket_room_worker_delivers() {
    let bucket = Bucket::new(&CometConfig::for_testing());
    let (ch, mut rx) = channel("a", 4);
    ch.watch(&[7]);
    bucket.put("r", Arc::clone(&ch)).unwrap();

    assert!(bucket.broadcast_room(RoomBroadcast {
        room_id: "r".to_string(),
        proto: Arc::new(Proto::new(7, "via worker")),
    }));

    let signal = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match signal {
        Signal::Data(p) => assert_eq!(&p.body[..], b"via worker"),
        other => panic!("unexpected signal {:?}", other),
    }

    // Unknown rooms are ignored
    assert!(bucket.broadcast_room(RoomBroadcast {
        room_id: "nowhere".to_string(),
        proto: Arc::new(Proto::new(7, "x")),
    }));
}

#[derive(Debug, Clone)]
enum Action {
    Put { key: usize, room: usize },
    Change { key: usize, room: usize },
    Del { key: usize },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        ((0usize..6), (0usize..4)).prop_map(|(key, room)| Action::Put { key, room }),
        ((0usize..6), (0usize..4)).prop_map(|(key, room)| Action::Change { key, room }),
        (0usize..6).prop_map(|key| Action::Del { key }),
    ]
}

fn room_name(i: usize) -> String {
    // Index 0 means no room
    if i == 0 {
        String::new()
    } else {
        format!("room{}", i)
    }
}

proptest! {
    #[test]
    fn bucket_directory_stays_consistent(actions in prop::collection::vec(action_strategy(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        let bucket = Bucket::new(&CometConfig::for_testing());

        // Live channel per key, as a connection's teardown would see it
        let mut live: Vec<Option<(Arc<Channel>, mpsc::Receiver<Signal>)>> = (0..6).map(|_| None).collect();

        for action in actions {
            match action {
                Action::Put { key, room } => {
                    let (ch, rx) = channel(&format!("key{}", key), 8);
                    bucket.put(&room_name(room), Arc::clone(&ch)).unwrap();
                    // The superseded channel tears itself down
                    if let Some((old, _)) = live[key].replace((ch, rx)) {
                        bucket.del(&old);
                    }
                }
                Action::Change { key, room } => {
                    if let Some((ch, _)) = &live[key] {
                        bucket.change_room(&room_name(room), ch).unwrap();
                    }
                }
                Action::Del { key } => {
                    if let Some((ch, _)) = live[key].take() {
                        bucket.del(&ch);
                    }
                }
            }

            let alive: Vec<&Arc<Channel>> = live.iter().flatten().map(|(ch, _)| ch).collect();
            prop_assert_eq!(bucket.channel_count(), alive.len());
            for ch in &alive {
                let registered = bucket.channel(&ch.key);
                prop_assert!(registered.is_some_and(|r| Arc::ptr_eq(&r, ch)));
            }

            // Every room in the directory is non-empty and its count
            // matches the channels pointing at it
            for room_idx in 1..4 {
                let name = room_name(room_idx);
                let members = alive
                    .iter()
                    .filter(|ch| ch.room().is_some_and(|r| r.id == name))
                    .count();
                match bucket.room(&name) {
                    Some(room) => {
                        prop_assert_eq!(room.online() as usize, members);
                        prop_assert_eq!(room.linked_len(), members);
                        prop_assert!(members > 0);
                    }
                    None => prop_assert_eq!(members, 0),
                }
            }
            prop_assert_eq!(bucket.ip_count("192.168.0.1") as usize, alive.len());
        }
    }
}
