use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use crate::{
    config::{ClientConfig, TorrentConfig},
    metainfo::{PieceHashes, TorrentModel, Version},
    p2p::PeerSource,
    store::FileInfo,
};

use super::{CommandToTorrent, TorrentTask, TorrentState};

fn model(is_private: bool) -> TorrentModel {
    TorrentModel {
        name: "test".into(),
        piece_length: 16,
        files: vec![FileInfo {
            path: "file.bin".into(),
            length: 16,
            offset: 0,
            md5sum: None,
            pieces_root: None,
        }],
        piece_hashes: PieceHashes { v1: vec![[0u8; 20]], v2_layers: BTreeMap::new() },
        version: Version::V1,
        meta_version: None,
        info_hash_v1: Some([1u8; 20]),
        info_hash_v2: None,
        announces: vec![],
        nodes: vec![],
        is_private,
        webseeds: vec![],
        comment: None,
        created_by: None,
        creation_date: None,
    }
}

async fn task(is_private: bool, dir: &std::path::Path) -> TorrentTask {
    let metainfo = model(is_private);
    let client_config = Arc::new(ClientConfig::default());
    let mut torrent_config = TorrentConfig::default();
    torrent_config.output_dir = dir.to_path_buf();
    torrent_config.listen_address = "127.0.0.1:0".parse().unwrap();
    TorrentTask::new(&metainfo, client_config, torrent_config).await.unwrap()
}

#[tokio::test]
async fn piece_write_completes_torrent_and_transitions_to_seeding() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = task(false, dir.path()).await;

    task.ctx.picker.piece_picker.write().await.bitfield_update(&crate::bitfield::Bitfield::have_all(1));
    task.handle_piece_write(0, true).await.unwrap();

    assert_eq!(task.state, TorrentState::Seeding);
    assert!(task.ctx.picker.piece_picker.read().await.all());
}

#[tokio::test]
async fn private_torrent_ignores_dht_peers() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = task(true, dir.path()).await;

    let addr: SocketAddr = "203.0.113.5:6881".parse().unwrap();
    let more = task
        .handle_command(CommandToTorrent::PeersDiscovered { peers: vec![addr], source: PeerSource::Dht })
        .await
        .unwrap();

    assert!(more);
    assert!(task.available.is_empty());
    assert!(task.peers.is_empty());
}

#[tokio::test]
async fn tracker_sourced_peers_are_queued_for_dialling() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = task(true, dir.path()).await;

    let addr: SocketAddr = "203.0.113.6:6881".parse().unwrap();
    task.handle_command(CommandToTorrent::PeersDiscovered { peers: vec![addr], source: PeerSource::Tracker })
        .await
        .unwrap();

    // `connect_to_peers` dials everything within budget immediately, so the
    // address should have moved out of `available` and into `dialing`.
    assert!(task.dialing.contains(&addr) || task.peers.keys().any(|id| id.addr == addr));
}

#[tokio::test]
async fn piece_write_emits_completed_and_piece_completed_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut task = task(false, dir.path()).await;
    let mut events = task.subscribe();

    task.ctx.picker.piece_picker.write().await.bitfield_update(&crate::bitfield::Bitfield::have_all(1));
    task.handle_piece_write(0, true).await.unwrap();

    let mut saw_piece_completed = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            super::TaskEvent::PieceCompleted(0) => saw_piece_completed = true,
            super::TaskEvent::Completed => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_piece_completed);
    assert!(saw_completed);
}

#[tokio::test]
async fn completing_download_with_super_seeding_enabled_enters_super_seed_state() {
    let dir = tempfile::tempdir().unwrap();
    let metainfo = model(false);
    let client_config = Arc::new(ClientConfig::default());
    let mut torrent_config = TorrentConfig::default();
    torrent_config.output_dir = dir.path().to_path_buf();
    torrent_config.listen_address = "127.0.0.1:0".parse().unwrap();
    torrent_config.super_seeding = true;
    let mut task = TorrentTask::new(&metainfo, client_config, torrent_config).await.unwrap();

    task.ctx.picker.piece_picker.write().await.bitfield_update(&crate::bitfield::Bitfield::have_all(1));
    task.handle_piece_write(0, true).await.unwrap();

    assert_eq!(task.state, TorrentState::SuperSeeding);
    assert!(task.super_seeder.is_some());
    assert!(task.ctx.super_seeding.load(std::sync::atomic::Ordering::Relaxed));
}
