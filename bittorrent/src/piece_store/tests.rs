use sha1::{Digest, Sha1};

use crate::{
    block::{block_len, num_blocks, BlockData},
    metainfo::PieceHashes,
    p2p::{PeerCommand, PeerId, Transport},
    store::{FileInfo, StoreInfo},
    task::CommandToTorrent,
    BLOCK_SIZE,
};

use super::{spawn, CommandToPieceStore};

fn single_file_store(dir: &std::path::Path, piece_len: usize, total_len: usize) -> StoreInfo {
    StoreInfo {
        total_len: total_len as u64,
        piece_len,
        last_piece_len: total_len % piece_len,
        num_pieces: ((total_len + piece_len - 1) / piece_len) as u32,
        files: vec![FileInfo {
            path: "file.bin".into(),
            length: total_len,
            offset: 0,
            md5sum: None,
            pieces_root: None,
        }],
        output_dir: dir.to_path_buf(),
    }
}

fn peer_id(port: u16) -> PeerId {
    PeerId::new(format!("127.0.0.1:{port}").parse().unwrap(), Transport::Tcp)
}

#[tokio::test]
async fn complete_piece_is_verified_and_written() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = BLOCK_SIZE * 2;
    let info = single_file_store(dir.path(), piece_len, piece_len);

    let piece_data: Vec<u8> = (0..piece_len).map(|i| (i % 251) as u8).collect();
    let mut hasher = Sha1::new();
    hasher.update(&piece_data);
    let hash: [u8; 20] = hasher.finalize().into();

    let piece_hashes = PieceHashes { v1: vec![hash], v2_layers: Default::default() };

    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, store_tx) = spawn(info.clone(), piece_hashes, 8, Default::default(), torrent_tx).await.unwrap();

    let num_blocks = num_blocks(piece_len) as usize;
    for i in 0..num_blocks {
        let offset = i * BLOCK_SIZE;
        let len = block_len(piece_len, i);
        store_tx
            .send(CommandToPieceStore::WriteBlock {
                peer_id: peer_id(1000),
                block: BlockData { piece_idx: 0, offset, data: piece_data[offset..offset + len].to_vec() },
            })
            .unwrap();
    }

    match torrent_rx.recv().await.unwrap() {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 0);
            assert!(valid);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let (peer_tx, mut peer_rx) = tokio::sync::mpsc::unbounded_channel();
    store_tx
        .send(CommandToPieceStore::ReadBlock {
            block: crate::block::BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE },
            peer_tx,
        })
        .unwrap();

    match peer_rx.recv().await.unwrap() {
        PeerCommand::BlockRead(block) => assert_eq!(block.data, piece_data[0..BLOCK_SIZE]),
        _ => panic!("unexpected command"),
    }
}

#[tokio::test]
async fn mismatched_hash_reports_bad_peer_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = BLOCK_SIZE;
    let info = single_file_store(dir.path(), piece_len, piece_len);

    // Hash for entirely different data than what we'll actually send.
    let piece_hashes = PieceHashes { v1: vec![[0xAA; 20]], v2_layers: Default::default() };

    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (_handle, store_tx) = spawn(info.clone(), piece_hashes, 8, Default::default(), torrent_tx).await.unwrap();

    let bad_peer = peer_id(2000);
    for _ in 0..5 {
        store_tx
            .send(CommandToPieceStore::WriteBlock {
                peer_id: bad_peer,
                block: BlockData { piece_idx: 0, offset: 0, data: vec![1u8; piece_len] },
            })
            .unwrap();

        match torrent_rx.recv().await.unwrap() {
            CommandToTorrent::PieceWritten { idx: 0, valid: false } => {}
            other => panic!("unexpected command: {other:?}"),
        }
    }

    match torrent_rx.recv().await.unwrap() {
        CommandToTorrent::BadPeer { id, .. } => assert_eq!(id, bad_peer),
        other => panic!("expected bad peer report, got {other:?}"),
    }
}
