// Owns piece-level verification and the write-buffer that accumulates blocks
// until a piece is complete, then hands bytes to `file_manager` for disk I/O.
// Runs as its own task, mirroring the disk actor's mpsc command-loop shape.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};
use sha1::{Digest, Sha1};
use tokio::{sync::{mpsc, oneshot}, task};

use crate::{
    bitfield::Bitfield,
    block::{BlockData, BlockInfo},
    file_manager::{FileManager, FilePriority, ValidateMode},
    metainfo::PieceHashes,
    p2p::{PeerCommand, PeerId, PeerTx},
    store::StoreInfo,
    task::{CommandToTorrent, TorrentTx},
};

mod piece;
use piece::PendingPiece;

#[cfg(test)]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum PieceStoreError {

    #[error(transparent)]
    FileManager(#[from] crate::file_manager::FileManagerError),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<mpsc::error::SendError<T>> for PieceStoreError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PieceStoreError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PieceStoreError>;
pub type PieceStoreTx = mpsc::UnboundedSender<CommandToPieceStore>;
pub type PieceStoreRx = mpsc::UnboundedReceiver<CommandToPieceStore>;

// A peer gets reported to the torrent task after this many pieces from them
// fail verification; three strikes against a flaky client is noise, this many
// in a row almost certainly means corrupt or malicious data.
const BAD_PIECE_THRESHOLD: u32 = 5;

pub enum CommandToPieceStore {

    // A block has arrived from a peer and needs to be folded into its piece's
    // write buffer; once the piece completes it is verified and flushed.
    WriteBlock { peer_id: PeerId, block: BlockData },

    // A block has been requested and needs to be read from disk.
    ReadBlock { block: BlockInfo, peer_tx: PeerTx },

    SetPriority { file_idx: usize, priority: FilePriority },

    // Re-derive the completed-piece bitfield from what's on disk, either
    // trusting file sizes (`Quick`) or re-hashing every piece (`Full`).
    Validate { mode: ValidateMode, respond_to: oneshot::Sender<Bitfield> },

    Shutdown,
}

pub async fn spawn(
    info: StoreInfo,
    piece_hashes: PieceHashes,
    cache_pieces: usize,
    initial_priorities: HashMap<usize, FilePriority>,
    torrent_tx: TorrentTx,
) -> Result<(task::JoinHandle<Result<()>>, PieceStoreTx)> {
    tracing::info!("spawning piece store task");
    let (mut store, tx) = PieceStore::new(info, piece_hashes, cache_pieces, initial_priorities, torrent_tx)?;
    let handle = tokio::task::spawn(async move { store.run().await });
    Ok((handle, tx))
}

pub struct PieceStore {

    info: StoreInfo,
    piece_hashes: PieceHashes,
    files: Arc<FileManager>,

    // Pieces currently being assembled from in-flight blocks.
    write_buf: HashMap<usize, PendingPiece>,

    // Consecutive hash-verification failures per peer since their last good piece.
    bad_pieces: HashMap<PeerId, u32>,

    read_cache: lru::LruCache<usize, Arc<Vec<u8>>>,

    piece_store_rx: PieceStoreRx,
    torrent_tx: TorrentTx,
}

impl PieceStore {

    pub fn new(
        info: StoreInfo,
        piece_hashes: PieceHashes,
        cache_pieces: usize,
        initial_priorities: HashMap<usize, FilePriority>,
        torrent_tx: TorrentTx,
    ) -> Result<(Self, PieceStoreTx)> {

        let files = Arc::new(FileManager::new(info.clone(), &initial_priorities)?);
        let (piece_store_tx, piece_store_rx) = mpsc::unbounded_channel();
        let cache_pieces = NonZeroUsize::new(cache_pieces).unwrap_or(NonZeroUsize::new(1).unwrap());

        Ok((
            Self {
                info,
                piece_hashes,
                files,
                write_buf: HashMap::new(),
                bad_pieces: HashMap::new(),
                read_cache: lru::LruCache::new(cache_pieces),
                piece_store_rx,
                torrent_tx,
            },
            piece_store_tx,
        ))
    }

    #[tracing::instrument(name = "piece_store", skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting piece store");
        while let Some(cmd) = self.piece_store_rx.recv().await {
            match cmd {

                CommandToPieceStore::WriteBlock { peer_id, block } => self.write_block(peer_id, block)?,

                CommandToPieceStore::ReadBlock { block, peer_tx } => self.read_block(block, peer_tx)?,

                CommandToPieceStore::SetPriority { file_idx, priority } => {
                    self.files.set_priority(file_idx, priority)?;
                }

                CommandToPieceStore::Validate { mode, respond_to } => {
                    let bitfield = self.validate(mode)?;
                    respond_to.send(bitfield).ok();
                }

                CommandToPieceStore::Shutdown => {
                    tracing::info!("piece store shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    fn write_block(&mut self, peer_id: PeerId, block: BlockData) -> Result<()> {

        let piece_idx = block.piece_idx;
        let piece_len = self.info.piece_length(piece_idx);

        let pending = self
            .write_buf
            .entry(piece_idx)
            .or_insert_with(|| PendingPiece::new(piece_len));

        if pending.add_block(block.offset, &block.data) {
            tracing::trace!("duplicate block for piece {} at offset {}", piece_idx, block.offset);
            return Ok(());
        }

        if !pending.is_complete() {
            return Ok(());
        }

        let pending = self.write_buf.remove(&piece_idx).expect("just inserted");

        if self.verify_piece(piece_idx, &pending.data) {
            tracing::trace!("piece {} hash verified", piece_idx);
            let offset = self.info.piece_byte_offset(piece_idx);
            self.files.write(offset, &pending.data)?;
            self.bad_pieces.remove(&peer_id);
            self.torrent_tx.send(CommandToTorrent::PieceWritten { idx: piece_idx, valid: true })?;
        } else {
            crate::metrics::ERRORS.hash_mismatch.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let strikes = self.bad_pieces.entry(peer_id).or_insert(0);
            *strikes += 1;
            tracing::warn!("piece {} failed verification from {} (strike {})", piece_idx, peer_id, strikes);
            if *strikes >= BAD_PIECE_THRESHOLD {
                self.torrent_tx.send(CommandToTorrent::BadPeer {
                    id: peer_id,
                    reason: format!("{strikes} failed piece verifications"),
                })?;
            }
            self.torrent_tx.send(CommandToTorrent::PieceWritten { idx: piece_idx, valid: false })?;
        }

        Ok(())
    }

    fn verify_piece(&self, piece_idx: usize, data: &[u8]) -> bool {
        if let Some(hash) = self.piece_hashes.v1.get(piece_idx) {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.finalize().as_slice() == hash
        } else {
            self.verify_piece_v2(piece_idx, data)
        }
    }

    // v2 file trees pad every file to a piece-length boundary (BEP 52), so a
    // piece's index within its owning file's layer is just its offset from
    // that file's start divided by the piece length.
    fn verify_piece_v2(&self, piece_idx: usize, data: &[u8]) -> bool {
        let file_range = self.info.piece_file_intersections(piece_idx);
        let Some(file) = self.info.files.get(file_range.start) else { return false };
        let Some(root) = file.pieces_root else { return false };
        let Some(layer) = self.piece_hashes.v2_layers.get(&root) else { return false };

        let piece_offset = self.info.piece_byte_offset(piece_idx);
        let local_idx = (piece_offset - file.offset) / self.info.piece_len;

        crate::merkle::verify_piece(data, local_idx, layer).is_ok()
    }

    // `Quick` trusts on-disk file sizes; `Full` re-hashes every piece against
    // the expected hash, the only way to catch a truncated or bit-rotted
    // write quick mode can't see.
    fn validate(&self, mode: ValidateMode) -> Result<Bitfield> {
        let num_pieces = self.info.num_pieces as usize;
        let mut bitfield = Bitfield::new(num_pieces);

        match mode {
            ValidateMode::Quick => {
                if self.files.validate_quick()? {
                    for idx in 0..num_pieces {
                        bitfield.set(idx, true);
                    }
                }
            }
            ValidateMode::Full => {
                for idx in 0..num_pieces {
                    let offset = self.info.piece_byte_offset(idx);
                    let len = self.info.piece_length(idx);
                    let data = self.files.read(offset, len)?;
                    if self.verify_piece(idx, &data) {
                        bitfield.set(idx, true);
                    }
                }
            }
        }

        Ok(bitfield)
    }

    fn read_block(&mut self, block: BlockInfo, peer_tx: PeerTx) -> Result<()> {

        let piece_idx = block.piece_idx;

        let piece_bytes = if let Some(cached) = self.read_cache.get(&piece_idx) {
            tracing::trace!("read cache hit for piece {}", piece_idx);
            Arc::clone(cached)
        } else {
            let offset = self.info.piece_byte_offset(piece_idx);
            let len = self.info.piece_length(piece_idx);
            let data = Arc::new(self.files.read(offset, len)?);
            self.read_cache.put(piece_idx, Arc::clone(&data));
            data
        };

        if block.offset + block.len > piece_bytes.len() {
            tracing::warn!("requested block out of piece range: {:?}", block);
            return Ok(());
        }

        let data = piece_bytes[block.offset..block.offset + block.len].to_vec();
        peer_tx.send(PeerCommand::BlockRead(BlockData {
            piece_idx,
            offset: block.offset,
            data,
        }))?;

        Ok(())
    }
}
