// v2 (BEP 52) Merkle tree operations: per-file piece-layer hashing and root
// derivation. SHA-256 throughout, leaves are hashes of 16 KiB blocks.

use sha2::{Digest, Sha256};

pub const MERKLE_BLOCK_SIZE: usize = 16 * 1024;

const ZERO_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("piece {index} failed merkle verification against layer")]
    VerifyFailed { index: usize },

    #[error("piece layer has no entry at index {0}")]
    MissingLayerEntry(usize),
}

fn hash_block(block: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(block);
    hasher.finalize().into()
}

fn hash_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

// Combine a list of leaf hashes into a single root, padding to the next power
// of two with the zero hash as BEP 52 mandates.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let mut level = leaves.to_vec();
    let padded_len = level.len().next_power_of_two();
    level.resize(padded_len, ZERO_HASH);

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

// Hash of a single piece's bytes as it appears in a file's piece layer: the
// merkle root over that piece's constituent 16 KiB blocks.
pub fn piece_layer_hash(piece_bytes: &[u8]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = piece_bytes
        .chunks(MERKLE_BLOCK_SIZE)
        .map(hash_block)
        .collect();
    merkle_root(&leaves)
}

// Root over an entire file's pieces, i.e. the value stored as `pieces root`
// in the v2 file tree leaf.
pub fn file_root(file_bytes: &[u8], piece_length: usize) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = file_bytes
        .chunks(piece_length)
        .map(piece_layer_hash)
        .collect();
    merkle_root(&leaves)
}

// Number of blocks-per-piece doublings; used to know how many layers up from
// the base layer a piece's hash sits when the piece layer itself stores
// deeper (smaller) leaves than the piece granularity.
pub fn layer_depth_for_piece_length(piece_length: usize) -> u32 {
    (piece_length / MERKLE_BLOCK_SIZE).max(1).trailing_zeros()
}

// Verify a piece's bytes against the piece-layer entry recorded for it.
pub fn verify_piece(piece_bytes: &[u8], index: usize, piece_layer: &[[u8; 32]]) -> Result<(), MerkleError> {
    let expected = piece_layer.get(index).ok_or(MerkleError::MissingLayerEntry(index))?;
    if &piece_layer_hash(piece_bytes) == expected {
        Ok(())
    } else {
        Err(MerkleError::VerifyFailed { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_piece_hash_is_block_hash() {
        let data = vec![7u8; MERKLE_BLOCK_SIZE];
        assert_eq!(piece_layer_hash(&data), hash_block(&data));
    }

    #[test]
    fn file_root_matches_manual_two_piece_tree() {
        let piece_len = MERKLE_BLOCK_SIZE * 2;
        let file = vec![1u8; piece_len * 2];
        let p0 = piece_layer_hash(&file[..piece_len]);
        let p1 = piece_layer_hash(&file[piece_len..]);
        let expected = hash_pair(&p0, &p1);
        assert_eq!(file_root(&file, piece_len), expected);
    }

    #[test]
    fn verify_piece_detects_corruption() {
        let piece_len = MERKLE_BLOCK_SIZE;
        let file = vec![9u8; piece_len * 2];
        let layer = vec![
            piece_layer_hash(&file[..piece_len]),
            piece_layer_hash(&file[piece_len..]),
        ];
        assert!(verify_piece(&file[..piece_len], 0, &layer).is_ok());

        let mut corrupt = file[piece_len..].to_vec();
        corrupt[0] ^= 0xFF;
        assert_eq!(
            verify_piece(&corrupt, 1, &layer).unwrap_err(),
            MerkleError::VerifyFailed { index: 1 }
        );
    }

    #[test]
    fn odd_leaf_count_pads_with_zero_hash() {
        let leaves = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let padded = hash_pair(&hash_pair(&leaves[0], &leaves[1]), &hash_pair(&leaves[2], &ZERO_HASH));
        assert_eq!(merkle_root(&leaves), padded);
    }
}
