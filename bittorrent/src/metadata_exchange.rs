// BEP 9 metadata exchange: acquiring the info dictionary from a magnet link's
// peer set before a torrent's full context (picker, store) can exist. Each
// peer gets its own short-lived connection: handshake, extended handshake,
// then a request/data loop over 16 KiB metadata pieces.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use futures::{future::join_all, SinkExt, StreamExt};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;

use crate::p2p::{
    extension::{ExtendedHandshake, UtMetadataMessage, UtMetadataMsgType, UT_METADATA},
    Handshake, HandshakeCodec, Message, MessageCodec,
};

const METADATA_PIECE_LEN: usize = 16 * 1024;
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(10);
const BACKOFF_STEP: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUR_UT_METADATA_ID: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer error: {0}")]
    Peer(#[from] crate::p2p::PeerError),

    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("peer does not support ut_metadata")]
    UnsupportedExtension,

    #[error("peer does not know the metadata size")]
    UnknownSize,

    #[error("metadata size {0} exceeds sane limit")]
    SizeTooLarge(usize),

    #[error("peer rejected piece {0}")]
    PieceRejected(u32),

    #[error("assembled metadata does not hash to the expected info-hash")]
    HashMismatch,

    #[error("connection timed out")]
    Timeout,

    #[error("no peers supplied")]
    NoPeers,

    #[error("exhausted all peers without acquiring metadata")]
    AllPeersFailed,
}

type Result<T> = std::result::Result<T, MetadataError>;

// Sane upper bound on an info dict; real torrents are a few KiB to a few MiB.
const MAX_METADATA_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MetadataReady {
    pub info_dict: Vec<u8>,
    pub peers_tried: Vec<SocketAddr>,
}

// Fetches the info dictionary identified by `info_hash` from candidate
// `peers`, trying one round of all peers in parallel before backing off and
// retrying. Returns as soon as any peer's assembled dict verifies.
pub async fn fetch(
    info_hash: [u8; 20],
    client_id: [u8; 20],
    peers: Vec<SocketAddr>,
    cache_dir: Option<PathBuf>,
) -> Result<MetadataReady> {

    if peers.is_empty() {
        return Err(MetadataError::NoPeers);
    }

    if let Some(dict) = load_from_cache(info_hash, cache_dir.as_deref()) {
        tracing::debug!("metadata cache hit for {}", hex::encode(info_hash));
        return Ok(MetadataReady { info_dict: dict, peers_tried: Vec::new() });
    }

    let mut attempt = 0;
    loop {
        attempt += 1;

        let results = join_all(
            peers.iter().map(|&addr| fetch_from_peer(addr, info_hash, client_id)),
        )
        .await;

        for result in results {
            if let Ok(dict) = result {
                save_to_cache(info_hash, &dict, cache_dir.as_deref());
                return Ok(MetadataReady { info_dict: dict, peers_tried: peers.clone() });
            }
        }

        if attempt >= MAX_RETRIES {
            return Err(MetadataError::AllPeersFailed);
        }

        let backoff = std::cmp::min(BACKOFF_BASE + BACKOFF_STEP * (attempt - 1), BACKOFF_CAP);
        tracing::warn!("metadata fetch round {attempt} failed for all peers, backing off {backoff:?}");
        time::sleep(backoff).await;
    }
}

async fn fetch_from_peer(addr: SocketAddr, info_hash: [u8; 20], client_id: [u8; 20]) -> Result<Vec<u8>> {
    let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MetadataError::Timeout)??;

    let mut socket = Framed::new(stream, HandshakeCodec);

    let handshake = Handshake::new(info_hash, client_id).with_extended(true);
    socket.send(handshake).await?;

    let their_handshake = time::timeout(CONNECT_TIMEOUT, socket.next())
        .await
        .map_err(|_| MetadataError::Timeout)?
        .ok_or(crate::p2p::PeerError::NoHandshake)??;

    if !their_handshake.supports_extended() {
        return Err(MetadataError::UnsupportedExtension);
    }

    let mut socket = Framed::new(socket.into_inner(), MessageCodec);

    let our_ext = ExtendedHandshake::new("bitter-clone/1.0", &[(UT_METADATA, OUR_UT_METADATA_ID)]);
    let payload = bencode::encode_to_raw(&our_ext)?;
    socket.send(Message::Extended { ext_id: 0, payload }).await?;

    let mut peer_ut_metadata_id = None;
    let mut metadata_size = None;

    while peer_ut_metadata_id.is_none() || metadata_size.is_none() {
        let msg = time::timeout(CONNECT_TIMEOUT, socket.next())
            .await
            .map_err(|_| MetadataError::Timeout)?
            .ok_or(MetadataError::Timeout)??;

        if let Message::Extended { ext_id: 0, payload } = msg {
            let ext: ExtendedHandshake = bencode::decode_bytes(&payload)?;
            peer_ut_metadata_id = ext.m.get(UT_METADATA).copied();
            metadata_size = ext.metadata_size;
        }
        // Ignore anything else sent before the extended handshake arrives;
        // a well-behaved peer sends it first, but nothing guarantees it.
    }

    let peer_ut_metadata_id = peer_ut_metadata_id.ok_or(MetadataError::UnsupportedExtension)?;
    let total_size = metadata_size.ok_or(MetadataError::UnknownSize)? as usize;
    if total_size > MAX_METADATA_SIZE {
        return Err(MetadataError::SizeTooLarge(total_size));
    }

    let num_pieces = total_size.div_ceil(METADATA_PIECE_LEN);
    let mut pieces: HashMap<u32, Vec<u8>> = HashMap::with_capacity(num_pieces);

    for piece in 0..num_pieces as u32 {
        let request = UtMetadataMessage { msg_type: 0, piece, total_size: None };
        let payload = bencode::encode_to_raw(&request)?;
        socket.send(Message::Extended { ext_id: peer_ut_metadata_id, payload }).await?;

        loop {
            let msg = time::timeout(CONNECT_TIMEOUT, socket.next())
                .await
                .map_err(|_| MetadataError::Timeout)?
                .ok_or(MetadataError::Timeout)??;

            let Message::Extended { ext_id, payload } = msg else { continue };
            if ext_id != peer_ut_metadata_id && ext_id != 0 {
                continue;
            }

            // The dict is followed by the raw piece bytes with no separator;
            // find_raw_value would need the key boundary, so instead we rely
            // on the bencode decoder consuming only the dict and handing back
            // the trailing bytes via a manual split on its encoded length.
            let dict_len = bencode_dict_len(&payload)?;
            let header: UtMetadataMessage = bencode::decode_bytes(&payload[..dict_len])?;

            match header.msg_type() {
                Some(UtMetadataMsgType::Data) => {
                    pieces.insert(header.piece, payload[dict_len..].to_vec());
                    break;
                }
                Some(UtMetadataMsgType::Reject) => return Err(MetadataError::PieceRejected(header.piece)),
                _ => continue,
            }
        }
    }

    let mut dict = Vec::with_capacity(total_size);
    for piece in 0..num_pieces as u32 {
        let chunk = pieces.remove(&piece).ok_or(MetadataError::PieceRejected(piece))?;
        dict.extend_from_slice(&chunk);
    }
    dict.truncate(total_size);

    if !verifies(&dict, info_hash) {
        return Err(MetadataError::HashMismatch);
    }

    Ok(dict)
}

// `info_hash` here is always the 20-byte v1 (or truncated v2) identifier;
// hybrid/v2-only torrents are matched by SHA-256 over the same bytes too,
// since the caller may supply either depending on which hash it already
// trusts.
fn verifies(dict: &[u8], info_hash: [u8; 20]) -> bool {
    let sha1: [u8; 20] = Sha1::digest(dict).into();
    if sha1 == info_hash {
        return true;
    }
    let sha256 = Sha256::digest(dict);
    sha256[..20] == info_hash
}

// Scans a bencoded dictionary at the start of `buf` and returns the byte
// length it occupies, so trailing raw piece data can be split off.
fn bencode_dict_len(buf: &[u8]) -> Result<usize> {
    if buf.first() != Some(&b'd') {
        return Err(MetadataError::Bencode(bencode::Error::Custom("expected dict".into())));
    }
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < buf.len() {
        match buf[i] {
            b'd' | b'l' => { depth += 1; i += 1; }
            b'e' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            b'i' => {
                let end = buf[i..].iter().position(|&b| b == b'e').ok_or_else(|| {
                    MetadataError::Bencode(bencode::Error::Custom("unterminated integer".into()))
                })?;
                i += end + 1;
            }
            b'0'..=b'9' => {
                let colon = buf[i..].iter().position(|&b| b == b':').ok_or_else(|| {
                    MetadataError::Bencode(bencode::Error::Custom("malformed string length".into()))
                })?;
                let len: usize = std::str::from_utf8(&buf[i..i + colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| MetadataError::Bencode(bencode::Error::Custom("bad string length".into())))?;
                i += colon + 1 + len;
            }
            _ => {
                return Err(MetadataError::Bencode(bencode::Error::Custom("unexpected token".into())));
            }
        }
    }
    Err(MetadataError::Bencode(bencode::Error::Custom("truncated dict".into())))
}

fn cache_path(info_hash: [u8; 20], dir: Option<&std::path::Path>) -> PathBuf {
    let dir = dir.map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    dir.join(format!("{}.metadata", hex::encode(info_hash)))
}

fn load_from_cache(info_hash: [u8; 20], dir: Option<&std::path::Path>) -> Option<Vec<u8>> {
    let path = cache_path(info_hash, dir);
    let bytes = std::fs::read(path).ok()?;
    verifies(&bytes, info_hash).then_some(bytes)
}

fn save_to_cache(info_hash: [u8; 20], dict: &[u8], dir: Option<&std::path::Path>) {
    let path = cache_path(info_hash, dir);
    if let Err(e) = std::fs::write(&path, dict) {
        tracing::warn!("failed to write metadata cache {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bencode_dict_len_splits_trailing_bytes() {
        let request = UtMetadataMessage { msg_type: 0, piece: 3, total_size: None };
        let mut payload = bencode::encode_to_raw(&request).unwrap();
        let dict_len = payload.len();
        payload.extend_from_slice(b"trailing-piece-bytes");

        assert_eq!(bencode_dict_len(&payload).unwrap(), dict_len);
    }

    #[test]
    fn verifies_accepts_sha1_match() {
        let dict = b"d4:spam4:eggse".to_vec();
        let hash: [u8; 20] = Sha1::digest(&dict).into();
        assert!(verifies(&dict, hash));
    }

    #[test]
    fn verifies_rejects_mismatch() {
        let dict = b"d4:spam4:eggse".to_vec();
        assert!(!verifies(&dict, [0xFF; 20]));
    }

    #[test]
    fn cache_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dict = b"d3:fooi1ee".to_vec();
        let hash: [u8; 20] = Sha1::digest(&dict).into();

        save_to_cache(hash, &dict, Some(dir.path()));
        let loaded = load_from_cache(hash, Some(dir.path()));
        assert_eq!(loaded, Some(dict));
    }

    #[tokio::test]
    async fn fetch_without_peers_errors_immediately() {
        let err = fetch([0u8; 20], [1u8; 20], Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, MetadataError::NoPeers));
    }
}
