// TorrentModel + parser (v1, v2, hybrid; BEP 52) and the magnet-URI bootstrap
// descriptor. Version detection and info-hash computation follow BEP 52's
// definitions; hashing always operates on the raw info-dict substring (see
// `raw_scan`), never on a re-encoding of the parsed struct.

pub mod magnet;
pub mod raw_scan;
mod value;

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use serde_derive::Deserialize;
use url::Url;

use crate::store::FileInfo;
use value::BValue;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("missing name")]
    MissingName,

    #[error("piece length must be > 0")]
    InvalidPieceLength,

    #[error("neither length nor files nor file tree present")]
    NoFiles,

    #[error("failed to extract raw info dict: {0}")]
    RawExtraction(String),

    #[error("invalid magnet uri: {0}")]
    InvalidMagnet(String),

    #[error("malformed v2 file tree: {0}")]
    MalformedFileTree(String),

    #[error("announce url invalid: {0}")]
    InvalidAnnounceUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
    Hybrid,
}

// v1 and/or v2 piece hash material, depending on `Version`.
#[derive(Debug, Clone, Default)]
pub struct PieceHashes {
    pub v1: Vec<[u8; 20]>,
    // Keyed by each file's own pieces root; each value is that file's
    // per-piece SHA-256 layer, in piece order.
    pub v2_layers: BTreeMap<[u8; 32], Vec<[u8; 32]>>,
}

#[derive(Clone, Deserialize)]
struct FileRaw {
    path: Vec<String>,
    length: u64,
    #[serde(default)]
    md5sum: Option<String>,
}

#[derive(Clone, Deserialize)]
struct InfoRaw {
    name: String,

    #[serde(rename = "piece length")]
    piece_length: u32,

    #[serde(default, with = "serde_bytes")]
    pieces: Vec<u8>,

    #[serde(default)]
    length: Option<u64>,

    #[serde(default)]
    files: Option<Vec<FileRaw>>,

    #[serde(default)]
    private: Option<u8>,

    #[serde(rename = "meta version", default)]
    meta_version: Option<u32>,

    #[serde(rename = "file tree", default)]
    file_tree: Option<BValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UrlListRaw {
    One(String),
    Many(Vec<String>),
}

#[derive(Clone, Deserialize)]
struct MetaInfoRaw {
    #[serde(default)]
    announce: Option<String>,

    info: InfoRaw,

    #[serde(default)]
    encoding: Option<String>,

    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,

    #[serde(rename = "creation date", default)]
    creation_date: Option<i64>,

    #[serde(default)]
    comment: Option<String>,

    #[serde(rename = "created by", default)]
    created_by: Option<String>,

    #[serde(rename = "url-list", default)]
    url_list: Option<UrlListRaw>,

    #[serde(default)]
    nodes: Option<Vec<(String, u16)>>,

    #[serde(rename = "piece layers", default, with = "serde_bytes_layers")]
    piece_layers: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
}

// `piece layers` values are raw byte strings; serde_bytes only covers a single
// field, not the Vec<u8> values of a whole map, so a small shim module does the
// equivalent via the generic BValue walk instead of a derive helper.
mod serde_bytes_layers {
    use std::collections::BTreeMap;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<BTreeMap<Vec<u8>, Vec<u8>>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<super::BValue>::deserialize(deserializer)?;
        let Some(raw) = raw else { return Ok(None) };
        let Some(dict) = raw.as_dict() else { return Ok(None) };
        let mut out = BTreeMap::new();
        for (k, v) in dict {
            if let Some(bytes) = v.as_bytes() {
                out.insert(k.clone(), bytes.to_vec());
            }
        }
        Ok(Some(out))
    }
}

#[derive(Debug, Clone)]
pub struct TorrentModel {
    pub name: String,
    pub piece_length: u32,
    pub files: Vec<FileInfo>,
    pub piece_hashes: PieceHashes,
    pub version: Version,
    pub meta_version: Option<u32>,
    pub info_hash_v1: Option<[u8; 20]>,
    pub info_hash_v2: Option<[u8; 32]>,
    pub announces: Vec<Vec<Url>>,
    pub nodes: Vec<(String, u16)>,
    pub is_private: bool,
    pub webseeds: Vec<Url>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl TorrentModel {
    pub fn from_path<P: AsRef<std::path::Path>>(path: P) -> Result<TorrentModel, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TorrentModel, MetaInfoError> {
        let raw: MetaInfoRaw = bencode::decode_bytes(bytes)?;
        Self::build(raw, bytes)
    }

    fn build(raw: MetaInfoRaw, original_bytes: &[u8]) -> Result<TorrentModel, MetaInfoError> {
        let info = &raw.info;

        if info.name.is_empty() {
            return Err(MetaInfoError::MissingName);
        }
        if info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }

        let is_v2 = info.meta_version == Some(2) && info.file_tree.is_some();
        let has_v1_pieces = !info.pieces.is_empty();

        if !is_v2 && !has_v1_pieces {
            return Err(MetaInfoError::NoFiles);
        }
        if has_v1_pieces && (info.pieces.len() % 20 != 0) {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        let version = match (is_v2, has_v1_pieces) {
            (true, true) => Version::Hybrid,
            (true, false) => Version::V2,
            (false, _) => Version::V1,
        };

        let info_hash_v1 = if version != Version::V2 {
            let raw_info = raw_scan::info_substring(original_bytes, "info")?;
            Some(raw_scan::sha1_of(raw_info))
        } else {
            None
        };

        let info_hash_v2 = if version != Version::V1 {
            let raw_info = raw_scan::info_substring(original_bytes, "info")?;
            Some(raw_scan::sha256_of(raw_info))
        } else {
            None
        };

        let files = match version {
            Version::V1 => v1_files(info)?,
            Version::V2 | Version::Hybrid => v2_files(info)?,
        };

        if files.iter().any(|f| f.path.as_os_str().is_empty()) {
            return Err(MetaInfoError::FileEmptyPath);
        }

        let v1_hashes = if has_v1_pieces {
            info.pieces
                .chunks_exact(20)
                .map(|c| c.try_into().unwrap())
                .collect()
        } else {
            Vec::new()
        };

        let v2_layers = raw.piece_layers.unwrap_or_default()
            .into_iter()
            .filter_map(|(root, hashes)| {
                let root: [u8; 32] = root.try_into().ok()?;
                let layer: Vec<[u8; 32]> = hashes.chunks_exact(32).map(|c| c.try_into().unwrap()).collect();
                Some((root, layer))
            })
            .collect();

        let announces = build_announce_tiers(&raw)?;
        let webseeds = match raw.url_list {
            Some(UrlListRaw::One(s)) => vec![parse_url(&s)?],
            Some(UrlListRaw::Many(v)) => v.iter().map(|s| parse_url(s)).collect::<Result<_, _>>()?,
            None => Vec::new(),
        };

        Ok(TorrentModel {
            name: info.name.clone(),
            piece_length: info.piece_length,
            files,
            piece_hashes: PieceHashes { v1: v1_hashes, v2_layers },
            version,
            meta_version: info.meta_version,
            info_hash_v1,
            info_hash_v2,
            announces,
            nodes: raw.nodes.unwrap_or_default(),
            is_private: info.private == Some(1),
            webseeds,
            comment: raw.comment,
            created_by: raw.created_by,
            creation_date: raw.creation_date,
        })
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.length as u64).sum()
    }

    pub fn num_pieces(&self) -> u32 {
        match self.version {
            Version::V1 | Version::Hybrid => self.piece_hashes.v1.len() as u32,
            Version::V2 => {
                let total = self.total_len();
                ((total + self.piece_length as u64 - 1) / self.piece_length as u64) as u32
            }
        }
    }

    // `truncated_info_hash`: first 20 bytes of the v2 hash, used on the wire
    // and with trackers when only a v2 hash is available.
    pub fn truncated_info_hash(&self) -> Option<[u8; 20]> {
        self.info_hash_v2.map(|h| {
            let mut out = [0u8; 20];
            out.copy_from_slice(&h[..20]);
            out
        })
    }

    // The 20-byte identity used for wire handshakes and tracker announces:
    // prefer v1, fall back to the truncated v2 hash.
    pub fn wire_info_hash(&self) -> [u8; 20] {
        self.info_hash_v1.or_else(|| self.truncated_info_hash()).expect("at least one info hash present")
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.wire_info_hash())
    }

    pub fn trackers(&self) -> Vec<Vec<Url>> {
        if self.announces.is_empty() {
            return Vec::new();
        }
        let mut tiers = self.announces.clone();
        for tier in tiers.iter_mut() {
            tier.shuffle(&mut rand::thread_rng());
        }
        tiers
    }
}

fn parse_url(s: &str) -> Result<Url, MetaInfoError> {
    Url::parse(s).map_err(|e| MetaInfoError::InvalidAnnounceUrl(e.to_string()))
}

fn build_announce_tiers(raw: &MetaInfoRaw) -> Result<Vec<Vec<Url>>, MetaInfoError> {
    if let Some(list) = &raw.announce_list {
        let mut tiers = Vec::with_capacity(list.len());
        for tier in list {
            let mut urls = Vec::with_capacity(tier.len());
            for u in tier {
                urls.push(parse_url(u)?);
            }
            tiers.push(urls);
        }
        Ok(tiers)
    } else if let Some(announce) = &raw.announce {
        Ok(vec![vec![parse_url(announce)?]])
    } else {
        Ok(Vec::new())
    }
}

fn v1_files(info: &InfoRaw) -> Result<Vec<FileInfo>, MetaInfoError> {
    if let Some(files) = &info.files {
        let mut offset = 0usize;
        Ok(files.iter().map(|f| {
            let file = FileInfo {
                path: f.path.join("/").into(),
                length: f.length as usize,
                offset,
                md5sum: f.md5sum.clone(),
                pieces_root: None,
            };
            offset += f.length as usize;
            file
        }).collect())
    } else {
        let length = info.length.ok_or(MetaInfoError::NoFiles)?;
        Ok(vec![FileInfo {
            path: info.name.clone().into(),
            length: length as usize,
            offset: 0,
            md5sum: None,
            pieces_root: None,
        }])
    }
}

// Depth-first walk of the v2 `file tree`. A leaf is a dict with a single
// empty-string key whose value holds `length` and optional `pieces root`.
fn v2_files(info: &InfoRaw) -> Result<Vec<FileInfo>, MetaInfoError> {
    let tree = info.file_tree.as_ref().ok_or(MetaInfoError::NoFiles)?;
    let mut files = Vec::new();
    let mut offset = 0usize;
    walk_file_tree(tree, &mut Vec::new(), &mut files, &mut offset)?;
    Ok(files)
}

fn walk_file_tree(
    node: &BValue,
    path: &mut Vec<String>,
    out: &mut Vec<FileInfo>,
    offset: &mut usize,
) -> Result<(), MetaInfoError> {
    let dict = node.as_dict().ok_or_else(|| MetaInfoError::MalformedFileTree("expected dict".into()))?;

    if let Some(leaf) = dict.get(b"".as_slice()) {
        let leaf_dict = leaf.as_dict().ok_or_else(|| MetaInfoError::MalformedFileTree("leaf not a dict".into()))?;
        let length = leaf_dict.get(b"length".as_slice())
            .and_then(BValue::as_int)
            .ok_or_else(|| MetaInfoError::MalformedFileTree("leaf missing length".into()))? as usize;
        let pieces_root = leaf_dict.get(b"pieces root".as_slice())
            .and_then(BValue::as_bytes)
            .and_then(|b| <[u8; 32]>::try_from(b).ok());

        if path.is_empty() {
            return Err(MetaInfoError::FileEmptyPath);
        }

        out.push(FileInfo {
            path: path.join("/").into(),
            length,
            offset: *offset,
            md5sum: None,
            pieces_root,
        });
        *offset += length;
        return Ok(());
    }

    // Iterate children in a stable (lexicographic) order: BTreeMap already
    // guarantees this.
    for (name, child) in dict {
        let name = String::from_utf8(name.clone())
            .map_err(|_| MetaInfoError::MalformedFileTree("non-utf8 path segment".into()))?;
        path.push(name);
        walk_file_tree(child, path, out, offset)?;
        path.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::Digest as _;

    fn bencode_info(extra: &str) -> Vec<u8> {
        format!(
            "d8:announce16:http://tracker/a{}4:infod6:lengthi10e4:name4:test12:piece lengthi10e6:pieces20:{}ee",
            extra,
            "\0".repeat(20),
        ).into_bytes()
    }

    #[test]
    fn parses_minimal_v1_torrent_and_hashes_raw_info() {
        let bytes = bencode_info("");
        let model = TorrentModel::from_bytes(&bytes).unwrap();
        assert_eq!(model.version, Version::V1);
        assert_eq!(model.name, "test");
        assert_eq!(model.total_len(), 10);
        assert_eq!(model.num_pieces(), 1);

        let raw_info = raw_scan::info_substring(&bytes, "info").unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(raw_info);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(model.info_hash_v1, Some(expected));
    }

    #[test]
    fn rejects_missing_name() {
        let bytes = b"d8:announce16:http://tracker/a4:infod6:lengthi10e12:piece lengthi10e6:pieces20:00000000000000000000ee".to_vec();
        assert!(TorrentModel::from_bytes(&bytes).is_err());
    }

    #[test]
    fn private_flag_is_read() {
        let bytes = format!(
            "d8:announce16:http://tracker/a4:infod6:lengthi10e4:name4:test7:privatei1e12:piece lengthi10e6:pieces20:{}ee",
            "\0".repeat(20),
        ).into_bytes();
        let model = TorrentModel::from_bytes(&bytes).unwrap();
        assert!(model.is_private);
    }
}
