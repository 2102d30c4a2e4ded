// BEP 10 extension protocol: the extended handshake dict and the two first-class
// extensions the engine understands, ut_metadata (BEP 9) and ut_pex (BEP 11). Payloads
// are bencoded dicts, so this module only knows shapes; dispatch by `m` id lives in
// `session.rs`.

use std::net::{IpAddr, SocketAddr};

use serde_derive::{Deserialize, Serialize};

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtendedHandshake {
    pub m: std::collections::BTreeMap<String, u8>,

    #[serde(default)]
    pub reqq: Option<u32>,

    #[serde(default)]
    pub v: Option<String>,

    #[serde(default, rename = "yourip", with = "serde_bytes")]
    pub yourip: Option<Vec<u8>>,

    #[serde(default, rename = "metadata_size")]
    pub metadata_size: Option<u32>,
}

impl ExtendedHandshake {
    pub fn new(client_version: &str, extensions: &[(&str, u8)]) -> Self {
        Self {
            m: extensions.iter().map(|(name, id)| (name.to_string(), *id)).collect(),
            reqq: Some(250),
            v: Some(client_version.to_string()),
            yourip: None,
            metadata_size: None,
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        let bytes = self.yourip.as_ref()?;
        match bytes.len() {
            4 => {
                let b: [u8; 4] = bytes.as_slice().try_into().ok()?;
                Some(IpAddr::from(b))
            }
            16 => {
                let b: [u8; 16] = bytes.as_slice().try_into().ok()?;
                Some(IpAddr::from(b))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtMetadataMsgType {
    Request,
    Data,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtMetadataMessage {
    pub msg_type: u8,
    pub piece: u32,

    #[serde(default, rename = "total_size")]
    pub total_size: Option<u32>,
}

impl UtMetadataMessage {
    pub fn msg_type(&self) -> Option<UtMetadataMsgType> {
        match self.msg_type {
            0 => Some(UtMetadataMsgType::Request),
            1 => Some(UtMetadataMsgType::Data),
            2 => Some(UtMetadataMsgType::Reject),
            _ => None,
        }
    }
}

// ut_pex compact peer list, added/dropped since the previous PEX message.
#[derive(Debug, Clone, Default)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub added_f: Vec<u8>,
    pub dropped: Vec<SocketAddr>,
}

pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    out
}

pub fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peer_roundtrip() {
        let peers = vec![
            "127.0.0.1:6881".parse().unwrap(),
            "10.0.0.5:51413".parse().unwrap(),
        ];
        let encoded = encode_compact_peers(&peers);
        assert_eq!(encoded.len(), 12);
        assert_eq!(decode_compact_peers(&encoded), peers);
    }

    #[test]
    fn handshake_reports_supported_extensions() {
        let hs = ExtendedHandshake::new("bittorrent/0.1", &[(UT_METADATA, 1), (UT_PEX, 2)]);
        assert_eq!(hs.m.get(UT_METADATA), Some(&1));
        assert_eq!(hs.m.get(UT_PEX), Some(&2));
    }
}
