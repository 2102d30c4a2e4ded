use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::error::{EngineError, Result};

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

// Settings shared across every torrent run by the same client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: [u8; 20],

    // Whether the Fast Extension (BEP 6) is offered on handshake.
    pub fast_enabled: bool,

    // Whether the Extension Protocol (BEP 10) is offered on handshake.
    pub extended_enabled: bool,

    // Max concurrent outbound dials across the whole task.
    pub max_dial_concurrency: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            fast_enabled: true,
            extended_enabled: true,
            max_dial_concurrency: 20,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_dial_concurrency == 0 {
            return Err(EngineError::Config("max_dial_concurrency must be > 0".into()));
        }
        Ok(())
    }
}

// Per-task configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub announce_interval: Duration,

    pub min_max_peers: (u32, u32),

    pub disk: DiskConfig,

    pub streaming: StreamingConfig,

    // BEP 16: advertise pieces one at a time once complete, instead of the
    // full bitfield, so the swarm self-distributes rather than the seed
    // doing all the upload work. Only takes effect once download completes.
    pub super_seeding: bool,

    // BEP 19 web seed mirrors, tried when no connected peer offers a piece.
    pub webseed_urls: Vec<url::Url>,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            disk: DiskConfig::default(),
            streaming: StreamingConfig::minimal(),
            super_seeding: false,
            webseed_urls: Vec::new(),
        }
    }
}

impl TorrentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_max_peers.0 > self.min_max_peers.1 {
            return Err(EngineError::Config("min_peers must be <= max_peers".into()));
        }
        self.disk.validate()?;
        self.streaming.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    // Number of whole pieces kept in the read cache (served to peers requesting
    // blocks we already have on disk).
    pub read_cache_pieces: usize,

    // Pieces at or above this size have their hash verification dispatched to the
    // blocking thread pool instead of running inline on the disk task.
    pub hash_offload_threshold: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            read_cache_pieces: 32,
            hash_offload_threshold: 256 * 1024,
        }
    }
}

impl DiskConfig {
    fn validate(&self) -> Result<()> {
        if self.read_cache_pieces == 0 {
            return Err(EngineError::Config("read_cache_pieces must be > 0".into()));
        }
        Ok(())
    }
}

// Configuration for the piece selector's sequential/streaming behaviour.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    // Whether `StreamingSelector` replaces rarest-first as the active piece
    // selection policy for this torrent.
    pub enabled: bool,
    pub look_ahead_pieces: usize,
    pub critical_zone_bytes: u64,
    pub adaptive_strategy: bool,
    pub min_speed_for_sequential: u64,
    pub auto_detect_moov_atom: bool,
    pub seek_tolerance_s: u32,
    pub enable_peer_priority: bool,
    pub enable_fast_resume: bool,
}

impl StreamingConfig {
    pub fn minimal() -> Self {
        Self {
            enabled: false,
            look_ahead_pieces: 0,
            critical_zone_bytes: 0,
            adaptive_strategy: false,
            min_speed_for_sequential: 0,
            auto_detect_moov_atom: false,
            seek_tolerance_s: 0,
            enable_peer_priority: false,
            enable_fast_resume: false,
        }
    }

    pub fn video_streaming() -> Self {
        Self {
            enabled: true,
            look_ahead_pieces: 20,
            critical_zone_bytes: 8 * 1024 * 1024,
            adaptive_strategy: true,
            min_speed_for_sequential: 500 * 1024,
            auto_detect_moov_atom: true,
            seek_tolerance_s: 5,
            enable_peer_priority: true,
            enable_fast_resume: true,
        }
    }

    pub fn audio_streaming() -> Self {
        Self {
            enabled: true,
            look_ahead_pieces: 8,
            critical_zone_bytes: 0,
            adaptive_strategy: true,
            min_speed_for_sequential: 128 * 1024,
            auto_detect_moov_atom: false,
            seek_tolerance_s: 3,
            enable_peer_priority: true,
            enable_fast_resume: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.seek_tolerance_s > 600 {
            return Err(EngineError::Config("seek_tolerance_s unreasonably large".into()));
        }
        Ok(())
    }

    pub fn dwell_between_switches(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_peer_bounds() {
        let mut cfg = TorrentConfig::default();
        cfg.min_max_peers = (50, 5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TorrentConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }
}
