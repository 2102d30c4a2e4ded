use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

use crate::{block::BlockData, task::TorrentContext};

pub mod congestion;
pub mod extension;
pub mod fast;
mod handshake;
mod message;
mod session;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;
use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

// How a peer was reached, carried in its identity so a client behind the
// same NAT on TCP and uTP is never mistaken for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Utp,
}

// Peer identity used for dedupe tables, bad-block counters and availability
// bookkeeping. Equality on IP alone conflates distinct peers behind the same
// NAT; (ip, port, transport) is the corrected scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub addr: SocketAddr,
    pub transport: Transport,
}

impl PeerId {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self { addr, transport }
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.addr, self.transport)
    }
}

// Where a discovered peer came from (BEP 27 gates dht/pex sources on private torrents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Lsd,
    Incoming,
    Manual,
    Holepunch,
}

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent before handshake")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("fast-only message received without fast negotiated")]
    UnnegotiatedFast,

    #[error("message length {0} exceeds maximum")]
    MessageTooLarge(u32),

    #[error("connection timeout")]
    Timeout,

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelError(e.to_string())
    }
}

// Commands that can be sent to a peer session from elsewhere in the engine.
pub enum PeerCommand {

    // A piece has been verified and written; tell the peer (HAVE) or cancel
    // requests we had outstanding for it.
    PieceWritten(usize),

    // Block read from disk, ready to send.
    BlockRead(BlockData),

    // The task wants us to (un)choke our view of interest, used when pausing.
    Choke(bool),

    Shutdown,
}

#[derive(Debug)]
pub struct PeerHandle {

    pub id: PeerId,

    // Sends commands to the peer session.
    pub peer_tx: PeerTx,

    // Handle to the peer session task.
    pub session_handle: JoinHandle<()>,

    // Tracks the state of the peer session, updated on PeerState events.
    pub state: SessionState,
}

impl PeerHandle {
    pub fn start_session(
        id: PeerId,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
    ) -> Self {
        let (mut session, peer_tx) = PeerSession::new(id, ctx);
        let session_handle = tokio::spawn(
            async move {
                if let Err(e) = session.start_session(socket).await {
                    tracing::error!("session error: {}", e);
                    crate::metrics::ERRORS.stream_error.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                session.disconnect().await;
            }
            .instrument(tracing::info_span!("peer", id = %id)),
        );

        PeerHandle {
            id,
            peer_tx,
            session_handle,
            state: SessionState::default(),
        }
    }
}
