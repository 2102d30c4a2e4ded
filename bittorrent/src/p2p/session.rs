use std::{collections::HashSet, sync::Arc, time::Instant};
use tokio::{sync::mpsc, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};

use crate::{
    block::{BlockData, BlockInfo},
    bitfield::Bitfield,
    task::{CommandToTorrent, TorrentContext},
    piece_store::CommandToPieceStore,
};
use super::{
    congestion::{Congestion, InFlightRequest},
    fast,
    handshake::{Handshake, HandshakeCodec, PROTOCOL},
    message::{Message, MessageCodec},
    state::{ConnState, SessionState},
    PeerCommand, PeerError, PeerId, PeerRx, PeerTx, Result,
};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

const KEEP_ALIVE_INTERVAL: time::Duration = time::Duration::from_secs(90);
const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(150);
const TARGET_QUEUE_LEN: usize = 20;

pub struct PeerSession {

    id: PeerId,

    torrent_ctx: Arc<TorrentContext>,

    peer_rx: PeerRx,

    peer_tx: PeerTx,

    // Pending block requests from peer to the client.
    requests_in: HashSet<BlockInfo>,

    // Pending block requests from client to peer, with send timestamps for
    // congestion timeout detection.
    requests_out: std::collections::HashMap<BlockInfo, InFlightRequest>,

    bitfield: Bitfield,

    state: SessionState,

    congestion: Congestion,

    connect_time: Option<Instant>,

    last_activity: Option<Instant>,
}

impl PeerSession {

    pub fn new(id: PeerId, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::new(torrent_ctx.info.num_pieces as usize);

        (
            PeerSession {
                id,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                state: SessionState::default(),
                congestion: Congestion::default(),
                requests_in: HashSet::new(),
                requests_out: std::collections::HashMap::new(),
                connect_time: None,
                last_activity: None,
            },
            peer_tx,
        )
    }

    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let timeout = time::Duration::from_secs(10);
            let stream = time::timeout(timeout, TcpStream::connect(self.id.addr))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        let socket = Framed::new(socket.into_inner(), MessageCodec);
        self.run(socket).await
    }

    pub async fn disconnect(&mut self) {
        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerState {
            id: self.id,
            state: self.state.clone(),
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.client_id)
            .with_fast(true)
            .with_extended(true)
            .with_v2(self.torrent_ctx.info_hash_v2.is_some());

        if !inbound {
            tracing::info!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        if let Some(Ok(handshake)) = socket.next().await {
            tracing::info!("read: handshake");

            if handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if handshake.info_hash != self.torrent_ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }

            self.state.update(|state| {
                state.fast_enabled = handshake.supports_fast();
                state.extended_enabled = handshake.supports_extended();
                state.v2_enabled = handshake.supports_v2() && self.torrent_ctx.info_hash_v2.is_some();
            });

            if self.state.fast_enabled {
                let set = fast::allowed_fast_set(self.id.addr.ip(), &self.torrent_ctx.info_hash, self.torrent_ctx.info.num_pieces);
                self.state.our_allowed_fast = set.into_iter().collect();
            }

            if inbound {
                tracing::info!("send handshake");
                socket.send(handshake).await?;
            }

            tracing::info!("handshake successful, peer connected");
            Ok(())

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let now = Instant::now();
        self.connect_time = Some(now);
        self.last_activity = Some(now);
        self.state.update(|state| state.conn_state = ConnState::Introducing);

        let (mut sink, mut stream) = socket.split();

        if self.state.fast_enabled {
            for idx in self.state.our_allowed_fast.clone() {
                sink.send(Message::AllowFast { idx: idx as u32 }).await?;
            }
        }

        let mut ticker = time::interval(time::Duration::from_secs(1));
        let mut keep_alive = time::interval(KEEP_ALIVE_INTERVAL);

        loop { tokio::select! {

            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    self.last_activity = Some(Instant::now());
                    self.handle_msg(&mut sink, msg).await?;
                },
                Some(Err(e)) => return Err(e),
                None => {
                    tracing::info!("peer closed connection");
                    break;
                },
            },

            Some(cmd) = self.peer_rx.recv() => {
                match cmd {
                    PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await?,
                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,
                    PeerCommand::Choke(choke) => {
                        self.state.choked = choke;
                        self.send_message(&mut sink, if choke { Message::Choke } else { Message::Unchoke }).await?;
                    },
                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },
                }
            }

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

            _ = keep_alive.tick() => self.send_message(&mut sink, Message::KeepAlive).await?,

        }}

        Ok(())
    }

    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("read: {}", msg);

        match msg {

            Message::Bitfield(bytes) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bytes).await?;
                } else {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    self.send_message(sink, Message::Unchoke).await?;
                    self.state.choked = false;
                }
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Port { port: _ } => {},

            Message::Cancel(block_info) => self.handle_cancel(block_info).await?,

            Message::HaveAll => {
                if !self.state.fast_enabled {
                    tracing::error!("HaveAll received without fast negotiated");
                    return Err(PeerError::UnnegotiatedFast);
                }
                self.bitfield = Bitfield::have_all(self.torrent_ctx.info.num_pieces as usize);
                let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&self.bitfield);

                if self.torrent_ctx.super_seeding.load(std::sync::atomic::Ordering::Relaxed) {
                    let indices: Vec<usize> = (0..self.torrent_ctx.info.num_pieces as usize).collect();
                    self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerPieces { id: self.id, indices }).ok();
                }

                self.update_interest(sink, interested).await?;
            },

            Message::HaveNone => {
                if !self.state.fast_enabled {
                    tracing::error!("HaveNone received without fast negotiated");
                    return Err(PeerError::UnnegotiatedFast);
                }
                self.bitfield = Bitfield::have_none(self.torrent_ctx.info.num_pieces as usize);
            },

            Message::Suggest { idx: _ } => {
                if !self.state.fast_enabled {
                    tracing::error!("Suggest received without fast negotiated");
                    return Err(PeerError::UnnegotiatedFast);
                }
            },

            Message::AllowFast { idx } => {
                if !self.state.fast_enabled {
                    tracing::error!("AllowFast received without fast negotiated");
                    return Err(PeerError::UnnegotiatedFast);
                }
                self.state.peer_allowed_fast.insert(idx as usize);
            },

            Message::Reject(block) => {
                if !self.state.fast_enabled {
                    tracing::error!("Reject received without fast negotiated");
                    return Err(PeerError::UnnegotiatedFast);
                }
                self.requests_out.remove(&block);
            },

            Message::Extended { .. } => {},

            Message::HashRequest { .. } | Message::Hashes { .. } | Message::HashReject { .. } => {},
        }

        if self.state.conn_state == ConnState::Introducing {

            if self.torrent_ctx.picker.piece_picker.read().await.own_bitfield().count_set() == 0
                && self.bitfield.count_set() == 0
            {
                tracing::warn!("no pieces in connection");
                self.peer_tx.send(PeerCommand::Shutdown)?;
                return Ok(())
            }

            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, bytes: Vec<u8>) -> Result<()> {
        let bitfield = Bitfield::from_wire_bytes(&bytes, self.torrent_ctx.info.num_pieces as usize);
        tracing::info!("peer has {}/{} pieces", bitfield.count_set(), self.torrent_ctx.info.num_pieces);

        let interested = self.torrent_ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_set());

        if self.torrent_ctx.super_seeding.load(std::sync::atomic::Ordering::Relaxed) {
            let indices: Vec<usize> = (0..bitfield.len()).filter(|&i| bitfield.get(i)).collect();
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerPieces { id: self.id, indices }).ok();
        }

        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx >= self.torrent_ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield.get(idx as usize) {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .torrent_ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        if self.torrent_ctx.super_seeding.load(std::sync::atomic::Ordering::Relaxed) {
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerPieces {
                id: self.id,
                indices: vec![idx as usize],
            }).ok();
        }

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let request = BlockInfo { piece_idx: block.piece_idx, offset: block.offset, len: block.data.len() };
        if self.requests_out.remove(&request).is_none() {
            tracing::warn!("unexpected block: {:?}", &request);
            return Ok(());
        }
        self.congestion.on_delivery();

        let is_duplicate = if let Some(partial_piece) = self
            .torrent_ctx
            .picker
            .partial_pieces
            .read()
            .await
            .get(&request.piece_idx)
        {
            partial_piece.write().await.received_block(&request)
        } else {
            tracing::warn!("received block for non-existent piece: {:?}", &request);
            return Ok(());
        };

        if !is_duplicate {
            self.state.update(|state| state.throughput.down += block.data.len() as u64);
            self.torrent_ctx.piece_store_tx
                .send(CommandToPieceStore::WriteBlock { peer_id: self.id, block })
                .map_err(|e| e.into())
        } else {
            tracing::warn!("duplicate block: {:?}", &request);
            Ok(())
        }
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        if self.state.choked && !self.state.our_allowed_fast.contains(&request.piece_idx) {
            tracing::warn!("peer requested while choked, rejecting");
            return self.send_reject(sink, request).await;
        }
        if request.len == 0 || request.len > crate::BLOCK_SIZE as usize {
            tracing::error!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        if self.requests_in.contains(&request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }

        self.requests_in.insert(request);
        self.torrent_ctx.piece_store_tx.send(CommandToPieceStore::ReadBlock {
            block: request,
            peer_tx: self.peer_tx.clone(),
        })?;

        Ok(())
    }

    // BEP 6: a choked peer still gets a Reject for a request it's entitled to
    // make an allowed-fast exception for, rather than silence.
    async fn send_reject(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {
        if self.state.fast_enabled {
            self.send_message(sink, Message::Reject(request)).await?;
        }
        Ok(())
    }

    async fn handle_cancel(&mut self, block_info: BlockInfo) -> Result<()> {
        self.requests_in.remove(&block_info);
        Ok(())
    }

    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield.get(idx) {
            sink.send(Message::Have { idx: idx as u32 }).await?;
        } else {
            let cancels: Vec<BlockInfo> = self.requests_out.keys()
                .filter(|b| b.piece_idx == idx)
                .copied()
                .collect();
            for block in cancels {
                sink.send(Message::Cancel(block)).await?;
            }
        }

        Ok(())
    }

    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking && self.state.peer_allowed_fast.is_empty() {
            tracing::debug!("attempted to make requests whilst choked and no allow-fast set");
            return Ok(())
        }
        if !self.state.interested {
            return Ok(())
        }

        let outstanding: HashSet<BlockInfo> = self.requests_out.keys().copied().collect();
        let window = self.congestion.window().saturating_sub(outstanding.len()).min(TARGET_QUEUE_LEN);
        if window == 0 {
            return Ok(());
        }

        let requests = if let Some(selector) = &self.torrent_ctx.streaming {
            self.torrent_ctx.picker
                .pick_blocks_streaming(&mut *selector.lock().await, &outstanding, window, &self.bitfield, &self.state)
                .await
        } else {
            self.torrent_ctx.picker
                .pick_blocks(&outstanding, window, &self.bitfield)
                .await
        };

        for block in requests {
            tracing::debug!("send request: {:?}", block);
            self.requests_out.insert(block, InFlightRequest { sent_at: Instant::now(), resend_count: 0 });
            sink.send(Message::Request(block)).await?;
        }

        Ok(())
    }

    async fn send_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {
        let request = BlockInfo { piece_idx: block.piece_idx, offset: block.offset, len: block.data.len() };
        if !self.requests_in.remove(&request) {
            tracing::warn!("block read but no request: {:?}", request);
            return Ok(());
        }
        let len = block.data.len() as u64;
        sink.send(Message::Block(block)).await?;
        self.state.update(|state| state.throughput.up += len);
        Ok(())
    }

    async fn free_requests_out(&mut self) {
        tracing::debug!("freeing requested blocks");
        let partial_pieces = self.torrent_ctx.picker.partial_pieces.read().await;
        for (request, _) in self.requests_out.drain() {
            if self.state.fast_enabled && self.state.peer_allowed_fast.contains(&request.piece_idx) {
                continue;
            }
            if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
            }
        }
    }

    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.interested = false;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        // Resend or give up on timed-out requests.
        let mut expired = Vec::new();
        for (req, inflight) in self.requests_out.iter() {
            if self.congestion.is_expired(inflight, now) {
                expired.push(*req);
            }
        }
        if !expired.is_empty() {
            self.congestion.on_timeout_or_reject();
        }
        for req in expired {
            let should_resend = if let Some(inflight) = self.requests_out.get_mut(&req) {
                if self.congestion.exhausted(inflight) {
                    self.requests_out.remove(&req);
                    false
                } else {
                    inflight.resend_count += 1;
                    inflight.sent_at = now;
                    true
                }
            } else {
                false
            };

            if should_resend {
                tracing::debug!("resending timed-out request: {:?}", req);
                sink.send(Message::Request(req)).await?;
            } else if let Some(partial_piece) = self.torrent_ctx.picker.partial_pieces.read().await.get(&req.piece_idx) {
                partial_piece.write().await.free_block(&req);
            }
        }

        if let Some(last) = self.last_activity {
            if now.saturating_duration_since(last) >= IDLE_TIMEOUT {
                tracing::warn!("disconnecting peer due to inactivity");
                return Err(PeerError::Timeout)
            }
        }

        if self.state.changed {
            self.torrent_ctx.torrent_tx.send(CommandToTorrent::PeerState {
                id: self.id,
                state: self.state.clone(),
            })?;
        }
        self.state.tick();

        Ok(())
    }
}
