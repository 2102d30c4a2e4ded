// Top level per-torrent orchestrator: owns peer sessions, trackers, and the
// piece store, and drives the torrent through its lifecycle. Replaces the
// older single-file `Torrent` with a peer table keyed on `PeerId` (ip, port,
// transport) rather than bare `SocketAddr`, and routes piece I/O through
// `piece_store` instead of holding file handles directly.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::{
    block::{block_len, num_blocks, BlockData},
    config::{ClientConfig, TorrentConfig},
    file_manager::ValidateMode,
    metainfo::TorrentModel,
    p2p::{state::{ConnState, SessionState}, PeerCommand, PeerHandle, PeerId, PeerSource, Transport},
    picker::{Picker, StreamingSelector},
    piece_store::{self, PieceStoreError, PieceStoreTx},
    state_file::{StateFile, StateFileError},
    store::StoreInfo,
    stats::{PeerStats, ThroughputStats, TorrentStats},
    super_seed::SuperSeeder,
    tracker::{AnnounceParams, Event, TrackerError, TrackersHandle},
    web_seed::WebSeeder,
};

// Resume data is rewritten at most this often, regardless of how many pieces
// complete in between; the final save on shutdown always happens regardless.
const RESUME_SAVE_INTERVAL: Duration = Duration::from_secs(30);

// How often an incomplete torrent with web seeds configured tries to pull a
// piece no connected peer has offered over HTTP instead.
const WEBSEED_RETRY_INTERVAL: Duration = Duration::from_secs(20);

// Identity used for pieces written by a web seed rather than a peer; only
// meaningful to `piece_store`'s per-source bad-piece strike counter.
fn webseed_peer_id() -> PeerId {
    PeerId::new(SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0), Transport::Tcp)
}

// Lifecycle and progress notifications for embedders. One instance is
// broadcast to every channel returned by `TorrentTask::subscribe`.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started,
    Completed,
    Stopped,
    Paused,
    Resumed,
    PieceCompleted(usize),
    FileCompleted(usize),
    Progress { downloaded: u64, uploaded: u64, rate_down: u64, rate_up: u64 },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MetadataProgress { have: usize, total: usize },
    MetadataReady,
}

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("piece store error: {0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resume state error: {0}")]
    StateFile(#[from] StateFileError),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TaskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TaskError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Initializing,
    CheckingFiles,
    Downloading,
    Seeding,
    SuperSeeding,
    Paused,
    Stopping,
    Stopped,
}

// Commands sent to the torrent task from peer sessions, the piece store and trackers.
#[derive(Debug)]
pub enum CommandToTorrent {

    // An outbound dial finished starting its session and should be tracked.
    PeerDialled { handle: PeerHandle },

    // A peer session's state changed (choke, interest, throughput, ...).
    PeerState { id: PeerId, state: SessionState },

    // Piece store finished verifying a piece we wrote.
    PieceWritten { idx: usize, valid: bool },

    // A peer has failed verification often enough to warrant disconnection.
    BadPeer { id: PeerId, reason: String },

    // New peer addresses became known, from a tracker, DHT, PEX, or LSD.
    PeersDiscovered { peers: Vec<SocketAddr>, source: PeerSource },

    // A peer reported having these pieces (bitfield, have-all, or have);
    // only sent while super-seeding, to feed `SuperSeeder`'s distribution
    // tracking without the chatter on an ordinary download.
    PeerPieces { id: PeerId, indices: Vec<usize> },

    Pause,

    Resume,

    Shutdown,
}

// Read-only-ish state shared with every peer session via Arc.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: [u8; 20],

    // Present only for v2/hybrid torrents; gates BEP 52 negotiation.
    pub info_hash_v2: Option<[u8; 32]>,

    pub client_id: [u8; 20],

    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub piece_store_tx: PieceStoreTx,

    pub info: StoreInfo,

    // Present only when `TorrentConfig.streaming.enabled`; swaps rarest-first
    // selection for sequential/adaptive playback order in `make_requests`.
    pub streaming: Option<Mutex<StreamingSelector>>,

    // Set once download completes if `TorrentConfig.super_seeding` opted in;
    // gates whether peer sessions report piece observations back for
    // `SuperSeeder`'s distribution tracking.
    pub super_seeding: AtomicBool,
}

pub struct TorrentTask {

    ctx: Arc<TorrentContext>,

    // Active peer sessions, keyed by (addr, transport) so a client reachable
    // over both TCP and uTP is never conflated into one entry.
    peers: HashMap<PeerId, PeerHandle>,

    // Addresses known but not yet connected to.
    available: HashSet<SocketAddr>,

    // Outbound dials currently in flight, excluded from `available` re-dials.
    dialing: HashSet<SocketAddr>,

    trackers: TrackersHandle,

    torrent_rx: TorrentRx,
    torrent_tx: TorrentTx,

    piece_store_handle: Option<tokio::task::JoinHandle<piece_store::Result<()>>>,

    dial_semaphore: Arc<Semaphore>,

    listen_address: SocketAddr,
    min_max_peers: (u32, u32),
    is_private: bool,

    resume_path: std::path::PathBuf,
    last_resume_save: Option<Instant>,

    state: TorrentState,
    start_time: Option<Instant>,

    super_seeding_enabled: bool,
    super_seeder: Option<SuperSeeder>,

    web_seeder: Option<WebSeeder>,
    last_webseed_attempt: Option<Instant>,

    // Pieces still missing per file, seeded from the metainfo layout; hits
    // zero exactly when every piece touching that file has been written.
    file_remaining: Vec<usize>,

    listeners: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

impl TorrentTask {

    pub async fn new(
        metainfo: &TorrentModel,
        client_config: Arc<ClientConfig>,
        torrent_config: TorrentConfig,
    ) -> Result<Self> {

        let info = StoreInfo::new(metainfo, torrent_config.output_dir.clone());
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        // Resume state is loaded before the piece store spawns so its
        // per-file priorities can seed `FileManager` at construction, rather
        // than being applied as a second pass of `SetPriority` commands.
        let resume_path = StateFile::path(&torrent_config.output_dir, &metainfo.info_hash_hex());
        let resume = if resume_path.exists() {
            match StateFile::load(&resume_path, info.num_pieces as usize) {
                Ok(resume) => Some(resume),
                Err(e) => {
                    tracing::warn!("failed to load resume state, starting fresh: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let initial_priorities: HashMap<usize, crate::file_manager::FilePriority> = resume
            .as_ref()
            .map(|r| r.file_priorities.iter().map(|(&idx, &p)| (idx as usize, p)).collect())
            .unwrap_or_default();

        let (piece_store_handle, piece_store_tx) = piece_store::spawn(
            info.clone(),
            metainfo.piece_hashes.clone(),
            torrent_config.disk.read_cache_pieces,
            initial_priorities,
            torrent_tx.clone(),
        ).await?;

        let streaming = torrent_config.streaming.enabled
            .then(|| Mutex::new(StreamingSelector::new(torrent_config.streaming.clone(), info.num_pieces as usize)));

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.wire_info_hash(),
            info_hash_v2: metainfo.info_hash_v2,
            client_id: client_config.client_id,
            picker: Picker::new(info.num_pieces, info.piece_len, info.last_piece_len),
            torrent_tx: torrent_tx.clone(),
            piece_store_tx,
            info,
            streaming,
            super_seeding: AtomicBool::new(false),
        });

        // BEP 27: private torrents never learn peers outside the tracker's say-so.
        let trackers = if metainfo.is_private {
            TrackersHandle::new(metainfo.announces.iter().map(|tier| {
                tier.iter().filter(|u| u.scheme() != "dht").cloned().collect()
            }).collect())
        } else {
            TrackersHandle::new(metainfo.announces.clone())
        };

        match resume {
            Some(resume) => {
                tracing::info!("resuming from {} ({} bytes downloaded)", resume_path.display(), resume.downloaded);
                ctx.picker.piece_picker.write().await.set_own_bitfield(resume.bitfield);
            }
            None => {
                // No resume file: the output files may already hold data from
                // a prior run that never wrote one (e.g. an imported
                // download), so a quick size check is worth the cost before
                // assuming an empty torrent.
                let (respond_to, response) = tokio::sync::oneshot::channel();
                ctx.piece_store_tx.send(piece_store::CommandToPieceStore::Validate {
                    mode: ValidateMode::Quick,
                    respond_to,
                })?;
                if let Ok(bitfield) = response.await {
                    if bitfield.count_set() > 0 {
                        tracing::info!("quick validate found {}/{} pieces already on disk", bitfield.count_set(), bitfield.len());
                        ctx.picker.piece_picker.write().await.set_own_bitfield(bitfield);
                    }
                }
            }
        }

        let file_remaining = Self::file_remaining_counts(&ctx.info);

        let web_seeder = (!torrent_config.webseed_urls.is_empty())
            .then(|| WebSeeder::new(torrent_config.webseed_urls.clone()));

        Ok(Self {
            ctx,
            peers: HashMap::new(),
            available: HashSet::new(),
            dialing: HashSet::new(),
            trackers,
            torrent_rx,
            torrent_tx,
            piece_store_handle: Some(piece_store_handle),
            dial_semaphore: Arc::new(Semaphore::new(client_config.max_dial_concurrency)),
            listen_address: torrent_config.listen_address,
            min_max_peers: torrent_config.min_max_peers,
            is_private: metainfo.is_private,
            resume_path,
            last_resume_save: None,
            state: TorrentState::Initializing,
            start_time: None,
            super_seeding_enabled: torrent_config.super_seeding,
            super_seeder: None,
            web_seeder,
            last_webseed_attempt: None,
            file_remaining,
            listeners: Vec::new(),
        })
    }

    // One entry per file, counting how many pieces still touch it. A piece
    // spanning several files (the common case only at file boundaries)
    // counts toward each.
    fn file_remaining_counts(info: &StoreInfo) -> Vec<usize> {
        let mut counts = vec![0usize; info.files.len()];
        for idx in 0..info.num_pieces as usize {
            let range = info.piece_file_intersections(idx);
            for file_idx in range {
                counts[file_idx] += 1;
            }
        }
        counts
    }

    // Registers a new listener for lifecycle/progress events; the returned
    // receiver gets every event emitted from this point on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: TaskEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // Builds a point-in-time snapshot for embedders that poll instead of
    // subscribing to events.
    pub async fn stats(&self) -> TorrentStats {
        let piece_picker = self.ctx.picker.piece_picker.read().await;
        let num_downloaded = piece_picker.own_bitfield().count_set();
        drop(piece_picker);

        let mut throughput = ThroughputStats::default();
        let peer_stats: Vec<PeerStats> = self.peers.values().map(|peer| {
            throughput += &peer.state.throughput;
            PeerStats { id: peer.id, state: peer.state.clone() }
        }).collect();

        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            state: self.state,
            piece_stats: crate::stats::PieceStats {
                num_pieces: self.ctx.info.num_pieces as usize,
                num_pending: self.ctx.picker.partial_pieces.read().await.len(),
                num_downloaded,
            },
            peer_stats,
            throughput,
        }
    }

    // Snapshots the current bitfield to disk, debounced to `RESUME_SAVE_INTERVAL`
    // unless `force` bypasses it (used on shutdown).
    async fn save_resume_state(&mut self, force: bool) -> Result<()> {
        let due = self.last_resume_save
            .map(|t| t.elapsed() >= RESUME_SAVE_INTERVAL)
            .unwrap_or(true);
        if !force && !due {
            return Ok(());
        }

        let bitfield = self.ctx.picker.piece_picker.read().await.own_bitfield().clone();
        let state = StateFile::new(self.ctx.info_hash.to_vec(), bitfield);
        state.save(&self.resume_path)?;
        self.last_resume_save = Some(Instant::now());
        Ok(())
    }

    pub fn context(&self) -> Arc<TorrentContext> {
        Arc::clone(&self.ctx)
    }

    #[tracing::instrument(skip_all, name = "task")]
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent {}", hex::encode(self.ctx.info_hash));
        self.start_time = Some(Instant::now());
        self.state = TorrentState::Downloading;

        self.trackers.start(self.torrent_tx.clone()).await;
        self.announce(Some(Event::Started)).await;
        self.emit(TaskEvent::Started);

        self.run().await
    }

    // Manual announce, bypassing the tracker task's own interval logic; used
    // for the initial started event and the final stopped event.
    async fn announce(&self, event: Option<Event>) {
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.listen_address.port(),
            uploaded: 0,
            downloaded: 0,
            left: self.ctx.info.total_len,
            event,
            num_want: Some(self.min_max_peers.1 as usize),
        };
        self.trackers.tracker_tx.send(Some(params)).ok();
    }

    fn dial_budget(&self) -> usize {
        (self.min_max_peers.1 as usize).saturating_sub(self.peers.len() + self.dialing.len())
    }

    fn connect_to_peers(&mut self) {
        let count = self.available.len().min(self.dial_budget());
        if count == 0 {
            return;
        }

        tracing::info!("dialling {} peers", count);
        let addresses: Vec<SocketAddr> = self.available.iter().take(count).copied().collect();
        for address in addresses {
            self.available.remove(&address);
            self.dialing.insert(address);

            let permit = Arc::clone(&self.dial_semaphore);
            let ctx = Arc::clone(&self.ctx);
            let id = PeerId::new(address, Transport::Tcp);
            let torrent_tx = self.torrent_tx.clone();

            tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let handle = PeerHandle::start_session(id, ctx, None);
                // Dial completion (success or failure) surfaces via PeerState events;
                // this only needs to register the handle with the task.
                torrent_tx.send(CommandToTorrent::PeerDialled { handle }).ok();
            });
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {

        let listener = tokio::net::TcpListener::bind(&self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        self.connect_to_peers();

        let mut webseed_ticker = tokio::time::interval(WEBSEED_RETRY_INTERVAL);
        webseed_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop { tokio::select! {

            accepted = listener.accept() => {
                let (stream, address) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("inbound connection error: {}", e);
                        continue;
                    }
                };
                let id = PeerId::new(address, Transport::Tcp);
                let handle = PeerHandle::start_session(id, Arc::clone(&self.ctx), Some(stream));
                self.peers.insert(id, handle);
            }

            Some(cmd) = self.torrent_rx.recv() => {
                if !self.handle_command(cmd).await? {
                    break;
                }
            }

            _ = webseed_ticker.tick(), if self.web_seeder.is_some() => {
                if let Err(e) = self.webseed_fallback_tick().await {
                    tracing::warn!("web seed fallback tick failed: {}", e);
                }
            }
        }}

        self.shutdown().await?;
        Ok(())
    }

    // Returns false when the task should stop its run loop.
    async fn handle_command(&mut self, cmd: CommandToTorrent) -> Result<bool> {
        match cmd {

            CommandToTorrent::PeerDialled { handle } => {
                self.dialing.remove(&handle.id.addr);
                self.peers.insert(handle.id, handle);
            }

            CommandToTorrent::PeerState { id, state } => {
                let transition = self.peers.get_mut(&id).map(|peer| {
                    let was_connected = peer.state.conn_state == ConnState::Connected;
                    let now_connected = state.conn_state == ConnState::Connected;
                    let now_disconnected = state.conn_state == ConnState::Disconnected;
                    peer.state = state;
                    (was_connected, now_connected, now_disconnected)
                });

                if let Some((was_connected, now_connected, now_disconnected)) = transition {
                    if !was_connected && now_connected {
                        self.emit(TaskEvent::PeerConnected(id));
                        let offer = self.super_seeder.as_mut().and_then(|seeder| seeder.on_peer_connected(id));
                        if let Some(idx) = offer {
                            if let Some(peer) = self.peers.get(&id) {
                                peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
                            }
                        }
                    } else if now_disconnected {
                        self.emit(TaskEvent::PeerDisconnected(id));
                        if let Some(seeder) = self.super_seeder.as_mut() {
                            seeder.on_peer_disconnected(id);
                        }
                    }
                }
            }

            CommandToTorrent::PeerPieces { id, indices } => {
                let advances: Vec<(PeerId, usize)> = match self.super_seeder.as_mut() {
                    Some(seeder) => indices.into_iter().filter_map(|idx| seeder.observe_have(id, idx)).collect(),
                    None => Vec::new(),
                };
                for (advanced_peer, next_idx) in advances {
                    if let Some(handle) = self.peers.get(&advanced_peer) {
                        handle.peer_tx.send(PeerCommand::PieceWritten(next_idx)).ok();
                    }
                }
            }

            CommandToTorrent::PieceWritten { idx, valid } => {
                self.handle_piece_write(idx, valid).await?;
            }

            CommandToTorrent::BadPeer { id, reason } => {
                tracing::warn!("disconnecting bad peer {}: {}", id, reason);
                if let Some(peer) = self.peers.remove(&id) {
                    peer.peer_tx.send(PeerCommand::Shutdown).ok();
                }
            }

            CommandToTorrent::PeersDiscovered { peers, source } => {
                if self.is_private && !matches!(source, PeerSource::Tracker | PeerSource::Manual) {
                    tracing::debug!("ignoring {:?} peers on private torrent", source);
                    return Ok(true);
                }
                for addr in peers {
                    let id = PeerId::new(addr, Transport::Tcp);
                    if !self.peers.contains_key(&id) && !self.dialing.contains(&addr) {
                        self.available.insert(addr);
                    }
                }
                self.connect_to_peers();
            }

            CommandToTorrent::Pause => {
                self.state = TorrentState::Paused;
                for peer in self.peers.values() {
                    peer.peer_tx.send(PeerCommand::Choke(true)).ok();
                }
                self.emit(TaskEvent::Paused);
            }

            CommandToTorrent::Resume => {
                self.state = TorrentState::Downloading;
                for peer in self.peers.values() {
                    peer.peer_tx.send(PeerCommand::Choke(false)).ok();
                }
                self.emit(TaskEvent::Resumed);
            }

            CommandToTorrent::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state = TorrentState::Stopping;
        tracing::info!("disconnecting from {} peers", self.peers.len());

        if let Err(e) = self.save_resume_state(true).await {
            tracing::warn!("failed to save resume state on shutdown: {}", e);
        }

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, peer) in self.peers.drain() {
            if let Err(e) = peer.session_handle.await {
                tracing::warn!("peer session join error: {}", e);
            }
        }

        self.ctx.piece_store_tx.send(piece_store::CommandToPieceStore::Shutdown).ok();
        if let Some(handle) = self.piece_store_handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("piece store join error: {}", e);
            }
        }

        self.trackers.shutdown().await;
        self.announce(Some(Event::Stopped)).await;

        self.state = TorrentState::Stopped;
        self.emit(TaskEvent::Stopped);
        Ok(())
    }

    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> Result<()> {

        if valid {
            self.ctx.picker.partial_pieces.write().await.remove(&idx);
            self.ctx.picker.piece_picker.write().await.received_piece(idx);

            let num_missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
            tracing::info!("piece {} complete, {} pieces remain", idx, num_missing);

            for peer in self.peers.values() {
                peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
            }

            self.emit(TaskEvent::PieceCompleted(idx));

            for file_idx in self.ctx.info.piece_file_intersections(idx) {
                if let Some(remaining) = self.file_remaining.get_mut(file_idx) {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        self.emit(TaskEvent::FileCompleted(file_idx));
                    }
                }
            }

            let throughput = self.stats().await.throughput;
            self.emit(TaskEvent::Progress {
                downloaded: throughput.down.total(),
                uploaded: throughput.up.total(),
                rate_down: throughput.down.avg(),
                rate_up: throughput.up.avg(),
            });

            if let Err(e) = self.save_resume_state(false).await {
                tracing::warn!("failed to save resume state: {}", e);
            }

            if num_missing == 0 {
                tracing::info!("torrent download complete");
                self.announce(Some(Event::Completed)).await;
                self.emit(TaskEvent::Completed);

                if self.super_seeding_enabled {
                    tracing::info!("entering super-seed mode");
                    self.state = TorrentState::SuperSeeding;
                    self.super_seeder = Some(SuperSeeder::new(self.ctx.info.num_pieces as usize));
                    self.ctx.super_seeding.store(true, Ordering::Relaxed);
                } else {
                    self.state = TorrentState::Seeding;
                }
            }
        } else if let Some(piece) = self.ctx.picker.partial_pieces.read().await.get(&idx) {
            piece.write().await.free_all_blocks();
        }

        Ok(())
    }

    // Periodic fallback for torrents configured with web seed mirrors: picks a
    // missing piece no connected peer is currently supplying and pulls it over
    // HTTP instead, feeding the result through the same per-block write path
    // peer sessions use.
    async fn webseed_fallback_tick(&mut self) -> Result<()> {
        let Some(web_seeder) = self.web_seeder.as_mut() else { return Ok(()) };

        let due = self.last_webseed_attempt
            .map(|t| t.elapsed() >= WEBSEED_RETRY_INTERVAL)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        self.last_webseed_attempt = Some(Instant::now());

        let in_flight: HashSet<usize> = self.ctx.picker.partial_pieces.read().await.keys().copied().collect();
        let own_bitfield = self.ctx.picker.piece_picker.read().await.own_bitfield().clone();

        let Some(idx) = (0..self.ctx.info.num_pieces as usize)
            .find(|idx| !own_bitfield.get(*idx) && !in_flight.contains(idx))
        else {
            return Ok(());
        };

        let piece_len = if idx as u32 == self.ctx.info.num_pieces - 1 {
            self.ctx.info.last_piece_len
        } else {
            self.ctx.info.piece_len
        };
        let offset = idx as u64 * self.ctx.info.piece_len as u64;

        tracing::debug!("web seed fallback: fetching piece {}", idx);
        let data = match web_seeder.fetch_range(offset, piece_len).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("web seed fetch for piece {} failed: {}", idx, e);
                return Ok(());
            }
        };

        let peer_id = webseed_peer_id();
        for block_idx in 0..num_blocks(piece_len) as usize {
            let block_offset = block_idx * crate::BLOCK_SIZE;
            let len = block_len(piece_len, block_idx);
            let block = BlockData {
                piece_idx: idx,
                offset: block_offset,
                data: data[block_offset..block_offset + len].to_vec(),
            };
            self.ctx.piece_store_tx.send(piece_store::CommandToPieceStore::WriteBlock {
                peer_id,
                block,
            })?;
        }

        Ok(())
    }
}
