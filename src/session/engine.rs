use super::error::SessionError;
use super::event::{Internal, SessionCommand, SessionEvent};
use super::io;
use crate::config::{SessionConfig, BLOCK_SIZE, MAX_REQUEST_LENGTH};
use crate::metainfo::{FileRecord, Metainfo};
use crate::peer::{
    Bitfield, BlockRequest, Choker, Message, PeerConnection, PeerError, PeerId, SuperSeeder,
};
use crate::picker::{FilePriority, PiecePicker};
use crate::rate::{UploadLimiter, UploadTuner};
use crate::storage::{Assembler, PieceStore, ResumeData, StorageError};
use crate::tracker::{AnnounceRequest, HttpAnnouncer, TrackerClient, TrackerEvent};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep_until, Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle to a running download session.
///
/// Cheap to clone; dropping every handle shuts the session down. Events
/// arrive on the receiver returned by [`Session::spawn`].
///
/// # Examples
///
/// ```no_run
/// use riptide::{Metainfo, Session, SessionConfig, SessionEvent};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let data = std::fs::read("example.torrent")?;
/// let metainfo = Metainfo::from_bytes(&data)?;
///
/// let (session, mut events) =
///     Session::spawn(&metainfo, "downloads", SessionConfig::default(), None).await?;
///
/// while let Some(event) = events.recv().await {
///     if matches!(event, SessionEvent::Completed) {
///         break;
///     }
/// }
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
}

impl Session {
    /// Starts a download session for one torrent.
    ///
    /// With a resume snapshot the verified set and partial-piece
    /// coverage are restored without touching the disk; without one the
    /// existing files are rechecked piece by piece.
    pub async fn spawn(
        metainfo: &Metainfo,
        base_path: impl Into<PathBuf>,
        config: SessionConfig,
        resume: Option<ResumeData>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let store = Arc::new(PieceStore::new(base_path, &metainfo.info)?);

        let mut assembler = Assembler::new();
        let ours = match &resume {
            Some(snapshot) => {
                if snapshot.piece_count != store.piece_count() {
                    return Err(StorageError::InvalidResume("piece count").into());
                }
                snapshot.restore_into(&mut assembler);
                snapshot.verified_bitfield()?
            }
            None => store.recheck().await?,
        };

        let mut picker = PiecePicker::new(
            store.piece_count(),
            metainfo.info.piece_length,
            metainfo.info.total_length,
            BLOCK_SIZE,
            config.priority_step as u64,
            config.rarest_first_cutoff,
        );
        for piece in ours.pieces() {
            picker.piece_verified(piece as u32);
        }
        let partials: Vec<(u32, Vec<(u32, u32)>)> = assembler
            .partial_pieces()
            .map(|(piece, ranges)| (piece, ranges.to_vec()))
            .collect();
        for (piece, ranges) in &partials {
            picker.restore_partial(*piece, ranges);
        }

        let limiter = UploadLimiter::new(config.upload_limit);
        let tuner = config
            .auto_tune
            .then(|| UploadTuner::new(limiter.clone(), &config));

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let listen_port = listener.local_addr()?.port();

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(1024);
        let (announce_tx, announce_rx) = mpsc::channel(8);

        let client = TrackerClient::new(HttpAnnouncer::new()?, metainfo.announce_tiers());
        tokio::spawn(io::tracker_loop(client, announce_rx, internal_tx.clone()));

        let engine = Engine::new(
            config,
            metainfo,
            store,
            ours,
            assembler,
            picker,
            limiter,
            tuner,
            listen_port,
            event_tx,
            internal_tx,
            announce_tx,
        );
        tokio::spawn(engine.run(command_rx, internal_rx, listener));

        Ok((Self { commands: command_tx }, event_rx))
    }

    pub async fn add_peer(&self, addr: SocketAddr) -> Result<(), SessionError> {
        self.send(SessionCommand::AddPeer(addr)).await
    }

    pub async fn set_file_priority(
        &self,
        file_index: usize,
        priority: FilePriority,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::SetFilePriority {
            file_index,
            priority,
        })
        .await
    }

    /// Replaces the upload cap in bytes per second. Zero is unlimited.
    pub async fn set_upload_limit(&self, bytes_per_sec: u64) -> Result<(), SessionError> {
        self.send(SessionCommand::SetUploadLimit(bytes_per_sec)).await
    }

    /// Takes a resume snapshot of the current progress.
    pub async fn resume_snapshot(&self) -> Result<ResumeData, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ResumeSnapshot(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown).await
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// All mutable state of one download, owned by a single task.
pub(super) struct Engine {
    pub(super) config: SessionConfig,
    pub(super) info_hash: [u8; 20],
    pub(super) our_id: PeerId,
    pub(super) listen_port: u16,
    pub(super) files: Vec<FileRecord>,
    pub(super) piece_length: u64,

    pub(super) store: Arc<PieceStore>,
    pub(super) ours: Bitfield,
    pub(super) picker: PiecePicker,
    pub(super) assembler: Assembler,
    pub(super) choker: Choker,
    pub(super) seeder: Option<SuperSeeder>,

    pub(super) peers: HashMap<SocketAddr, PeerConnection>,
    pub(super) serves: HashMap<SocketAddr, HashMap<BlockRequest, AbortHandle>>,
    pub(super) banned: HashSet<IpAddr>,
    pub(super) hash_strikes: HashMap<IpAddr, u32>,
    pub(super) candidates: VecDeque<SocketAddr>,
    pub(super) dialing: HashSet<SocketAddr>,

    pub(super) limiter: UploadLimiter,
    pub(super) tuner: Option<UploadTuner>,
    pub(super) downloaded: u64,
    pub(super) uploaded: u64,

    pub(super) events: mpsc::Sender<SessionEvent>,
    pub(super) internal_tx: mpsc::Sender<Internal>,
    pub(super) announce_tx: mpsc::Sender<AnnounceRequest>,
    pub(super) announce_pending: bool,
    pub(super) next_announce: TokioInstant,
    pub(super) last_optimistic: Instant,
    pub(super) completed_sent: bool,
    pub(super) fatal: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: SessionConfig,
        metainfo: &Metainfo,
        store: Arc<PieceStore>,
        ours: Bitfield,
        assembler: Assembler,
        picker: PiecePicker,
        limiter: UploadLimiter,
        tuner: Option<UploadTuner>,
        listen_port: u16,
        events: mpsc::Sender<SessionEvent>,
        internal_tx: mpsc::Sender<Internal>,
        announce_tx: mpsc::Sender<AnnounceRequest>,
    ) -> Self {
        Self {
            choker: Choker::new(config.max_uploads),
            seeder: config.super_seed.then(SuperSeeder::new),
            config,
            info_hash: metainfo.info_hash,
            our_id: PeerId::generate(),
            listen_port,
            files: metainfo.info.files.clone(),
            piece_length: metainfo.info.piece_length,
            store,
            ours,
            picker,
            assembler,
            peers: HashMap::new(),
            serves: HashMap::new(),
            banned: HashSet::new(),
            hash_strikes: HashMap::new(),
            candidates: VecDeque::new(),
            dialing: HashSet::new(),
            limiter,
            tuner,
            downloaded: 0,
            uploaded: 0,
            events,
            internal_tx,
            announce_tx,
            announce_pending: false,
            next_announce: TokioInstant::now(),
            last_optimistic: Instant::now(),
            completed_sent: false,
            fatal: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::Receiver<Internal>,
        listener: TcpListener,
    ) {
        let mut choke_tick = interval(self.config.choke_interval);
        choke_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval(Duration::from_secs(1));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tune_tick = interval(self.config.tune_interval);
        tune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A crash between assembly and verification can leave fully
        // covered but unverified pieces in the resume data.
        let complete: Vec<u32> = (0..self.piece_count())
            .filter(|&p| {
                !self.ours.has(p as usize)
                    && self.assembler.is_complete(p, self.store.piece_size(p))
            })
            .collect();
        for piece in complete {
            self.finish_piece(piece).await;
        }

        self.request_announce(TrackerEvent::Started);
        info!(port = self.listen_port, "session started");

        loop {
            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                accepted = listener.accept() => {
                    if let Ok((stream, addr)) = accepted {
                        self.handle_inbound(stream, addr);
                    }
                }
                _ = choke_tick.tick() => self.rechoke(),
                _ = sweep_tick.tick() => self.sweep(),
                _ = tune_tick.tick() => self.tune(),
                _ = sleep_until(self.next_announce), if !self.announce_pending => {
                    self.request_announce(TrackerEvent::None);
                }
            }

            if self.fatal {
                break;
            }
        }

        // Best-effort goodbye; the tracker task drains what is queued.
        self.request_announce(TrackerEvent::Stopped);
        let _ = self.events.try_send(SessionEvent::Resume(self.snapshot()));
        info!("session stopped");
    }

    pub(super) fn piece_count(&self) -> u32 {
        self.store.piece_count()
    }

    pub(super) fn snapshot(&self) -> ResumeData {
        ResumeData::capture(&self.ours, &self.assembler)
    }

    fn fail(&mut self, message: String) {
        warn!(%message, "fatal session error");
        let _ = self.events.try_send(SessionEvent::Fatal(message));
        self.fatal = true;
    }

    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::AddPeer(addr) => {
                self.candidates.push_front(addr);
                self.dial_candidates();
            }
            SessionCommand::SetFilePriority {
                file_index,
                priority,
            } => {
                if let Some(range) = self.file_piece_range(file_index, priority) {
                    self.picker.set_priority(range, priority);
                }
            }
            SessionCommand::SetUploadLimit(limit) => self.limiter.set_rate(limit),
            SessionCommand::ResumeSnapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => return true,
        }
        false
    }

    /// Pieces affected by a priority change for one file.
    ///
    /// Boundary pieces shared with a neighboring file are only included
    /// when raising interest, never when disabling, so disabling one
    /// file cannot starve the piece its neighbor still needs.
    fn file_piece_range(
        &self,
        file_index: usize,
        priority: FilePriority,
    ) -> Option<std::ops::Range<u32>> {
        let file = self.files.get(file_index)?;
        let total = self
            .files
            .last()
            .map(|f| f.offset + f.length)
            .unwrap_or(0);
        let (start, end) = if matches!(priority, FilePriority::Disabled) {
            let file_end = file.offset + file.length;
            // The short last piece ends at the torrent end, not at a
            // piece boundary.
            let end = if file_end == total {
                self.piece_count() as u64
            } else {
                file_end / self.piece_length
            };
            (file.offset.div_ceil(self.piece_length), end)
        } else {
            (
                file.offset / self.piece_length,
                (file.offset + file.length).div_ceil(self.piece_length),
            )
        };
        let end = end.min(self.piece_count() as u64);
        (start < end).then(|| start as u32..end as u32)
    }

    fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        // Dropping the socket declines the connection; this is the
        // normal path when the table is full, not an error.
        if self.peers.len() >= self.config.max_peers || self.banned.contains(&addr.ip()) {
            debug!(%addr, "declining inbound connection");
            return;
        }
        tokio::spawn(io::accept(
            stream,
            addr,
            self.info_hash,
            self.our_id,
            self.config.handshake_grace,
            self.internal_tx.clone(),
        ));
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Connected {
                addr,
                peer_id,
                outgoing,
            } => self.handle_connected(addr, peer_id, outgoing),
            Internal::PeerMessage { addr, message } => {
                if let Err(violation) = self.handle_message(addr, message).await {
                    debug!(%addr, %violation, "dropping peer");
                    self.drop_peer(addr);
                }
            }
            Internal::Served {
                addr,
                request,
                bytes,
            } => {
                self.uploaded += bytes as u64;
                if let Some(conn) = self.peers.get_mut(&addr) {
                    conn.record_uploaded(bytes);
                }
                if let Some(serves) = self.serves.get_mut(&addr) {
                    serves.remove(&request);
                }
            }
            Internal::ServeFailed { addr, request } => {
                if let Some(serves) = self.serves.get_mut(&addr) {
                    serves.remove(&request);
                }
            }
            Internal::Closed { addr, reason } => {
                if let Some(reason) = reason {
                    debug!(%addr, %reason, "connection closed");
                }
                self.drop_peer(addr);
            }
            Internal::DialFailed { addr } => {
                self.dialing.remove(&addr);
            }
            Internal::Announce(result) => self.handle_announce(result),
        }
    }

    pub(super) fn handle_connected(
        &mut self,
        addr: SocketAddr,
        peer_id: PeerId,
        outgoing: mpsc::Sender<Message>,
    ) {
        self.dialing.remove(&addr);

        if self.peers.len() >= self.config.max_peers
            || self.banned.contains(&addr.ip())
            || self.peers.contains_key(&addr)
        {
            // Dropping `outgoing` closes the writer task.
            return;
        }

        let mut conn = PeerConnection::new(
            addr,
            peer_id,
            self.piece_count() as usize,
            outgoing,
            self.config.snub_window,
        );
        conn.hash_failures = self.hash_strikes.get(&addr.ip()).copied().unwrap_or(0);

        if let Some(seeder) = &mut self.seeder {
            // Super-seed: reveal exactly one piece, never the bitfield.
            if let Some(piece) = seeder.next_assignment(addr, &self.ours, &conn.bitfield) {
                let _ = conn.send(Message::Have { piece });
            }
        } else if !self.ours.is_empty() {
            let _ = conn.send(Message::Bitfield(self.ours.to_bytes()));
        }

        debug!(%addr, id = %peer_id, "peer connected");
        self.peers.insert(addr, conn);
        let _ = self.events.try_send(SessionEvent::PeerConnected(addr));
    }

    /// Applies one wire message. An `Err` is a protocol violation and
    /// costs the peer its connection.
    pub(super) async fn handle_message(
        &mut self,
        addr: SocketAddr,
        message: Message,
    ) -> Result<(), PeerError> {
        let payload_len = match &message {
            Message::Piece { data, .. } => data.len(),
            _ => 0,
        };

        let first = {
            let Some(conn) = self.peers.get_mut(&addr) else {
                return Ok(()); // raced a disconnect
            };
            let first = !conn.saw_message;
            conn.saw_message = true;
            conn.record_received(payload_len);
            first
        };

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                let released: Vec<BlockRequest> = {
                    let conn = self.conn_mut(&addr)?;
                    conn.peer_choking = true;
                    conn.requests.drain().collect()
                };
                self.picker.release(released);
            }
            Message::Unchoke => {
                self.conn_mut(&addr)?.peer_choking = false;
                self.fill_backlog(addr);
            }
            Message::Interested => {
                self.conn_mut(&addr)?.peer_interested = true;
            }
            Message::NotInterested => {
                self.conn_mut(&addr)?.peer_interested = false;
            }
            Message::Have { piece } => self.handle_have(addr, piece)?,
            Message::Bitfield(bits) => self.handle_bitfield(addr, bits, first)?,
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(addr, index, begin, length)?,
            Message::Piece { index, begin, data } => {
                self.handle_piece(addr, index, begin, data).await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(index, begin, length);
                if let Some(serves) = self.serves.get_mut(&addr) {
                    if let Some(handle) = serves.remove(&request) {
                        handle.abort();
                    }
                }
            }
        }

        Ok(())
    }

    fn conn_mut(&mut self, addr: &SocketAddr) -> Result<&mut PeerConnection, PeerError> {
        self.peers
            .get_mut(addr)
            .ok_or(PeerError::ConnectionClosed)
    }

    fn handle_have(&mut self, addr: SocketAddr, piece: u32) -> Result<(), PeerError> {
        if piece >= self.piece_count() {
            return Err(PeerError::Violation("have index out of range"));
        }

        // Duplicate haves must not inflate availability.
        let newly_known = {
            let conn = self.conn_mut(&addr)?;
            if conn.bitfield.has(piece as usize) {
                false
            } else {
                conn.bitfield.set(piece as usize);
                true
            }
        };
        if newly_known {
            self.picker.peer_has(piece);
        }

        if let Some(seeder) = &mut self.seeder {
            // Someone redistributed an assigned piece; free the peer
            // that was spreading it and hand them the next one.
            if let Some(freed) = seeder.piece_spread(piece) {
                if let Some(conn) = self.peers.get(&freed) {
                    if let Some(next) =
                        seeder.next_assignment(freed, &self.ours, &conn.bitfield)
                    {
                        if let Some(conn) = self.peers.get_mut(&freed) {
                            let _ = conn.send(Message::Have { piece: next });
                        }
                    }
                }
            }
        }

        self.update_interest(addr);
        self.fill_backlog(addr);
        Ok(())
    }

    fn handle_bitfield(
        &mut self,
        addr: SocketAddr,
        bits: Bytes,
        first: bool,
    ) -> Result<(), PeerError> {
        if !first {
            return Err(PeerError::Violation("bitfield after first message"));
        }

        let bitfield = Bitfield::from_wire(&bits, self.piece_count() as usize)
            .ok_or(PeerError::Violation("malformed bitfield"))?;

        for piece in bitfield.pieces() {
            self.picker.peer_has(piece as u32);
        }

        {
            let conn = self.conn_mut(&addr)?;
            conn.bitfield = bitfield;
            conn.saw_bitfield = true;
        }

        self.update_interest(addr);
        Ok(())
    }

    fn handle_request(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), PeerError> {
        let probe = self
            .peers
            .get_mut(&addr)
            .and_then(|conn| conn.unchoked_at.take());
        if let (Some(unchoked_at), Some(tuner)) = (probe, self.tuner.as_mut()) {
            tuner.record_probe(unchoked_at.elapsed());
        }

        let Some(conn) = self.peers.get(&addr) else {
            return Ok(());
        };
        if conn.am_choking {
            // A request racing our choke message is dropped, not punished.
            return Ok(());
        }

        if length == 0 || length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Violation("request length"));
        }
        if index >= self.piece_count() || !self.ours.has(index as usize) {
            return Err(PeerError::Violation("request for piece we lack"));
        }
        if begin as u64 + length as u64 > self.store.piece_size(index) {
            return Err(PeerError::Violation("request range"));
        }

        let request = BlockRequest::new(index, begin, length);
        let handle = tokio::spawn(io::serve_block(
            self.store.clone(),
            self.limiter.clone(),
            request,
            conn.sender(),
            self.internal_tx.clone(),
            addr,
        ))
        .abort_handle();
        self.serves.entry(addr).or_default().insert(request, handle);
        Ok(())
    }

    async fn handle_piece(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let length = data.len() as u32;
        if index >= self.piece_count()
            || begin as u64 + length as u64 > self.store.piece_size(index)
        {
            return Err(PeerError::Violation("piece payload out of range"));
        }

        let request = BlockRequest::new(index, begin, length);
        let solicited = match self.peers.get_mut(&addr) {
            Some(conn) => conn.requests.remove(&request),
            None => return Ok(()),
        };
        if !solicited {
            // Not requested (or already answered by someone else after
            // our cancel): discard without penalty.
            debug!(%addr, index, begin, "unsolicited block discarded");
            return Ok(());
        }

        self.downloaded += length as u64;

        if let Err(error) = self.store.write_block(index, begin, &data).await {
            self.fail(format!("disk write failed: {error}"));
            return Ok(());
        }

        self.assembler.record(index, begin, length, addr);
        self.picker.block_received(request);

        // First copy wins in endgame; cancel the duplicates.
        let duplicates: Vec<SocketAddr> = self
            .peers
            .iter_mut()
            .filter(|(other, _)| **other != addr)
            .filter_map(|(other, conn)| conn.requests.remove(&request).then_some(*other))
            .collect();
        for other in duplicates {
            if let Some(conn) = self.peers.get_mut(&other) {
                let _ = conn.send(Message::Cancel {
                    index,
                    begin,
                    length,
                });
            }
        }

        if self
            .assembler
            .is_complete(index, self.store.piece_size(index))
        {
            self.finish_piece(index).await;
        }

        self.fill_backlog(addr);
        Ok(())
    }

    async fn finish_piece(&mut self, piece: u32) {
        match self.store.verify_piece(piece).await {
            Ok(true) => {
                self.assembler.clear(piece);
                self.ours.set(piece as usize);
                self.picker.piece_verified(piece);
                info!(piece, "piece verified");
                let _ = self.events.try_send(SessionEvent::PieceVerified { piece });
                let _ = self.events.try_send(SessionEvent::Resume(self.snapshot()));

                if self.seeder.is_none() {
                    let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
                    for addr in &addrs {
                        if let Some(conn) = self.peers.get_mut(addr) {
                            let _ = conn.send(Message::Have { piece });
                        }
                    }
                    for addr in addrs {
                        self.update_interest(addr);
                    }
                }

                if self.picker.is_complete() && !self.completed_sent {
                    self.completed_sent = true;
                    info!("download complete, seeding");
                    let _ = self.events.try_send(SessionEvent::Completed);
                    self.request_announce(TrackerEvent::Completed);
                }
            }
            Ok(false) => {
                let contributors = self.assembler.contributors(piece);
                self.assembler.clear(piece);
                self.picker.piece_failed(piece);
                warn!(piece, ?contributors, "piece failed verification");
                let _ = self.events.try_send(SessionEvent::PieceFailed { piece });

                for addr in contributors {
                    let strikes = self.hash_strikes.entry(addr.ip()).or_insert(0);
                    *strikes += 1;
                    let strikes = *strikes;
                    if let Some(conn) = self.peers.get_mut(&addr) {
                        conn.hash_failures = strikes;
                    }
                    if strikes >= self.config.hash_fail_ban {
                        warn!(%addr, strikes, "banning peer");
                        self.banned.insert(addr.ip());
                        self.drop_peer(addr);
                    } else if strikes >= self.config.hash_fail_kick {
                        self.drop_peer(addr);
                    }
                }
            }
            Err(error) => self.fail(format!("piece verification failed: {error}")),
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let wants = match self.peers.get(&addr) {
            Some(conn) => self.picker.wants_from(&conn.bitfield),
            None => return,
        };
        if let Some(conn) = self.peers.get_mut(&addr) {
            if wants != conn.am_interested {
                conn.am_interested = wants;
                let _ = conn.send(if wants {
                    Message::Interested
                } else {
                    Message::NotInterested
                });
            }
        }
    }

    /// Tops up a peer's outstanding requests to its rate-scaled backlog.
    pub(super) fn fill_backlog(&mut self, addr: SocketAddr) {
        let (theirs, budget) = {
            let Some(conn) = self.peers.get_mut(&addr) else {
                return;
            };
            if !conn.can_request() || conn.snubbed() {
                return;
            }
            let rate = conn.download_meter.rate();
            let target = self.config.backlog_for_rate(rate);
            if conn.requests.len() >= target {
                return;
            }
            (conn.bitfield.clone(), target - conn.requests.len())
        };

        let mut picks = self.picker.pick(&theirs, budget);

        if picks.len() < budget && self.picker.is_endgame() {
            // Endgame: shadow other peers' outstanding requests so the
            // fastest copy wins.
            if let Some(conn) = self.peers.get(&addr) {
                for request in self.picker.all_outstanding() {
                    if picks.len() >= budget {
                        break;
                    }
                    if theirs.has(request.piece as usize)
                        && !conn.requests.contains(&request)
                        && !picks.contains(&request)
                    {
                        picks.push(request);
                    }
                }
            }
        }

        if let Some(conn) = self.peers.get_mut(&addr) {
            for request in picks {
                if conn.requests.insert(request) {
                    let _ = conn.send(Message::Request {
                        index: request.piece,
                        begin: request.offset,
                        length: request.length,
                    });
                }
            }
        }
    }

    pub(super) fn drop_peer(&mut self, addr: SocketAddr) {
        if let Some(conn) = self.peers.remove(&addr) {
            let released: Vec<BlockRequest> = conn.requests.iter().copied().collect();
            self.picker.release(released);
            self.picker.peer_gone(&conn.bitfield);
            self.choker.peer_gone(&addr);
            if let Some(seeder) = &mut self.seeder {
                seeder.peer_gone(&addr);
            }
            if let Some(serves) = self.serves.remove(&addr) {
                for handle in serves.into_values() {
                    handle.abort();
                }
            }
            let _ = self.events.try_send(SessionEvent::PeerDisconnected(addr));
        }
        self.dialing.remove(&addr);
    }

    fn rechoke(&mut self) {
        let rotate = self.last_optimistic.elapsed() >= self.config.optimistic_interval;
        if rotate {
            self.last_optimistic = Instant::now();
        }
        let seeding = self.picker.is_complete();

        let decisions = {
            let mut views: Vec<&mut PeerConnection> = self.peers.values_mut().collect();
            self.choker.rechoke(&mut views, seeding, rotate)
        };

        for decision in decisions {
            let Some(conn) = self.peers.get_mut(&decision.addr) else {
                continue;
            };
            conn.am_choking = !decision.unchoke;
            if decision.unchoke {
                conn.unchoked_at = Some(Instant::now());
                let _ = conn.send(Message::Unchoke);
            } else {
                let _ = conn.send(Message::Choke);
                // Withdraw anything still queued for them.
                if let Some(serves) = self.serves.get_mut(&decision.addr) {
                    for (_, handle) in serves.drain() {
                        handle.abort();
                    }
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut idle = Vec::new();
        let mut released = Vec::new();
        let mut download_rate = 0.0;
        let mut upload_rate = 0.0;
        for (addr, conn) in self.peers.iter_mut() {
            download_rate += conn.download_meter.rate();
            upload_rate += conn.upload_meter.rate();
            if conn.idle_for() > self.config.idle_timeout {
                idle.push(*addr);
                continue;
            }
            if conn.last_send.elapsed() >= self.config.keepalive_interval {
                let _ = conn.send(Message::KeepAlive);
            }
            if conn.snubbed() {
                // Requests stuck behind a silent peer go back into the
                // pool so someone else can pick them up.
                released.extend(conn.requests.drain());
            }
        }
        let _ = self.events.try_send(SessionEvent::Progress {
            verified: self.picker.verified_count(),
            total: self.piece_count(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            download_rate,
            upload_rate,
            peers: self.peers.len(),
            endgame: self.picker.is_endgame(),
        });

        self.picker.release(released);
        for addr in idle {
            debug!(%addr, "dropping idle peer");
            self.drop_peer(addr);
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.fill_backlog(addr);
        }

        self.dial_candidates();
    }

    fn tune(&mut self) {
        if let Some(tuner) = self.tuner.as_mut() {
            let rate = tuner.evaluate();
            debug!(rate, "upload limit tuned");
        }
    }

    fn dial_candidates(&mut self) {
        while self.peers.len() + self.dialing.len() < self.config.max_peers {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            if self.peers.contains_key(&addr)
                || self.dialing.contains(&addr)
                || self.banned.contains(&addr.ip())
            {
                continue;
            }
            self.dialing.insert(addr);
            tokio::spawn(io::dial(
                addr,
                self.info_hash,
                self.our_id,
                self.config.handshake_grace,
                self.internal_tx.clone(),
            ));
        }
    }

    fn handle_announce(
        &mut self,
        result: Result<crate::tracker::AnnounceResponse, crate::tracker::TrackerError>,
    ) {
        self.announce_pending = false;
        match result {
            Ok(response) => {
                let interval = response
                    .interval
                    .max(response.min_interval.unwrap_or(0))
                    .max(30);
                self.next_announce = TokioInstant::now() + Duration::from_secs(interval as u64);
                for addr in response.all_peers() {
                    if !self.peers.contains_key(addr)
                        && !self.dialing.contains(addr)
                        && !self.banned.contains(&addr.ip())
                        && !self.candidates.contains(addr)
                    {
                        self.candidates.push_back(*addr);
                    }
                }
                self.dial_candidates();
            }
            Err(error) => {
                debug!(%error, "announce round failed");
                let _ = self
                    .events
                    .try_send(SessionEvent::TrackerProblem(error.to_string()));
                self.next_announce = TokioInstant::now() + self.config.tracker_retry;
            }
        }
    }

    fn request_announce(&mut self, event: TrackerEvent) {
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: *self.our_id.as_bytes(),
            port: self.listen_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.store.bytes_left(&self.ours),
            event,
            numwant: self.config.numwant,
        };
        match self.announce_tx.try_send(request) {
            Ok(()) => self.announce_pending = true,
            Err(_) => {
                self.announce_pending = false;
                self.next_announce = TokioInstant::now() + self.config.tracker_retry;
            }
        }
    }
}
