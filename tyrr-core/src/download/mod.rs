use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, OwnedSemaphorePermit},
    time::{interval, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tyrr_common::{manifest::BLOCK_LEN, InfoHash, Manifest, PeerId};
use tyrr_wire::{Message, Request, Response};

use crate::{
    bitfield::Bitfield,
    client::Admission,
    disk::{DiskError, DiskStore},
    peer::{self, PeerSession, SessionConfig, SessionError, Transport},
    resume::ResumeData,
};

pub(crate) mod assembler;
pub(crate) mod picker;

use assembler::PieceBuffer;

/// Target in-flight window per unchoked peer.
const PIPELINE_DEPTH: usize = 8;
/// An unanswered request is handed back to the scheduler after this long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// After a re-choke, requests linger this long before being reclaimed.
const CHOKE_GRACE: Duration = Duration::from_secs(15);
const TICK_INTERVAL: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Contributing to this many corrupt pieces gets a peer disconnected.
const MISMATCH_BAN_THRESHOLD: u32 = 2;
/// Largest block a peer may request from us.
const MAX_SERVE_LEN: u32 = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Checking,
    Downloading,
    Uploading,
    Stopped,
    Moving,
    Error,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Stopped => "stopped",
            Self::Moving => "moving",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("not implemented")]
    NotImplemented,
    #[error("download task is gone")]
    TaskGone,
    #[error("disk failure: {0}")]
    Disk(#[from] DiskError),
}

/// Mailbox of a download task: user operations plus events posted by its
/// peer sessions. Sessions hold only this sender, never the task itself.
pub enum DownloadMessage {
    Start,
    Stop,
    Snapshot {
        resp: oneshot::Sender<Bytes>,
    },
    MoveTo {
        target: PathBuf,
        resp: oneshot::Sender<Result<(), DownloadError>>,
    },
    Stats {
        resp: oneshot::Sender<DownloadStats>,
    },
    /// Peer candidates from the tracker client (or any other source).
    AddPeers(Vec<SocketAddr>),
    RemovePeer {
        addr: SocketAddr,
        reason: String,
    },
    AttachInbound {
        stream: Transport,
        addr: SocketAddr,
        remote_id: PeerId,
        permit: Option<OwnedSemaphorePermit>,
    },
    Dialed {
        addr: SocketAddr,
        stream: Transport,
        permit: Option<OwnedSemaphorePermit>,
    },
    PeerClosed {
        addr: SocketAddr,
        reason: SessionError,
    },
    PeerBitfield {
        addr: SocketAddr,
    },
    PeerHave {
        addr: SocketAddr,
        piece: u32,
    },
    PeerChoked {
        addr: SocketAddr,
    },
    PeerUnchoked {
        addr: SocketAddr,
    },
    PeerCancelled {
        addr: SocketAddr,
        request: Request,
    },
}

pub struct DownloadShared {
    info_hash: InfoHash,
    state: Mutex<TaskState>,
    err: Mutex<Option<String>>,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub completed: AtomicU64,
    pub check_progress: Arc<AtomicU64>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct DownloadStats {
    pub name: String,
    pub info_hash: InfoHash,
    pub state: TaskState,
    pub err: Option<String>,
    pub completed: u64,
    pub total_length: u64,
    pub peers: usize,
    pub tracker_tiers: Vec<Vec<String>>,
}

impl std::fmt::Display for DownloadStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pct = if self.total_length == 0 {
            100.0
        } else {
            self.completed as f64 / self.total_length as f64 * 100.0
        };
        write!(
            f,
            "{} | {:.20} | {:.2}% | {} peers",
            self.state, self.name, pct, self.peers
        )?;
        for tier in &self.tracker_tiers {
            for url in tier {
                write!(f, " ( {url} )")?;
            }
        }
        if let Some(err) = &self.err {
            write!(f, " | {err}")?;
        }
        Ok(())
    }
}

pub struct DownloadArgs {
    pub manifest: Arc<Manifest>,
    pub download_path: PathBuf,
    pub tags: Vec<String>,
    pub our_id: PeerId,
    pub disk: Arc<dyn DiskStore>,
    pub admission: Arc<Admission>,
    pub resume: Option<ResumeData>,
    pub cancel: CancellationToken,
}

/// Handle onto one download task. Cloning is cheap; the task itself runs
/// until the cancellation token fires (torrent removal or client shutdown).
#[derive(Clone)]
pub struct DownloadHandle {
    tx: mpsc::Sender<DownloadMessage>,
    shared: Arc<DownloadShared>,
}

impl DownloadHandle {
    pub fn spawn(args: DownloadArgs) -> Self {
        let shared = Arc::new(DownloadShared {
            info_hash: args.manifest.info_hash,
            state: Mutex::new(TaskState::Checking),
            err: Mutex::new(None),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            check_progress: Arc::new(AtomicU64::new(0)),
            cancel: args.cancel.clone(),
        });

        let (tx, rx) = mpsc::channel(64);
        let (res_tx, res_rx) = mpsc::channel(64);
        let (req_tx, req_rx) = mpsc::channel(64);

        let num_pieces = args.manifest.num_pieces();
        let task = Download {
            manifest: args.manifest,
            shared: shared.clone(),
            disk: args.disk,
            admission: args.admission,
            our_id: args.our_id,
            download_path: args.download_path,
            tags: args.tags,
            resume: args.resume,
            local: Bitfield::new(num_pieces),
            buffers: HashMap::new(),
            conns: HashMap::new(),
            inflight: HashMap::new(),
            serve_queue: VecDeque::new(),
            tx: tx.clone(),
            rx,
            res_tx,
            res_rx,
            req_tx,
            req_rx,
        };
        tokio::spawn(task.run());

        Self { tx, shared }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    pub fn error(&self) -> Option<String> {
        self.shared.err.lock().expect("err lock poisoned").clone()
    }

    pub fn downloaded(&self) -> u64 {
        self.shared.downloaded.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Cancel the whole task tree: used on torrent removal, not on stop.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub async fn start(&self) -> Result<(), DownloadError> {
        self.send(DownloadMessage::Start).await
    }

    pub async fn stop(&self) -> Result<(), DownloadError> {
        self.send(DownloadMessage::Stop).await
    }

    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<(), DownloadError> {
        self.send(DownloadMessage::AddPeers(peers)).await
    }

    pub async fn remove_peer(&self, addr: SocketAddr, reason: String) -> Result<(), DownloadError> {
        self.send(DownloadMessage::RemovePeer { addr, reason }).await
    }

    pub async fn attach_inbound(
        &self,
        stream: Transport,
        addr: SocketAddr,
        remote_id: PeerId,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), DownloadError> {
        self.send(DownloadMessage::AttachInbound {
            stream,
            addr,
            remote_id,
            permit,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Bytes, DownloadError> {
        let (resp, rx) = oneshot::channel();
        self.send(DownloadMessage::Snapshot { resp }).await?;
        rx.await.map_err(|_| DownloadError::TaskGone)
    }

    pub async fn move_to(&self, target: PathBuf) -> Result<(), DownloadError> {
        let (resp, rx) = oneshot::channel();
        self.send(DownloadMessage::MoveTo { target, resp }).await?;
        rx.await.map_err(|_| DownloadError::TaskGone)?
    }

    pub async fn stats(&self) -> Result<DownloadStats, DownloadError> {
        let (resp, rx) = oneshot::channel();
        self.send(DownloadMessage::Stats { resp }).await?;
        rx.await.map_err(|_| DownloadError::TaskGone)
    }

    async fn send(&self, msg: DownloadMessage) -> Result<(), DownloadError> {
        self.tx.send(msg).await.map_err(|_| DownloadError::TaskGone)
    }
}

struct PeerEntry {
    session: PeerSession,
    choked_at: Option<Instant>,
    mismatches: u32,
    _permit: Option<OwnedSemaphorePermit>,
}

struct Inflight {
    addr: SocketAddr,
    sent_at: Instant,
}

struct Download {
    manifest: Arc<Manifest>,
    shared: Arc<DownloadShared>,
    disk: Arc<dyn DiskStore>,
    admission: Arc<Admission>,
    our_id: PeerId,
    download_path: PathBuf,
    tags: Vec<String>,
    resume: Option<ResumeData>,

    local: Bitfield,
    buffers: HashMap<u32, PieceBuffer>,
    conns: HashMap<SocketAddr, PeerEntry>,
    inflight: HashMap<Request, Inflight>,
    serve_queue: VecDeque<(SocketAddr, Request)>,

    tx: mpsc::Sender<DownloadMessage>,
    rx: mpsc::Receiver<DownloadMessage>,
    res_tx: mpsc::Sender<(SocketAddr, Response)>,
    res_rx: mpsc::Receiver<(SocketAddr, Response)>,
    req_tx: mpsc::Sender<(SocketAddr, Request)>,
    req_rx: mpsc::Receiver<(SocketAddr, Request)>,
}

impl Download {
    async fn run(mut self) {
        info!(info_hash = %self.manifest.info_hash, "download task starting");
        self.init().await;

        let mut tick = interval(TICK_INTERVAL);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                Some(msg) = self.rx.recv() => self.handle_message(msg).await,
                Some((addr, response)) = self.res_rx.recv() => self.on_response(addr, response).await,
                Some((addr, request)) = self.req_rx.recv() => self.queue_serve(addr, request),
                _ = tick.tick() => self.on_tick().await,
                _ = std::future::ready(()), if !self.serve_queue.is_empty() => {
                    self.serve_next().await;
                }
            }
        }

        // torrent removal / client shutdown: child tokens cancel the sessions
        debug!(info_hash = %self.manifest.info_hash, "download task exiting");
    }

    /// Restore from resume data when possible, otherwise re-hash everything.
    async fn init(&mut self) {
        let disk = self.disk.clone();
        let registered = disk
            .register(self.manifest.clone(), self.download_path.clone())
            .await;
        if let Err(e) = registered {
            self.set_error(e.to_string());
            return;
        }

        if let Some(resume) = self.resume.take() {
            if self.restore(resume) {
                return;
            }
            warn!(info_hash = %self.manifest.info_hash, "resume data unusable, re-checking");
        }

        self.set_state(TaskState::Checking);
        let checked = disk
            .hash_check(
                self.manifest.info_hash,
                0..self.manifest.num_pieces(),
                self.shared.check_progress.clone(),
            )
            .await;
        match checked {
            Ok(bitmap) => {
                let completed: u64 = bitmap
                    .iter_set()
                    .map(|i| self.manifest.piece_len(i) as u64)
                    .sum();
                self.shared.completed.store(completed, Ordering::Relaxed);
                self.local = bitmap;
                self.enter_running_state();
            }
            Err(e) => self.set_error(e.to_string()),
        }
    }

    fn restore(&mut self, resume: ResumeData) -> bool {
        if resume.info_hash != self.manifest.info_hash {
            return false;
        }
        let Ok(bitmap) =
            Bitfield::from_bytes_checked(&resume.bitmap, self.manifest.num_pieces())
        else {
            return false;
        };

        self.local = bitmap;
        self.shared
            .downloaded
            .store(resume.downloaded, Ordering::Relaxed);
        self.shared
            .uploaded
            .store(resume.uploaded, Ordering::Relaxed);
        self.shared
            .completed
            .store(resume.completed, Ordering::Relaxed);

        match resume.state {
            TaskState::Stopped => self.set_state(TaskState::Stopped),
            // a snapshot taken mid-check or mid-move resumes as a plain task
            _ => self.enter_running_state(),
        }
        true
    }

    fn enter_running_state(&mut self) {
        if self.local.all_set() {
            self.set_state(TaskState::Uploading);
        } else {
            self.set_state(TaskState::Downloading);
        }
    }

    async fn handle_message(&mut self, msg: DownloadMessage) {
        match msg {
            DownloadMessage::Start => self.on_start(),
            DownloadMessage::Stop => self.on_stop(),
            DownloadMessage::Snapshot { resp } => {
                let _ = resp.send(self.snapshot());
            }
            DownloadMessage::MoveTo { target, resp } => {
                debug!(?target, "move requested");
                let _ = resp.send(Err(DownloadError::NotImplemented));
            }
            DownloadMessage::Stats { resp } => {
                let _ = resp.send(self.stats());
            }
            DownloadMessage::AddPeers(peers) => self.on_add_peers(peers),
            DownloadMessage::RemovePeer { addr, reason } => {
                debug!(%addr, %reason, "peer removal requested");
                self.remove_peer(addr).await;
            }
            DownloadMessage::AttachInbound {
                stream,
                addr,
                remote_id,
                permit,
            } => self.attach_session(stream, addr, Some(remote_id), permit).await,
            DownloadMessage::Dialed {
                addr,
                stream,
                permit,
            } => self.attach_session(stream, addr, None, permit).await,
            DownloadMessage::PeerClosed { addr, reason } => self.on_peer_closed(addr, reason).await,
            DownloadMessage::PeerBitfield { addr } => self.on_peer_pieces_changed(addr).await,
            DownloadMessage::PeerHave { addr, .. } => self.on_peer_pieces_changed(addr).await,
            DownloadMessage::PeerChoked { addr } => {
                if let Some(entry) = self.conns.get_mut(&addr) {
                    entry.choked_at = Some(Instant::now());
                }
            }
            DownloadMessage::PeerUnchoked { addr } => {
                if let Some(entry) = self.conns.get_mut(&addr) {
                    entry.choked_at = None;
                }
                self.fill_requests().await;
            }
            DownloadMessage::PeerCancelled { addr, request } => {
                self.serve_queue
                    .retain(|(a, r)| !(*a == addr && *r == request));
            }
        }
    }

    fn on_start(&mut self) {
        match self.state() {
            TaskState::Stopped | TaskState::Error => {
                *self.shared.err.lock().expect("err lock poisoned") = None;
                self.enter_running_state();
            }
            _ => {}
        }
    }

    /// Tear down all sessions but keep the bitmap and resume data.
    fn on_stop(&mut self) {
        if self.state() == TaskState::Stopped {
            return;
        }
        for entry in self.conns.values() {
            entry.session.cancel();
        }
        self.conns.clear();
        self.inflight.clear();
        self.buffers.clear();
        self.serve_queue.clear();
        self.set_state(TaskState::Stopped);
    }

    fn snapshot(&self) -> Bytes {
        ResumeData {
            info_hash: self.manifest.info_hash,
            bitmap: self.local.as_bytes(),
            downloaded: self.shared.downloaded.load(Ordering::Relaxed),
            uploaded: self.shared.uploaded.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            state: self.state(),
            tags: self.tags.clone(),
            download_path: self.download_path.clone(),
        }
        .encode()
    }

    fn stats(&self) -> DownloadStats {
        DownloadStats {
            name: self.manifest.name.clone(),
            info_hash: self.manifest.info_hash,
            state: self.state(),
            err: self.shared.err.lock().expect("err lock poisoned").clone(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            total_length: self.manifest.total_length,
            peers: self.conns.len(),
            tracker_tiers: self.manifest.announce_list.clone(),
        }
    }

    fn on_add_peers(&mut self, peers: Vec<SocketAddr>) {
        if !matches!(self.state(), TaskState::Downloading | TaskState::Uploading) {
            return;
        }
        for addr in peers {
            if self.conns.contains_key(&addr) || self.admission.in_cooldown(addr) {
                continue;
            }
            let admission = self.admission.clone();
            let tx = self.tx.clone();
            let cancel = self.shared.cancel.clone();
            tokio::spawn(async move {
                let Ok(permit) = admission.acquire_outbound().await else {
                    return;
                };
                let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr));
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    outcome = dial => match outcome {
                        Ok(Ok(stream)) => {
                            admission.record_connected(addr);
                            let _ = tx
                                .send(DownloadMessage::Dialed {
                                    addr,
                                    stream: Box::new(stream),
                                    permit: Some(permit),
                                })
                                .await;
                        }
                        Ok(Err(e)) => admission.record_refused(addr, e.to_string()),
                        Err(_) => admission.record_timeout(addr),
                    },
                }
            });
        }
    }

    async fn attach_session(
        &mut self,
        stream: Transport,
        addr: SocketAddr,
        remote_id: Option<PeerId>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if !matches!(self.state(), TaskState::Downloading | TaskState::Uploading)
            || self.conns.contains_key(&addr)
        {
            return;
        }

        let cfg = SessionConfig {
            address: addr,
            info_hash: self.manifest.info_hash,
            our_id: self.our_id,
            num_pieces: self.manifest.num_pieces(),
            cancel: self.shared.cancel.child_token(),
            events: self.tx.clone(),
            responses: self.res_tx.clone(),
            requests: self.req_tx.clone(),
        };
        let session = match remote_id {
            Some(id) => peer::spawn_inbound(stream, id, cfg),
            None => peer::spawn_outbound(stream, cfg),
        };

        if !self.local.is_empty() {
            session.send(Message::Bitfield(self.local.as_bytes())).await;
        }
        session.set_choking(false).await;

        debug!(%addr, "peer attached");
        self.conns.insert(
            addr,
            PeerEntry {
                session,
                choked_at: None,
                mismatches: 0,
                _permit: permit,
            },
        );
    }

    async fn on_peer_closed(&mut self, addr: SocketAddr, reason: SessionError) {
        if let Some(entry) = self.conns.remove(&addr) {
            debug!(%addr, %reason, "peer removed");
            for request in entry.session.take_outstanding() {
                self.inflight.remove(&request);
                if let Some(buffer) = self.buffers.get_mut(&request.piece_index) {
                    buffer.unmark_requested(request.begin);
                }
            }
        }

        // anything still charged to this peer goes back to the pool
        let stale: Vec<Request> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.addr == addr)
            .map(|(request, _)| *request)
            .collect();
        for request in stale {
            self.inflight.remove(&request);
            if let Some(buffer) = self.buffers.get_mut(&request.piece_index) {
                buffer.unmark_requested(request.begin);
            }
        }

        self.fill_requests().await;
    }

    async fn on_peer_pieces_changed(&mut self, addr: SocketAddr) {
        let Some(entry) = self.conns.get(&addr) else {
            return;
        };
        let session = entry.session.clone();
        let bitmap = session.remote_bitmap();
        let interesting = bitmap.iter_set().any(|i| !self.local.get(i));
        session.set_interested(interesting).await;
        self.fill_requests().await;
    }

    /// Fill every eligible peer's pipeline up to the target depth.
    async fn fill_requests(&mut self) {
        if self.state() != TaskState::Downloading {
            return;
        }

        let rarity = {
            let bitmaps: Vec<Bitfield> = self
                .conns
                .values()
                .map(|entry| entry.session.remote_bitmap())
                .collect();
            picker::piece_rarity(self.manifest.num_pieces(), bitmaps.iter())
        };

        let addrs: Vec<SocketAddr> = self.conns.keys().copied().collect();
        for addr in addrs {
            let Some(entry) = self.conns.get(&addr) else {
                continue;
            };
            let session = entry.session.clone();
            if session.is_dead() || session.choked_by_remote() || !session.interested_in_remote()
            {
                continue;
            }

            let bitmap = session.remote_bitmap();
            let mut picked = Vec::new();
            while session.outstanding_len() + picked.len() < PIPELINE_DEPTH {
                let Some(request) = self.next_request(&bitmap, &rarity) else {
                    break;
                };
                self.inflight.insert(
                    request,
                    Inflight {
                        addr,
                        sent_at: Instant::now(),
                    },
                );
                picked.push(request);
            }
            for request in picked {
                session.submit_request(request).await;
            }
        }
    }

    /// Finish pieces already in progress first, then start the rarest piece
    /// this peer can supply.
    fn next_request(&mut self, bitmap: &Bitfield, rarity: &[u32]) -> Option<Request> {
        let mut partial: Vec<u32> = self
            .buffers
            .iter()
            .filter(|(index, buffer)| {
                buffer.has_unrequested() && bitmap.get(**index) && !self.local.get(**index)
            })
            .map(|(index, _)| *index)
            .collect();
        partial.sort_unstable();
        if let Some(index) = partial.first() {
            return self.allocate_block(*index);
        }

        let index = picker::pick_rarest(bitmap, &self.local, &self.buffers, rarity)?;
        self.buffers
            .insert(index, PieceBuffer::new(self.manifest.piece_len(index)));
        self.allocate_block(index)
    }

    fn allocate_block(&mut self, index: u32) -> Option<Request> {
        let block = {
            let buffer = self.buffers.get_mut(&index)?;
            let block = buffer.next_unrequested()?;
            buffer.mark_requested(block);
            block
        };
        Some(Request {
            piece_index: index,
            begin: block * BLOCK_LEN,
            length: self.manifest.block_len(index, block),
        })
    }

    async fn on_response(&mut self, addr: SocketAddr, response: Response) {
        self.shared
            .downloaded
            .fetch_add(response.data.len() as u64, Ordering::Relaxed);

        let request = response.implied_request();
        self.inflight.remove(&request);

        if !matches!(self.state(), TaskState::Downloading) {
            return;
        }
        let piece = response.piece_index;
        if self.local.get(piece) {
            // late duplicate of a piece another peer already finished
            return;
        }

        let piece_len = self.manifest.piece_len(piece);
        let buffer = self
            .buffers
            .entry(piece)
            .or_insert_with(|| PieceBuffer::new(piece_len));
        match buffer.accept(response.begin, &response.data, addr) {
            Ok(true) => self.finish_piece(piece).await,
            Ok(false) => {}
            Err(e) => {
                warn!(%addr, piece, %e, "dropping bad block");
            }
        }
    }

    /// All blocks arrived: verify, persist, publish.
    async fn finish_piece(&mut self, piece: u32) {
        let Some(buffer) = self.buffers.remove(&piece) else {
            return;
        };
        let contributors: Vec<SocketAddr> = buffer.contributors().iter().copied().collect();
        let data = buffer.into_data();

        let Some(expected) = self.manifest.piece_hash(piece).copied() else {
            return;
        };
        let (matches, data) = tokio::task::spawn_blocking(move || {
            let digest = Sha1::digest(&data);
            (digest[..] == expected[..], data)
        })
        .await
        .unwrap_or((false, Vec::new()));

        if !matches {
            warn!(piece, "piece hash mismatch, discarding");
            for addr in contributors {
                let banned = match self.conns.get_mut(&addr) {
                    Some(entry) => {
                        entry.mismatches += 1;
                        entry.mismatches >= MISMATCH_BAN_THRESHOLD
                    }
                    None => false,
                };
                if banned {
                    warn!(%addr, "peer exceeded mismatch threshold, disconnecting");
                    self.remove_peer(addr).await;
                }
            }
            self.fill_requests().await;
            return;
        }

        let piece_len = data.len() as u64;
        let disk = self.disk.clone();
        let written = disk
            .write_piece(self.manifest.info_hash, piece, Bytes::from(data))
            .await;
        if let Err(e) = written {
            self.set_error(e.to_string());
            return;
        }

        self.local.set(piece);
        self.shared.completed.fetch_add(piece_len, Ordering::Relaxed);
        info!(piece, "piece verified");

        // bitmap update happens-before the have broadcast; peers that
        // already advertise the piece are skipped
        let recipients: Vec<PeerSession> = self
            .conns
            .values()
            .filter(|entry| !entry.session.has_piece(piece))
            .map(|entry| entry.session.clone())
            .collect();
        for session in recipients {
            session.send(Message::Have { piece_index: piece }).await;
        }

        let sessions: Vec<PeerSession> =
            self.conns.values().map(|entry| entry.session.clone()).collect();
        for session in sessions {
            let bitmap = session.remote_bitmap();
            let interesting = bitmap.iter_set().any(|i| !self.local.get(i));
            session.set_interested(interesting).await;
        }

        if self.local.all_set() {
            info!(info_hash = %self.manifest.info_hash, "download complete");
            self.set_state(TaskState::Uploading);
        }
        self.fill_requests().await;
    }

    async fn remove_peer(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.conns.get(&addr) {
            entry.session.cancel();
        }
        // the session posts PeerClosed; reclaim eagerly anyway
        let reason = SessionError::Cancelled;
        self.on_peer_closed(addr, reason).await;
    }

    fn queue_serve(&mut self, addr: SocketAddr, request: Request) {
        self.serve_queue.push_back((addr, request));
    }

    async fn serve_next(&mut self) {
        let Some((addr, request)) = self.serve_queue.pop_front() else {
            return;
        };
        if !matches!(self.state(), TaskState::Downloading | TaskState::Uploading) {
            return;
        }

        let piece = request.piece_index;
        let in_bounds = piece < self.manifest.num_pieces()
            && request.length <= MAX_SERVE_LEN
            && request.length > 0
            && request.begin as u64 + request.length as u64
                <= self.manifest.piece_len(piece) as u64;
        if !in_bounds || !self.local.get(piece) {
            debug!(%addr, ?request, "ignoring unservable request");
            return;
        }
        let Some(entry) = self.conns.get(&addr) else {
            return;
        };
        let session = entry.session.clone();

        let disk = self.disk.clone();
        let block = disk.read_block(self.manifest.info_hash, request).await;
        match block {
            Ok(data) => {
                self.shared
                    .uploaded
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                session
                    .send(Message::Piece(Response {
                        piece_index: request.piece_index,
                        begin: request.begin,
                        data,
                    }))
                    .await;
            }
            Err(e) => self.set_error(e.to_string()),
        }
    }

    /// Reclaim timed-out requests and requests stuck behind a re-choke.
    async fn on_tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<(Request, SocketAddr)> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| now.duration_since(inflight.sent_at) >= REQUEST_TIMEOUT)
            .map(|(request, inflight)| (*request, inflight.addr))
            .collect();
        for (request, addr) in expired {
            debug!(%addr, ?request, "request timed out");
            self.reclaim(request, addr);
        }

        let graced: Vec<SocketAddr> = self
            .conns
            .iter()
            .filter(|(_, entry)| {
                entry
                    .choked_at
                    .is_some_and(|at| now.duration_since(at) >= CHOKE_GRACE)
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in graced {
            if let Some(entry) = self.conns.get_mut(&addr) {
                entry.choked_at = None;
            }
            let stuck: Vec<Request> = self
                .inflight
                .iter()
                .filter(|(_, inflight)| inflight.addr == addr)
                .map(|(request, _)| *request)
                .collect();
            for request in stuck {
                self.reclaim(request, addr);
            }
        }

        self.fill_requests().await;
    }

    fn reclaim(&mut self, request: Request, addr: SocketAddr) {
        self.inflight.remove(&request);
        if let Some(buffer) = self.buffers.get_mut(&request.piece_index) {
            buffer.unmark_requested(request.begin);
        }
        if let Some(entry) = self.conns.get(&addr) {
            entry.session.remove_outstanding(request);
        }
    }

    fn state(&self) -> TaskState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: TaskState) {
        *self.shared.state.lock().expect("state lock poisoned") = state;
    }

    /// Sticky: scheduling stops and peers are dropped until the user acts.
    fn set_error(&mut self, err: String) {
        warn!(info_hash = %self.manifest.info_hash, %err, "download entered error state");
        *self.shared.err.lock().expect("err lock poisoned") = Some(err);
        self.set_state(TaskState::Error);
        for entry in self.conns.values() {
            entry.session.cancel();
        }
        self.conns.clear();
        self.inflight.clear();
        self.buffers.clear();
        self.serve_queue.clear();
    }
}
