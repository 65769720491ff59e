use std::{
    collections::HashSet,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use tyrr_common::{InfoHash, PeerId};
use tyrr_wire::{Message, Request, Response};

use crate::{bitfield::Bitfield, download::DownloadMessage};

mod session;

/// Opaque byte-duplex: plain TCP, an obfuscation wrapper, or an in-memory
/// pipe in tests.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type Transport = Box<dyn Duplex>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer handshake carries a different info-hash")]
    InfoHashMismatch,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("peer sent invalid data")]
    InvalidData,
    #[error("closed by remote")]
    ClosedByRemote,
    #[error("cancelled")]
    Cancelled,
}

/// Handshaking → Running → Dying → Dead; Dead is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Running = 1,
    Dying = 2,
    Dead = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Running,
            2 => Self::Dying,
            _ => Self::Dead,
        }
    }
}

pub(crate) struct PeerShared {
    address: SocketAddr,
    info_hash: InfoHash,
    remote_id: Mutex<Option<PeerId>>,
    remote_bitmap: Mutex<Bitfield>,
    num_pieces: u32,
    choked_by_remote: AtomicBool,
    interesting_to_remote: AtomicBool,
    choking_remote: AtomicBool,
    interested_in_remote: AtomicBool,
    dead: AtomicBool,
    state: AtomicU8,
    outstanding: Mutex<HashSet<Request>>,
    cancel: CancellationToken,
}

/// Channels wiring a session to its download task.
pub struct SessionConfig {
    pub address: SocketAddr,
    pub info_hash: InfoHash,
    pub our_id: PeerId,
    pub num_pieces: u32,
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<DownloadMessage>,
    pub responses: mpsc::Sender<(SocketAddr, Response)>,
    pub requests: mpsc::Sender<(SocketAddr, Request)>,
}

/// Cheap cloneable handle onto one peer connection.
///
/// The session is alive until its first transport error, protocol violation,
/// cancellation or remote close; it then tears down both loops, closes the
/// transport and reports a single `PeerClosed` to the download task.
#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<PeerShared>,
    out_tx: mpsc::Sender<Message>,
}

/// Dial-side session: sends the handshake, then expects and verifies one.
pub fn spawn_outbound(stream: Transport, cfg: SessionConfig) -> PeerSession {
    spawn(stream, cfg, None)
}

/// Accept-side session: the registry has already peeked and answered the
/// handshake, so the remote identity is known up front.
pub fn spawn_inbound(stream: Transport, remote_id: PeerId, cfg: SessionConfig) -> PeerSession {
    spawn(stream, cfg, Some(remote_id))
}

fn spawn(stream: Transport, cfg: SessionConfig, remote_id: Option<PeerId>) -> PeerSession {
    let initiator = remote_id.is_none();
    let shared = Arc::new(PeerShared {
        address: cfg.address,
        info_hash: cfg.info_hash,
        remote_id: Mutex::new(remote_id),
        remote_bitmap: Mutex::new(Bitfield::new(cfg.num_pieces)),
        num_pieces: cfg.num_pieces,
        choked_by_remote: AtomicBool::new(true),
        interesting_to_remote: AtomicBool::new(false),
        choking_remote: AtomicBool::new(true),
        interested_in_remote: AtomicBool::new(false),
        dead: AtomicBool::new(false),
        state: AtomicU8::new(if initiator {
            SessionState::Handshaking as u8
        } else {
            SessionState::Running as u8
        }),
        outstanding: Mutex::new(HashSet::new()),
        cancel: cfg.cancel.clone(),
    });

    let (out_tx, out_rx) = mpsc::channel(64);
    tokio::spawn(session::run(stream, shared.clone(), out_rx, cfg, initiator));

    PeerSession { shared, out_tx }
}

impl PeerSession {
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        *self.shared.remote_id.lock().expect("peer id lock poisoned")
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    pub fn choked_by_remote(&self) -> bool {
        self.shared.choked_by_remote.load(Ordering::Acquire)
    }

    /// Whether the remote declared interest in our pieces.
    pub fn interesting_to_remote(&self) -> bool {
        self.shared.interesting_to_remote.load(Ordering::Acquire)
    }

    pub fn choking_remote(&self) -> bool {
        self.shared.choking_remote.load(Ordering::Acquire)
    }

    pub fn interested_in_remote(&self) -> bool {
        self.shared.interested_in_remote.load(Ordering::Acquire)
    }

    pub fn remote_bitmap(&self) -> Bitfield {
        self.shared
            .remote_bitmap
            .lock()
            .expect("bitmap lock poisoned")
            .clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.shared
            .remote_bitmap
            .lock()
            .expect("bitmap lock poisoned")
            .get(index)
    }

    pub fn outstanding_len(&self) -> usize {
        self.shared
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .len()
    }

    /// Record the request as outstanding, then enqueue it on the wire. The
    /// entry exists before any byte leaves the write loop.
    pub async fn submit_request(&self, request: Request) {
        self.shared
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .insert(request);
        if self.out_tx.send(Message::Request(request)).await.is_err() {
            // session already dying; the download reclaims on PeerClosed
            self.remove_outstanding(request);
        }
    }

    /// Drop a request from the outstanding set, e.g. when the scheduler
    /// reclaims it for another peer.
    pub fn remove_outstanding(&self, request: Request) -> bool {
        self.shared
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .remove(&request)
    }

    pub fn take_outstanding(&self) -> Vec<Request> {
        self.shared
            .outstanding
            .lock()
            .expect("outstanding lock poisoned")
            .drain()
            .collect()
    }

    pub async fn send(&self, msg: Message) {
        let _ = self.out_tx.send(msg).await;
    }

    /// Flip our interest toward the remote, emitting the wire message only
    /// on an actual change.
    pub async fn set_interested(&self, interested: bool) {
        if self
            .shared
            .interested_in_remote
            .swap(interested, Ordering::AcqRel)
            != interested
        {
            self.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            })
            .await;
        }
    }

    pub async fn set_choking(&self, choking: bool) {
        if self.shared.choking_remote.swap(choking, Ordering::AcqRel) != choking {
            self.send(if choking {
                Message::Choke
            } else {
                Message::Unchoke
            })
            .await;
        }
    }

    /// Idempotent teardown: marks the session dead and unblocks both loops.
    pub fn cancel(&self) {
        if !self.shared.dead.swap(true, Ordering::AcqRel) {
            self.shared
                .state
                .store(SessionState::Dying as u8, Ordering::Release);
        }
        self.shared.cancel.cancel();
    }
}
