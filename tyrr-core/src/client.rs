use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{AcquireError, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tyrr_common::{InfoHash, Manifest, PeerId};
use tyrr_wire::Handshake;

use crate::{
    config::Config,
    disk::DiskStore,
    download::{DownloadArgs, DownloadHandle},
    peer::Transport,
    resume::ResumeData,
};

const HANDSHAKE_PEEK_TIMEOUT: Duration = Duration::from_secs(10);
/// Cool-down before re-dialing an address that refused us.
const REFUSED_COOLDOWN: Duration = Duration::from_secs(60);
/// Cool-down before re-dialing an address that timed out.
const TIMEOUT_COOLDOWN: Duration = Duration::from_secs(300);
const HISTORY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("torrent {0} exists")]
    Exists(InfoHash),
    #[error("no torrent registered for {0}")]
    UnknownTorrent(InfoHash),
    #[error("connection limit reached")]
    AtCapacity,
    #[error("malformed handshake from peer")]
    BadHandshake,
    #[error("download task is gone")]
    TaskGone,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ConnHistory {
    pub last_err: Option<String>,
    pub timed_out: bool,
    pub connected: bool,
}

/// Map whose entries vanish after a fixed TTL; expired entries are purged
/// lazily on access.
struct TtlMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: std::hash::Hash + Eq + Copy, V> TtlMap<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.entries
            .retain(|_, (stamped, _)| now.duration_since(*stamped) < self.ttl);
        self.entries.insert(key, (now, value));
    }

    fn get(&mut self, key: &K) -> Option<(Instant, &V)> {
        let expired = match self.entries.get(key) {
            Some((stamped, _)) => Instant::now().duration_since(*stamped) >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries
            .get(key)
            .map(|(stamped, value)| (*stamped, value))
    }
}

/// Global connection admission: one counted semaphore for the whole client
/// plus the dial cool-down history.
pub struct Admission {
    semaphore: Arc<Semaphore>,
    history: Mutex<TtlMap<SocketAddr, ConnHistory>>,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            history: Mutex::new(TtlMap::new(HISTORY_TTL)),
        }
    }

    /// Outbound dials wait for a slot.
    pub async fn acquire_outbound(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    /// Inbound connections never wait: at the cap they are rejected.
    pub fn try_acquire_inbound(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether a recent failed dial means this address should be left alone.
    pub fn in_cooldown(&self, addr: SocketAddr) -> bool {
        let mut history = self.history.lock().expect("history lock poisoned");
        match history.get(&addr) {
            Some((stamped, entry)) if !entry.connected => {
                let cooldown = if entry.timed_out {
                    TIMEOUT_COOLDOWN
                } else {
                    REFUSED_COOLDOWN
                };
                Instant::now().duration_since(stamped) < cooldown
            }
            _ => false,
        }
    }

    pub fn record_connected(&self, addr: SocketAddr) {
        self.history
            .lock()
            .expect("history lock poisoned")
            .insert(
                addr,
                ConnHistory {
                    connected: true,
                    ..Default::default()
                },
            );
    }

    pub fn record_refused(&self, addr: SocketAddr, err: String) {
        debug!(%addr, %err, "dial failed");
        self.history
            .lock()
            .expect("history lock poisoned")
            .insert(
                addr,
                ConnHistory {
                    last_err: Some(err),
                    ..Default::default()
                },
            );
    }

    pub fn record_timeout(&self, addr: SocketAddr) {
        debug!(%addr, "dial timed out");
        self.history
            .lock()
            .expect("history lock poisoned")
            .insert(
                addr,
                ConnHistory {
                    timed_out: true,
                    ..Default::default()
                },
            );
    }
}

/// Registry multiplexing download tasks and admitting connections.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Config,
    session_path: PathBuf,
    peer_id: PeerId,
    disk: Arc<dyn DiskStore>,
    downloads: RwLock<HashMap<InfoHash, DownloadHandle>>,
    admission: Arc<Admission>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: Config, session_path: PathBuf, disk: Arc<dyn DiskStore>) -> Self {
        let limit = config.application.global_connections_limit as usize;
        Self {
            inner: Arc::new(ClientInner {
                config,
                session_path,
                peer_id: PeerId::generate(),
                disk,
                downloads: RwLock::new(HashMap::new()),
                admission: Arc::new(Admission::new(limit)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn admission(&self) -> Arc<Admission> {
        self.inner.admission.clone()
    }

    /// Register a torrent and kick off its init. At most one task may exist
    /// per info-hash.
    pub fn add_torrent(
        &self,
        manifest: Arc<Manifest>,
        download_path: PathBuf,
        tags: Vec<String>,
    ) -> Result<DownloadHandle, ClientError> {
        let info_hash = manifest.info_hash;
        info!(%info_hash, name = %manifest.name, "adding torrent");

        let mut downloads = self
            .inner
            .downloads
            .write()
            .expect("registry lock poisoned");
        if downloads.contains_key(&info_hash) {
            return Err(ClientError::Exists(info_hash));
        }

        let handle = DownloadHandle::spawn(DownloadArgs {
            manifest,
            download_path,
            tags,
            our_id: self.inner.peer_id,
            disk: self.inner.disk.clone(),
            admission: self.inner.admission.clone(),
            resume: self.load_resume(info_hash),
            cancel: self.inner.cancel.child_token(),
        });
        downloads.insert(info_hash, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, info_hash: InfoHash) -> Option<DownloadHandle> {
        self.inner
            .downloads
            .read()
            .expect("registry lock poisoned")
            .get(&info_hash)
            .cloned()
    }

    pub fn downloads(&self) -> Vec<DownloadHandle> {
        self.inner
            .downloads
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Drop the task entirely; its bitmap survives only in the resume file.
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), ClientError> {
        let handle = self
            .inner
            .downloads
            .write()
            .expect("registry lock poisoned")
            .remove(&info_hash)
            .ok_or(ClientError::UnknownTorrent(info_hash))?;
        handle.cancel();
        let _ = self.inner.disk.deregister(info_hash).await;
        Ok(())
    }

    /// Admit one inbound connection: take a permit without waiting, peek the
    /// handshake, route to the task owning that info-hash.
    pub async fn accept(&self, mut conn: Transport, addr: SocketAddr) -> Result<(), ClientError> {
        let Some(permit) = self.inner.admission.try_acquire_inbound() else {
            debug!(%addr, "rejecting inbound connection at the cap");
            return Err(ClientError::AtCapacity);
        };

        let peek = async {
            let mut buf = [0u8; Handshake::LEN];
            conn.read_exact(&mut buf).await?;
            Ok::<_, io::Error>(buf)
        };
        let buf = tokio::time::timeout(HANDSHAKE_PEEK_TIMEOUT, peek)
            .await
            .map_err(|_| ClientError::BadHandshake)??;
        let remote = Handshake::from_bytes(&buf).ok_or(ClientError::BadHandshake)?;

        let Some(handle) = self.get(remote.info_hash) else {
            debug!(%addr, info_hash = %remote.info_hash, "dropping connection for unknown torrent");
            return Err(ClientError::UnknownTorrent(remote.info_hash));
        };

        let reply = Handshake::new(remote.info_hash, self.inner.peer_id);
        conn.write_all(&reply.to_bytes()).await?;
        conn.flush().await?;

        handle
            .attach_inbound(conn, addr, remote.peer_id, Some(permit))
            .await
            .map_err(|_| ClientError::TaskGone)
    }

    /// Accept loop over a bound listener; runs until shutdown.
    pub async fn listen(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let client = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client.accept(Box::new(stream), addr).await {
                                debug!(%addr, %e, "inbound connection dropped");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(%e, "accept failed");
                    }
                },
            }
        }
    }

    /// Snapshot every task's resume state, then cancel the whole tree.
    pub async fn shutdown(&self) {
        info!("client shutting down");

        let handles: Vec<DownloadHandle> = {
            let mut downloads = self
                .inner
                .downloads
                .write()
                .expect("registry lock poisoned");
            downloads.drain().map(|(_, handle)| handle).collect()
        };

        let dir = self.inner.session_path.join("torrents");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(%e, "cannot create session directory");
        }

        for handle in &handles {
            match handle.snapshot().await {
                Ok(bytes) => {
                    let path = dir.join(format!("{}.resume", handle.info_hash().to_hex()));
                    if let Err(e) = std::fs::write(&path, &bytes) {
                        warn!(info_hash = %handle.info_hash(), %e, "failed to save resume state");
                    }
                }
                Err(e) => {
                    warn!(info_hash = %handle.info_hash(), %e, "failed to snapshot download");
                }
            }
        }

        self.inner.cancel.cancel();
    }

    fn load_resume(&self, info_hash: InfoHash) -> Option<ResumeData> {
        let path = self
            .inner
            .session_path
            .join("torrents")
            .join(format!("{}.resume", info_hash.to_hex()));
        let raw = std::fs::read(&path).ok()?;
        match ResumeData::decode(&raw) {
            Ok(resume) => Some(resume),
            Err(e) => {
                warn!(%info_hash, %e, "ignoring corrupt resume file");
                None
            }
        }
    }
}
