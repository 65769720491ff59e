use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io,
    ops::Range,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use tyrr_common::{InfoHash, Manifest};
use tyrr_wire::Request;

use crate::bitfield::Bitfield;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("torrent not registered: {0}")]
    UnknownTorrent(InfoHash),
    #[error("read/write outside the payload")]
    OutOfBounds,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Piece-level persistence collaborator. Calls are cancellable by dropping
/// the returned future.
#[async_trait]
pub trait DiskStore: Send + Sync + 'static {
    /// Register a torrent so piece offsets can be mapped onto files.
    async fn register(&self, manifest: Arc<Manifest>, download_path: PathBuf)
        -> Result<(), DiskError>;

    async fn deregister(&self, info_hash: InfoHash) -> Result<(), DiskError>;

    async fn read_block(&self, info_hash: InfoHash, request: Request) -> Result<Bytes, DiskError>;

    async fn write_piece(&self, info_hash: InfoHash, piece: u32, data: Bytes)
        -> Result<(), DiskError>;

    /// Re-hash the given piece range against the manifest; returns the bitmap
    /// of verified pieces (full domain, bits only set inside `range`).
    /// `progress` is bumped once per piece examined.
    async fn hash_check(
        &self,
        info_hash: InfoHash,
        range: Range<u32>,
        progress: Arc<AtomicU64>,
    ) -> Result<Bitfield, DiskError>;
}

fn check_bounds(manifest: &Manifest, piece: u32, begin: u32, length: usize) -> Result<(), DiskError> {
    if piece >= manifest.num_pieces()
        || begin as u64 + length as u64 > manifest.piece_len(piece) as u64
    {
        return Err(DiskError::OutOfBounds);
    }
    Ok(())
}

//
// File-backed store
//

struct TorrentFiles {
    manifest: Arc<Manifest>,
    base: PathBuf,
    handles: Mutex<HashMap<PathBuf, Arc<File>>>,
    fallocate: bool,
}

/// Positional file I/O spanning the manifest's file list. `pread`/`pwrite`
/// do not touch the descriptor's seek position, so one cached handle per
/// file serves concurrent blocking-pool calls.
pub struct FileStore {
    torrents: RwLock<HashMap<InfoHash, Arc<TorrentFiles>>>,
    fallocate: bool,
}

impl FileStore {
    pub fn new(fallocate: bool) -> Self {
        Self {
            torrents: RwLock::new(HashMap::new()),
            fallocate,
        }
    }

    fn torrent(&self, info_hash: InfoHash) -> Result<Arc<TorrentFiles>, DiskError> {
        self.torrents
            .read()
            .expect("disk registry lock poisoned")
            .get(&info_hash)
            .cloned()
            .ok_or(DiskError::UnknownTorrent(info_hash))
    }
}

impl TorrentFiles {
    fn open(&self, rel: &Path, expected_len: u64) -> io::Result<Arc<File>> {
        let path = self.base.join(rel);
        let mut handles = self.handles.lock().expect("file handle lock poisoned");
        if let Some(file) = handles.get(&path) {
            return Ok(file.clone());
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if self.fallocate && file.metadata()?.len() < expected_len {
            file.set_len(expected_len)?;
        }

        let file = Arc::new(file);
        handles.insert(path, file.clone());
        Ok(file)
    }

    /// Walk the file list covering `[offset, offset + buf.len())` of the
    /// whole payload and apply `op` per file segment.
    fn for_each_segment(
        &self,
        mut offset: u64,
        mut remaining: usize,
        mut op: impl FnMut(&File, u64, usize, usize) -> io::Result<()>,
    ) -> Result<(), DiskError> {
        let mut done = 0usize;
        for entry in &self.manifest.files {
            if remaining == 0 {
                break;
            }
            if offset >= entry.length {
                offset -= entry.length;
                continue;
            }

            let in_file = ((entry.length - offset) as usize).min(remaining);
            let file = self.open(&entry.path, entry.length)?;
            op(&file, offset, done, in_file)?;

            done += in_file;
            remaining -= in_file;
            offset = 0;
        }

        if remaining != 0 {
            return Err(DiskError::OutOfBounds);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        use std::os::unix::fs::FileExt;
        let len = buf.len();
        self.for_each_segment(offset, len, |file, file_off, done, n| {
            file.read_exact_at(&mut buf[done..done + n], file_off)
        })
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DiskError> {
        use std::os::unix::fs::FileExt;
        self.for_each_segment(offset, data.len(), |file, file_off, done, n| {
            file.write_all_at(&data[done..done + n], file_off)
        })
    }
}

#[async_trait]
impl DiskStore for FileStore {
    async fn register(
        &self,
        manifest: Arc<Manifest>,
        download_path: PathBuf,
    ) -> Result<(), DiskError> {
        let entry = Arc::new(TorrentFiles {
            manifest: manifest.clone(),
            base: download_path,
            handles: Mutex::new(HashMap::new()),
            fallocate: self.fallocate,
        });
        self.torrents
            .write()
            .expect("disk registry lock poisoned")
            .insert(manifest.info_hash, entry);
        Ok(())
    }

    async fn deregister(&self, info_hash: InfoHash) -> Result<(), DiskError> {
        self.torrents
            .write()
            .expect("disk registry lock poisoned")
            .remove(&info_hash);
        Ok(())
    }

    async fn read_block(&self, info_hash: InfoHash, request: Request) -> Result<Bytes, DiskError> {
        let torrent = self.torrent(info_hash)?;
        check_bounds(
            &torrent.manifest,
            request.piece_index,
            request.begin,
            request.length as usize,
        )?;

        tokio::task::spawn_blocking(move || {
            let offset = request.piece_index as u64 * torrent.manifest.piece_length as u64
                + request.begin as u64;
            let mut buf = vec![0u8; request.length as usize];
            torrent.read_at(offset, &mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| DiskError::Io(io::Error::other(e)))?
    }

    async fn write_piece(
        &self,
        info_hash: InfoHash,
        piece: u32,
        data: Bytes,
    ) -> Result<(), DiskError> {
        let torrent = self.torrent(info_hash)?;
        check_bounds(&torrent.manifest, piece, 0, data.len())?;

        tokio::task::spawn_blocking(move || {
            let offset = piece as u64 * torrent.manifest.piece_length as u64;
            torrent.write_at(offset, &data)
        })
        .await
        .map_err(|e| DiskError::Io(io::Error::other(e)))?
    }

    async fn hash_check(
        &self,
        info_hash: InfoHash,
        range: Range<u32>,
        progress: Arc<AtomicU64>,
    ) -> Result<Bitfield, DiskError> {
        let torrent = self.torrent(info_hash)?;

        tokio::task::spawn_blocking(move || {
            let manifest = &torrent.manifest;
            let mut bitmap = Bitfield::new(manifest.num_pieces());
            for piece in range.start..range.end.min(manifest.num_pieces()) {
                let len = manifest.piece_len(piece) as usize;
                let offset = piece as u64 * manifest.piece_length as u64;
                let mut buf = vec![0u8; len];
                // unreadable bytes mean the piece simply is not there yet
                if torrent.read_at(offset, &mut buf).is_ok()
                    && manifest.piece_hash(piece).map(|h| &h[..]) == Some(&Sha1::digest(&buf)[..])
                {
                    bitmap.set(piece);
                }
                progress.fetch_add(1, Ordering::Relaxed);
            }
            Ok(bitmap)
        })
        .await
        .map_err(|e| DiskError::Io(io::Error::other(e)))?
    }
}

//
// In-memory store
//

struct MemTorrent {
    manifest: Arc<Manifest>,
    data: Mutex<Vec<u8>>,
}

/// Test double keeping each payload in one flat buffer.
#[derive(Default)]
pub struct MemoryStore {
    torrents: RwLock<HashMap<InfoHash, Arc<MemTorrent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn torrent(&self, info_hash: InfoHash) -> Result<Arc<MemTorrent>, DiskError> {
        self.torrents
            .read()
            .expect("memory registry lock poisoned")
            .get(&info_hash)
            .cloned()
            .ok_or(DiskError::UnknownTorrent(info_hash))
    }

    /// Replace the whole payload, e.g. to stand up a seeding side.
    pub fn preload(&self, info_hash: InfoHash, payload: &[u8]) -> Result<(), DiskError> {
        let torrent = self.torrent(info_hash)?;
        let mut data = torrent.data.lock().expect("payload lock poisoned");
        if payload.len() != data.len() {
            return Err(DiskError::OutOfBounds);
        }
        data.copy_from_slice(payload);
        Ok(())
    }

    /// Snapshot of the stored payload bytes.
    pub fn payload(&self, info_hash: InfoHash) -> Result<Vec<u8>, DiskError> {
        let torrent = self.torrent(info_hash)?;
        let data = torrent.data.lock().expect("payload lock poisoned").clone();
        Ok(data)
    }
}

#[async_trait]
impl DiskStore for MemoryStore {
    async fn register(
        &self,
        manifest: Arc<Manifest>,
        _download_path: PathBuf,
    ) -> Result<(), DiskError> {
        let entry = Arc::new(MemTorrent {
            data: Mutex::new(vec![0u8; manifest.total_length as usize]),
            manifest: manifest.clone(),
        });
        self.torrents
            .write()
            .expect("memory registry lock poisoned")
            .insert(manifest.info_hash, entry);
        Ok(())
    }

    async fn deregister(&self, info_hash: InfoHash) -> Result<(), DiskError> {
        self.torrents
            .write()
            .expect("memory registry lock poisoned")
            .remove(&info_hash);
        Ok(())
    }

    async fn read_block(&self, info_hash: InfoHash, request: Request) -> Result<Bytes, DiskError> {
        let torrent = self.torrent(info_hash)?;
        check_bounds(
            &torrent.manifest,
            request.piece_index,
            request.begin,
            request.length as usize,
        )?;

        let offset = request.piece_index as usize * torrent.manifest.piece_length as usize
            + request.begin as usize;
        let data = torrent.data.lock().expect("payload lock poisoned");
        Ok(Bytes::copy_from_slice(
            &data[offset..offset + request.length as usize],
        ))
    }

    async fn write_piece(
        &self,
        info_hash: InfoHash,
        piece: u32,
        data: Bytes,
    ) -> Result<(), DiskError> {
        let torrent = self.torrent(info_hash)?;
        check_bounds(&torrent.manifest, piece, 0, data.len())?;

        let offset = piece as usize * torrent.manifest.piece_length as usize;
        let mut payload = torrent.data.lock().expect("payload lock poisoned");
        payload[offset..offset + data.len()].copy_from_slice(&data);
        Ok(())
    }

    async fn hash_check(
        &self,
        info_hash: InfoHash,
        range: Range<u32>,
        progress: Arc<AtomicU64>,
    ) -> Result<Bitfield, DiskError> {
        let torrent = self.torrent(info_hash)?;
        let manifest = &torrent.manifest;
        let data = torrent.data.lock().expect("payload lock poisoned");

        let mut bitmap = Bitfield::new(manifest.num_pieces());
        for piece in range.start..range.end.min(manifest.num_pieces()) {
            let offset = piece as usize * manifest.piece_length as usize;
            let len = manifest.piece_len(piece) as usize;
            let digest = Sha1::digest(&data[offset..offset + len]);
            if manifest.piece_hash(piece).map(|h| &h[..]) == Some(&digest[..]) {
                bitmap.set(piece);
            }
            progress.fetch_add(1, Ordering::Relaxed);
        }
        Ok(bitmap)
    }
}
