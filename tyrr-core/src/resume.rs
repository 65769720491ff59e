use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use tyrr_common::InfoHash;

use crate::download::TaskState;

const MAGIC: &[u8; 4] = b"TYRR";
const VERSION: u16 = 1;

/// Binary snapshot of a download task, enough to restart without re-hashing.
///
/// Layout (big-endian): magic `"TYRR"`, version `u16`, info-hash (20 B),
/// bitmap length `u32` + bitmap bytes (MSB = piece 0), `downloaded u64`,
/// `uploaded u64`, `completed u64`, `state u8`, `tags_count u16` followed by
/// (`tag_len u16`, tag bytes) entries, `download_path_len u16` + path bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub info_hash: InfoHash,
    /// Raw local-bitmap bytes; the domain comes from the manifest on load.
    pub bitmap: Bytes,
    pub downloaded: u64,
    pub uploaded: u64,
    pub completed: u64,
    pub state: TaskState,
    pub tags: Vec<String>,
    pub download_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported resume version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated resume data")]
    Truncated,
    #[error("unknown state code {0}")]
    UnknownState(u8),
    #[error("non-utf8 string field")]
    InvalidUtf8,
}

fn state_code(state: TaskState) -> u8 {
    match state {
        TaskState::Downloading => 0,
        TaskState::Stopped => 1,
        TaskState::Uploading => 2,
        TaskState::Checking => 3,
        TaskState::Error => 4,
        TaskState::Moving => 5,
    }
}

fn state_from_code(code: u8) -> Result<TaskState, ResumeError> {
    Ok(match code {
        0 => TaskState::Downloading,
        1 => TaskState::Stopped,
        2 => TaskState::Uploading,
        3 => TaskState::Checking,
        4 => TaskState::Error,
        5 => TaskState::Moving,
        other => return Err(ResumeError::UnknownState(other)),
    })
}

impl ResumeData {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.bitmap.len());
        buf.put_slice(MAGIC);
        buf.put_u16(VERSION);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_u32(self.bitmap.len() as u32);
        buf.put_slice(&self.bitmap);
        buf.put_u64(self.downloaded);
        buf.put_u64(self.uploaded);
        buf.put_u64(self.completed);
        buf.put_u8(state_code(self.state));
        buf.put_u16(self.tags.len() as u16);
        for tag in &self.tags {
            buf.put_u16(tag.len() as u16);
            buf.put_slice(tag.as_bytes());
        }
        let path = self.download_path.to_string_lossy();
        buf.put_u16(path.len() as u16);
        buf.put_slice(path.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, ResumeError> {
        if src.remaining() < 4 || &src[..4] != MAGIC {
            return Err(ResumeError::BadMagic);
        }
        src.advance(4);

        if src.remaining() < 2 {
            return Err(ResumeError::Truncated);
        }
        let version = src.get_u16();
        if version != VERSION {
            return Err(ResumeError::UnsupportedVersion(version));
        }

        if src.remaining() < 20 {
            return Err(ResumeError::Truncated);
        }
        let mut hash = [0u8; 20];
        src.copy_to_slice(&mut hash);

        if src.remaining() < 4 {
            return Err(ResumeError::Truncated);
        }
        let bitmap_len = src.get_u32() as usize;
        if src.remaining() < bitmap_len {
            return Err(ResumeError::Truncated);
        }
        let bitmap = Bytes::copy_from_slice(&src[..bitmap_len]);
        src.advance(bitmap_len);

        if src.remaining() < 8 * 3 + 1 + 2 {
            return Err(ResumeError::Truncated);
        }
        let downloaded = src.get_u64();
        let uploaded = src.get_u64();
        let completed = src.get_u64();
        let state = state_from_code(src.get_u8())?;

        let tags_count = src.get_u16();
        let mut tags = Vec::with_capacity(tags_count as usize);
        for _ in 0..tags_count {
            if src.remaining() < 2 {
                return Err(ResumeError::Truncated);
            }
            let len = src.get_u16() as usize;
            if src.remaining() < len {
                return Err(ResumeError::Truncated);
            }
            let tag = std::str::from_utf8(&src[..len])
                .map_err(|_| ResumeError::InvalidUtf8)?
                .to_string();
            src.advance(len);
            tags.push(tag);
        }

        if src.remaining() < 2 {
            return Err(ResumeError::Truncated);
        }
        let path_len = src.get_u16() as usize;
        if src.remaining() < path_len {
            return Err(ResumeError::Truncated);
        }
        let path = std::str::from_utf8(&src[..path_len]).map_err(|_| ResumeError::InvalidUtf8)?;

        Ok(Self {
            info_hash: InfoHash::new(hash),
            bitmap,
            downloaded,
            uploaded,
            completed,
            state,
            tags,
            download_path: PathBuf::from(path),
        })
    }
}
