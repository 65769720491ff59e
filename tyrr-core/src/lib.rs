pub mod bitfield;
pub mod client;
pub mod config;
pub mod disk;
pub mod download;
pub mod peer;
pub mod resume;

pub use bitfield::Bitfield;
pub use client::{Client, ClientError};
pub use config::{Config, ConfigError, CryptoMode};
pub use disk::{DiskError, DiskStore, FileStore, MemoryStore};
pub use download::{DownloadError, DownloadHandle, DownloadStats, TaskState};
pub use peer::{PeerSession, SessionError, Transport};
