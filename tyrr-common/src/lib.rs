pub mod manifest;
pub mod types;

pub use manifest::{FileSpec, Manifest};
pub use types::{InfoHash, PeerId};
