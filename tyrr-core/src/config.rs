use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Transport obfuscation policy, negotiated by the crypto collaborator.
/// The core itself only ever sees the resulting byte-duplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptoMode {
    Force,
    #[default]
    Prefer,
    PreferNot,
    Disable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Application {
    pub download_dir: PathBuf,
    pub crypto: CryptoMode,
    /// Tracker HTTP concurrency.
    pub max_http_parallel: usize,
    pub p2p_port: u16,
    /// Peers requested per announce.
    pub num_want: u16,
    /// Hard cap on live transport connections.
    pub global_connections_limit: u16,
    /// Whether the disk store pre-allocates files.
    pub fallocate: bool,
}

impl Default for Application {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            crypto: CryptoMode::default(),
            max_http_parallel: 100,
            p2p_port: 6881,
            num_want: 50,
            global_connections_limit: 50,
            fallocate: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub application: Application,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("downloads")
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults; a file
    /// that exists but does not parse (including an unknown crypto mode)
    /// is a startup error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.application.crypto, CryptoMode::Prefer);
        assert_eq!(cfg.application.max_http_parallel, 100);
        assert_eq!(cfg.application.global_connections_limit, 50);
        assert!(cfg.application.download_dir.ends_with("downloads"));
    }

    #[test]
    fn parses_recognized_options() {
        let cfg: Config = toml::from_str(
            r#"
            [application]
            download-dir = "/srv/torrents"
            crypto = "prefer-not"
            max-http-parallel = 16
            p2p-port = 7001
            num-want = 30
            global-connections-limit = 10
            fallocate = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.application.download_dir, PathBuf::from("/srv/torrents"));
        assert_eq!(cfg.application.crypto, CryptoMode::PreferNot);
        assert_eq!(cfg.application.p2p_port, 7001);
        assert_eq!(cfg.application.num_want, 30);
        assert_eq!(cfg.application.global_connections_limit, 10);
        assert!(cfg.application.fallocate);
    }

    #[test]
    fn invalid_crypto_mode_is_fatal() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [application]
            crypto = "maybe"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/tyrr.toml")).unwrap();
        assert_eq!(cfg.application.crypto, CryptoMode::Prefer);
    }
}
