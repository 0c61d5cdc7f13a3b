//! Runtime configuration: master secret loading and settings.
//!
//! # Master secret sources
//!
//! Precedence (highest first):
//! - `CLINVAULT_MASTER_KEY_FD` (read once from an already-open FD, then closed)
//! - `CLINVAULT_MASTER_KEY_FILE` (read from a file path)
//! - `/run/secrets/clinvault_master_key` (Docker/Compose secret default)
//! - `CLINVAULT_MASTER_KEY` (plain environment variable)
//!
//! The secret is 32 bytes encoded as 64 hex characters. A missing or malformed
//! secret is fatal at startup.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use zeroize::Zeroizing;

use crate::domain::{KdfError, MasterSecret};

pub const MASTER_KEY_FD_ENV: &str = "CLINVAULT_MASTER_KEY_FD";
pub const MASTER_KEY_FILE_ENV: &str = "CLINVAULT_MASTER_KEY_FILE";
pub const MASTER_KEY_DOCKER_SECRET_PATH: &str = "/run/secrets/clinvault_master_key";
pub const MASTER_KEY_ENV: &str = "CLINVAULT_MASTER_KEY";

const DB_PATH_ENV: &str = "CLINVAULT_DB_PATH";
const KEY_LIFETIME_DAYS_ENV: &str = "CLINVAULT_KEY_LIFETIME_DAYS";
const DEFAULT_DB_PATH: &str = "clinvault.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "Missing master key: provide {MASTER_KEY_FD_ENV}, {MASTER_KEY_FILE_ENV}, {MASTER_KEY_ENV} (or mount {MASTER_KEY_DOCKER_SECRET_PATH})"
    )]
    MissingMasterKey,

    #[error("Invalid master key: {0}")]
    InvalidMasterKey(#[from] KdfError),

    #[error("Failed reading master key from {source_name}: {message}")]
    Unreadable {
        source_name: &'static str,
        message: String,
    },
}

/// Where the master secret may come from. [`SecretSources::from_env`] is the
/// production constructor; tests build one directly.
#[derive(Default)]
pub struct SecretSources {
    pub fd: Option<String>,
    pub file: Option<PathBuf>,
    pub docker_secret: Option<PathBuf>,
    pub env_value: Option<Zeroizing<String>>,
}

impl SecretSources {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            fd: std::env::var(MASTER_KEY_FD_ENV).ok(),
            file: std::env::var(MASTER_KEY_FILE_ENV)
                .ok()
                .map(|p| PathBuf::from(p.trim())),
            docker_secret: Some(PathBuf::from(MASTER_KEY_DOCKER_SECRET_PATH)),
            env_value: std::env::var(MASTER_KEY_ENV).ok().map(Zeroizing::new),
        }
    }
}

/// Load the master secret from the process environment.
///
/// # Errors
/// `MissingMasterKey` if no source is configured, `InvalidMasterKey` if the
/// value is not 64 hex characters.
pub fn load_master_secret() -> Result<MasterSecret, ConfigError> {
    load_master_secret_from(&SecretSources::from_env())
}

/// Load the master secret from explicit sources.
///
/// # Errors
/// Same as [`load_master_secret`].
pub fn load_master_secret_from(sources: &SecretSources) -> Result<MasterSecret, ConfigError> {
    let raw = read_raw_secret(sources)?;
    let secret = raw.trim_end_matches(['\n', '\r']);
    if secret.is_empty() {
        return Err(ConfigError::MissingMasterKey);
    }
    Ok(MasterSecret::from_hex(secret)?)
}

fn read_raw_secret(sources: &SecretSources) -> Result<Zeroizing<String>, ConfigError> {
    #[cfg(unix)]
    if let Some(fd_str) = &sources.fd {
        use std::io::Read;
        use std::os::unix::io::FromRawFd;

        let fd: i32 = fd_str.trim().parse().map_err(|_| ConfigError::MissingMasterKey)?;
        if fd <= 2 {
            return Err(ConfigError::MissingMasterKey);
        }

        // SAFETY: the FD is handed to us for a one-time secret read; we take
        // ownership and close it on drop.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut buf = Zeroizing::new(String::new());
        file.read_to_string(&mut buf)
            .map_err(|e| ConfigError::Unreadable {
                source_name: MASTER_KEY_FD_ENV,
                message: e.to_string(),
            })?;
        return Ok(buf);
    }

    if let Some(path) = &sources.file {
        return read_secret_file(path, MASTER_KEY_FILE_ENV);
    }

    if let Some(path) = &sources.docker_secret {
        if path.exists() {
            return read_secret_file(path, "docker secret");
        }
    }

    if let Some(value) = &sources.env_value {
        return Ok(value.clone());
    }

    Err(ConfigError::MissingMasterKey)
}

fn read_secret_file(path: &Path, source_name: &'static str) -> Result<Zeroizing<String>, ConfigError> {
    fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|e| ConfigError::Unreadable {
            source_name,
            message: e.to_string(),
        })
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Lifetime applied to newly created keys. `None` means keys never expire.
    pub key_lifetime: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            key_lifetime: None,
        }
    }
}

impl Settings {
    /// Load overrides from environment (best-effort).
    ///
    /// Supported:
    /// - CLINVAULT_DB_PATH
    /// - CLINVAULT_KEY_LIFETIME_DAYS (positive integer)
    #[must_use]
    pub fn from_env_or_default() -> Self {
        let mut settings = Self::default();

        if let Ok(v) = std::env::var(DB_PATH_ENV) {
            let v = v.trim();
            if !v.is_empty() {
                settings.db_path = PathBuf::from(v);
            }
        }

        if let Ok(v) = std::env::var(KEY_LIFETIME_DAYS_ENV) {
            settings.key_lifetime = parse_lifetime_days(&v);
            if settings.key_lifetime.is_none() {
                tracing::warn!(value = %v, "Ignoring invalid {KEY_LIFETIME_DAYS_ENV}");
            }
        }

        settings
    }
}

fn parse_lifetime_days(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|&days| days > 0 && days <= 36_500)
        .map(Duration::days)
}
