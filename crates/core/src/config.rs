//! Configuration types shared across crates.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Maximum bytes per streamed chunk; also sizes gRPC message limits.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum total payload of a batch read or update.
    #[serde(default = "default_max_batch_total_size")]
    pub max_batch_total_size: u64,
    /// Maximum digests accepted by a single FindMissingBlobs call.
    #[serde(default = "default_max_find_missing_digests")]
    pub max_find_missing_digests: usize,
    /// Concurrent existence checks issued per request.
    #[serde(default = "default_existence_check_concurrency")]
    pub existence_check_concurrency: usize,
    /// Whether clients may write to the Action Cache.
    #[serde(default = "default_true")]
    pub ac_update_enabled: bool,
    /// Enable the /metrics endpoint for Prometheus scraping.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Timeout for the startup backend health check, in seconds.
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

/// Default listen address honours `$PORT` like most container platforms.
fn default_listen_addr() -> String {
    match std::env::var("PORT") {
        Ok(port) if !port.is_empty() => format!("0.0.0.0:{port}"),
        _ => "0.0.0.0:8080".to_string(),
    }
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_batch_total_size() -> u64 {
    crate::DEFAULT_MAX_BATCH_TOTAL_SIZE
}

fn default_max_find_missing_digests() -> usize {
    crate::DEFAULT_MAX_FIND_MISSING_DIGESTS
}

fn default_existence_check_concurrency() -> usize {
    32
}

fn default_health_check_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_chunk_size: default_max_chunk_size(),
            max_batch_total_size: default_max_batch_total_size(),
            max_find_missing_digests: default_max_find_missing_digests(),
            existence_check_concurrency: default_existence_check_concurrency(),
            ac_update_enabled: true,
            metrics_enabled: true,
            health_check_timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Health check timeout as a Duration.
    pub fn health_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_timeout_secs)
    }

    /// Chunk size as usize, saturating on narrow targets.
    pub fn max_chunk_size_usize(&self) -> usize {
        usize::try_from(self.max_chunk_size).unwrap_or(usize::MAX)
    }

    /// Validate server limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size == 0 {
            return Err("server.max_chunk_size must be greater than 0".to_string());
        }
        if self.max_batch_total_size == 0 {
            return Err("server.max_batch_total_size must be greater than 0".to_string());
        }
        if self.max_chunk_size > self.max_batch_total_size {
            return Err(format!(
                "server.max_chunk_size ({}) must not exceed server.max_batch_total_size ({})",
                self.max_chunk_size, self.max_batch_total_size
            ));
        }
        if self.max_find_missing_digests == 0 {
            return Err("server.max_find_missing_digests must be greater than 0".to_string());
        }
        if self.existence_check_concurrency == 0 {
            return Err("server.existence_check_concurrency must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cache URI selecting the backend, e.g. `file:///var/cache/larder`.
    #[serde(default = "default_cache_uri")]
    pub uri: String,
    /// Access key ID for object storage. Falls back to the default credential chain.
    /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
    pub access_key_id: Option<String>,
    /// Secret access key for object storage.
    pub secret_access_key: Option<String>,
}

fn default_cache_uri() -> String {
    "file://./data/cache".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uri: default_cache_uri(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.uri.parse::<CacheUri>().map_err(|e| e.to_string())?;
        match (self.access_key_id.as_ref(), self.secret_access_key.as_ref()) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => Err(
                "storage requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Binds to an ephemeral loopback port and stores
    /// blobs under `root`.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                ..ServerConfig::default()
            },
            storage: StorageConfig {
                uri: format!("file://{}", root.display()),
                ..StorageConfig::default()
            },
        }
    }

    /// Validate the full configuration.
    pub fn validate(&self) -> crate::Result<()> {
        self.server.validate().map_err(crate::Error::Config)?;
        self.storage.validate().map_err(crate::Error::Config)?;
        Ok(())
    }
}

/// A parsed cache URI: `scheme://authority/path?key=value`.
///
/// Interpretation of the parts is left to the backend registered for the
/// scheme. For `file` URIs the authority and path together form the
/// directory, so `file://relative/dir` and `file:///abs/dir` both work.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheUri {
    scheme: String,
    authority: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl CacheUri {
    /// Parse a cache URI.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let invalid = |msg: &str| crate::Error::InvalidCacheUri(format!("{msg}: {input}"));

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid scheme"));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match location.find('/') {
            Some(idx) => (&location[..idx], &location[idx..]),
            None => (location, ""),
        };

        let mut params = BTreeMap::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(decode(key, input)?, decode(value, input)?);
        }

        let uri = Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: decode(authority, input)?,
            path: decode(path, input)?,
            params,
        };
        if uri.authority.is_empty() && uri.path.trim_matches('/').is_empty() {
            return Err(invalid("missing location"));
        }
        Ok(uri)
    }

    /// Lowercased scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Authority component (bucket name for object stores).
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Path component, including its leading `/` when present.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path with surrounding slashes removed, or `None` when empty.
    pub fn prefix(&self) -> Option<&str> {
        let trimmed = self.path.trim_matches('/');
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Look up a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Look up a boolean query parameter (`true`/`false`/`1`/`0`).
    pub fn bool_param(&self, key: &str) -> crate::Result<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some("true" | "1" | "yes") => Ok(Some(true)),
            Some("false" | "0" | "no") => Ok(Some(false)),
            Some(other) => Err(crate::Error::InvalidCacheUri(format!(
                "parameter {key} expects a boolean, got {other:?}"
            ))),
        }
    }

    /// Filesystem directory named by a `file` URI.
    pub fn filesystem_root(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.authority, self.path))
    }
}

fn decode(part: &str, input: &str) -> crate::Result<String> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| crate::Error::InvalidCacheUri(format!("invalid percent-encoding: {input}")))
}

impl FromStr for CacheUri {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CacheUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
        // Parameter values are omitted: they may carry endpoints or tokens
        // that do not belong in logs.
        if !self.params.is_empty() {
            let keys: Vec<_> = self.params.keys().map(String::as_str).collect();
            write!(f, "?[{}]", keys.join(","))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheUri({self})")
    }
}
