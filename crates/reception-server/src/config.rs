//! Reception configuration loaded from environment variables.
//!
//! Everything except the system public key has a default so the service
//! can start with minimal configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Reception configuration.
#[derive(Debug, Clone)]
pub struct ReceptionConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:2444`
    pub http_addr: SocketAddr,

    /// Root of the staging area (`upload/` and `ready/` live below it).
    /// Env: `STAGING_PATH`
    /// Default: `./staging`
    pub staging_path: PathBuf,

    /// WebSocket URL of the broker gateway. Startup fails when unset.
    /// Env: `BROKER_URL` (empty string unsets)
    /// Default: `ws://mq:8443/reception`
    pub broker_url: Option<String>,

    /// X25519 public key every upload stream is first encrypted for
    /// (hex-encoded, 64 chars).
    /// Env: `SYSTEM_PUBLIC_KEY`
    /// Default: none, startup fails without it.
    pub system_public_key: Option<[u8; 32]>,

    /// Concurrent file intakes allowed system-wide.
    /// Env: `UPLOAD_CONCURRENCY`
    pub upload_concurrency: usize,

    /// Concurrent message submissions allowed system-wide.
    /// Env: `SUBMIT_CONCURRENCY`
    pub submit_concurrency: usize,

    /// How long a submission waits for the broker link.
    /// Env: `PRODUCER_WAIT_SECS`
    pub producer_wait: Duration,

    /// Broker round-trip timeout for message submission.
    /// Env: `SUBMIT_TIMEOUT_SECS`
    pub submit_timeout: Duration,

    /// Broker round-trip timeout for certificate queries.
    /// Env: `CERTIFICATE_TIMEOUT_SECS`
    pub certificate_timeout: Duration,

    /// Upper bound on in-flight correlated requests.
    /// Env: `MAX_PENDING_REPLIES`
    pub max_pending_replies: usize,

    /// Env: `KEYRING_REFRESH_SECS`
    pub keyring_refresh_interval: Duration,

    /// Delay before retrying a refresh that loaded nothing.
    /// Env: `KEYRING_RETRY_SECS`
    /// Default: 30 s
    pub keyring_retry_interval: Duration,

    /// Env: `KEYRING_PRUNE_SECS`
    pub keyring_prune_interval: Duration,

    /// Age past which a keyring entry is pruned.
    pub keyring_staleness: Duration,

    /// Keep the newest keyring entry when pruning would empty the cache.
    /// Env: `KEYRING_KEEP_LAST` (true/false)
    /// Default: `true`
    pub keyring_keep_last: bool,

    /// Staged batches older than this are swept.
    /// Env: `STAGING_MAX_AGE_SECS`
    /// Default: 3 days
    pub staging_max_age: Duration,

    /// Request body limit (multipart uploads included).
    /// Env: `MAX_BODY_SIZE`
    /// Default: 100 MiB
    pub max_body_size: usize,
}

impl Default for ReceptionConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 2444).into(),
            staging_path: PathBuf::from("./staging"),
            broker_url: Some("ws://mq:8443/reception".to_string()),
            system_public_key: None,
            upload_concurrency: 5,
            submit_concurrency: 3,
            producer_wait: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(10),
            certificate_timeout: Duration::from_secs(5),
            max_pending_replies: 50,
            keyring_refresh_interval: Duration::from_secs(10 * 60),
            keyring_retry_interval: Duration::from_secs(30),
            keyring_prune_interval: Duration::from_secs(20 * 60),
            keyring_staleness: Duration::from_secs(20 * 60),
            keyring_keep_last: true,
            staging_max_age: Duration::from_secs(3 * 24 * 3600),
            max_body_size: 100 * 1024 * 1024, // 100 MiB
        }
    }
}

impl ReceptionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("STAGING_PATH") {
            config.staging_path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("BROKER_URL") {
            config.broker_url = if url.is_empty() { None } else { Some(url) };
        }

        if let Ok(hex_key) = std::env::var("SYSTEM_PUBLIC_KEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.system_public_key = Some(key),
                Err(e) => tracing::warn!(error = %e, "Invalid SYSTEM_PUBLIC_KEY"),
            }
        }

        read_usize("UPLOAD_CONCURRENCY", &mut config.upload_concurrency);
        read_usize("SUBMIT_CONCURRENCY", &mut config.submit_concurrency);
        read_usize("MAX_PENDING_REPLIES", &mut config.max_pending_replies);
        read_usize("MAX_BODY_SIZE", &mut config.max_body_size);

        read_secs("PRODUCER_WAIT_SECS", &mut config.producer_wait);
        read_secs("SUBMIT_TIMEOUT_SECS", &mut config.submit_timeout);
        read_secs("CERTIFICATE_TIMEOUT_SECS", &mut config.certificate_timeout);
        read_secs("KEYRING_REFRESH_SECS", &mut config.keyring_refresh_interval);
        read_secs("KEYRING_RETRY_SECS", &mut config.keyring_retry_interval);
        read_secs("KEYRING_PRUNE_SECS", &mut config.keyring_prune_interval);
        read_secs("STAGING_MAX_AGE_SECS", &mut config.staging_max_age);

        if let Ok(val) = std::env::var("KEYRING_KEEP_LAST") {
            config.keyring_keep_last = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn read_usize(name: &str, target: &mut usize) {
    if let Ok(val) = std::env::var(name) {
        match val.parse::<usize>() {
            Ok(n) if n > 0 => *target = n,
            _ => tracing::warn!(var = name, value = %val, "Invalid value, using default"),
        }
    }
}

fn read_secs(name: &str, target: &mut Duration) {
    if let Ok(val) = std::env::var(name) {
        match val.parse::<u64>() {
            Ok(secs) if secs > 0 => *target = Duration::from_secs(secs),
            _ => tracing::warn!(var = name, value = %val, "Invalid value, using default"),
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex: &str) -> Result<[u8; 32], String> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }

    let bytes = hex::decode(hex).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
