//! Configuration for the push relay.
//!
//! All configuration is loaded from environment variables, layered over
//! [`Config::default`]. No secrets are logged.

use std::str::FromStr;
use std::time::Duration;

/// Default GCM send endpoint
pub const GCM_ENDPOINT: &str = "https://android.googleapis.com/gcm/send";

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,

    /// Server port
    pub port: u16,

    /// Enable permissive CORS on the endpoint
    pub enable_cors: bool,

    // === Limits ===
    /// Maximum notification payload in bytes (default: 4KB)
    pub max_data: usize,

    /// Pending notifications kept per UAID by the in-memory storage
    pub max_pending_per_uaid: usize,

    // === Node bridge ===
    /// Connect/request timeout when talking to connection nodes
    pub node_timeout: Duration,

    /// How long a failed node stays marked dead (default: 5 minutes)
    pub dead_node_ttl: Duration,

    /// Maximum dead-node entries before the oldest are dropped
    pub dead_node_capacity: usize,

    /// Dead-node sweep interval (default: 60 seconds)
    pub cleanup_interval: Duration,

    // === APNS Configuration ===
    /// APNS team ID
    pub apns_team_id: Option<String>,

    /// APNS key ID
    pub apns_key_id: Option<String>,

    /// Path to APNS private key (.p8 file)
    pub apns_key_path: Option<String>,

    /// APNS bundle ID (app identifier)
    pub apns_bundle_id: Option<String>,

    /// Use APNS sandbox (development) environment
    pub apns_sandbox: bool,

    /// Alert title shown on the device
    pub apns_title: String,

    /// Bound on messages awaiting APNS feedback
    pub apns_max_pending: usize,

    // === GCM Configuration ===
    /// GCM server API key
    pub gcm_api_key: Option<String>,

    pub gcm_endpoint: String,

    /// `time_to_live` in seconds
    pub gcm_ttl: u64,

    pub gcm_collapse_key: String,

    pub gcm_dry_run: bool,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: env_parse("PORT").unwrap_or(defaults.port),
            enable_cors: env_flag("ENABLE_CORS").unwrap_or(defaults.enable_cors),

            max_data: env_parse("MAX_DATA").unwrap_or(defaults.max_data),
            max_pending_per_uaid: env_parse("MAX_PENDING_PER_UAID")
                .unwrap_or(defaults.max_pending_per_uaid),

            node_timeout: env_secs("NODE_TIMEOUT_SECS").unwrap_or(defaults.node_timeout),
            dead_node_ttl: env_secs("DEAD_NODE_TTL_SECS").unwrap_or(defaults.dead_node_ttl),
            dead_node_capacity: env_parse("DEAD_NODE_CAPACITY")
                .unwrap_or(defaults.dead_node_capacity),
            cleanup_interval: env_secs("CLEANUP_INTERVAL_SECS")
                .unwrap_or(defaults.cleanup_interval),

            // APNS
            apns_team_id: std::env::var("APNS_TEAM_ID").ok(),
            apns_key_id: std::env::var("APNS_KEY_ID").ok(),
            apns_key_path: std::env::var("APNS_KEY_PATH").ok(),
            apns_bundle_id: std::env::var("APNS_BUNDLE_ID").ok(),
            apns_sandbox: env_flag("APNS_SANDBOX").unwrap_or(defaults.apns_sandbox),
            apns_title: std::env::var("APNS_TITLE").unwrap_or(defaults.apns_title),
            apns_max_pending: env_parse("APNS_MAX_PENDING").unwrap_or(defaults.apns_max_pending),

            // GCM
            gcm_api_key: std::env::var("GCM_API_KEY").ok().filter(|k| !k.is_empty()),
            gcm_endpoint: std::env::var("GCM_ENDPOINT").unwrap_or(defaults.gcm_endpoint),
            gcm_ttl: env_parse("GCM_TTL_SECS").unwrap_or(defaults.gcm_ttl),
            gcm_collapse_key: std::env::var("GCM_COLLAPSE_KEY")
                .unwrap_or(defaults.gcm_collapse_key),
            gcm_dry_run: env_flag("GCM_DRY_RUN").unwrap_or(defaults.gcm_dry_run),
        }
    }

    /// Check if APNS is configured
    pub fn apns_configured(&self) -> bool {
        self.apns_team_id.is_some()
            && self.apns_key_id.is_some()
            && self.apns_key_path.is_some()
            && self.apns_bundle_id.is_some()
    }

    /// Check if GCM is configured
    pub fn gcm_configured(&self) -> bool {
        self.gcm_api_key.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8082,
            enable_cors: false,
            max_data: 4096,
            max_pending_per_uaid: 100,
            node_timeout: Duration::from_secs(5),
            dead_node_ttl: Duration::from_secs(300),
            dead_node_capacity: 150,
            cleanup_interval: Duration::from_secs(60),
            apns_team_id: None,
            apns_key_id: None,
            apns_key_path: None,
            apns_bundle_id: None,
            apns_sandbox: true, // Default to sandbox for safety
            apns_title: "SimplePush".to_string(),
            apns_max_pending: 100,
            gcm_api_key: None,
            gcm_endpoint: GCM_ENDPOINT.to_string(),
            gcm_ttl: 60,
            gcm_collapse_key: "simplepush".to_string(),
            gcm_dry_run: false,
        }
    }
}
