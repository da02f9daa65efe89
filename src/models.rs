//! Data models for the push relay.
//!
//! Notifications are immutable once built by the front end. Router data is an
//! opaque, flat key/value record owned by storage; routers only read it and
//! may hand back a complete replacement.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// User-agent identifier (opaque to routers)
pub type Uaid = String;

/// Well-known keys inside a [`RouterData`] record.
pub mod keys {
    /// Owning user-agent identifier
    pub const UAID: &str = "uaid";
    /// Which router delivers for this UAID
    pub const ROUTER_TYPE: &str = "router_type";
    /// Address of the connection node currently holding the client
    pub const NODE_ID: &str = "node_id";
    /// Unix timestamp (ms) of the client's connection to `node_id`
    pub const CONNECTED_AT: &str = "connected_at";
    /// Bridged device token (APNs / GCM)
    pub const TOKEN: &str = "token";
}

// ============================================================================
// Notification
// ============================================================================

/// Notification version, either numeric or an opaque string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    Int(u64),
    Str(String),
}

impl Version {
    /// Version derived from the current unix time
    pub fn now() -> Self {
        Version::Int(Utc::now().timestamp().max(1) as u64)
    }

    /// Normalize a client-supplied version.
    ///
    /// Missing, zero or non-numeric versions are replaced by the current time.
    pub fn from_client(raw: Option<Version>) -> Self {
        match raw {
            Some(Version::Int(v)) if v >= 1 => Version::Int(v),
            Some(Version::Str(s)) => match s.trim().parse::<u64>() {
                Ok(v) if v >= 1 => Version::Int(v),
                _ => Self::now(),
            },
            _ => Self::now(),
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Version::Int(v) => Some(*v),
            Version::Str(_) => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Int(v) => write!(f, "{v}"),
            Version::Str(s) => f.write_str(s),
        }
    }
}

/// A notification addressed to one channel of a UAID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Notification {
    pub fn new(channel_id: impl Into<String>, version: Version, data: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            version,
            data,
        }
    }
}

// ============================================================================
// Router data
// ============================================================================

/// Per-UAID, per-router delivery metadata.
///
/// Always handled as a complete record: routers that return one expect the
/// caller to persist it as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterData(Map<String, Value>);

impl RouterData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Non-empty string value for `key`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn uaid(&self) -> Option<&str> {
        self.get_str(keys::UAID)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.get_str(keys::NODE_ID)
    }

    pub fn token(&self) -> Option<&str> {
        self.get_str(keys::TOKEN)
    }

    /// Router type recorded for this UAID, defaulting to simplepush
    pub fn router_type(&self) -> Result<RouterType, UnknownRouterType> {
        match self.get_str(keys::ROUTER_TYPE) {
            Some(raw) => raw.parse(),
            None => Ok(RouterType::SimplePush),
        }
    }
}

impl From<Map<String, Value>> for RouterData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Closed set of delivery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouterType {
    #[default]
    SimplePush,
    Apns,
    Gcm,
}

impl RouterType {
    pub const ALL: [RouterType; 3] = [RouterType::SimplePush, RouterType::Apns, RouterType::Gcm];

    pub fn as_str(self) -> &'static str {
        match self {
            RouterType::SimplePush => "simplepush",
            RouterType::Apns => "apns",
            RouterType::Gcm => "gcm",
        }
    }
}

impl fmt::Display for RouterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown router type: {0}")]
pub struct UnknownRouterType(pub String);

impl FromStr for RouterType {
    type Err = UnknownRouterType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RouterType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownRouterType(s.to_string()))
    }
}

// === API Request/Response Models ===

/// PUT /push/{uaid}/{channel_id} body
#[derive(Debug, Default, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub data: Option<String>,
}

/// POST /register/{router_type} body
///
/// Everything besides `uaid` is router input (e.g. `token`).
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub uaid: Option<String>,
    #[serde(flatten)]
    pub router_input: RouterData,
}

/// Register response
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub uaid: Uaid,
    pub router_type: RouterType,
    pub router_data: RouterData,
}

/// PUT /node/:uaid body, sent by a connection node when a client connects
#[derive(Debug, Deserialize)]
pub struct NodeRegistrationRequest {
    pub node_id: String,
    /// Connection time in unix milliseconds; defaults to now
    #[serde(default)]
    pub connected_at: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct NodeRegistrationResponse {
    /// `false` when a newer connection is already recorded
    pub registered: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub routers: Vec<RouterType>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}
