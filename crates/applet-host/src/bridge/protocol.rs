//! Wire protocol types for parent-applet communication.
//!
//! Both directions of the stdio pair carry the same message shape: a `kind`
//! discriminator naming the message's purpose and a free-form `data` object.

use serde::{Deserialize, Serialize};

/// Unique identifier for a registered applet.
///
/// UUID v4 so identifiers are never reused within (or across) processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppletId(uuid::Uuid);

impl AppletId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for AppletId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AppletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppletMessage {
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl AppletMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Add a payload entry, replacing any previous value under `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}
