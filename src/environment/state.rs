//! Serialized environment state and history records.
//!
//! The state note is self-describing JSON with an explicit schema version so
//! later releases can add fields without breaking reconstruction. Secrets are
//! stored by reference only; resolved values never reach git.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Everything needed to rebuild an environment's container, minus the
/// ephemeral parts (history, container handle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Opaque references (`NAME=env://VAR`, `NAME=file:///path`), never values.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub instructions: String,
}

impl EnvironmentState {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Decode the most recent state from a note. Notes are append-only, so a
    /// note may hold several concatenated JSON documents; the last one wins.
    pub fn decode_latest(note: &str) -> serde_json::Result<Self> {
        let mut latest: Option<serde_json::Result<Self>> = None;
        for doc in serde_json::Deserializer::from_str(note).into_iter::<Self>() {
            match doc {
                Ok(state) => latest = Some(Ok(state)),
                Err(e) if latest.is_none() => latest = Some(Err(e)),
                Err(_) => break,
            }
        }
        latest.unwrap_or_else(|| Self::decode(note))
    }

    /// Decode the most recent state for one environment. Initial commits can
    /// be shared between branches (every environment created from the same
    /// source HEAD anchors its first note on that commit), so the note is
    /// filtered by ID; `None` when no document belongs to `env_id`.
    pub fn decode_latest_for(note: &str, env_id: &str) -> Option<Self> {
        let mut latest = None;
        for doc in serde_json::Deserializer::from_str(note).into_iter::<Self>() {
            match doc {
                Ok(state) if state.id == env_id => latest = Some(state),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        latest
    }
}

/// One record per mutating operation, mirrored to git notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(name: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            explanation: explanation.into(),
            command: None,
            output: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self.output = Some(output.into());
        self
    }
}

/// Render the log-note payload for a command commit.
pub fn format_log_note(command: &str, explanation: &str, output: &str) -> String {
    format!("COMMAND: {command}\nEXPLANATION: {explanation}\nOUTPUT:\n{output}")
}
