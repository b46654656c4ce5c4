use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of the random part of a local id.
const LOCAL_ID_SUFFIX_LEN: usize = 8;

/// Domain object carried by a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
  Workout,
  Program,
}

impl RecordKind {
  /// Remote collection holding documents of this kind.
  pub fn collection(self) -> &'static str {
    match self {
      RecordKind::Workout => "workouts",
      RecordKind::Program => "programs",
    }
  }
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RecordKind::Workout => write!(f, "workout"),
      RecordKind::Program => write!(f, "program"),
    }
  }
}

impl FromStr for RecordKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "workout" | "workouts" => Ok(RecordKind::Workout),
      "program" | "programs" => Ok(RecordKind::Program),
      other => Err(format!("unknown record kind '{}' (expected workout or program)", other)),
    }
  }
}

/// A write waiting for confirmation from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
  /// Client-generated id, also used as the remote upsert key
  pub local_id: String,
  /// Set once the remote store confirmed the write
  pub remote_id: Option<String>,
  pub kind: RecordKind,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Sync attempts made so far, never above the configured maximum
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl QueuedRecord {
  pub fn new(local_id: String, kind: RecordKind, payload: serde_json::Value) -> Self {
    Self {
      local_id,
      remote_id: None,
      kind,
      payload,
      enqueued_at: Utc::now(),
      attempts: 0,
      last_error: None,
    }
  }

  pub fn is_exhausted(&self, max_attempts: u32) -> bool {
    self.attempts >= max_attempts
  }
}

/// Generate a local id: millisecond timestamp plus a random suffix.
pub fn new_local_id() -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(LOCAL_ID_SUFFIX_LEN)
    .map(|c| char::from(c).to_ascii_lowercase())
    .collect();
  format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}
