//! Durable, append-only transition log.
//!
//! Every status transition is appended to a per-epic sled tree under a
//! monotonically increasing sequence key; nothing is ever overwritten, so the
//! full history stays reconstructable for audit and resume. A zstd-compressed
//! snapshot of the finished run is kept in a separate tree for reporting
//! collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::errors::{EpicError, Result};
use crate::model::{EpicRun, EpicStatus, SprintStatus};

/// Typed run events. Sprint transitions carry the transition detail; epic and
/// layer markers have `sprint_id: None` in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    EpicStarted {
        name: String,
    },
    EpicResumed,
    LayerStarted {
        layer: usize,
    },
    SprintTransition {
        status: SprintStatus,
        reason: Option<String>,
        actual_hours: Option<f64>,
    },
    LayerFinished {
        layer: usize,
    },
    EpicFinished {
        status: EpicStatus,
    },
}

/// Envelope for one appended event: `{event_id, epic_id, sprint_id | null,
/// event_type, timestamp, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub event_id: String,
    pub epic_id: String,
    pub sprint_id: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
    pub payload: Value,
}

impl TransitionEvent {
    pub fn new(
        epic_id: &str,
        sprint_id: Option<String>,
        timestamp: DateTime<Utc>,
        event: RunEvent,
        payload: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            epic_id: epic_id.to_string(),
            sprint_id,
            sequence: 0,
            timestamp,
            event,
            payload,
        }
    }
}

pub struct TransitionStore {
    db: sled::Db,
}

impl TransitionStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        info!(path, "opened transition store");
        Ok(Self { db })
    }

    /// In-memory store for tests; dropped with the process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn transitions_tree(&self, epic_id: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("transitions:{}", epic_id))?)
    }

    fn snapshots_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree("epic_snapshots")?)
    }

    /// Appends one event, assigning the next sequence number for the epic.
    /// The tracker is the single writer, so last-key+1 is race-free.
    pub fn append(&self, event: &TransitionEvent) -> Result<u64> {
        let tree = self.transitions_tree(&event.epic_id)?;
        let sequence = match tree.last()? {
            Some((key, _)) => decode_sequence(&key)? + 1,
            None => 0,
        };
        let mut stamped = event.clone();
        stamped.sequence = sequence;
        tree.insert(sequence.to_be_bytes(), serde_json::to_vec(&stamped)?)?;
        debug!(epic_id = %event.epic_id, sequence, "appended transition event");
        Ok(sequence)
    }

    /// Loads the full event history for an epic in append order.
    pub fn load(&self, epic_id: &str) -> Result<Vec<TransitionEvent>> {
        let tree = self.transitions_tree(epic_id)?;
        let mut events = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, value) = entry?;
            events.push(serde_json::from_slice(&value)?);
        }
        Ok(events)
    }

    pub fn has_history(&self, epic_id: &str) -> Result<bool> {
        Ok(!self.transitions_tree(epic_id)?.is_empty())
    }

    /// Persists the finished run, zstd-compressed, keyed by epic id.
    pub fn save_snapshot(&self, run: &EpicRun) -> Result<()> {
        let serialized = serde_json::to_vec(run)?;
        let compressed = zstd::encode_all(&*serialized, 3)
            .map_err(|e| EpicError::database("zstd_encode", e))?;
        self.snapshots_tree()?
            .insert(run.epic_id.as_bytes(), compressed)?;
        debug!(epic_id = %run.epic_id, "saved epic snapshot");
        Ok(())
    }

    pub fn load_snapshot(&self, epic_id: &str) -> Result<Option<EpicRun>> {
        let tree = self.snapshots_tree()?;
        match tree.get(epic_id.as_bytes())? {
            Some(compressed) => {
                let bytes = zstd::decode_all(&compressed[..])
                    .map_err(|e| EpicError::database("zstd_decode", e))?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_sequence(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| EpicError::internal("malformed transition log key"))?;
    Ok(u64::from_be_bytes(bytes))
}
