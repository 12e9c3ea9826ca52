//! Stream wire entries.
//!
//! A queued task travels as a flat field map so any stream consumer can read
//! it: `task_id`, `pool`, `payload` (the whole task as JSON), `enqueued_at`
//! (RFC 3339) and `attempts`.

use crate::error::{QueueError, QueueResult};
use gantry_core::{PoolName, Task, TaskId, Timestamp};
use std::collections::HashMap;

/// Field names of a stream entry
pub mod field {
    /// Task id
    pub const TASK_ID: &str = "task_id";
    /// Pool name
    pub const POOL: &str = "pool";
    /// Full task as JSON
    pub const PAYLOAD: &str = "payload";
    /// Enqueue time
    pub const ENQUEUED_AT: &str = "enqueued_at";
    /// Reclaim count
    pub const ATTEMPTS: &str = "attempts";
}

/// A task as it sits in a queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// The task
    pub task: Task,
    /// Reclaim count
    pub attempts: u32,
    /// When it was last put on the ready list
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    /// A fresh entry
    #[must_use]
    pub fn new(task: Task) -> Self {
        Self {
            task,
            attempts: 0,
            enqueued_at: Timestamp::now(),
        }
    }

    /// Task id
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    /// Encode as stream fields
    ///
    /// # Errors
    ///
    /// Returns error if the task cannot be serialized
    pub fn to_fields(&self) -> QueueResult<Vec<(&'static str, String)>> {
        let payload = serde_json::to_string(&self.task)
            .map_err(|e| QueueError::malformed("task", e))?;
        Ok(vec![
            (field::TASK_ID, self.task.id.to_string()),
            (field::POOL, self.task.pool.to_string()),
            (field::PAYLOAD, payload),
            (field::ENQUEUED_AT, self.enqueued_at.to_rfc3339()),
            (field::ATTEMPTS, self.attempts.to_string()),
        ])
    }

    /// Decode from stream fields
    ///
    /// `payload` is authoritative for the task; `task_id` and `pool` must
    /// agree with it. A missing `attempts` reads as zero.
    ///
    /// # Errors
    ///
    /// `Malformed` if a required field is missing or inconsistent
    pub fn from_fields(fields: &HashMap<String, String>) -> QueueResult<Self> {
        let get = |name: &'static str| {
            fields
                .get(name)
                .ok_or_else(|| QueueError::malformed("stream entry", format!("missing {}", name)))
        };
        let task: Task = serde_json::from_str(get(field::PAYLOAD)?)
            .map_err(|e| QueueError::malformed("stream entry", e))?;
        if task.id.as_str() != get(field::TASK_ID)?.as_str() {
            return Err(QueueError::malformed(
                "stream entry",
                "task_id does not match payload",
            ));
        }
        let pool = PoolName::parse(get(field::POOL)?.as_str())?;
        if task.pool != pool {
            return Err(QueueError::malformed("stream entry", "pool does not match payload"));
        }
        let enqueued_at = Timestamp::parse(get(field::ENQUEUED_AT)?)?;
        let attempts = match fields.get(field::ATTEMPTS) {
            Some(raw) => raw
                .parse()
                .map_err(|e| QueueError::malformed("stream entry", e))?,
            None => 0,
        };
        Ok(Self {
            task,
            attempts,
            enqueued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> QueueEntry {
        let Some(payload) = json!({"action": "eval", "n": 3}).as_object().cloned() else {
            panic!("object")
        };
        QueueEntry::new(Task::new(PoolName::parse("gpu").unwrap(), payload))
    }

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_fields_carry_every_column() {
        let fields = as_map(entry().to_fields().unwrap());
        for name in [
            field::TASK_ID,
            field::POOL,
            field::PAYLOAD,
            field::ENQUEUED_AT,
            field::ATTEMPTS,
        ] {
            assert!(fields.contains_key(name), "missing {}", name);
        }
        assert_eq!(fields[field::POOL], "gpu");
        assert_eq!(fields[field::ATTEMPTS], "0");
        assert!(fields[field::ENQUEUED_AT].ends_with('Z'));
    }

    #[test]
    fn test_decode_restores_entry() {
        let mut original = entry();
        original.attempts = 2;
        let decoded = QueueEntry::from_fields(&as_map(original.to_fields().unwrap())).unwrap();
        assert_eq!(decoded.task, original.task);
        assert_eq!(decoded.attempts, 2);
    }

    #[test]
    fn test_missing_attempts_reads_zero() {
        let mut fields = as_map(entry().to_fields().unwrap());
        fields.remove(field::ATTEMPTS);
        assert_eq!(QueueEntry::from_fields(&fields).unwrap().attempts, 0);
    }

    #[test]
    fn test_inconsistent_task_id_rejected() {
        let mut fields = as_map(entry().to_fields().unwrap());
        fields.insert(field::TASK_ID.to_string(), "someone-else".to_string());
        assert!(matches!(
            QueueEntry::from_fields(&fields),
            Err(QueueError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let mut fields = as_map(entry().to_fields().unwrap());
        fields.remove(field::PAYLOAD);
        assert!(QueueEntry::from_fields(&fields).is_err());
    }
}
