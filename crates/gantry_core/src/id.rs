//! Identifiers for GANTRY entities.
//!
//! Ids arrive over the wire from submitters and workers, so they are opaque
//! strings rather than parsed UUIDs. Generated task ids are UUID v4.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Parse a non-empty identifier
            ///
            /// # Errors
            ///
            /// Returns error if the value is empty or contains whitespace
            pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
                let value = value.into();
                if value.is_empty() {
                    return Err(CoreError::InvalidId {
                        reason: format!("{} must not be empty", $kind),
                    });
                }
                if value.chars().any(char::is_whitespace) {
                    return Err(CoreError::InvalidId {
                        reason: format!("{} contains whitespace: {:?}", $kind, value),
                    });
                }
                Ok(Self(value))
            }

            /// Get as string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume into the inner string
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

string_id!(
    /// Task identifier
    TaskId,
    "task id"
);

string_id!(
    /// Worker identifier, chosen by the worker at registration
    WorkerId,
    "worker id"
);

string_id!(
    /// Name of a worker pool; every pool has its own queue lane
    PoolName,
    "pool name"
);

impl TaskId {
    /// Create a new random TaskId
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate_unique() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
        assert!(Uuid::parse_str(id1.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(PoolName::parse("").is_err());
        assert!(WorkerId::parse("w 1").is_err());
        assert_eq!(PoolName::parse("default").unwrap().as_str(), "default");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = WorkerId::parse("w1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"w1\"");
        let back: WorkerId = serde_json::from_str("\"w1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_from_str() {
        let pool: PoolName = "gpu".parse().unwrap();
        assert_eq!(pool.to_string(), "gpu");
    }
}
