//! Error types for skillgate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the aggregate database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("skill not found: {skill_id}")]
    SkillNotFound { skill_id: String },

    #[error("skill already registered: {skill_id}")]
    AlreadyExists { skill_id: String },

    #[error("revision conflict for {skill_id}: expected {expected}, found {actual}")]
    RevisionConflict {
        skill_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("content not found at {location}")]
    ContentNotFound { location: String },

    #[error("content at {location} does not match digest {expected} (found {actual})")]
    DigestMismatch {
        location: String,
        expected: String,
        actual: String,
    },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("invalid storage key: {key}")]
    InvalidKey { key: String },

    #[error("invalid registry change for {skill_id}: {reason}")]
    InvalidChange { skill_id: String, reason: String },

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_transient() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(!StorageError::Backend("bad query".into()).is_transient());
        assert!(!StorageError::SkillNotFound {
            skill_id: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn io_kind_decides_transience() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(StorageError::from(timed_out).is_transient());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!StorageError::from(missing).is_transient());
    }

    #[test]
    fn revision_conflict_display() {
        let err = StorageError::RevisionConflict {
            skill_id: "greeting".into(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("greeting"));
        assert!(msg.contains("expected 3"));
    }
}
