// ABOUTME: Error taxonomy for the reconciliation engine
// ABOUTME: Separates configuration, parse, invariant and store failures

/// Errors raised by the replication engine.
///
/// Configuration and reconciliation errors always terminate a run. Parse and
/// store errors are first offered to the configured error handler, which may
/// decide to skip the offending field or object instead.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Bad schema mapping, missing keys or an invalid removal policy.
    #[error("Invalid replication settings: {0}")]
    Configuration(String),

    /// A raw value could not be coerced to the member's primitive type.
    #[error("Invalid value '{value}' for field '{alias}': {message}")]
    Parse {
        alias: String,
        value: String,
        message: String,
    },

    /// An engine invariant was violated (illegal state transition, key bucket
    /// inconsistency, fetched object not matching any pending key).
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// The backing store failed to create, update, commit or delete objects.
    #[error("Store operation '{operation}' failed: {source}")]
    Store {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ReplicationError {
    pub fn config(message: impl Into<String>) -> Self {
        ReplicationError::Configuration(message.into())
    }

    pub fn reconciliation(message: impl Into<String>) -> Self {
        ReplicationError::Reconciliation(message.into())
    }

    pub fn store(operation: impl Into<String>, source: anyhow::Error) -> Self {
        ReplicationError::Store {
            operation: operation.into(),
            source,
        }
    }

    pub fn parse(alias: &str, value: impl ToString, message: impl Into<String>) -> Self {
        ReplicationError::Parse {
            alias: alias.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error handler may be consulted before aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Parse { .. } | ReplicationError::Store { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ReplicationError::parse("code", "x", "not a number").is_recoverable());
        assert!(ReplicationError::store("commit", anyhow::anyhow!("disk full")).is_recoverable());
        assert!(!ReplicationError::config("no keys").is_recoverable());
        assert!(!ReplicationError::reconciliation("reset object").is_recoverable());
    }

    #[test]
    fn test_store_error_message_includes_source() {
        let err = ReplicationError::store("commit", anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "Store operation 'commit' failed: disk full");
    }
}
