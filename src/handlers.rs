// ABOUTME: Pluggable callbacks consulted while reconciling
// ABOUTME: Error handler (skip vs abort) and unknown linked object resolution

use crate::error::ReplicationError;
use crate::store::PersistedObject;
use crate::value::Value;
use std::collections::BTreeMap;

/// Decides whether a recoverable failure skips the offending field or
/// object (`true`) or aborts the run (`false`).
pub trait ErrorHandler: Send + Sync {
    /// A value could not be coerced to its member type.
    fn value_error(&self, error: &ReplicationError, message: &str) -> bool {
        let _ = (error, message);
        false
    }

    /// The store failed to instantiate or commit objects.
    fn store_error(&self, error: &ReplicationError, message: &str) -> bool {
        let _ = (error, message);
        false
    }
}

/// Abort on every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnError;

impl ErrorHandler for AbortOnError {}

/// Log every failure as a warning and carry on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipAndLog;

impl ErrorHandler for SkipAndLog {
    fn value_error(&self, error: &ReplicationError, message: &str) -> bool {
        tracing::warn!("Skipping value: {} ({})", message, error);
        true
    }

    fn store_error(&self, error: &ReplicationError, message: &str) -> bool {
        tracing::warn!("Skipping object: {} ({})", message, error);
        true
    }
}

/// Read-only view of a staged associated record that had no persisted match.
#[derive(Debug, Clone, Copy)]
pub struct StagedRecord<'a> {
    pub association: &'a str,
    pub object_type: &'a str,
    pub key: Option<&'a str>,
    /// member name -> staged value
    pub attributes: &'a BTreeMap<String, Value>,
}

/// Resolves associated records that matched nothing in the store.
///
/// Returning an object links it as if the lookup had found it. Returning
/// `None` leaves the link empty.
pub trait UnknownObjectHandler: Send + Sync {
    fn resolve(
        &self,
        record: &StagedRecord<'_>,
        main: &PersistedObject,
    ) -> anyhow::Result<Option<PersistedObject>>;
}

impl<F> UnknownObjectHandler for F
where
    F: Fn(&StagedRecord<'_>, &PersistedObject) -> anyhow::Result<Option<PersistedObject>>
        + Send
        + Sync,
{
    fn resolve(
        &self,
        record: &StagedRecord<'_>,
        main: &PersistedObject,
    ) -> anyhow::Result<Option<PersistedObject>> {
        self(record, main)
    }
}
