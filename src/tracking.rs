// ABOUTME: RemovalMarker - remove-indicator bookkeeping for change tracking
// ABOUTME: Picks the marker for this run and deletes objects the run did not touch

use crate::error::{ReplicationError, Result};
use crate::query::DeletePredicate;
use crate::settings::ObjectConfig;
use crate::store::ObjectStore;
use crate::value::Value;

/// Marker values of the remove indicator for one run.
///
/// Every object the run stages is tagged with `new_value`. Objects still
/// carrying another value (or none) after the run are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalMarker {
    object_type: String,
    member: String,
    current: Option<i32>,
    new: i32,
}

impl RemovalMarker {
    /// Scan the store for the markers in use. Returns `None` when the object
    /// does not use a remove indicator.
    pub async fn prepare(store: &dyn ObjectStore, config: &ObjectConfig) -> Result<Option<Self>> {
        if !config.uses_remove_indicator() {
            return Ok(None);
        }
        let Some(member) = config.remove_indicator() else {
            return Ok(None);
        };

        let values = store
            .distinct_values(config.object_type(), member)
            .await
            .map_err(|e| ReplicationError::store("scan remove indicator", e))?;
        let mut markers: Vec<i32> = values
            .iter()
            .filter_map(Value::as_integer)
            .filter_map(|value| i32::try_from(value).ok())
            .collect();
        markers.sort_unstable();
        markers.dedup();

        let (current, new) = next_marker(&markers);
        tracing::info!(
            "Remove indicator {}.{}: current marker {:?}, new marker {}",
            config.object_type(),
            member,
            current,
            new
        );
        Ok(Some(Self {
            object_type: config.object_type().to_string(),
            member: member.to_string(),
            current,
            new,
        }))
    }

    pub fn current(&self) -> Option<i32> {
        self.current
    }

    /// Marker written onto every object staged by this run.
    pub fn new_value(&self) -> i32 {
        self.new
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Objects whose marker is not this run's.
    pub fn stale_predicate(&self) -> DeletePredicate {
        DeletePredicate {
            object_type: self.object_type.clone(),
            marker_member: self.member.clone(),
            keep_value: Value::Integer(self.new),
        }
    }

    /// Delete stale objects in chunks of `batch_size`, returning the total.
    pub async fn remove_stale(&self, store: &dyn ObjectStore, batch_size: usize) -> Result<u64> {
        let batch_size = std::cmp::max(1, batch_size);
        let predicate = self.stale_predicate();
        tracing::debug!("Removing stale objects: {}", predicate);

        let mut total = 0u64;
        loop {
            let deleted = store
                .delete_where(&predicate, batch_size)
                .await
                .map_err(|e| ReplicationError::store("delete stale objects", e))?;
            total += deleted;
            if deleted < batch_size as u64 {
                break;
            }
        }
        if total > 0 {
            tracing::info!("Removed {} stale {} objects", total, self.object_type);
        }
        Ok(total)
    }
}

/// Current and new marker from the ascending distinct markers in the store.
///
/// The lowest marker is current. The new marker must not collide with any
/// marker in use, and wraps to 0 past `i32::MAX`.
pub fn next_marker(sorted: &[i32]) -> (Option<i32>, i32) {
    let Some((&first, rest)) = sorted.split_first() else {
        return (None, 1);
    };
    let mut new = first.checked_add(1).unwrap_or(0);
    for value in rest {
        if *value >= new {
            new = value.checked_add(1).unwrap_or(0);
        }
    }
    (Some(first), new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SearchAction;
    use crate::schema::{EntityDef, Schema};
    use crate::settings::ChangeTracking;
    use crate::store::{MemoryStore, PersistedObject};
    use crate::value::PrimitiveType;

    #[test]
    fn test_next_marker_without_values() {
        assert_eq!(next_marker(&[]), (None, 1));
    }

    #[test]
    fn test_next_marker_skips_markers_in_use() {
        assert_eq!(next_marker(&[3]), (Some(3), 4));
        assert_eq!(next_marker(&[3, 4]), (Some(3), 5));
        assert_eq!(next_marker(&[1, 7]), (Some(1), 8));
    }

    #[test]
    fn test_next_marker_wraps() {
        assert_eq!(next_marker(&[i32::MAX]), (Some(i32::MAX), 0));
        assert_eq!(next_marker(&[5, i32::MAX]), (Some(5), 0));
    }

    fn tracked_config() -> ObjectConfig {
        let schema = Schema::new().with_entity(
            EntityDef::new("Crm.Customer")
                .member("Code", PrimitiveType::String)
                .member("Marker", PrimitiveType::Integer),
        );
        let mut config = ObjectConfig::main("Crm.Customer");
        config.set_search_action(SearchAction::FindCreate);
        config
            .set_change_tracking(&schema, ChangeTracking::RemoveUnchangedObjects, Some("Marker"))
            .unwrap();
        config
    }

    #[tokio::test]
    async fn test_prepare_reads_markers_from_store() {
        let store = MemoryStore::new();
        store.insert(PersistedObject::new(1, "Crm.Customer").with("Marker", 2)).await;
        store.insert(PersistedObject::new(2, "Crm.Customer").with("Marker", 3)).await;
        store.insert(PersistedObject::new(3, "Crm.Customer")).await;

        let marker = RemovalMarker::prepare(&store, &tracked_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.current(), Some(2));
        assert_eq!(marker.new_value(), 4);
        assert_eq!(marker.member(), "Marker");
    }

    #[tokio::test]
    async fn test_prepare_is_none_without_indicator() {
        let store = MemoryStore::new();
        let config = ObjectConfig::main("Crm.Customer");
        assert!(RemovalMarker::prepare(&store, &config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_stale_deletes_in_chunks() {
        let store = MemoryStore::new();
        for id in 1..=5 {
            store.insert(PersistedObject::new(id, "Crm.Customer").with("Marker", 1)).await;
        }
        store.insert(PersistedObject::new(6, "Crm.Customer").with("Marker", 2)).await;

        let marker = RemovalMarker {
            object_type: "Crm.Customer".to_string(),
            member: "Marker".to_string(),
            current: Some(1),
            new: 2,
        };
        let removed = marker.remove_stale(&store, 2).await.unwrap();
        assert_eq!(removed, 5);
        assert_eq!(store.len().await, 1);
        assert!(store.get(6).await.is_some());
    }
}
