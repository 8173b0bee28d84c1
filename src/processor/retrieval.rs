// ABOUTME: ObjectRetrieval - bulk lookup of persisted objects for staged composite keys
// ABOUTME: Pages lookup queries, fetches by id in chunks and maps results back to keys

use crate::error::{ReplicationError, Result};
use crate::parser::{build_key, KeyField};
use crate::query::{LookupQueryBuilder, PendingEntry};
use crate::store::{ObjectStore, PersistedObject};
use crate::value::{ObjectId, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Retrieval of one object type. Owns everything it needs so it can run as
/// its own task.
pub struct ObjectRetrieval {
    label: String,
    store: Arc<dyn ObjectStore>,
    builder: LookupQueryBuilder,
    key_fields: Vec<KeyField>,
    fetch_limit: usize,
}

impl ObjectRetrieval {
    pub fn new(
        label: &str,
        store: Arc<dyn ObjectStore>,
        builder: LookupQueryBuilder,
        key_fields: Vec<KeyField>,
        fetch_limit: usize,
    ) -> Self {
        Self {
            label: label.to_string(),
            store,
            builder,
            key_fields,
            fetch_limit: std::cmp::max(1, fetch_limit),
        }
    }

    /// Look up every pending entry, returning the persisted match per key.
    ///
    /// A fetched object whose recomputed key matches no pending entry means
    /// the store and the lookup disagree and aborts the run.
    pub async fn run(self, entries: Vec<PendingEntry>) -> Result<HashMap<String, PersistedObject>> {
        let mut found: HashMap<String, PersistedObject> = HashMap::new();
        if entries.is_empty() {
            return Ok(found);
        }
        let pending: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        let pages = self.builder.build_pages(&entries);
        tracing::debug!(
            "Looking up {} {} keys in {} pages",
            entries.len(),
            self.label,
            pages.len()
        );

        for query in pages {
            tracing::trace!("{}", query);
            let ids = self
                .store
                .find_ids(&query)
                .await
                .map_err(|e| ReplicationError::store("find", e))?;
            if ids.len() > query.clauses.len() * 2 {
                tracing::warn!(
                    "Lookup of {} {} keys returned {} objects, keys may not be unique",
                    query.clauses.len(),
                    self.label,
                    ids.len()
                );
            }

            for chunk in ids.chunks(self.fetch_limit) {
                let objects = self
                    .store
                    .fetch_by_ids(chunk)
                    .await
                    .map_err(|e| ReplicationError::store("fetch", e))?;
                let links = self.fetch_linked(&objects).await?;
                for object in objects {
                    let key = self.recompute_key(&object, &links);
                    if !pending.contains(key.as_str()) {
                        return Err(ReplicationError::reconciliation(format!(
                            "{} #{} was returned for {} lookup but its key {} matches no pending entry",
                            object.object_type, object.id, self.label, key
                        )));
                    }
                    if found.contains_key(&key) {
                        tracing::warn!(
                            "More than one {} object has key {}, keeping the first",
                            self.label,
                            key
                        );
                        continue;
                    }
                    found.insert(key, object);
                }
            }
        }
        tracing::debug!("Found {} of {} {} keys", found.len(), entries.len(), self.label);
        Ok(found)
    }

    /// Objects referenced by key fields routed through an association.
    async fn fetch_linked(&self, objects: &[PersistedObject]) -> Result<HashMap<ObjectId, PersistedObject>> {
        let associations: Vec<&str> = self
            .key_fields
            .iter()
            .filter_map(|field| field.member.split_once('/').map(|(association, _)| association))
            .collect();
        if associations.is_empty() {
            return Ok(HashMap::new());
        }

        let mut ids: Vec<ObjectId> = Vec::new();
        for object in objects {
            for association in &associations {
                if let Some(id) = object.get(association).as_reference() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }

        let mut linked = HashMap::new();
        for chunk in ids.chunks(self.fetch_limit) {
            let objects = self
                .store
                .fetch_by_ids(chunk)
                .await
                .map_err(|e| ReplicationError::store("fetch", e))?;
            linked.extend(objects.into_iter().map(|o| (o.id, o)));
        }
        Ok(linked)
    }

    fn recompute_key(&self, object: &PersistedObject, links: &HashMap<ObjectId, PersistedObject>) -> String {
        build_key(&self.key_fields, false, |field| {
            let value: Value = match field.member.split_once('/') {
                Some((association, member)) => object
                    .get(association)
                    .as_reference()
                    .and_then(|id| links.get(&id))
                    .map(|linked| linked.get(member).clone())
                    .unwrap_or_default(),
                None => object.get(&field.member).clone(),
            };
            Some(value)
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ConditionPath, LookupField};
    use crate::store::MemoryStore;

    fn retrieval(store: Arc<MemoryStore>, page_size: usize) -> ObjectRetrieval {
        let builder = LookupQueryBuilder::new(
            "Crm.Customer",
            vec![LookupField {
                alias: "code".to_string(),
                path: ConditionPath::Member("Code".to_string()),
                case_sensitive: false,
            }],
            page_size,
        );
        let fields = vec![KeyField {
            alias: "code".to_string(),
            member: "Code".to_string(),
            case_sensitive: false,
        }];
        ObjectRetrieval::new("Crm.Customer", store, builder, fields, 1)
    }

    fn entry(code: &str) -> PendingEntry {
        PendingEntry {
            key: format!("{}|KEY|", code.to_lowercase()),
            values: HashMap::from([("code".to_string(), Value::from(code))]),
        }
    }

    #[tokio::test]
    async fn test_matches_are_mapped_to_keys() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PersistedObject::new(1, "Crm.Customer").with("Code", "A")).await;
        store.insert(PersistedObject::new(2, "Crm.Customer").with("Code", "B")).await;

        let found = retrieval(Arc::clone(&store), 1)
            .run(vec![entry("a"), entry("B"), entry("C")])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a|KEY|"].id, 1);
        assert_eq!(found["b|KEY|"].id, 2);
        assert_eq!(store.lookup_count().await, 3);
    }

    #[tokio::test]
    async fn test_empty_entries_skip_the_store() {
        let store = Arc::new(MemoryStore::new());
        let found = retrieval(Arc::clone(&store), 10).run(Vec::new()).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(store.lookup_count().await, 0);
    }

    #[tokio::test]
    async fn test_unexpected_key_is_an_integrity_error() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PersistedObject::new(1, "Crm.Customer").with("Code", "A")).await;
        let mut stale = entry("A");
        stale.key = "something-else|KEY|".to_string();
        let err = retrieval(store, 10).run(vec![stale]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Reconciliation(_)));
    }
}
