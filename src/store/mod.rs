// ABOUTME: ObjectStore trait - the persisted object store the engine reconciles against
// ABOUTME: Bulk lookup, fetch, instantiate, commit and delete operations plus PersistedObject

pub mod memory;

pub use memory::MemoryStore;

use crate::query::{DeletePredicate, LookupQuery};
use crate::value::{ObjectId, Value};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

static NULL: Value = Value::Null;

/// An object as the store knows it: id, type and member values.
///
/// Association links are stored as members named after the association,
/// holding `Value::Reference` or `Value::ReferenceSet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedObject {
    pub id: ObjectId,
    pub object_type: String,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl PersistedObject {
    pub fn new(id: ObjectId, object_type: &str) -> Self {
        Self {
            id,
            object_type: object_type.to_string(),
            values: BTreeMap::new(),
        }
    }

    /// Current value of a member, `Value::Null` when never set.
    pub fn get(&self, member: &str) -> &Value {
        self.values.get(member).unwrap_or(&NULL)
    }

    pub fn set(&mut self, member: &str, value: Value) {
        self.values.insert(member.to_string(), value);
    }

    pub fn with(mut self, member: &str, value: impl Into<Value>) -> Self {
        self.set(member, value.into());
        self
    }

    /// Unlink every object in `ids`. Returns whether any link was removed.
    pub fn drop_references(&mut self, ids: &HashSet<ObjectId>) -> bool {
        let mut changed = false;
        for value in self.values.values_mut() {
            match value {
                Value::Reference(reference) => {
                    if reference.is_some_and(|id| ids.contains(&id)) {
                        *reference = None;
                        changed = true;
                    }
                }
                Value::ReferenceSet(list) => {
                    let before = list.len();
                    list.retain(|id| !ids.contains(id));
                    changed |= list.len() != before;
                }
                _ => {}
            }
        }
        changed
    }
}

/// Persisted object store consumed by the engine.
///
/// Implementations must be usable from two retrieval tasks at once.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Ids of every object matching any clause of the query.
    async fn find_ids(&self, query: &LookupQuery) -> Result<Vec<ObjectId>>;

    /// Full objects for the given ids. Unknown ids are left out.
    async fn fetch_by_ids(&self, ids: &[ObjectId]) -> Result<Vec<PersistedObject>>;

    /// A new object with a fresh id. It is not stored until committed.
    async fn instantiate(&self, object_type: &str) -> Result<PersistedObject>;

    /// Store the given objects, replacing any stored version.
    async fn commit(&self, objects: Vec<PersistedObject>) -> Result<()>;

    /// Delete at most `limit` objects matching the predicate, returning how many were deleted.
    async fn delete_where(&self, predicate: &DeletePredicate, limit: usize) -> Result<u64>;

    /// Distinct non-null values of a member across all objects of a type.
    async fn distinct_values(&self, object_type: &str, member: &str) -> Result<Vec<Value>>;

    async fn begin_transaction(&self) -> Result<()> {
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_member_reads_as_null() {
        let object = PersistedObject::new(7, "Crm.Customer").with("Code", "A");
        assert_eq!(object.get("Code"), &Value::from("A"));
        assert!(object.get("Name").is_null());
    }

    #[test]
    fn test_drop_references_unlinks_only_given_ids() {
        let mut object = PersistedObject::new(7, "Crm.Customer")
            .with("Code", "A")
            .with("Crm.Customer_Country", Value::Reference(Some(3)))
            .with("Crm.Customer_Region", Value::Reference(Some(4)))
            .with("Crm.Customer_Tag", Value::ReferenceSet(vec![3, 5]));
        let dropped: HashSet<ObjectId> = [3].into_iter().collect();

        assert!(object.drop_references(&dropped));
        assert_eq!(object.get("Crm.Customer_Country"), &Value::Reference(None));
        assert_eq!(object.get("Crm.Customer_Region"), &Value::Reference(Some(4)));
        assert_eq!(object.get("Crm.Customer_Tag"), &Value::ReferenceSet(vec![5]));
        assert!(!object.drop_references(&dropped));
    }

    #[test]
    fn test_snapshot_format() {
        let object = PersistedObject::new(7, "Crm.Customer")
            .with("Crm.Customer_Country", Value::Reference(Some(3)));
        let json = serde_json::to_string(&object).unwrap();
        let back: PersistedObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, object);
    }
}
