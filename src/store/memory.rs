// ABOUTME: In-memory ObjectStore used by tests and the CLI
// ABOUTME: Evaluates lookup queries directly and persists snapshots as JSON

use super::{ObjectStore, PersistedObject};
use crate::parser::key_segment;
use crate::query::{Condition, ConditionPath, DeletePredicate, LookupQuery};
use crate::value::{ObjectId, Value};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::fs;
use tokio::sync::RwLock;

/// Serializable contents of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: ObjectId,
    pub objects: BTreeMap<ObjectId, PersistedObject>,
}

impl Snapshot {
    fn linked(&self, object: &PersistedObject, association: &str, target_type: &str) -> Option<&PersistedObject> {
        if let Some(id) = object.get(association).as_reference() {
            return self.objects.get(&id);
        }
        // link stored on the other side
        self.objects.values().find(|candidate| {
            candidate.object_type == target_type
                && (candidate.get(association).as_reference() == Some(object.id)
                    || candidate.get(association).as_reference_set().contains(&object.id))
        })
    }

    fn matches(&self, object: &PersistedObject, condition: &Condition) -> bool {
        let stored = match &condition.path {
            ConditionPath::Member(member) => object.get(member).clone(),
            ConditionPath::Associated {
                association,
                target_type,
                member,
            } => self
                .linked(object, association, target_type)
                .map(|linked| linked.get(member).clone())
                .unwrap_or_default(),
        };
        let stored = key_segment(&stored);
        let wanted = key_segment(&condition.value);
        if condition.case_sensitive {
            stored == wanted
        } else {
            stored.to_lowercase() == wanted.to_lowercase()
        }
    }
}

#[derive(Debug, Default)]
struct State {
    data: Snapshot,
    checkpoint: Option<Snapshot>,
    commit_log: Vec<ObjectId>,
    lookups: usize,
    failing_commits: HashSet<String>,
    failing_instantiations: HashSet<String>,
    failing_lookups: HashSet<String>,
}

/// Object store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(State {
                data: snapshot,
                ..State::default()
            }),
        }
    }

    /// Load a store from a JSON snapshot.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read store snapshot from {:?}", path))?;
        let snapshot: Snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store snapshot from {:?}", path))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Load a snapshot if the file exists, otherwise start empty.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to check store snapshot {:?}", path))?
        {
            Self::load(path).await
        } else {
            tracing::info!("No store snapshot at {:?}, starting empty", path);
            Ok(Self::new())
        }
    }

    /// Save the committed contents as a JSON snapshot.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        let contents = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&state.data).context("Failed to serialize store snapshot")?
        };
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write store snapshot to {:?}", path))?;
        Ok(())
    }

    /// Store an object directly, bypassing instantiate/commit.
    pub async fn insert(&self, object: PersistedObject) {
        let mut state = self.state.write().await;
        state.data.next_id = state.data.next_id.max(object.id);
        state.data.objects.insert(object.id, object);
    }

    pub async fn get(&self, id: ObjectId) -> Option<PersistedObject> {
        self.state.read().await.data.objects.get(&id).cloned()
    }

    /// Every stored object of a type, ordered by id.
    pub async fn objects_of(&self, object_type: &str) -> Vec<PersistedObject> {
        self.state
            .read()
            .await
            .data
            .objects
            .values()
            .filter(|o| o.object_type == object_type)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.data.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids in the order they were committed.
    pub async fn commit_log(&self) -> Vec<ObjectId> {
        self.state.read().await.commit_log.clone()
    }

    /// Number of `find_ids` calls served.
    pub async fn lookup_count(&self) -> usize {
        self.state.read().await.lookups
    }

    /// Make every commit containing an object of this type fail.
    pub async fn fail_commits_for(&self, object_type: &str) {
        self.state
            .write()
            .await
            .failing_commits
            .insert(object_type.to_string());
    }

    /// Make every lookup of this type fail.
    pub async fn fail_lookups_for(&self, object_type: &str) {
        self.state
            .write()
            .await
            .failing_lookups
            .insert(object_type.to_string());
    }

    /// Make instantiating this type fail.
    pub async fn fail_instantiations_for(&self, object_type: &str) {
        self.state
            .write()
            .await
            .failing_instantiations
            .insert(object_type.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn find_ids(&self, query: &LookupQuery) -> Result<Vec<ObjectId>> {
        let mut state = self.state.write().await;
        if state.failing_lookups.contains(&query.object_type) {
            bail!("Lookup rejected for {}", query.object_type);
        }
        state.lookups += 1;
        let data = &state.data;
        let ids = data
            .objects
            .values()
            .filter(|object| object.object_type == query.object_type)
            .filter(|object| {
                query
                    .clauses
                    .iter()
                    .any(|clause| clause.iter().all(|c| data.matches(object, c)))
            })
            .map(|object| object.id)
            .collect();
        Ok(ids)
    }

    async fn fetch_by_ids(&self, ids: &[ObjectId]) -> Result<Vec<PersistedObject>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.data.objects.get(id).cloned())
            .collect())
    }

    async fn instantiate(&self, object_type: &str) -> Result<PersistedObject> {
        let mut state = self.state.write().await;
        if state.failing_instantiations.contains(object_type) {
            bail!("Cannot instantiate {}", object_type);
        }
        state.data.next_id += 1;
        Ok(PersistedObject::new(state.data.next_id, object_type))
    }

    async fn commit(&self, objects: Vec<PersistedObject>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(object) = objects
            .iter()
            .find(|o| state.failing_commits.contains(&o.object_type))
        {
            bail!("Commit rejected for {} #{}", object.object_type, object.id);
        }
        for object in objects {
            state.commit_log.push(object.id);
            state.data.objects.insert(object.id, object);
        }
        Ok(())
    }

    async fn delete_where(&self, predicate: &DeletePredicate, limit: usize) -> Result<u64> {
        let mut state = self.state.write().await;
        let doomed: Vec<ObjectId> = state
            .data
            .objects
            .values()
            .filter(|object| predicate.matches(object))
            .map(|object| object.id)
            .take(limit)
            .collect();
        for id in &doomed {
            state.data.objects.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn distinct_values(&self, object_type: &str, member: &str) -> Result<Vec<Value>> {
        let state = self.state.read().await;
        let mut values: Vec<Value> = Vec::new();
        for object in state.data.objects.values() {
            if object.object_type != object_type {
                continue;
            }
            let value = object.get(member);
            if !value.is_null() && !values.contains(value) {
                values.push(value.clone());
            }
        }
        Ok(values)
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.checkpoint.is_some() {
            bail!("A transaction is already open");
        }
        state.checkpoint = Some(state.data.clone());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.state.write().await.checkpoint = None;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(checkpoint) = state.checkpoint.take() {
            state.data = checkpoint;
        }
        Ok(())
    }
}
