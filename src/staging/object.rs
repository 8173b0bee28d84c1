// ABOUTME: StagedObject - in-memory accumulator for one logical record before commit
// ABOUTME: Tracks attributes, links, the resolved persisted object and the lifecycle state

use crate::error::{ReplicationError, Result};
use crate::stats::Stat;
use crate::store::PersistedObject;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Index of a staged object in the batch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagedId(pub(crate) usize);

impl StagedId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Whether a staged object is a main object or linked through an association.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StagedKind {
    Main,
    Association(String),
}

/// Lifecycle of a staged object within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Still collecting values, not resolved yet
    Undetermined,
    /// A new persisted object was instantiated
    New,
    /// Matched and at least one member was written
    Changed,
    /// Matched and nothing written so far
    Unchanged,
    /// Batch flushed, must never be touched again
    Reset,
}

impl ObjectState {
    /// Whether the object has to be committed.
    pub fn needs_commit(&self) -> bool {
        matches!(self, ObjectState::New | ObjectState::Changed)
    }

    /// Statistic recorded for an object that finished in this state.
    pub fn stat(&self) -> Stat {
        match self {
            ObjectState::New => Stat::Created,
            ObjectState::Changed => Stat::Synchronized,
            _ => Stat::Skipped,
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectState::Undetermined => "undetermined",
            ObjectState::New => "new",
            ObjectState::Changed => "changed",
            ObjectState::Unchanged => "unchanged",
            ObjectState::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Values and links moved out of an object that is merged into another.
#[derive(Debug, Default)]
pub(crate) struct MergeContents {
    attributes: BTreeMap<String, Value>,
    single_links: BTreeMap<String, StagedId>,
    multi_links: BTreeMap<String, Vec<StagedId>>,
}

#[derive(Debug, Clone)]
pub struct StagedObject {
    run_id: u64,
    kind: StagedKind,
    object_type: String,
    state: ObjectState,
    /// member name -> staged value
    attributes: BTreeMap<String, Value>,
    single_links: BTreeMap<String, StagedId>,
    multi_links: BTreeMap<String, Vec<StagedId>>,
    resolved: Option<PersistedObject>,
    object_key: Option<String>,
    registered_key: Option<String>,
    /// Keys of keyless types are fixed at creation and never recomputed
    fixed_key: bool,
}

impl StagedObject {
    pub(crate) fn new(run_id: u64, kind: StagedKind, object_type: &str) -> Self {
        Self {
            run_id,
            kind,
            object_type: object_type.to_string(),
            state: ObjectState::Undetermined,
            attributes: BTreeMap::new(),
            single_links: BTreeMap::new(),
            multi_links: BTreeMap::new(),
            resolved: None,
            object_key: None,
            registered_key: None,
            fixed_key: false,
        }
    }

    /// Run-local identity, unique across all batches of a run.
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn kind(&self) -> &StagedKind {
        &self.kind
    }

    pub fn association(&self) -> Option<&str> {
        match &self.kind {
            StagedKind::Main => None,
            StagedKind::Association(name) => Some(name),
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, member: &str) -> Option<&Value> {
        self.attributes.get(member)
    }

    pub fn single_links(&self) -> &BTreeMap<String, StagedId> {
        &self.single_links
    }

    pub fn single_link(&self, association: &str) -> Option<StagedId> {
        self.single_links.get(association).copied()
    }

    pub fn multi_links(&self) -> &BTreeMap<String, Vec<StagedId>> {
        &self.multi_links
    }

    pub fn multi_link(&self, association: &str) -> &[StagedId] {
        self.multi_links
            .get(association)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the object links anything through this association.
    pub fn has_link(&self, association: &str) -> bool {
        self.single_links.contains_key(association) || !self.multi_link(association).is_empty()
    }

    pub fn resolved(&self) -> Option<&PersistedObject> {
        self.resolved.as_ref()
    }

    pub fn cached_key(&self) -> Option<&str> {
        self.object_key.as_deref()
    }

    pub(crate) fn registered_key(&self) -> Option<&str> {
        self.registered_key.as_deref()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == ObjectState::Reset {
            return Err(ReplicationError::reconciliation(format!(
                "Staged {} object {} was already flushed and cannot be modified",
                self.object_type, self.run_id
            )));
        }
        Ok(())
    }

    pub(crate) fn set_attribute(&mut self, member: &str, value: Value, key_member: bool) -> Result<()> {
        self.ensure_live()?;
        self.attributes.insert(member.to_string(), value);
        if key_member {
            self.invalidate_key();
        }
        Ok(())
    }

    pub(crate) fn link_single(&mut self, association: &str, target: StagedId) -> Result<()> {
        self.ensure_live()?;
        self.single_links.insert(association.to_string(), target);
        Ok(())
    }

    pub(crate) fn push_multi(&mut self, association: &str, target: StagedId) -> Result<()> {
        self.ensure_live()?;
        self.multi_links
            .entry(association.to_string())
            .or_default()
            .push(target);
        Ok(())
    }

    pub(crate) fn replace_last_multi(&mut self, association: &str, target: StagedId) -> Result<()> {
        self.ensure_live()?;
        if let Some(last) = self
            .multi_links
            .get_mut(association)
            .and_then(|list| list.last_mut())
        {
            *last = target;
        }
        Ok(())
    }

    /// Point every link at `from` to `to`.
    pub(crate) fn redirect_links(&mut self, from: StagedId, to: StagedId) {
        for target in self.single_links.values_mut() {
            if *target == from {
                *target = to;
            }
        }
        for target in self.multi_links.values_mut().flatten() {
            if *target == from {
                *target = to;
            }
        }
    }

    pub(crate) fn invalidate_key(&mut self) {
        if !self.fixed_key {
            self.object_key = None;
        }
    }

    pub(crate) fn cache_key(&mut self, key: Option<String>) {
        self.object_key = key;
    }

    pub(crate) fn fix_key(&mut self, key: String) {
        self.object_key = Some(key);
        self.fixed_key = true;
    }

    pub(crate) fn set_registered_key(&mut self, key: Option<String>) {
        self.registered_key = key;
    }

    /// Move values and links out, leaving the object flushed.
    pub(crate) fn take_contents(&mut self) -> Result<MergeContents> {
        self.ensure_live()?;
        let contents = MergeContents {
            attributes: std::mem::take(&mut self.attributes),
            single_links: std::mem::take(&mut self.single_links),
            multi_links: std::mem::take(&mut self.multi_links),
        };
        self.reset();
        Ok(contents)
    }

    /// Union another object's contents into this one. Incoming attributes and
    /// single links win, incoming multi links are appended unless already present.
    pub(crate) fn absorb(&mut self, contents: MergeContents) -> Result<()> {
        self.ensure_live()?;
        self.attributes.extend(contents.attributes);
        self.single_links.extend(contents.single_links);
        for (association, targets) in contents.multi_links {
            let list = self.multi_links.entry(association).or_default();
            for target in targets {
                if !list.contains(&target) {
                    list.push(target);
                }
            }
        }
        self.invalidate_key();
        Ok(())
    }

    /// Attach the persisted match found by retrieval.
    pub(crate) fn attach(&mut self, object: PersistedObject) -> Result<()> {
        self.ensure_live()?;
        self.resolved = Some(object);
        Ok(())
    }

    /// Resolve to a persisted object and enter the given state.
    pub(crate) fn resolve_to(&mut self, object: Option<PersistedObject>, state: ObjectState) -> Result<()> {
        self.ensure_live()?;
        if let Some(object) = object {
            self.resolved = Some(object);
        }
        self.state = state;
        Ok(())
    }

    /// Drop the persisted match so nothing gets written or linked.
    pub(crate) fn detach(&mut self, state: ObjectState) -> Result<()> {
        self.ensure_live()?;
        self.resolved = None;
        self.state = state;
        Ok(())
    }

    /// Write one member onto the resolved object.
    ///
    /// The write only happens when the value differs from the persisted one,
    /// unless `force` is set. A write moves an Unchanged object to Changed.
    /// Returns whether the member was written.
    pub(crate) fn update_member(&mut self, member: &str, value: Value, force: bool) -> Result<bool> {
        self.ensure_live()?;
        let object = self.resolved.as_mut().ok_or_else(|| {
            ReplicationError::reconciliation(format!(
                "Cannot write {} on staged {} object {} before it is resolved",
                member, self.object_type, self.run_id
            ))
        })?;
        if !force && same_value(object.get(member), &value) {
            return Ok(false);
        }
        object.set(member, value);
        if self.state == ObjectState::Unchanged {
            self.state = ObjectState::Changed;
        }
        Ok(true)
    }

    /// Flush the object: it can never be modified again.
    pub(crate) fn reset(&mut self) {
        self.state = ObjectState::Reset;
        self.attributes.clear();
        self.single_links.clear();
        self.multi_links.clear();
        self.resolved = None;
        self.object_key = None;
        self.registered_key = None;
    }
}

/// Equality as the store sees it: every flavour of "no link" is the same.
fn same_value(current: &Value, new: &Value) -> bool {
    match (current, new) {
        (a, b) if a == b => true,
        (a, b) if a.is_null() && b.is_null() => true,
        (Value::Null, Value::ReferenceSet(ids)) | (Value::ReferenceSet(ids), Value::Null) => {
            ids.is_empty()
        }
        _ => false,
    }
}
