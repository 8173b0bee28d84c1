// ABOUTME: StagingBatch - arena of staged objects for the in-flight batch
// ABOUTME: Deduplicates by composite key, merges collisions and handles reference-set fan-out

use super::object::{StagedId, StagedKind, StagedObject};
use super::RunContext;
use crate::error::{ReplicationError, Result};
use crate::parser::{build_key, KeyField};
use crate::policy::SearchAction;
use crate::settings::{FieldRoute, ReplicationSettings};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use uuid::Uuid;

/// Staged objects of one batch, addressed by `StagedId`.
#[derive(Debug, Default)]
pub struct StagingBatch {
    objects: Vec<StagedObject>,
    /// record key -> main object, correlation only
    records: HashMap<String, StagedId>,
    /// composite key -> main object, in staging order
    by_key: IndexMap<String, StagedId>,
    /// association name -> composite key -> associated object
    associated: HashMap<String, IndexMap<String, StagedId>>,
    /// main objects whose key came out empty
    unkeyed: Vec<StagedId>,
    main_fields: Vec<KeyField>,
    association_fields: HashMap<String, Vec<KeyField>>,
}

impl StagingBatch {
    pub fn new(settings: &ReplicationSettings) -> Self {
        Self {
            main_fields: settings.main_key_fields(),
            association_fields: settings
                .associations()
                .map(|config| {
                    let name = config.association_name();
                    (name.to_string(), settings.association_key_fields(name))
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn object(&self, id: StagedId) -> &StagedObject {
        &self.objects[id.0]
    }

    pub(crate) fn object_mut(&mut self, id: StagedId) -> &mut StagedObject {
        &mut self.objects[id.0]
    }

    /// Main object currently staged for a record key.
    pub fn record(&self, record_key: &str) -> Option<StagedId> {
        self.records.get(record_key).copied()
    }

    /// Main object registered under a composite key.
    pub fn by_key(&self, key: &str) -> Option<StagedId> {
        self.by_key.get(key).copied()
    }

    /// Associated object registered under a composite key.
    pub fn associated_by_key(&self, association: &str, key: &str) -> Option<StagedId> {
        self.associated
            .get(association)
            .and_then(|bucket| bucket.get(key))
            .copied()
    }

    /// Main objects staged so far, keyed ones in staging order first.
    pub fn main_objects(&self) -> Vec<StagedId> {
        self.by_key
            .values()
            .chain(self.unkeyed.iter())
            .copied()
            .collect()
    }

    /// Number of sealed main objects, the measure for the batch threshold.
    pub fn main_count(&self) -> usize {
        self.by_key.len() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.main_count() == 0
    }

    pub(crate) fn key_fields(&self, object: &StagedObject) -> &[KeyField] {
        match object.kind() {
            StagedKind::Main => &self.main_fields,
            StagedKind::Association(name) => self
                .association_fields
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }

    fn stage(&mut self, context: &RunContext, kind: StagedKind, object_type: &str) -> StagedId {
        let id = StagedId(self.objects.len());
        self.objects
            .push(StagedObject::new(context.next_id(), kind, object_type));
        id
    }

    fn stage_associated(&mut self, context: &RunContext, association: &str, object_type: &str) -> StagedId {
        let id = self.stage(
            context,
            StagedKind::Association(association.to_string()),
            object_type,
        );
        let keyless = self
            .association_fields
            .get(association)
            .map(Vec::is_empty)
            .unwrap_or(true);
        if keyless {
            self.objects[id.0].fix_key(Uuid::new_v4().to_string());
        }
        id
    }

    /// Get or create the main object for a record key. New objects are tagged
    /// with the run's remove indicator when one is in use.
    pub(crate) fn main_for_record(
        &mut self,
        context: &RunContext,
        settings: &ReplicationSettings,
        record_key: &str,
        marker: Option<(&str, i32)>,
    ) -> Result<StagedId> {
        if let Some(id) = self.records.get(record_key) {
            return Ok(*id);
        }
        let id = self.stage(context, StagedKind::Main, settings.main().object_type());
        if self.main_fields.is_empty() {
            self.objects[id.0].fix_key(Uuid::new_v4().to_string());
        }
        if let Some((member, value)) = marker {
            self.objects[id.0].set_attribute(member, Value::Integer(value), false)?;
        }
        self.records.insert(record_key.to_string(), id);
        Ok(id)
    }

    /// Composite key of a staged object, computed on demand and cached.
    pub(crate) fn key_of(&mut self, settings: &ReplicationSettings, id: StagedId) -> Option<String> {
        if let Some(key) = self.objects[id.0].cached_key() {
            return Some(key.to_string());
        }
        let key = self.build_key_for(settings, id);
        self.objects[id.0].cache_key(key.clone());
        key
    }

    fn build_key_for(&self, settings: &ReplicationSettings, id: StagedId) -> Option<String> {
        let object = &self.objects[id.0];
        let ignore_empty_keys = match object.kind() {
            StagedKind::Main => settings.main().ignore_empty_keys(),
            StagedKind::Association(name) => settings
                .association(name)
                .map(|config| config.object().ignore_empty_keys())
                .unwrap_or(false),
        };
        build_key(self.key_fields(object), ignore_empty_keys, |field| {
            self.key_value(object, field)
        })
    }

    /// Value of one key field, following the association for qualified members.
    pub(crate) fn key_value(&self, object: &StagedObject, field: &KeyField) -> Option<Value> {
        match field.member.split_once('/') {
            Some((association, member)) => object
                .single_link(association)
                .and_then(|linked| self.objects[linked.0].attribute(member).cloned()),
            None => object.attribute(&field.member).cloned(),
        }
    }

    /// alias -> value of every key field of an object.
    pub(crate) fn key_values(&self, id: StagedId) -> HashMap<String, Value> {
        let object = &self.objects[id.0];
        self.key_fields(object)
            .iter()
            .map(|field| {
                (
                    field.alias.clone(),
                    self.key_value(object, field).unwrap_or_default(),
                )
            })
            .collect()
    }

    fn bucket(&self, association: Option<&str>) -> Option<&IndexMap<String, StagedId>> {
        match association {
            None => Some(&self.by_key),
            Some(name) => self.associated.get(name),
        }
    }

    fn bucket_mut(&mut self, association: Option<&str>) -> &mut IndexMap<String, StagedId> {
        match association {
            None => &mut self.by_key,
            Some(name) => self.associated.entry(name.to_string()).or_default(),
        }
    }

    fn bucket_get(&self, association: Option<&str>, key: &str) -> Option<StagedId> {
        self.bucket(association).and_then(|bucket| bucket.get(key)).copied()
    }

    /// Remove an object's current registration, if any.
    fn unregister(&mut self, id: StagedId) {
        let association = self.objects[id.0].association().map(str::to_string);
        if let Some(old) = self.objects[id.0].registered_key().map(str::to_string) {
            if self.bucket_get(association.as_deref(), &old) == Some(id) {
                self.bucket_mut(association.as_deref()).shift_remove(&old);
            }
            self.objects[id.0].set_registered_key(None);
        }
    }

    /// Register an object under `key`, returning the canonical staged object
    /// for that key. An object already registered under an equal key absorbs
    /// the new one. An object sitting under a key it no longer has is moved.
    fn register(&mut self, settings: &ReplicationSettings, id: StagedId, key: String) -> Result<StagedId> {
        let association = self.objects[id.0].association().map(str::to_string);
        let scope = association.as_deref();

        if self.objects[id.0].registered_key() == Some(key.as_str())
            && self.bucket_get(scope, &key) == Some(id)
        {
            return Ok(id);
        }
        self.unregister(id);

        let Some(existing) = self.bucket_get(scope, &key) else {
            self.bucket_mut(scope).insert(key.clone(), id);
            self.objects[id.0].set_registered_key(Some(key));
            return Ok(id);
        };

        let existing_key = self.key_of(settings, existing);
        if existing_key.as_deref() == Some(key.as_str()) {
            self.merge(id, existing)?;
            return Ok(existing);
        }

        tracing::debug!(
            "Staged {} object {} sits under stale key {}, relocating",
            self.objects[existing.0].object_type(),
            self.objects[existing.0].run_id(),
            key
        );
        self.bucket_mut(scope).shift_remove(&key);
        self.objects[existing.0].set_registered_key(None);
        self.bucket_mut(scope).insert(key.clone(), id);
        self.objects[id.0].set_registered_key(Some(key));
        match existing_key {
            Some(existing_key) => {
                self.register(settings, existing, existing_key)?;
            }
            None if scope.is_none() => self.unkeyed.push(existing),
            None => {}
        }
        Ok(id)
    }

    /// Merge `from` into `into` and point every reference to `from` at `into`.
    fn merge(&mut self, from: StagedId, into: StagedId) -> Result<()> {
        if from == into {
            return Ok(());
        }
        if self.objects[from.0].run_id() == self.objects[into.0].run_id() {
            return Ok(());
        }
        let contents = self.objects[from.0].take_contents()?;
        self.objects[into.0].absorb(contents)?;
        for object in &mut self.objects {
            object.redirect_links(from, into);
        }
        for target in self.records.values_mut() {
            if *target == from {
                *target = into;
            }
        }
        self.unkeyed.retain(|id| *id != from);
        tracing::trace!(
            "Merged staged object {} into {}",
            from.index(),
            into.index()
        );
        Ok(())
    }

    /// Compute the final key of a record's main object and register it.
    pub(crate) fn seal(&mut self, settings: &ReplicationSettings, record_key: &str) -> Result<()> {
        let Some(id) = self.records.get(record_key).copied() else {
            return Ok(());
        };
        match self.key_of(settings, id) {
            Some(key) => {
                self.unkeyed.retain(|other| *other != id);
                let canonical = self.register(settings, id, key)?;
                self.records.insert(record_key.to_string(), canonical);
            }
            None => {
                self.unregister(id);
                if !self.unkeyed.contains(&id) {
                    self.unkeyed.push(id);
                }
            }
        }
        Ok(())
    }

    /// Register an associated object under its current key.
    fn register_associated(&mut self, settings: &ReplicationSettings, id: StagedId) -> Result<StagedId> {
        match self.key_of(settings, id) {
            Some(key) => self.register(settings, id, key),
            None => {
                self.unregister(id);
                Ok(id)
            }
        }
    }

    /// Stage an attribute of a main object.
    pub(crate) fn set_main_attribute(
        &mut self,
        settings: &ReplicationSettings,
        main: StagedId,
        alias: &str,
        value: Value,
    ) -> Result<()> {
        let member = settings
            .route(alias)
            .map(FieldRoute::member)
            .ok_or_else(|| ReplicationError::config(format!("Field alias {} is not mapped", alias)))?
            .to_string();
        let key_member = settings.main().is_key(alias);
        self.objects[main.0].set_attribute(&member, value, key_member)
    }

    fn association_route<'s>(
        settings: &'s ReplicationSettings,
        alias: &str,
    ) -> Result<(&'s str, &'s str)> {
        match settings.route(alias) {
            Some(FieldRoute::Association {
                association,
                member,
                ..
            }) => Ok((association.as_str(), member.as_str())),
            _ => Err(ReplicationError::config(format!(
                "Field alias {} is not mapped to an association",
                alias
            ))),
        }
    }

    /// Stage a value of the single object linked to `main` through the
    /// alias' association.
    pub(crate) fn set_association_value(
        &mut self,
        context: &RunContext,
        settings: &ReplicationSettings,
        main: StagedId,
        alias: &str,
        value: Value,
    ) -> Result<()> {
        let (association, member) = Self::association_route(settings, alias)?;
        let config = settings
            .association(association)
            .ok_or_else(|| ReplicationError::config(format!("Association {} is not mapped", association)))?;
        if config.acts_as_reference_set() {
            return Err(ReplicationError::config(format!(
                "Field {} is linked through {}, which holds many objects",
                alias, association
            )));
        }
        if value.is_empty() && settings.main().ignore_empty_keys() {
            return Ok(());
        }

        let key_member = config.object().is_key(alias);
        let linked = match self.objects[main.0].single_link(association) {
            Some(linked) => linked,
            None => self.stage_associated(context, association, config.object_type()),
        };
        self.objects[linked.0].set_attribute(member, value, key_member)?;
        let canonical = self.register_associated(settings, linked)?;
        self.objects[main.0].link_single(association, canonical)?;
        if settings.main().is_key(alias) {
            self.objects[main.0].invalidate_key();
        }
        Ok(())
    }

    /// Stage a value of a reference-set link. A value for a member the tail
    /// entry already holds starts a new linked object.
    pub(crate) fn add_association_value(
        &mut self,
        context: &RunContext,
        settings: &ReplicationSettings,
        main: StagedId,
        alias: &str,
        value: Value,
    ) -> Result<()> {
        let (association, member) = Self::association_route(settings, alias)?;
        let config = settings
            .association(association)
            .ok_or_else(|| ReplicationError::config(format!("Association {} is not mapped", association)))?;
        if !config.acts_as_reference_set() {
            return Err(ReplicationError::config(format!(
                "Field {} is linked through {}, which holds a single object",
                alias, association
            )));
        }
        let object_config = config.object();
        if value.is_empty() && object_config.ignore_empty_keys() {
            return Ok(());
        }

        let key_member = object_config.is_key(alias);
        let tail = self.objects[main.0].multi_link(association).last().copied();
        let start_new = match tail {
            None => true,
            Some(tail) => {
                let current = self.objects[tail.0].attribute(member);
                let has_value = current.map(|v| !v.is_null()).unwrap_or(false);
                let create_everything =
                    object_config.search_action() == SearchAction::CreateEverything;
                (key_member && has_value)
                    || (create_everything && object_config.ignore_empty_keys() && has_value)
                    || (create_everything && !object_config.ignore_empty_keys() && current.is_some())
            }
        };

        match tail {
            Some(tail) if !start_new => {
                self.objects[tail.0].set_attribute(member, value, key_member)?;
                let canonical = self.register_associated(settings, tail)?;
                if canonical != tail {
                    self.objects[main.0].replace_last_multi(association, canonical)?;
                }
            }
            _ => {
                let linked = self.stage_associated(context, association, config.object_type());
                self.objects[linked.0].set_attribute(member, value, key_member)?;
                let canonical = self.register_associated(settings, linked)?;
                self.objects[main.0].push_multi(association, canonical)?;
            }
        }
        Ok(())
    }

    /// Flush every staged object and forget the batch.
    pub(crate) fn clear(&mut self) {
        for object in &mut self.objects {
            object.reset();
        }
        self.objects.clear();
        self.records.clear();
        self.by_key.clear();
        self.associated.clear();
        self.unkeyed.clear();
    }
}
