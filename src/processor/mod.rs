// ABOUTME: BatchProcessor - turns one staged batch into persisted changes
// ABOUTME: Retrieval, search-action resolution, member and link writes, ordered commit

pub mod retrieval;

pub use retrieval::ObjectRetrieval;

use crate::error::{ReplicationError, Result};
use crate::handlers::StagedRecord;
use crate::parser::is_key_empty;
use crate::policy::Resolution;
use crate::query::{ConditionPath, LookupField, LookupQueryBuilder, PendingEntry};
use crate::settings::{
    AssociationConfig, DataHandling, FieldRoute, ObjectConfig, ParentLink, ReplicationSettings,
};
use crate::staging::{ObjectState, RunContext, StagedId, StagingBatch};
use crate::stats::Stat;
use crate::store::{ObjectStore, PersistedObject};
use crate::value::{ObjectId, Value};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinError;

type Found = HashMap<String, PersistedObject>;

/// Processes one batch of staged objects.
pub struct BatchProcessor<'a> {
    settings: &'a Arc<ReplicationSettings>,
    store: &'a Arc<dyn ObjectStore>,
    context: &'a RunContext,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(
        settings: &'a Arc<ReplicationSettings>,
        store: &'a Arc<dyn ObjectStore>,
        context: &'a RunContext,
    ) -> Self {
        Self {
            settings,
            store,
            context,
        }
    }

    /// Resolve, write and commit every staged object, then flush the batch.
    pub async fn process(&self, batch: &mut StagingBatch) -> Result<()> {
        let mains = batch.main_objects();
        let associated = self.collect_associated(batch, &mains);
        for id in mains.iter().chain(associated.values().flatten()) {
            batch.key_of(self.settings, *id);
        }
        tracing::debug!(
            "Processing batch of {} {} objects and {} associated objects",
            mains.len(),
            self.settings.main().object_type(),
            associated.values().map(Vec::len).sum::<usize>()
        );

        let outcome = self.reconcile(batch, &mains, &associated).await;
        batch.clear();
        outcome
    }

    /// Retrieval, writes and commit, inside one transaction when enabled.
    async fn reconcile(
        &self,
        batch: &mut StagingBatch,
        mains: &[StagedId],
        associated: &IndexMap<String, Vec<StagedId>>,
    ) -> Result<()> {
        self.retrieve(batch, mains, associated).await?;

        let use_transactions = self.settings.use_transactions();
        if use_transactions {
            self.store
                .begin_transaction()
                .await
                .map_err(|e| ReplicationError::store("begin transaction", e))?;
        }
        let outcome = self.write_and_commit(batch, mains, associated).await;
        if !use_transactions {
            return outcome;
        }
        match outcome {
            Ok(()) => self
                .store
                .commit_transaction()
                .await
                .map_err(|e| ReplicationError::store("commit transaction", e)),
            Err(err) => {
                if let Err(e) = self.store.rollback_transaction().await {
                    tracing::warn!("Failed to roll back batch transaction: {:#}", e);
                }
                Err(err)
            }
        }
    }

    /// Every distinct associated object linked from the batch, per association.
    fn collect_associated(&self, batch: &StagingBatch, mains: &[StagedId]) -> IndexMap<String, Vec<StagedId>> {
        let mut associated: IndexMap<String, Vec<StagedId>> = self
            .settings
            .associations()
            .map(|config| (config.association_name().to_string(), Vec::new()))
            .collect();
        let mut seen: HashSet<StagedId> = HashSet::new();
        for main in mains {
            let object = batch.object(*main);
            let singles = object
                .single_links()
                .iter()
                .map(|(association, linked)| (association, *linked));
            let multis = object
                .multi_links()
                .iter()
                .flat_map(|(association, list)| list.iter().map(move |linked| (association, *linked)));
            for (association, linked) in singles.chain(multis) {
                if seen.insert(linked) {
                    associated.entry(association.clone()).or_default().push(linked);
                }
            }
        }
        associated
    }

    fn association(&self, name: &str) -> Result<&'a AssociationConfig> {
        let settings: &'a ReplicationSettings = self.settings;
        settings.association(name).ok_or_else(|| {
            ReplicationError::reconciliation(format!("Staged link through unmapped association {}", name))
        })
    }

    /// Look up persisted matches for main and associated objects and attach them.
    async fn retrieve(
        &self,
        batch: &mut StagingBatch,
        mains: &[StagedId],
        associated: &IndexMap<String, Vec<StagedId>>,
    ) -> Result<()> {
        let settings = self.settings;
        let fetch_limit = settings.batch().retrieve_by_id_limit;
        let page_size = settings.batch().lookup_page_size;

        let main = settings.main();
        let main_job = if main.search_action().performs_lookup() {
            let entries = pending_entries(batch, settings, mains, main.ignore_empty_keys());
            let builder = LookupQueryBuilder::new(main.object_type(), main_lookup_fields(settings), page_size);
            let job = ObjectRetrieval::new(
                main.object_type(),
                Arc::clone(self.store),
                builder,
                settings.main_key_fields(),
                fetch_limit,
            );
            Some((job, entries))
        } else {
            None
        };

        let mut association_jobs = Vec::new();
        for (name, ids) in associated {
            let config = self.association(name)?;
            let object = config.object();
            if !object.search_action().performs_lookup() || ids.is_empty() {
                continue;
            }
            let entries = pending_entries(batch, settings, ids, object.ignore_empty_keys());
            let builder = LookupQueryBuilder::new(object.object_type(), association_lookup_fields(object), page_size);
            let job = ObjectRetrieval::new(
                name,
                Arc::clone(self.store),
                builder,
                settings.association_key_fields(name),
                fetch_limit,
            );
            association_jobs.push((name.clone(), job, entries));
        }

        let run_main = async move {
            match main_job {
                Some((job, entries)) => job.run(entries).await,
                None => Ok(Found::new()),
            }
        };
        let run_associations = async move {
            let mut results = Vec::new();
            for (name, job, entries) in association_jobs {
                results.push((name, job.run(entries).await?));
            }
            Ok::<_, ReplicationError>(results)
        };

        let (main_found, association_found) = if settings.retrieve_objects_async() {
            let main_task = tokio::spawn(run_main);
            let association_task = tokio::spawn(run_associations);
            let (main_result, association_result) = tokio::join!(main_task, association_task);
            (joined(main_result)?, joined(association_result)?)
        } else {
            (run_main.await?, run_associations.await?)
        };

        attach(batch, mains, main_found)?;
        for (name, found) in association_found {
            if let Some(ids) = associated.get(&name) {
                attach(batch, ids, found)?;
            }
        }
        Ok(())
    }

    async fn write_and_commit(
        &self,
        batch: &mut StagingBatch,
        mains: &[StagedId],
        associated: &IndexMap<String, Vec<StagedId>>,
    ) -> Result<()> {
        for (name, ids) in associated {
            let config = self.association(name)?;
            for id in ids {
                self.resolve_associated(batch, config, *id).await?;
            }
        }
        for id in mains {
            self.resolve_main(batch, *id).await?;
        }
        self.commit_all(batch, mains, associated).await
    }

    /// Instantiate a new persisted object, consulting the error handler on failure.
    async fn instantiate(&self, object_type: &str, description: &str) -> Result<Option<PersistedObject>> {
        match self.store.instantiate(object_type).await {
            Ok(object) => Ok(Some(object)),
            Err(source) => {
                let err = ReplicationError::store("instantiate", source);
                if self.settings.error_handler().store_error(&err, description) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn resolve_associated(&self, batch: &mut StagingBatch, config: &AssociationConfig, id: StagedId) -> Result<()> {
        let statistics = self.context.statistics();
        let object_config = config.object();
        let name = config.association_name();
        let (key, found) = {
            let staged = batch.object(id);
            (staged.cached_key().map(str::to_string), staged.resolved().is_some())
        };

        match object_config.search_action().resolve(found) {
            Resolution::Create => {
                if is_key_empty(key.as_deref()) && object_config.ignore_empty_keys() {
                    tracing::warn!(
                        "Not creating {} for association {}: all key fields are empty",
                        object_config.object_type(),
                        name
                    );
                    batch.object_mut(id).detach(ObjectState::Unchanged)?;
                    statistics.add_association_stat(name, Stat::Skipped);
                    return Ok(());
                }
                let description = format!("{} {}", object_config.object_type(), key.as_deref().unwrap_or_default());
                let Some(created) = self.instantiate(object_config.object_type(), &description).await? else {
                    batch.object_mut(id).detach(ObjectState::Unchanged)?;
                    statistics.add_association_stat(name, Stat::Skipped);
                    return Ok(());
                };
                batch.object_mut(id).resolve_to(Some(created), ObjectState::New)?;
                self.write_attributes(batch, id, object_config)?;
            }
            Resolution::Update => {
                batch.object_mut(id).resolve_to(None, ObjectState::Unchanged)?;
                if object_config.has_non_key_members() || object_config.commit_unchanged_objects() {
                    self.write_attributes(batch, id, object_config)?;
                }
            }
            Resolution::Skip => {
                batch.object_mut(id).resolve_to(None, ObjectState::Unchanged)?;
            }
            Resolution::NotFound => {
                batch.object_mut(id).detach(ObjectState::Unchanged)?;
                statistics.record_unknown_associated(
                    name,
                    object_config.object_type(),
                    key.as_deref().unwrap_or_default(),
                    object_config.print_not_found_messages(),
                );
                return Ok(());
            }
        }
        Ok(())
    }

    async fn resolve_main(&self, batch: &mut StagingBatch, id: StagedId) -> Result<()> {
        let statistics = self.context.statistics();
        let main = self.settings.main();
        let (key, found) = {
            let staged = batch.object(id);
            (staged.cached_key().map(str::to_string), staged.resolved().is_some())
        };
        let Some(key) = key else {
            batch.object_mut(id).detach(ObjectState::Unchanged)?;
            statistics.add_object_stat(Stat::Skipped);
            return Ok(());
        };

        match main.search_action().resolve(found) {
            Resolution::Create => {
                let description = format!("{} {}", main.object_type(), key);
                let Some(created) = self.instantiate(main.object_type(), &description).await? else {
                    batch.object_mut(id).detach(ObjectState::Unchanged)?;
                    statistics.add_object_stat(Stat::Skipped);
                    return Ok(());
                };
                batch.object_mut(id).resolve_to(Some(created), ObjectState::New)?;
            }
            Resolution::Update => {
                batch.object_mut(id).resolve_to(None, ObjectState::Unchanged)?;
            }
            Resolution::Skip => {
                batch.object_mut(id).detach(ObjectState::Unchanged)?;
                statistics.add_object_stat(Stat::Skipped);
                return Ok(());
            }
            Resolution::NotFound => {
                batch.object_mut(id).detach(ObjectState::Unchanged)?;
                statistics.record_unknown_object(main.object_type(), &key, main.print_not_found_messages());
                return Ok(());
            }
        }

        self.write_main(batch, id).await
    }

    /// Copy staged attributes onto the resolved object.
    fn write_attributes(&self, batch: &mut StagingBatch, id: StagedId, config: &ObjectConfig) -> Result<()> {
        let staged = batch.object(id);
        let object_type = staged.object_type().to_string();
        let attributes: Vec<(String, Value)> = staged
            .attributes()
            .iter()
            .map(|(member, value)| (member.clone(), value.clone()))
            .collect();
        for (member, value) in attributes {
            let force = config.commit_unchanged_objects() || self.settings.is_write_only(&object_type, &member);
            batch.object_mut(id).update_member(&member, value, force)?;
        }
        Ok(())
    }

    /// Parent link, attributes and association links of a main object.
    async fn write_main(&self, batch: &mut StagingBatch, id: StagedId) -> Result<()> {
        let main = self.settings.main();
        let force = main.commit_unchanged_objects();

        if let Some(ParentLink {
            association,
            object_id: Some(parent),
        }) = self.settings.parent()
        {
            batch
                .object_mut(id)
                .update_member(association, Value::Reference(Some(*parent)), force)?;
        }

        self.write_attributes(batch, id, main)?;

        let main_id = batch
            .object(id)
            .resolved()
            .map(|object| object.id)
            .ok_or_else(|| ReplicationError::reconciliation("Main object written before it was resolved"))?;

        let singles: Vec<(String, StagedId)> = batch
            .object(id)
            .single_links()
            .iter()
            .map(|(association, linked)| (association.clone(), *linked))
            .collect();
        for (association, linked) in singles {
            let config = self.association(&association)?;
            let target = self.linked_object_id(batch, id, config, linked)?;
            if config.referenced_is_owner() {
                // the link lives on the associated object, an unmatched one has nothing to point back
                if target.is_some() {
                    self.write_back_pointer(batch, config, linked, main_id)?;
                }
            } else {
                // an unmatched value clears whatever the main object linked before
                batch
                    .object_mut(id)
                    .update_member(&association, Value::Reference(target), force)?;
            }
        }

        let multis: Vec<(String, Vec<StagedId>)> = batch
            .object(id)
            .multi_links()
            .iter()
            .map(|(association, list)| (association.clone(), list.clone()))
            .collect();
        for (association, list) in multis {
            let config = self.association(&association)?;
            let mut seen: HashSet<StagedId> = HashSet::new();
            let mut targets: Vec<(StagedId, ObjectId)> = Vec::new();
            for linked in list {
                if !seen.insert(linked) {
                    continue;
                }
                if let Some(target) = self.linked_object_id(batch, id, config, linked)? {
                    targets.push((linked, target));
                }
            }

            if config.referenced_is_owner() {
                for (linked, _) in targets {
                    self.write_back_pointer(batch, config, linked, main_id)?;
                }
                continue;
            }

            let mut ids: Vec<ObjectId> = match config.data_handling() {
                DataHandling::Overwrite => Vec::new(),
                DataHandling::Append => batch
                    .object(id)
                    .resolved()
                    .map(|object| object.get(&association).as_reference_set().to_vec())
                    .unwrap_or_default(),
            };
            for (_, target) in targets {
                if !ids.contains(&target) {
                    ids.push(target);
                }
            }
            batch
                .object_mut(id)
                .update_member(&association, Value::ReferenceSet(ids), force)?;
        }

        if self.settings.reset_empty_associations() {
            self.reset_empty_associations(batch, id, force)?;
        }
        Ok(())
    }

    /// Clear main-owned links the record left empty.
    fn reset_empty_associations(&self, batch: &mut StagingBatch, id: StagedId, force: bool) -> Result<()> {
        for config in self.settings.associations() {
            let association = config.association_name();
            if config.referenced_is_owner() || batch.object(id).has_link(association) {
                continue;
            }
            let cleared = if config.reference_kind().is_set() {
                if config.data_handling() == DataHandling::Append {
                    continue;
                }
                Value::ReferenceSet(Vec::new())
            } else {
                Value::Reference(None)
            };
            batch.object_mut(id).update_member(association, cleared, force)?;
        }
        Ok(())
    }

    /// Persisted id a staged link points to, asking the unknown-object handler
    /// when the linked record matched nothing.
    fn linked_object_id(
        &self,
        batch: &mut StagingBatch,
        main: StagedId,
        config: &AssociationConfig,
        linked: StagedId,
    ) -> Result<Option<ObjectId>> {
        if let Some(object) = batch.object(linked).resolved() {
            return Ok(Some(object.id));
        }
        let Some(handler) = config.unknown_object_handler() else {
            return Ok(None);
        };
        let main_object = batch
            .object(main)
            .resolved()
            .ok_or_else(|| ReplicationError::reconciliation("Main object linked before it was resolved"))?;

        let staged = batch.object(linked);
        let record = StagedRecord {
            association: config.association_name(),
            object_type: staged.object_type(),
            key: staged.cached_key(),
            attributes: staged.attributes(),
        };
        let resolved = match handler.resolve(&record, main_object) {
            Ok(resolved) => resolved,
            Err(source) => {
                let message = format!("unknown {} for association {}", staged.object_type(), config.association_name());
                let err = ReplicationError::store("resolve unknown object", source);
                if self.settings.error_handler().store_error(&err, &message) {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let Some(object) = resolved else {
            return Ok(None);
        };
        let target = object.id;
        if config.referenced_is_owner() {
            // the staged record takes the object over so the back pointer gets committed
            batch
                .object_mut(linked)
                .resolve_to(Some(object), ObjectState::Unchanged)?;
        }
        Ok(Some(target))
    }

    /// Point an owning associated object back at the main object.
    fn write_back_pointer(
        &self,
        batch: &mut StagingBatch,
        config: &AssociationConfig,
        linked: StagedId,
        main_id: ObjectId,
    ) -> Result<()> {
        let association = config.association_name();
        let Some(current) = batch.object(linked).resolved() else {
            return Ok(());
        };
        let value = if config.reference_kind().is_set() {
            let mut ids = current.get(association).as_reference_set().to_vec();
            if !ids.contains(&main_id) {
                ids.push(main_id);
            }
            Value::ReferenceSet(ids)
        } else {
            Value::Reference(Some(main_id))
        };
        let force = config.object().commit_unchanged_objects();
        batch
            .object_mut(linked)
            .update_member(association, value, force)?;
        Ok(())
    }

    /// Commit owning associated objects, then main objects, then the rest.
    async fn commit_all(
        &self,
        batch: &StagingBatch,
        mains: &[StagedId],
        associated: &IndexMap<String, Vec<StagedId>>,
    ) -> Result<()> {
        let mut owners = Vec::new();
        let mut others = Vec::new();
        for (name, ids) in associated {
            if self.association(name)?.referenced_is_owner() {
                owners.extend_from_slice(ids);
            } else {
                others.extend_from_slice(ids);
            }
        }

        let mut ledger = CommitLedger::default();
        self.commit_group(batch, "owning associated objects", &owners, &mut ledger)
            .await?;
        self.commit_group(batch, "main objects", mains, &mut ledger)
            .await?;
        self.commit_group(batch, "associated objects", &others, &mut ledger)
            .await
    }

    /// Commit one group. Statistics are recorded once the outcome is known.
    async fn commit_group(
        &self,
        batch: &StagingBatch,
        label: &str,
        ids: &[StagedId],
        ledger: &mut CommitLedger,
    ) -> Result<()> {
        let mut pending = Vec::new();
        let mut objects = Vec::new();
        for id in ids {
            let staged = batch.object(*id);
            if staged.state() == ObjectState::Reset {
                return Err(ReplicationError::reconciliation(format!(
                    "Staged {} object {} was flushed before it was committed",
                    staged.object_type(),
                    staged.run_id()
                )));
            }
            // detached objects were counted when they were resolved
            let Some(object) = staged.resolved() else {
                continue;
            };
            if !staged.state().needs_commit() {
                self.record_stat(batch, *id, staged.state().stat());
                continue;
            }
            pending.push(*id);
            if ledger.committed.insert(object.id) {
                let mut object = object.clone();
                object.drop_references(&ledger.dropped);
                objects.push(object);
            }
        }
        if objects.is_empty() {
            for id in pending {
                self.record_stat(batch, id, batch.object(id).state().stat());
            }
            return Ok(());
        }

        let count = objects.len();
        tracing::debug!("Committing {} {}", count, label);
        match self.store.commit(objects.clone()).await {
            Ok(()) => {
                for id in pending {
                    self.record_stat(batch, id, batch.object(id).state().stat());
                }
                ledger.persisted.extend(objects);
                Ok(())
            }
            Err(source) => {
                let err = ReplicationError::store("commit", source);
                let message = format!("{} {}", count, label);
                if !self.settings.error_handler().store_error(&err, &message) {
                    return Err(err);
                }
                let mut lost = HashSet::new();
                for id in pending {
                    let staged = batch.object(id);
                    if staged.state() == ObjectState::New {
                        if let Some(object) = staged.resolved() {
                            lost.insert(object.id);
                        }
                    }
                    self.record_stat(batch, id, Stat::Skipped);
                }
                self.unlink_lost_objects(ledger, lost).await
            }
        }
    }

    /// Recommit already persisted objects that link to objects whose commit
    /// was skipped, so nothing points at an object that was never stored.
    async fn unlink_lost_objects(&self, ledger: &mut CommitLedger, lost: HashSet<ObjectId>) -> Result<()> {
        if lost.is_empty() {
            return Ok(());
        }
        ledger.dropped.extend(lost.iter().copied());
        let repaired: Vec<PersistedObject> = ledger
            .persisted
            .iter_mut()
            .filter_map(|object| object.drop_references(&lost).then(|| object.clone()))
            .collect();
        if repaired.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            "Unlinking {} committed objects from {} objects that were not stored",
            repaired.len(),
            lost.len()
        );
        if let Err(source) = self.store.commit(repaired).await {
            let err = ReplicationError::store("commit", source);
            if !self.settings.error_handler().store_error(&err, "unlinking skipped objects") {
                return Err(err);
            }
        }
        Ok(())
    }

    fn record_stat(&self, batch: &StagingBatch, id: StagedId, stat: Stat) {
        let statistics = self.context.statistics();
        match batch.object(id).association() {
            Some(association) => statistics.add_association_stat(association, stat),
            None => statistics.add_object_stat(stat),
        }
    }
}

/// What the commit phase of one batch has stored so far.
#[derive(Default)]
struct CommitLedger {
    /// Persisted ids already handed to the store
    committed: HashSet<ObjectId>,
    /// Objects stored by this batch, as committed
    persisted: Vec<PersistedObject>,
    /// New objects whose commit was skipped
    dropped: HashSet<ObjectId>,
}

/// Lookup conditions for the main object's key fields.
fn main_lookup_fields(settings: &ReplicationSettings) -> Vec<LookupField> {
    settings
        .main()
        .keys()
        .iter()
        .filter_map(|(alias, case_sensitive)| {
            let path = match settings.route(alias)? {
                FieldRoute::Attribute { member, .. } => ConditionPath::Member(member.clone()),
                FieldRoute::Association {
                    association,
                    member,
                    ..
                } => ConditionPath::Associated {
                    association: association.clone(),
                    target_type: settings.association(association)?.object_type().to_string(),
                    member: member.clone(),
                },
            };
            Some(LookupField {
                alias: alias.clone(),
                path,
                case_sensitive: *case_sensitive,
            })
        })
        .collect()
}

fn association_lookup_fields(config: &ObjectConfig) -> Vec<LookupField> {
    config
        .keys()
        .iter()
        .filter_map(|(alias, case_sensitive)| {
            Some(LookupField {
                alias: alias.clone(),
                path: ConditionPath::Member(config.member_for(alias)?.to_string()),
                case_sensitive: *case_sensitive,
            })
        })
        .collect()
}

/// One pending entry per distinct non-empty key.
fn pending_entries(
    batch: &mut StagingBatch,
    settings: &ReplicationSettings,
    ids: &[StagedId],
    ignore_empty_keys: bool,
) -> Vec<PendingEntry> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();
    for id in ids {
        let Some(key) = batch.key_of(settings, *id) else {
            continue;
        };
        if ignore_empty_keys && is_key_empty(Some(&key)) {
            continue;
        }
        if seen.insert(key.clone()) {
            entries.push(PendingEntry {
                key,
                values: batch.key_values(*id),
            });
        }
    }
    entries
}

/// Attach persisted matches to the staged objects with the same key.
fn attach(batch: &mut StagingBatch, ids: &[StagedId], found: Found) -> Result<()> {
    if found.is_empty() {
        return Ok(());
    }
    for id in ids {
        let Some(key) = batch.object(*id).cached_key().map(str::to_string) else {
            continue;
        };
        if let Some(object) = found.get(&key) {
            batch.object_mut(*id).attach(object.clone())?;
        }
    }
    Ok(())
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.map_err(|e| ReplicationError::reconciliation(format!("Retrieval task failed: {}", e)))?
}
