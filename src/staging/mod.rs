// ABOUTME: ReplicationRun - caller-facing API that stages values and drives batch processing
// ABOUTME: Owns the per-run context, the staging batch and the remove indicator bookkeeping

pub mod batch;
pub mod object;

pub use batch::StagingBatch;
pub use object::{ObjectState, StagedId, StagedKind, StagedObject};

use crate::error::{ReplicationError, Result};
use crate::processor::BatchProcessor;
use crate::settings::{ChangeTracking, FieldRoute, ReplicationSettings};
use crate::stats::{ObjectStatistics, StatisticsSnapshot};
use crate::store::ObjectStore;
use crate::tracking::RemovalMarker;
use crate::value::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by everything working on one run.
#[derive(Debug)]
pub struct RunContext {
    next_id: AtomicU64,
    statistics: Arc<ObjectStatistics>,
}

impl RunContext {
    pub fn new(statistics: Arc<ObjectStatistics>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            statistics,
        }
    }

    /// Next run-local staged object id, starting at 1.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn statistics(&self) -> &Arc<ObjectStatistics> {
        &self.statistics
    }
}

/// One replication run: feed values with `add_value` and friends, then call
/// `finish` to flush the last batch and remove stale objects.
pub struct ReplicationRun {
    settings: Arc<ReplicationSettings>,
    store: Arc<dyn ObjectStore>,
    context: RunContext,
    batch: StagingBatch,
    current_record: Option<String>,
    marker: Option<RemovalMarker>,
    started: Instant,
}

impl ReplicationRun {
    /// Validate the settings and prepare the remove indicator.
    pub async fn start(mut settings: ReplicationSettings, store: Arc<dyn ObjectStore>) -> Result<Self> {
        settings.validate()?;
        let main = settings.main();
        tracing::info!(
            "Starting replication of {} with {} ({} associations)",
            main.object_type(),
            main.search_action(),
            settings.associations().count()
        );

        let marker = RemovalMarker::prepare(store.as_ref(), main).await?;
        let statistics = Arc::new(ObjectStatistics::new(
            main.object_type(),
            settings.statistics_level(),
        ));
        let batch = StagingBatch::new(&settings);
        Ok(Self {
            settings: Arc::new(settings),
            store,
            context: RunContext::new(statistics),
            batch,
            current_record: None,
            marker,
            started: Instant::now(),
        })
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    /// Objects staged in the current batch.
    pub fn staging(&self) -> &StagingBatch {
        &self.batch
    }

    pub fn marker(&self) -> Option<&RemovalMarker> {
        self.marker.as_ref()
    }

    /// Statistics collected so far.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.context.statistics().snapshot()
    }

    /// Stage one raw value for the record identified by `record_key`.
    ///
    /// Association aliases are dispatched to `set_association_value` or
    /// `add_association_value` depending on the link cardinality.
    pub async fn add_value(&mut self, record_key: &str, alias: &str, raw: impl Into<Value>) -> Result<()> {
        let result = self.stage_value(record_key, alias, raw.into(), None).await;
        result.map_err(|err| self.aborted(err))
    }

    /// Stage a value of the single object linked through the alias' association.
    pub async fn set_association_value(
        &mut self,
        record_key: &str,
        alias: &str,
        raw: impl Into<Value>,
    ) -> Result<()> {
        let result = self
            .stage_value(record_key, alias, raw.into(), Some(false))
            .await;
        result.map_err(|err| self.aborted(err))
    }

    /// Stage a value of a reference-set link, starting a new linked object
    /// when the current one already holds the member.
    pub async fn add_association_value(
        &mut self,
        record_key: &str,
        alias: &str,
        raw: impl Into<Value>,
    ) -> Result<()> {
        let result = self
            .stage_value(record_key, alias, raw.into(), Some(true))
            .await;
        result.map_err(|err| self.aborted(err))
    }

    async fn stage_value(
        &mut self,
        record_key: &str,
        alias: &str,
        raw: Value,
        as_reference_set: Option<bool>,
    ) -> Result<()> {
        let route = self
            .settings
            .route(alias)
            .cloned()
            .ok_or_else(|| ReplicationError::config(format!("Field alias {} is not mapped", alias)))?;
        let main = self.prepare_record(record_key).await?;
        let Some(value) = self.parse(record_key, alias, &raw)? else {
            return Ok(());
        };

        let settings = Arc::clone(&self.settings);
        match (route, as_reference_set) {
            (FieldRoute::Attribute { .. }, None) => {
                self.batch.set_main_attribute(&settings, main, alias, value)
            }
            (FieldRoute::Attribute { .. }, Some(_)) => Err(ReplicationError::config(format!(
                "Field {} is not mapped to an association",
                alias
            ))),
            (FieldRoute::Association { .. }, Some(true)) => {
                self.batch
                    .add_association_value(&self.context, &settings, main, alias, value)
            }
            (FieldRoute::Association { .. }, Some(false)) => {
                self.batch
                    .set_association_value(&self.context, &settings, main, alias, value)
            }
            (FieldRoute::Association { .. }, None) => {
                if settings.treat_field_as_reference_set(alias) {
                    self.batch
                        .add_association_value(&self.context, &settings, main, alias, value)
                } else {
                    self.batch
                        .set_association_value(&self.context, &settings, main, alias, value)
                }
            }
        }
    }

    /// Coerce a raw value, letting the error handler skip bad values.
    fn parse(&self, record_key: &str, alias: &str, raw: &Value) -> Result<Option<Value>> {
        match self.settings.parse_value(alias, raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_recoverable() => {
                let message = format!("record {}, field {}", record_key, alias);
                if self.settings.error_handler().value_error(&err, &message) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Switch to `record_key`, sealing the previous record and processing the
    /// batch once it reached the threshold.
    async fn prepare_record(&mut self, record_key: &str) -> Result<StagedId> {
        if self.current_record.as_deref() != Some(record_key) {
            if let Some(previous) = self.current_record.take() {
                self.batch.seal(&self.settings, &previous)?;
            }
            if self.batch.main_count() >= self.settings.batch().processing_batch_threshold {
                self.process_batch().await?;
            }
            self.current_record = Some(record_key.to_string());
        }
        let marker = match (&self.marker, self.settings.main().remove_indicator()) {
            (Some(marker), Some(member)) => Some((member, marker.new_value())),
            _ => None,
        };
        self.batch
            .main_for_record(&self.context, &self.settings, record_key, marker)
    }

    async fn process_batch(&mut self) -> Result<()> {
        if self.batch.main_count() == 0 {
            self.batch.clear();
            return Ok(());
        }
        let processor = BatchProcessor::new(&self.settings, &self.store, &self.context);
        processor.process(&mut self.batch).await
    }

    /// Flush the remaining objects, remove stale ones and report statistics.
    pub async fn finish(mut self) -> Result<StatisticsSnapshot> {
        let result = self.flush().await;
        if let Err(err) = result {
            return Err(self.aborted(err));
        }

        let duration_ms = whole_millis(self.started.elapsed());
        let statistics = self.context.statistics();
        statistics.print_final(duration_ms);
        let print_not_found = self.settings.main().print_not_found_messages()
            || self
                .settings
                .associations()
                .any(|config| config.object().print_not_found_messages());
        if print_not_found {
            statistics.print_not_found_messages();
        }

        let mut snapshot = statistics.snapshot();
        snapshot.duration_ms = duration_ms;
        Ok(snapshot)
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(previous) = self.current_record.take() {
            self.batch.seal(&self.settings, &previous)?;
        }
        self.process_batch().await?;

        if let Some(marker) = &self.marker {
            if self.settings.main().change_tracking() == ChangeTracking::RemoveUnchangedObjects {
                let removed = marker
                    .remove_stale(
                        self.store.as_ref(),
                        self.settings.batch().removal_batch_size,
                    )
                    .await?;
                self.context.statistics().add_removed(removed);
            }
        }
        Ok(())
    }

    fn aborted(&self, err: ReplicationError) -> ReplicationError {
        tracing::error!(
            "Replication of {} aborted after {} processed objects: {}",
            self.settings.main().object_type(),
            self.context.statistics().processed(),
            err
        );
        err
    }
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
