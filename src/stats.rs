// ABOUTME: ObjectStatistics - per-run counters for the main type and each association
// ABOUTME: Also collects unmatched keys and prints progress and final reports

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Outcome recorded for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stat {
    Created,
    Synchronized,
    NotFound,
    Removed,
    Skipped,
}

/// How much statistics output a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatisticsLevel {
    /// Progress during the run and a final report
    #[default]
    AllStatistics,
    /// Only the final report
    OnlyFinalStatistics,
    NoStatistics,
}

/// Counters for one object type or association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub created: u64,
    pub synchronized: u64,
    pub not_found: u64,
    pub removed: u64,
    pub skipped: u64,
}

impl Counters {
    fn add(&mut self, stat: Stat, count: u64) {
        match stat {
            Stat::Created => self.created += count,
            Stat::Synchronized => self.synchronized += count,
            Stat::NotFound => self.not_found += count,
            Stat::Removed => self.removed += count,
            Stat::Skipped => self.skipped += count,
        }
    }

    pub fn get(&self, stat: Stat) -> u64 {
        match stat {
            Stat::Created => self.created,
            Stat::Synchronized => self.synchronized,
            Stat::NotFound => self.not_found,
            Stat::Removed => self.removed,
            Stat::Skipped => self.skipped,
        }
    }

    /// Objects that went through resolution (removals are not processed objects).
    pub fn processed(&self) -> u64 {
        self.created + self.synchronized + self.not_found + self.skipped
    }
}

/// Copy of the statistics at a point in time, returned by `finish()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub object_type: String,
    pub main: Counters,
    pub associations: BTreeMap<String, Counters>,
    /// object type -> unmatched key -> occurrences
    pub not_found: BTreeMap<String, BTreeMap<String, u64>>,
    pub duration_ms: u64,
}

impl StatisticsSnapshot {
    pub fn association(&self, name: &str) -> Counters {
        self.associations.get(name).copied().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Inner {
    main: Counters,
    associations: BTreeMap<String, Counters>,
    unknown: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Thread-safe statistics accumulator shared by one run.
#[derive(Debug)]
pub struct ObjectStatistics {
    object_type: String,
    level: StatisticsLevel,
    inner: Mutex<Inner>,
}

impl ObjectStatistics {
    pub fn new(object_type: &str, level: StatisticsLevel) -> Self {
        Self {
            object_type: object_type.to_string(),
            level,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // counters stay meaningful even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_object_stat(&self, stat: Stat) {
        let processed = {
            let mut inner = self.lock();
            inner.main.add(stat, 1);
            inner.main.processed()
        };
        if stat != Stat::Removed {
            self.log_progress(processed);
        }
    }

    pub fn add_association_stat(&self, association: &str, stat: Stat) {
        let mut inner = self.lock();
        inner
            .associations
            .entry(association.to_string())
            .or_default()
            .add(stat, 1);
    }

    pub fn add_removed(&self, count: u64) {
        self.lock().main.add(Stat::Removed, count);
    }

    /// Count a main object that matched nothing, remembering its key when
    /// `record_key` is set.
    pub fn record_unknown_object(&self, object_type: &str, key: &str, record_key: bool) {
        let mut inner = self.lock();
        inner.main.add(Stat::NotFound, 1);
        if record_key {
            Self::remember(&mut inner, object_type, key);
        }
    }

    /// Count an associated object that matched nothing.
    pub fn record_unknown_associated(
        &self,
        association: &str,
        object_type: &str,
        key: &str,
        record_key: bool,
    ) {
        let mut inner = self.lock();
        inner
            .associations
            .entry(association.to_string())
            .or_default()
            .add(Stat::NotFound, 1);
        if record_key {
            Self::remember(&mut inner, object_type, key);
        }
    }

    fn remember(inner: &mut Inner, object_type: &str, key: &str) {
        *inner
            .unknown
            .entry(object_type.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    /// Objects processed so far for the main type.
    pub fn processed(&self) -> u64 {
        self.lock().main.processed()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let inner = self.lock();
        StatisticsSnapshot {
            object_type: self.object_type.clone(),
            main: inner.main,
            associations: inner.associations.clone(),
            not_found: inner.unknown.clone(),
            duration_ms: 0,
        }
    }

    fn log_progress(&self, processed: u64) {
        if self.level != StatisticsLevel::AllStatistics || processed == 0 {
            return;
        }
        if processed % 100 == 0 && tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("{}", self.runtime_line());
        } else if processed % 1000 == 0 {
            tracing::info!("{}", self.runtime_line());
        }
    }

    fn runtime_line(&self) -> String {
        let inner = self.lock();
        format!(
            "{}: processed {} objects so far ({} created, {} synchronized, {} skipped, {} not found)",
            self.object_type,
            inner.main.processed(),
            inner.main.created,
            inner.main.synchronized,
            inner.main.skipped,
            inner.main.not_found
        )
    }

    /// Log the final report, unless statistics are disabled.
    pub fn print_final(&self, duration_ms: u64) {
        if self.level == StatisticsLevel::NoStatistics {
            return;
        }
        let snapshot = self.snapshot();
        let main = snapshot.main;
        tracing::info!(
            "Replication of {} finished in {}ms: {} created, {} synchronized, {} skipped, {} not found, {} removed",
            snapshot.object_type,
            duration_ms,
            main.created,
            main.synchronized,
            main.skipped,
            main.not_found,
            main.removed
        );
        for (association, counters) in &snapshot.associations {
            tracing::info!(
                "  {}: {} created, {} synchronized, {} skipped, {} not found",
                association,
                counters.created,
                counters.synchronized,
                counters.skipped,
                counters.not_found
            );
        }
    }

    /// Log every unmatched key, sorted case-insensitively with occurrence counts.
    pub fn print_not_found_messages(&self) {
        for (object_type, keys) in self.not_found_report() {
            tracing::info!("Objects of type {} that could not be found:", object_type);
            for (key, occurrences) in keys {
                tracing::info!("  {} ({}x)", key, occurrences);
            }
        }
    }

    /// Unmatched keys per type in report order.
    pub fn not_found_report(&self) -> Vec<(String, Vec<(String, u64)>)> {
        let inner = self.lock();
        inner
            .unknown
            .iter()
            .map(|(object_type, keys)| {
                let mut keys: Vec<(String, u64)> =
                    keys.iter().map(|(k, n)| (k.clone(), *n)).collect();
                keys.sort_by(|(a, _), (b, _)| a.to_lowercase().cmp(&b.to_lowercase()).then(a.cmp(b)));
                (object_type.clone(), keys)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_per_stat() {
        let stats = ObjectStatistics::new("Crm.Customer", StatisticsLevel::NoStatistics);
        stats.add_object_stat(Stat::Created);
        stats.add_object_stat(Stat::Created);
        stats.add_object_stat(Stat::Skipped);
        stats.add_removed(5);
        stats.add_association_stat("Crm.Customer_Country", Stat::Synchronized);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.main.created, 2);
        assert_eq!(snapshot.main.skipped, 1);
        assert_eq!(snapshot.main.removed, 5);
        assert_eq!(snapshot.main.processed(), 3);
        assert_eq!(snapshot.association("Crm.Customer_Country").synchronized, 1);
        assert_eq!(snapshot.association("Crm.Other"), Counters::default());
    }

    #[test]
    fn test_unknown_keys_are_only_recorded_on_request() {
        let stats = ObjectStatistics::new("Crm.Customer", StatisticsLevel::NoStatistics);
        stats.record_unknown_object("Crm.Customer", "b|KEY|", true);
        stats.record_unknown_object("Crm.Customer", "B|KEY|", true);
        stats.record_unknown_object("Crm.Customer", "a|KEY|", true);
        stats.record_unknown_object("Crm.Customer", "a|KEY|", true);
        stats.record_unknown_object("Crm.Customer", "z|KEY|", false);

        assert_eq!(stats.snapshot().main.not_found, 5);
        let report = stats.not_found_report();
        assert_eq!(report.len(), 1);
        let keys: Vec<(&str, u64)> = report[0].1.iter().map(|(k, n)| (k.as_str(), *n)).collect();
        assert_eq!(keys, vec![("a|KEY|", 2), ("B|KEY|", 1), ("b|KEY|", 1)]);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(ObjectStatistics::new("Crm.Customer", StatisticsLevel::NoStatistics));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.add_association_stat("Crm.Customer_Tag", Stat::Created);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().association("Crm.Customer_Tag").created, 1000);
    }
}
