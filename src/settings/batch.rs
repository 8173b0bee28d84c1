// ABOUTME: Batching limits for lookups, fetches, removals and processing
// ABOUTME: Defaults match typical backend predicate and page size limits

use serde::{Deserialize, Serialize};

/// Backend limit on parameters in a single predicate.
const MAX_PREDICATE_PARAMETERS: usize = 2100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfiguration {
    /// Ids fetched per fetch-by-id call
    pub retrieve_by_id_limit: usize,
    /// Staged keys per lookup query
    pub lookup_page_size: usize,
    /// Objects deleted per removal call
    pub removal_batch_size: usize,
    /// Staged main objects that trigger processing of a batch
    pub processing_batch_threshold: usize,
}

impl Default for BatchConfiguration {
    fn default() -> Self {
        Self {
            retrieve_by_id_limit: 200,
            lookup_page_size: 1000,
            removal_batch_size: 200,
            processing_batch_threshold: 1000,
        }
    }
}

impl BatchConfiguration {
    /// Lower the lookup page size so that `key_count` conditions per staged
    /// key stay under the backend predicate limit, with 20% headroom.
    pub fn recalculate_lookup_page_size(&mut self, key_count: usize) {
        if key_count == 0 {
            return;
        }
        let limit = (MAX_PREDICATE_PARAMETERS / key_count) * 4 / 5;
        let limit = std::cmp::max(1, limit);
        if limit < self.lookup_page_size {
            tracing::debug!(
                "Lowering lookup page size from {} to {} for {} key fields",
                self.lookup_page_size,
                limit,
                key_count
            );
            self.lookup_page_size = limit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfiguration::default();
        assert_eq!(config.retrieve_by_id_limit, 200);
        assert_eq!(config.lookup_page_size, 1000);
        assert_eq!(config.removal_batch_size, 200);
        assert_eq!(config.processing_batch_threshold, 1000);
    }

    #[test]
    fn test_page_size_only_moves_down() {
        let mut config = BatchConfiguration::default();
        config.recalculate_lookup_page_size(1);
        assert_eq!(config.lookup_page_size, 1000);

        config.recalculate_lookup_page_size(3);
        assert_eq!(config.lookup_page_size, 560);

        config.recalculate_lookup_page_size(7);
        assert_eq!(config.lookup_page_size, 240);

        config.recalculate_lookup_page_size(2);
        assert_eq!(config.lookup_page_size, 240);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BatchConfiguration = toml::from_str("processing_batch_threshold = 50").unwrap();
        assert_eq!(config.processing_batch_threshold, 50);
        assert_eq!(config.lookup_page_size, 1000);
    }
}
