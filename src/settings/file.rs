// ABOUTME: TOML mapping file describing schema, field mappings and run options
// ABOUTME: Applied through the ReplicationSettings API so the same checks run

use super::{
    AssociationConfig, BatchConfiguration, ChangeTracking, DataHandling, KeyType,
    ReplicationSettings,
};
use crate::error::Result;
use crate::handlers::{AbortOnError, SkipAndLog};
use crate::policy::SearchAction;
use crate::schema::Schema;
use crate::stats::StatisticsLevel;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainSection {
    pub object_type: String,
    #[serde(default)]
    pub search_action: SearchAction,
    #[serde(default = "default_true")]
    pub ignore_empty_keys: bool,
    #[serde(default)]
    pub change_tracking: ChangeTracking,
    #[serde(default)]
    pub remove_indicator: Option<String>,
    #[serde(default)]
    pub commit_unchanged_objects: bool,
    #[serde(default)]
    pub print_not_found_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub alias: String,
    pub member: String,
    #[serde(default)]
    pub key: KeyType,
    #[serde(default)]
    pub case_sensitive: bool,
    /// chrono format for textual dates
    #[serde(default)]
    pub date_format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationMapping {
    pub alias: String,
    pub association: String,
    pub target_type: String,
    pub member: String,
    #[serde(default)]
    pub key: KeyType,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub date_format: Option<String>,
}

/// Per-association policy, keyed by association name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationPolicy {
    pub association: String,
    #[serde(default)]
    pub search_action: Option<SearchAction>,
    #[serde(default)]
    pub data_handling: Option<DataHandling>,
    #[serde(default)]
    pub commit_unchanged_objects: Option<bool>,
    #[serde(default)]
    pub ignore_empty_keys: Option<bool>,
    #[serde(default)]
    pub print_not_found_messages: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    #[default]
    Abort,
    SkipAndLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub use_transactions: bool,
    pub retrieve_objects_async: bool,
    pub reset_empty_associations: bool,
    pub statistics_level: StatisticsLevel,
    pub error_handling: ErrorHandling,
    pub parent_association: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_transactions: true,
            retrieve_objects_async: false,
            reset_empty_associations: false,
            statistics_level: StatisticsLevel::default(),
            error_handling: ErrorHandling::default(),
            parent_association: None,
        }
    }
}

/// A complete mapping, typically stored as `mapping.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingFile {
    #[serde(default)]
    pub schema: Schema,
    pub main: MainSection,
    #[serde(default, rename = "attribute")]
    pub attributes: Vec<AttributeMapping>,
    #[serde(default, rename = "association")]
    pub associations: Vec<AssociationMapping>,
    #[serde(default, rename = "association_policy")]
    pub association_policies: Vec<AssociationPolicy>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default)]
    pub batch: BatchConfiguration,
}

fn default_true() -> bool {
    true
}

impl MappingFile {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("Failed to parse mapping file")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read mapping file {:?}", path))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid mapping file {:?}", path))
    }

    /// Build and validate the settings this file describes.
    pub fn into_settings(self) -> Result<ReplicationSettings> {
        let main = self.main;
        let mut settings = ReplicationSettings::new(Arc::new(self.schema), &main.object_type)?;
        settings
            .configure_main_object(
                &main.object_type,
                main.search_action,
                main.ignore_empty_keys,
                Some(main.change_tracking),
                main.remove_indicator.as_deref(),
            )?
            .set_commit_unchanged_objects(main.commit_unchanged_objects)
            .set_print_not_found_messages(main.print_not_found_messages);

        for mapping in &self.attributes {
            settings.map_attribute(
                &mapping.alias,
                &mapping.member,
                mapping.key,
                mapping.case_sensitive,
                None,
            )?;
            if let Some(format) = &mapping.date_format {
                settings.set_date_format(&mapping.alias, format);
            }
        }

        for mapping in &self.associations {
            settings.map_association(
                &mapping.alias,
                &mapping.association,
                &mapping.target_type,
                &mapping.member,
                None,
                mapping.key,
                mapping.case_sensitive,
            )?;
            if let Some(format) = &mapping.date_format {
                settings.set_date_format(&mapping.alias, format);
            }
        }

        for policy in &self.association_policies {
            let config: &mut AssociationConfig = settings.association_mut(&policy.association)?;
            if let Some(handling) = policy.data_handling {
                config.set_data_handling(handling);
            }
            let object = config.object_mut();
            if let Some(action) = policy.search_action {
                object.set_search_action(action);
            }
            if let Some(commit) = policy.commit_unchanged_objects {
                object.set_commit_unchanged_objects(commit);
            }
            if let Some(ignore) = policy.ignore_empty_keys {
                object.set_ignore_empty_keys(ignore);
            }
            if let Some(print) = policy.print_not_found_messages {
                object.set_print_not_found_messages(print);
            }
        }

        let options = self.options;
        settings.set_use_transactions(options.use_transactions);
        settings.set_retrieve_objects_async(options.retrieve_objects_async);
        settings.set_reset_empty_associations(options.reset_empty_associations);
        settings.set_statistics_level(options.statistics_level);
        match options.error_handling {
            ErrorHandling::Abort => settings.set_error_handler(Arc::new(AbortOnError)),
            ErrorHandling::SkipAndLog => settings.set_error_handler(Arc::new(SkipAndLog)),
        }
        if let Some(association) = &options.parent_association {
            settings.set_parent_association(association)?;
        }
        *settings.batch_mut() = self.batch;

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
        [[schema.entity]]
        name = "Crm.Customer"
        [[schema.entity.member]]
        name = "Code"
        type = "string"
        [[schema.entity.member]]
        name = "Marker"
        type = "integer"

        [[schema.entity]]
        name = "Crm.Country"
        [[schema.entity.member]]
        name = "Code"
        type = "string"

        [[schema.association]]
        name = "Crm.Customer_Country"
        parent = "Crm.Customer"
        child = "Crm.Country"

        [main]
        object_type = "Crm.Customer"
        search_action = "find-create"
        change_tracking = "remove-unchanged-objects"
        remove_indicator = "Marker"
        commit_unchanged_objects = true

        [[attribute]]
        alias = "code"
        member = "Code"
        key = "object-key"

        [[association]]
        alias = "country"
        association = "Crm.Customer_Country"
        target_type = "Crm.Country"
        member = "Code"
        key = "association-key"

        [[association_policy]]
        association = "Crm.Customer_Country"
        search_action = "find-create"

        [options]
        error_handling = "skip-and-log"

        [batch]
        processing_batch_threshold = 25
    "#;

    #[test]
    fn test_mapping_file_builds_settings() {
        let settings = MappingFile::from_toml_str(MAPPING)
            .unwrap()
            .into_settings()
            .unwrap();
        assert_eq!(settings.main().search_action(), SearchAction::FindCreate);
        assert_eq!(settings.main().remove_indicator(), Some("Marker"));
        assert!(settings.main().is_key("code"));
        assert!(settings.treat_field_as_reference("country"));
        let country = settings.association("Crm.Customer_Country").unwrap();
        assert_eq!(country.object().search_action(), SearchAction::FindCreate);
        assert_eq!(settings.batch().processing_batch_threshold, 25);
        assert!(settings.use_transactions());
    }

    #[test]
    fn test_invalid_mapping_is_a_configuration_error() {
        let broken = MAPPING.replace("commit_unchanged_objects = true", "");
        let err = MappingFile::from_toml_str(&broken).unwrap().into_settings();
        assert!(matches!(err, Err(crate::error::ReplicationError::Configuration(_))));
    }

    #[test]
    fn test_load_reports_path() {
        let err = MappingFile::load(Path::new("/nonexistent/mapping.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("mapping.toml"));
    }
}
