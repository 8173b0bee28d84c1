// ABOUTME: ObjectConfig - declarative identity and policy for one object type
// ABOUTME: Holds key fields, member routing, search action and change tracking

use crate::error::{ReplicationError, Result};
use crate::policy::SearchAction;
use crate::schema::Schema;
use crate::value::PrimitiveType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bookkeeping applied to objects touched by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeTracking {
    #[default]
    Nothing,
    /// Tag touched objects with the run's remove indicator
    TrackChanges,
    /// Tag touched objects and delete every untagged one at the end
    RemoveUnchangedObjects,
}

impl ChangeTracking {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ChangeTracking::Nothing)
    }
}

/// Whether a mapped field takes part in a composite key, and whose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    #[default]
    NoKey,
    /// Key of the main object
    ObjectKey,
    /// Key of the associated object only
    AssociationKey,
    /// Key of both the associated object and the main object
    AssociationAndObjectKey,
}

/// Identity and policy for one object type.
#[derive(Debug, Clone)]
pub struct ObjectConfig {
    object_type: String,
    /// alias -> case sensitive, in lexicographic alias order
    keys: BTreeMap<String, bool>,
    /// alias -> member name
    members: BTreeMap<String, String>,
    search_action: SearchAction,
    change_tracking: ChangeTracking,
    remove_indicator: Option<String>,
    commit_unchanged_objects: bool,
    ignore_empty_keys: bool,
    print_not_found_messages: bool,
    is_main: bool,
}

impl ObjectConfig {
    /// Create a config for an associated object type.
    pub fn new(object_type: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            keys: BTreeMap::new(),
            members: BTreeMap::new(),
            search_action: SearchAction::default(),
            change_tracking: ChangeTracking::Nothing,
            remove_indicator: None,
            commit_unchanged_objects: false,
            ignore_empty_keys: false,
            print_not_found_messages: false,
            is_main: false,
        }
    }

    /// Create the config for the main object type. Empty keys are ignored by default.
    pub fn main(object_type: &str) -> Self {
        Self {
            ignore_empty_keys: true,
            is_main: true,
            ..Self::new(object_type)
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn search_action(&self) -> SearchAction {
        self.search_action
    }

    pub fn change_tracking(&self) -> ChangeTracking {
        self.change_tracking
    }

    pub fn remove_indicator(&self) -> Option<&str> {
        self.remove_indicator.as_deref()
    }

    pub fn commit_unchanged_objects(&self) -> bool {
        self.commit_unchanged_objects
    }

    pub fn ignore_empty_keys(&self) -> bool {
        self.ignore_empty_keys
    }

    pub fn print_not_found_messages(&self) -> bool {
        self.print_not_found_messages
    }

    pub fn keys(&self) -> &BTreeMap<String, bool> {
        &self.keys
    }

    pub fn members(&self) -> &BTreeMap<String, String> {
        &self.members
    }

    pub fn set_search_action(&mut self, action: SearchAction) -> &mut Self {
        self.search_action = action;
        self
    }

    pub fn set_commit_unchanged_objects(&mut self, commit: bool) -> &mut Self {
        self.commit_unchanged_objects = commit;
        self
    }

    pub fn set_ignore_empty_keys(&mut self, ignore: bool) -> &mut Self {
        self.ignore_empty_keys = ignore;
        self
    }

    pub fn set_print_not_found_messages(&mut self, print: bool) -> &mut Self {
        self.print_not_found_messages = print;
        self
    }

    /// Enable or disable change tracking.
    ///
    /// Any policy other than `Nothing` needs an Integer member of this type to
    /// hold the remove indicator.
    pub fn set_change_tracking(
        &mut self,
        schema: &Schema,
        tracking: ChangeTracking,
        remove_indicator: Option<&str>,
    ) -> Result<&mut Self> {
        if !tracking.is_enabled() {
            self.change_tracking = tracking;
            self.remove_indicator = remove_indicator.map(str::to_string);
            return Ok(self);
        }

        let indicator = remove_indicator.ok_or_else(|| {
            ReplicationError::config(format!(
                "Change tracking on {} requires a remove indicator member",
                self.object_type
            ))
        })?;
        let member = schema.member(&self.object_type, indicator).ok_or_else(|| {
            ReplicationError::config(format!(
                "Remove indicator {} does not exist on {}",
                indicator, self.object_type
            ))
        })?;
        if member.member_type != PrimitiveType::Integer {
            return Err(ReplicationError::config(format!(
                "Remove indicator {}.{} must be an integer member, found {}",
                self.object_type, indicator, member.member_type
            )));
        }

        self.change_tracking = tracking;
        self.remove_indicator = Some(indicator.to_string());
        Ok(self)
    }

    /// Check that the tracking policy and the search action fit together.
    pub fn check_tracking_policy(&self) -> Result<()> {
        if self.change_tracking.is_enabled()
            && !self.commit_unchanged_objects
            && self.search_action == SearchAction::FindCreate
        {
            return Err(ReplicationError::config(format!(
                "Change tracking on {} with find-create requires commit-unchanged-objects",
                self.object_type
            )));
        }
        Ok(())
    }

    /// Whether objects of this type are tagged with the run's remove indicator.
    pub fn uses_remove_indicator(&self) -> bool {
        self.is_main
            && self.remove_indicator.is_some()
            && self.change_tracking.is_enabled()
            && !matches!(
                self.search_action,
                SearchAction::CreateEverything | SearchAction::OnlyCreateNewObjects
            )
    }

    pub(crate) fn add_key(&mut self, alias: &str, case_sensitive: bool) {
        self.keys.insert(alias.to_string(), case_sensitive);
    }

    pub(crate) fn add_member(&mut self, alias: &str, member: &str) {
        self.members.insert(alias.to_string(), member.to_string());
    }

    pub fn member_for(&self, alias: &str) -> Option<&str> {
        self.members.get(alias).map(String::as_str)
    }

    pub fn is_key(&self, alias: &str) -> bool {
        self.keys.contains_key(alias)
    }

    pub fn has_key_members(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn has_non_key_members(&self) -> bool {
        self.keys.len() < self.members.len()
    }

    /// Case sensitivity of a key alias; non-key aliases are case-insensitive.
    pub fn is_case_sensitive(&self, alias: &str) -> bool {
        self.keys.get(alias).copied().unwrap_or(false)
    }

    /// Whether `member` is stored by one of the key aliases.
    pub fn contains_key_member(&self, member: &str) -> bool {
        self.keys
            .keys()
            .any(|alias| self.member_for(alias) == Some(member))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDef;

    fn schema() -> Schema {
        Schema::new().with_entity(
            EntityDef::new("Crm.Customer")
                .member("Code", PrimitiveType::String)
                .member("Marker", PrimitiveType::Integer)
                .member("Label", PrimitiveType::String),
        )
    }

    #[test]
    fn test_main_defaults() {
        let config = ObjectConfig::main("Crm.Customer");
        assert!(config.is_main());
        assert!(config.ignore_empty_keys());
        assert_eq!(config.search_action(), SearchAction::FindIgnore);
        assert!(!ObjectConfig::new("Crm.Country").ignore_empty_keys());
    }

    #[test]
    fn test_change_tracking_requires_integer_indicator() {
        let schema = schema();
        let mut config = ObjectConfig::main("Crm.Customer");
        assert!(config
            .set_change_tracking(&schema, ChangeTracking::TrackChanges, None)
            .is_err());
        assert!(config
            .set_change_tracking(&schema, ChangeTracking::TrackChanges, Some("Label"))
            .is_err());
        assert!(config
            .set_change_tracking(&schema, ChangeTracking::TrackChanges, Some("Missing"))
            .is_err());
        config
            .set_change_tracking(&schema, ChangeTracking::RemoveUnchangedObjects, Some("Marker"))
            .unwrap();
        assert_eq!(config.remove_indicator(), Some("Marker"));
    }

    #[test]
    fn test_tracking_with_find_create_needs_commit_unchanged() {
        let schema = schema();
        let mut config = ObjectConfig::main("Crm.Customer");
        config.set_search_action(SearchAction::FindCreate);
        config
            .set_change_tracking(&schema, ChangeTracking::TrackChanges, Some("Marker"))
            .unwrap();
        assert!(config.check_tracking_policy().is_err());
        config.set_commit_unchanged_objects(true);
        assert!(config.check_tracking_policy().is_ok());
        assert!(config.uses_remove_indicator());
    }

    #[test]
    fn test_remove_indicator_not_used_when_only_creating() {
        let schema = schema();
        let mut config = ObjectConfig::main("Crm.Customer");
        config.set_search_action(SearchAction::OnlyCreateNewObjects);
        config
            .set_change_tracking(&schema, ChangeTracking::TrackChanges, Some("Marker"))
            .unwrap();
        assert!(!config.uses_remove_indicator());
    }

    #[test]
    fn test_key_helpers() {
        let mut config = ObjectConfig::new("Crm.Country");
        config.add_member("code", "Code");
        config.add_member("label", "Label");
        config.add_key("code", true);
        assert!(config.is_key("code"));
        assert!(config.is_case_sensitive("code"));
        assert!(!config.is_case_sensitive("label"));
        assert!(config.has_non_key_members());
        assert!(config.contains_key_member("Code"));
        assert!(!config.contains_key_member("Label"));
    }
}
