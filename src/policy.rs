// ABOUTME: Search-action policy shared by main-object and association resolution
// ABOUTME: Decides create/update/skip/not-found from whether a match exists

use serde::{Deserialize, Serialize};
use std::fmt;

/// How staged records are matched against persisted objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchAction {
    /// Never look up; every distinct key creates a new object
    CreateEverything,
    /// Update matches, create the rest
    FindCreate,
    /// Update matches, report the rest as not found
    #[default]
    FindIgnore,
    /// Create unmatched keys, never touch existing objects
    OnlyCreateNewObjects,
}

/// What to do with one staged object once its lookup finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Instantiate a new persisted object
    Create,
    /// Write changes onto the matched (or already created) object
    Update,
    /// Leave the match untouched
    Skip,
    /// No match and creation is not allowed
    NotFound,
}

impl SearchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchAction::CreateEverything => "create-everything",
            SearchAction::FindCreate => "find-create",
            SearchAction::FindIgnore => "find-ignore",
            SearchAction::OnlyCreateNewObjects => "only-create-new-objects",
        }
    }

    /// Whether persisted objects are looked up before resolving.
    pub fn performs_lookup(&self) -> bool {
        !matches!(self, SearchAction::CreateEverything)
    }

    /// Whether this action can ever modify an object that existed before the run.
    pub fn updates_existing(&self) -> bool {
        matches!(self, SearchAction::FindCreate | SearchAction::FindIgnore)
    }

    /// Decide the outcome for a staged object.
    ///
    /// `found` is true when the lookup matched a persisted object, or, for
    /// `CreateEverything`, when the same key was already created in this run.
    pub fn resolve(&self, found: bool) -> Resolution {
        match (self, found) {
            (SearchAction::CreateEverything, true) => Resolution::Update,
            (SearchAction::CreateEverything, false) => Resolution::Create,
            (SearchAction::FindCreate, true) => Resolution::Update,
            (SearchAction::FindCreate, false) => Resolution::Create,
            (SearchAction::FindIgnore, true) => Resolution::Update,
            (SearchAction::FindIgnore, false) => Resolution::NotFound,
            (SearchAction::OnlyCreateNewObjects, true) => Resolution::Skip,
            (SearchAction::OnlyCreateNewObjects, false) => Resolution::Create,
        }
    }
}

impl fmt::Display for SearchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_ignore_never_creates() {
        assert_eq!(SearchAction::FindIgnore.resolve(false), Resolution::NotFound);
        assert_eq!(SearchAction::FindIgnore.resolve(true), Resolution::Update);
    }

    #[test]
    fn test_only_create_new_never_updates() {
        assert_eq!(SearchAction::OnlyCreateNewObjects.resolve(true), Resolution::Skip);
        assert_eq!(SearchAction::OnlyCreateNewObjects.resolve(false), Resolution::Create);
        assert!(!SearchAction::OnlyCreateNewObjects.updates_existing());
    }

    #[test]
    fn test_create_everything_skips_lookup() {
        assert!(!SearchAction::CreateEverything.performs_lookup());
        assert_eq!(SearchAction::CreateEverything.resolve(false), Resolution::Create);
        assert!(SearchAction::FindCreate.performs_lookup());
        assert_eq!(SearchAction::FindCreate.resolve(true), Resolution::Update);
    }

    #[test]
    fn test_serde_names() {
        let action: SearchAction = serde_json::from_str("\"only-create-new-objects\"").unwrap();
        assert_eq!(action, SearchAction::OnlyCreateNewObjects);
        assert_eq!(action.to_string(), "only-create-new-objects");
    }
}
