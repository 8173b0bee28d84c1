// ABOUTME: Lookup query builder for batched existence checks by composite key
// ABOUTME: Builds paged OR-of-AND predicates and renders them as query text

use crate::parser::query_literal;
use crate::store::PersistedObject;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;

/// The member a condition compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConditionPath {
    /// A member of the queried object
    Member(String),
    /// A member of the object reached through a single-valued association
    Associated {
        association: String,
        target_type: String,
        member: String,
    },
}

/// One key field used in lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupField {
    pub alias: String,
    pub path: ConditionPath,
    pub case_sensitive: bool,
}

/// `path = value`, with `Value::Null` meaning "not set".
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub alias: String,
    pub path: ConditionPath,
    pub value: Value,
    pub case_sensitive: bool,
}

/// A staged key waiting for its persisted match.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub key: String,
    /// alias -> typed value of the key field
    pub values: HashMap<String, Value>,
}

/// Disjunction of per-object conjunctions: one clause per staged key.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupQuery {
    pub object_type: String,
    pub clauses: Vec<Vec<Condition>>,
}

impl LookupQuery {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Associations joined by this query, with the alias used for the join.
    fn joins(&self) -> Vec<(String, &str, &str)> {
        let mut joins: Vec<(String, &str, &str)> = Vec::new();
        for condition in self.clauses.iter().flatten() {
            if let ConditionPath::Associated {
                association,
                target_type,
                ..
            } = &condition.path
            {
                let alias = format!("tbl_{}", condition.alias);
                if !joins.iter().any(|(a, _, _)| *a == alias) {
                    joins.push((alias, association, target_type));
                }
            }
        }
        joins
    }

    /// Render as query text, for logging and for stores that speak it.
    pub fn to_query_text(&self) -> String {
        let (module, entity) = self
            .object_type
            .split_once('.')
            .unwrap_or(("", self.object_type.as_str()));
        let mut text = if module.is_empty() {
            format!("SELECT obj/ID FROM \"{}\" AS obj", entity)
        } else {
            format!("SELECT obj/ID FROM \"{}\".\"{}\" AS obj", module, entity)
        };
        for (alias, association, target_type) in self.joins() {
            text.push_str(&format!(
                " LEFT JOIN obj/{}/{} AS {}",
                association, target_type, alias
            ));
        }
        if self.clauses.is_empty() {
            return text;
        }
        let clauses: Vec<String> = self
            .clauses
            .iter()
            .map(|conditions| {
                let parts: Vec<String> = conditions
                    .iter()
                    .map(|c| {
                        let column = match &c.path {
                            ConditionPath::Member(member) => format!("obj/{}", member),
                            ConditionPath::Associated { member, .. } => {
                                format!("tbl_{}/{}", c.alias, member)
                            }
                        };
                        format!("{} = {}", column, query_literal(&c.value))
                    })
                    .collect();
                format!("({})", parts.join(" AND "))
            })
            .collect();
        text.push_str(" WHERE ");
        text.push_str(&clauses.join(" OR "));
        text
    }
}

impl fmt::Display for LookupQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_text())
    }
}

/// Builds paged lookup queries for one object type.
#[derive(Debug, Clone)]
pub struct LookupQueryBuilder {
    object_type: String,
    fields: Vec<LookupField>,
    page_size: usize,
}

impl LookupQueryBuilder {
    pub fn new(object_type: &str, fields: Vec<LookupField>, page_size: usize) -> Self {
        Self {
            object_type: object_type.to_string(),
            fields,
            page_size: std::cmp::max(1, page_size),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn fields(&self) -> &[LookupField] {
        &self.fields
    }

    /// Build the query matching every given entry.
    pub fn build(&self, entries: &[PendingEntry]) -> LookupQuery {
        let clauses = entries
            .iter()
            .map(|entry| {
                self.fields
                    .iter()
                    .map(|field| Condition {
                        alias: field.alias.clone(),
                        path: field.path.clone(),
                        value: entry.values.get(&field.alias).cloned().unwrap_or_default(),
                        case_sensitive: field.case_sensitive,
                    })
                    .collect()
            })
            .collect();
        LookupQuery {
            object_type: self.object_type.clone(),
            clauses,
        }
    }

    /// Split the entries into queries of at most `page_size` keys each.
    pub fn build_pages(&self, entries: &[PendingEntry]) -> Vec<LookupQuery> {
        entries
            .chunks(self.page_size)
            .map(|page| self.build(page))
            .collect()
    }
}

/// Predicate selecting stale objects: marker differs from `keep_value` or is unset.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletePredicate {
    pub object_type: String,
    pub marker_member: String,
    pub keep_value: Value,
}

impl DeletePredicate {
    pub fn matches(&self, object: &PersistedObject) -> bool {
        if object.object_type != self.object_type {
            return false;
        }
        let marker = object.get(&self.marker_member);
        marker.is_null() || *marker != self.keep_value
    }
}

impl fmt::Display for DeletePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "//{}[{} != {} or {} = empty]",
            self.object_type,
            self.marker_member,
            query_literal(&self.keep_value),
            self.marker_member
        )
    }
}
