// ABOUTME: AssociationConfig - how an associated object type is linked to the main object
// ABOUTME: Derives link ownership and cardinality once from schema metadata

use super::object::ObjectConfig;
use crate::error::{ReplicationError, Result};
use crate::handlers::UnknownObjectHandler;
use crate::schema::{AssociationKind, AssociationOwner, Schema, SYSTEM_ASSOCIATIONS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Cardinality and ownership classification of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    SingleDefault,
    SingleBothOwners,
    SetDefault,
    SetBothOwners,
}

impl ReferenceKind {
    pub fn is_set(&self) -> bool {
        matches!(self, ReferenceKind::SetDefault | ReferenceKind::SetBothOwners)
    }
}

/// How ids are written into a reference set the main object owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataHandling {
    /// Replace the set with the staged ids
    #[default]
    Overwrite,
    /// Add staged ids to the ids already linked
    Append,
}

/// Configuration for one association reachable from the main object.
#[derive(Clone)]
pub struct AssociationConfig {
    object: ObjectConfig,
    association_name: String,
    referenced_is_owner: bool,
    reference_kind: ReferenceKind,
    data_handling: DataHandling,
    unknown_object_handler: Option<Arc<dyn UnknownObjectHandler>>,
}

impl fmt::Debug for AssociationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationConfig")
            .field("object", &self.object)
            .field("association_name", &self.association_name)
            .field("referenced_is_owner", &self.referenced_is_owner)
            .field("reference_kind", &self.reference_kind)
            .field("data_handling", &self.data_handling)
            .field(
                "unknown_object_handler",
                &self.unknown_object_handler.is_some(),
            )
            .finish()
    }
}

impl AssociationConfig {
    /// Classify `association_name` as seen from `main_type` linking to
    /// `target_type`.
    ///
    /// When both ends are the same type or related by inheritance the
    /// referenced side never owns the link. Otherwise ownership follows the
    /// schema: with default ownership the association's parent stores it,
    /// with shared ownership the main object writes it.
    pub fn derive(
        schema: &Schema,
        main_type: &str,
        association_name: &str,
        target_type: &str,
    ) -> Result<Self> {
        if schema.entity(target_type).is_none() {
            return Err(ReplicationError::config(format!(
                "Unknown object type {} for association {}",
                target_type, association_name
            )));
        }

        if SYSTEM_ASSOCIATIONS.contains(&association_name) {
            return Ok(Self::with_classification(
                target_type,
                association_name,
                false,
                ReferenceKind::SingleDefault,
            ));
        }

        let def = schema.association(association_name).ok_or_else(|| {
            ReplicationError::config(format!("Unknown association {}", association_name))
        })?;

        let reference_kind = match (def.kind, def.owner) {
            (AssociationKind::Reference, AssociationOwner::Default) => ReferenceKind::SingleDefault,
            (AssociationKind::Reference, AssociationOwner::Both) => ReferenceKind::SingleBothOwners,
            (AssociationKind::ReferenceSet, AssociationOwner::Default) => ReferenceKind::SetDefault,
            (AssociationKind::ReferenceSet, AssociationOwner::Both) => ReferenceKind::SetBothOwners,
        };

        let connects = |a: &str, b: &str| {
            schema.is_subclass_of(main_type, a) && schema.is_subclass_of(target_type, b)
        };
        if !connects(&def.parent, &def.child) && !connects(&def.child, &def.parent) {
            return Err(ReplicationError::config(format!(
                "Association {} does not connect {} and {}",
                association_name, main_type, target_type
            )));
        }

        let related = def.parent == def.child
            || schema.is_subclass_of(&def.parent, &def.child)
            || schema.is_subclass_of(&def.child, &def.parent);

        let referenced_is_owner = if related {
            false
        } else {
            match def.owner {
                AssociationOwner::Both => false,
                AssociationOwner::Default => {
                    if schema.is_subclass_of(target_type, &def.parent) {
                        true
                    } else if schema.is_subclass_of(target_type, &def.child) {
                        false
                    } else {
                        return Err(ReplicationError::config(format!(
                            "Cannot determine the owner of association {} for {}",
                            association_name, target_type
                        )));
                    }
                }
            }
        };

        Ok(Self::with_classification(
            target_type,
            association_name,
            referenced_is_owner,
            reference_kind,
        ))
    }

    fn with_classification(
        target_type: &str,
        association_name: &str,
        referenced_is_owner: bool,
        reference_kind: ReferenceKind,
    ) -> Self {
        Self {
            object: ObjectConfig::new(target_type),
            association_name: association_name.to_string(),
            referenced_is_owner,
            reference_kind,
            data_handling: DataHandling::default(),
            unknown_object_handler: None,
        }
    }

    pub fn object(&self) -> &ObjectConfig {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut ObjectConfig {
        &mut self.object
    }

    pub fn association_name(&self) -> &str {
        &self.association_name
    }

    pub fn object_type(&self) -> &str {
        self.object.object_type()
    }

    /// Whether the associated object stores the link (and must be written to
    /// persist it) rather than the main object.
    pub fn referenced_is_owner(&self) -> bool {
        self.referenced_is_owner
    }

    pub fn reference_kind(&self) -> ReferenceKind {
        self.reference_kind
    }

    /// Owned-by-referenced links behave like sets: many associated objects
    /// may point back to one main object.
    pub fn acts_as_reference_set(&self) -> bool {
        self.referenced_is_owner || self.reference_kind.is_set()
    }

    pub fn data_handling(&self) -> DataHandling {
        self.data_handling
    }

    pub fn set_data_handling(&mut self, handling: DataHandling) -> &mut Self {
        self.data_handling = handling;
        self
    }

    pub fn unknown_object_handler(&self) -> Option<&Arc<dyn UnknownObjectHandler>> {
        self.unknown_object_handler.as_ref()
    }

    pub fn set_unknown_object_handler(&mut self, handler: Arc<dyn UnknownObjectHandler>) -> &mut Self {
        self.unknown_object_handler = Some(handler);
        self
    }

    /// Reject mapping the same association to a second target type.
    pub fn validate_object_type(&self, target_type: &str) -> Result<()> {
        if self.object.object_type() != target_type {
            return Err(ReplicationError::config(format!(
                "Association {} is already mapped to {}, cannot map it to {}",
                self.association_name,
                self.object.object_type(),
                target_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssociationDef, EntityDef};

    fn schema() -> Schema {
        Schema::new()
            .with_entity(EntityDef::new("Crm.Party"))
            .with_entity(EntityDef::new("Crm.Customer").extends("Crm.Party"))
            .with_entity(EntityDef::new("Crm.Country"))
            .with_entity(EntityDef::new("Crm.Address"))
            .with_entity(EntityDef::new("Crm.Tag"))
            .with_association(AssociationDef::new("Crm.Customer_Country", "Crm.Customer", "Crm.Country"))
            .with_association(AssociationDef::new("Crm.Address_Customer", "Crm.Address", "Crm.Customer"))
            .with_association(
                AssociationDef::new("Crm.Customer_Tag", "Crm.Customer", "Crm.Tag")
                    .reference_set()
                    .owned_by_both(),
            )
            .with_association(AssociationDef::new("Crm.Customer_Referrer", "Crm.Customer", "Crm.Party"))
    }

    #[test]
    fn test_main_owns_reference_to_child() {
        let config =
            AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Customer_Country", "Crm.Country").unwrap();
        assert!(!config.referenced_is_owner());
        assert_eq!(config.reference_kind(), ReferenceKind::SingleDefault);
        assert!(!config.acts_as_reference_set());
    }

    #[test]
    fn test_referenced_parent_owns_link() {
        let config =
            AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Address_Customer", "Crm.Address").unwrap();
        assert!(config.referenced_is_owner());
        assert!(config.acts_as_reference_set());
    }

    #[test]
    fn test_shared_ownership_set() {
        let config = AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Customer_Tag", "Crm.Tag").unwrap();
        assert!(!config.referenced_is_owner());
        assert_eq!(config.reference_kind(), ReferenceKind::SetBothOwners);
        assert!(config.acts_as_reference_set());
    }

    #[test]
    fn test_inheritance_related_ends_never_owned_by_referenced() {
        let config =
            AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Customer_Referrer", "Crm.Party").unwrap();
        assert!(!config.referenced_is_owner());
    }

    #[test]
    fn test_system_association() {
        let config = AssociationConfig::derive(&schema(), "Crm.Customer", "System.owner", "Crm.Party").unwrap();
        assert!(!config.referenced_is_owner());
        assert_eq!(config.reference_kind(), ReferenceKind::SingleDefault);
    }

    #[test]
    fn test_unrelated_target_is_rejected() {
        let err = AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Customer_Country", "Crm.Tag");
        assert!(matches!(err, Err(ReplicationError::Configuration(_))));
        assert!(AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Nope", "Crm.Tag").is_err());
    }

    #[test]
    fn test_validate_object_type() {
        let config =
            AssociationConfig::derive(&schema(), "Crm.Customer", "Crm.Customer_Country", "Crm.Country").unwrap();
        assert!(config.validate_object_type("Crm.Country").is_ok());
        assert!(config.validate_object_type("Crm.Tag").is_err());
    }
}
