// ABOUTME: Schema metadata consulted while mapping fields to members
// ABOUTME: Describes entities, their members, inheritance and associations

use crate::value::PrimitiveType;
use serde::{Deserialize, Serialize};

/// System members that can never be written through a mapping.
pub const READ_ONLY_MEMBERS: [&str; 2] = ["changedDate", "createdDate"];

/// System associations that always behave as plain references owned by the
/// object that carries them.
pub const SYSTEM_ASSOCIATIONS: [&str; 2] = ["System.owner", "System.changedBy"];

/// Metadata for a single attribute member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDef {
    pub name: String,
    #[serde(rename = "type")]
    pub member_type: PrimitiveType,
    /// Calculated member, never stored
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    /// Value can be written but never read back (credential hashes)
    #[serde(default)]
    pub write_only: bool,
}

/// Metadata for an entity (object type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    /// Parent entity this one specializes, if any
    #[serde(default)]
    pub generalization: Option<String>,
    #[serde(default, rename = "member")]
    pub members: Vec<MemberDef>,
}

impl EntityDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            generalization: None,
            members: Vec::new(),
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.generalization = Some(parent.to_string());
        self
    }

    pub fn member(mut self, name: &str, member_type: PrimitiveType) -> Self {
        self.members.push(MemberDef {
            name: name.to_string(),
            member_type,
            is_virtual: false,
            write_only: member_type == PrimitiveType::HashString,
        });
        self
    }

    pub fn virtual_member(mut self, name: &str, member_type: PrimitiveType) -> Self {
        self.members.push(MemberDef {
            name: name.to_string(),
            member_type,
            is_virtual: true,
            write_only: false,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationKind {
    #[default]
    Reference,
    ReferenceSet,
}

/// Which side of an association physically stores the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationOwner {
    /// The parent entity stores the link
    #[default]
    Default,
    /// Both sides store the link
    Both,
}

/// Metadata for an association between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationDef {
    pub name: String,
    /// Entity that owns the link under `AssociationOwner::Default`
    pub parent: String,
    /// Entity the link points to
    pub child: String,
    #[serde(default)]
    pub kind: AssociationKind,
    #[serde(default)]
    pub owner: AssociationOwner,
}

impl AssociationDef {
    pub fn new(name: &str, parent: &str, child: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.to_string(),
            child: child.to_string(),
            kind: AssociationKind::Reference,
            owner: AssociationOwner::Default,
        }
    }

    pub fn reference_set(mut self) -> Self {
        self.kind = AssociationKind::ReferenceSet;
        self
    }

    pub fn owned_by_both(mut self) -> Self {
        self.owner = AssociationOwner::Both;
        self
    }
}

/// Schema metadata of the backing store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityDef>,
    #[serde(default, rename = "association")]
    pub associations: Vec<AssociationDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_association(mut self, association: AssociationDef) -> Self {
        self.associations.push(association);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Look up a member on an entity or any of its generalizations.
    pub fn member(&self, entity: &str, member: &str) -> Option<&MemberDef> {
        self.lineage(entity)
            .into_iter()
            .find_map(|e| e.members.iter().find(|m| m.name == member))
    }

    /// Whether `entity` is `ancestor` or specializes it, directly or not.
    pub fn is_subclass_of(&self, entity: &str, ancestor: &str) -> bool {
        self.lineage(entity).iter().any(|e| e.name == ancestor)
    }

    /// The entity followed by its generalization chain.
    fn lineage(&self, entity: &str) -> Vec<&EntityDef> {
        let mut chain: Vec<&EntityDef> = Vec::new();
        let mut current = self.entity(entity);
        while let Some(def) = current {
            // cycles in hand-written schemas would otherwise loop forever
            if chain.iter().any(|e| e.name == def.name) {
                break;
            }
            chain.push(def);
            current = def.generalization.as_deref().and_then(|g| self.entity(g));
        }
        chain
    }
}
