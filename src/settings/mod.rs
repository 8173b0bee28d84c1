// ABOUTME: ReplicationSettings - the configuration registry for one replication
// ABOUTME: Routes field aliases to members and associations and validates the mapping

pub mod association;
pub mod batch;
pub mod file;
pub mod object;

pub use association::{AssociationConfig, DataHandling, ReferenceKind};
pub use batch::BatchConfiguration;
pub use file::MappingFile;
pub use object::{ChangeTracking, KeyType, ObjectConfig};

use crate::error::{ReplicationError, Result};
use crate::handlers::{AbortOnError, ErrorHandler, UnknownObjectHandler};
use crate::parser::{FieldParser, KeyField, ValueParser};
use crate::policy::SearchAction;
use crate::schema::{Schema, READ_ONLY_MEMBERS};
use crate::stats::StatisticsLevel;
use crate::value::{ObjectId, PrimitiveType, Value};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Where the values of a field alias end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRoute {
    /// A member of the main object
    Attribute {
        member: String,
        member_type: PrimitiveType,
    },
    /// A member of an object linked through an association
    Association {
        association: String,
        member: String,
        member_type: PrimitiveType,
    },
}

impl FieldRoute {
    pub fn member(&self) -> &str {
        match self {
            FieldRoute::Attribute { member, .. } | FieldRoute::Association { member, .. } => member,
        }
    }

    pub fn member_type(&self) -> PrimitiveType {
        match self {
            FieldRoute::Attribute { member_type, .. }
            | FieldRoute::Association { member_type, .. } => *member_type,
        }
    }

    pub fn association(&self) -> Option<&str> {
        match self {
            FieldRoute::Attribute { .. } => None,
            FieldRoute::Association { association, .. } => Some(association),
        }
    }
}

/// Association that links every imported object to one parent object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub association: String,
    pub object_id: Option<ObjectId>,
}

/// Configuration registry: one main object config, the association configs
/// and the alias routing tables, plus the global run policies.
#[derive(Clone)]
pub struct ReplicationSettings {
    schema: Arc<Schema>,
    main: ObjectConfig,
    associations: IndexMap<String, AssociationConfig>,
    routes: IndexMap<String, FieldRoute>,
    parser: ValueParser,
    parent: Option<ParentLink>,
    error_handler: Arc<dyn ErrorHandler>,
    use_transactions: bool,
    retrieve_objects_async: bool,
    reset_empty_associations: bool,
    statistics_level: StatisticsLevel,
    batch: BatchConfiguration,
}

impl fmt::Debug for ReplicationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationSettings")
            .field("main", &self.main)
            .field("associations", &self.associations)
            .field("routes", &self.routes)
            .field("parser", &self.parser)
            .field("parent", &self.parent)
            .field("use_transactions", &self.use_transactions)
            .field("retrieve_objects_async", &self.retrieve_objects_async)
            .field("reset_empty_associations", &self.reset_empty_associations)
            .field("statistics_level", &self.statistics_level)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl ReplicationSettings {
    /// Create settings replicating into `object_type`.
    pub fn new(schema: Arc<Schema>, object_type: &str) -> Result<Self> {
        if schema.entity(object_type).is_none() {
            return Err(ReplicationError::config(format!(
                "Unknown object type {}",
                object_type
            )));
        }
        Ok(Self {
            schema,
            main: ObjectConfig::main(object_type),
            associations: IndexMap::new(),
            routes: IndexMap::new(),
            parser: ValueParser::new(),
            parent: None,
            error_handler: Arc::new(AbortOnError),
            use_transactions: true,
            retrieve_objects_async: false,
            reset_empty_associations: false,
            statistics_level: StatisticsLevel::default(),
            batch: BatchConfiguration::default(),
        })
    }

    /// (Re)configure the main object. Switching to another object type is only
    /// possible before any field is mapped.
    pub fn configure_main_object(
        &mut self,
        object_type: &str,
        search_action: SearchAction,
        ignore_empty_keys: bool,
        change_tracking: Option<ChangeTracking>,
        remove_indicator: Option<&str>,
    ) -> Result<&mut ObjectConfig> {
        if object_type != self.main.object_type() {
            if !self.routes.is_empty() {
                return Err(ReplicationError::config(format!(
                    "Cannot switch the main object to {} after fields were mapped to {}",
                    object_type,
                    self.main.object_type()
                )));
            }
            if self.schema.entity(object_type).is_none() {
                return Err(ReplicationError::config(format!(
                    "Unknown object type {}",
                    object_type
                )));
            }
            self.main = ObjectConfig::main(object_type);
        }

        let schema = Arc::clone(&self.schema);
        self.main
            .set_search_action(search_action)
            .set_ignore_empty_keys(ignore_empty_keys);
        self.main.set_change_tracking(
            &schema,
            change_tracking.unwrap_or_default(),
            remove_indicator,
        )
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn main(&self) -> &ObjectConfig {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut ObjectConfig {
        &mut self.main
    }

    /// Map `alias` onto a member of the main object.
    pub fn map_attribute(
        &mut self,
        alias: &str,
        member: &str,
        key_type: KeyType,
        case_sensitive: bool,
        parser: Option<Arc<dyn FieldParser>>,
    ) -> Result<()> {
        self.check_new_alias(alias)?;
        let object_type = self.main.object_type().to_string();
        let def = self.schema.member(&object_type, member).ok_or_else(|| {
            ReplicationError::config(format!(
                "Member {} does not exist on {}",
                member, object_type
            ))
        })?;
        let member_type = def.member_type;

        if key_type == KeyType::NoKey {
            if READ_ONLY_MEMBERS.contains(&member) || def.is_virtual {
                return Err(ReplicationError::config(format!(
                    "Member {}.{} is read-only and cannot be mapped",
                    object_type, member
                )));
            }
        } else {
            self.main.add_key(alias, case_sensitive);
        }
        self.main.add_member(alias, member);

        if let Some(parser) = parser {
            self.parser.set_parser(alias, parser);
        }
        self.routes.insert(
            alias.to_string(),
            FieldRoute::Attribute {
                member: member.to_string(),
                member_type,
            },
        );
        Ok(())
    }

    /// Map `alias` onto `member` of the object linked through `association`.
    #[allow(clippy::too_many_arguments)]
    pub fn map_association(
        &mut self,
        alias: &str,
        association: &str,
        target_type: &str,
        member: &str,
        parser: Option<Arc<dyn FieldParser>>,
        key_type: KeyType,
        case_sensitive: bool,
    ) -> Result<()> {
        self.check_new_alias(alias)?;

        match self.associations.get(association) {
            Some(existing) => existing.validate_object_type(target_type)?,
            None => {
                let config = AssociationConfig::derive(
                    &self.schema,
                    self.main.object_type(),
                    association,
                    target_type,
                )?;
                tracing::debug!(
                    "Association {}: referenced object is owner = {}, kind = {:?}",
                    association,
                    config.referenced_is_owner(),
                    config.reference_kind()
                );
                self.associations.insert(association.to_string(), config);
            }
        }

        let member_type = self
            .schema
            .member(target_type, member)
            .map(|def| def.member_type)
            .ok_or_else(|| {
                ReplicationError::config(format!(
                    "Member {} does not exist on {}",
                    member, target_type
                ))
            })?;

        let config = self
            .associations
            .get_mut(association)
            .ok_or_else(|| ReplicationError::config(format!("Unknown association {}", association)))?
            .object_mut();
        config.add_member(alias, member);
        match key_type {
            KeyType::AssociationAndObjectKey => {
                config.add_key(alias, case_sensitive);
                self.main.add_key(alias, case_sensitive);
            }
            KeyType::AssociationKey => config.add_key(alias, case_sensitive),
            KeyType::ObjectKey => self.main.add_key(alias, case_sensitive),
            KeyType::NoKey => {}
        }

        if let Some(parser) = parser {
            self.parser.set_parser(alias, parser);
        }
        self.routes.insert(
            alias.to_string(),
            FieldRoute::Association {
                association: association.to_string(),
                member: member.to_string(),
                member_type,
            },
        );
        Ok(())
    }

    fn check_new_alias(&self, alias: &str) -> Result<()> {
        if self.routes.contains_key(alias) {
            return Err(ReplicationError::config(format!(
                "Field alias {} is mapped more than once",
                alias
            )));
        }
        Ok(())
    }

    /// Check the whole mapping before a run starts.
    pub fn validate(&mut self) -> Result<()> {
        let keyless: Vec<&str> = self
            .associations
            .values()
            .filter(|a| {
                a.object().search_action() != SearchAction::CreateEverything
                    && !a.object().has_key_members()
            })
            .map(|a| a.association_name())
            .collect();
        if !keyless.is_empty() {
            return Err(ReplicationError::config(format!(
                "Associations without key fields must use create-everything: {}",
                keyless.join(", ")
            )));
        }

        for alias in self.main.keys().keys() {
            if self.treat_field_as_reference_set(alias) {
                return Err(ReplicationError::config(format!(
                    "Key field {} is routed through a reference set, which makes the object identity ambiguous",
                    alias
                )));
            }
        }

        if self.main.search_action() != SearchAction::CreateEverything
            && !self.main.has_key_members()
        {
            return Err(ReplicationError::config(format!(
                "{} has no key fields, only create-everything can replicate it",
                self.main.object_type()
            )));
        }

        self.main.check_tracking_policy()?;

        if self.main.search_action() == SearchAction::OnlyCreateNewObjects
            && self.main.commit_unchanged_objects()
        {
            tracing::warn!(
                "commit-unchanged-objects has no effect on {} because only new objects are created",
                self.main.object_type()
            );
        }

        let key_count = self.main.keys().len();
        self.batch.recalculate_lookup_page_size(key_count);
        Ok(())
    }

    pub fn route(&self, alias: &str) -> Option<&FieldRoute> {
        self.routes.get(alias)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, &FieldRoute)> {
        self.routes.iter().map(|(alias, route)| (alias.as_str(), route))
    }

    pub fn member_type(&self, alias: &str) -> Option<PrimitiveType> {
        self.routes.get(alias).map(FieldRoute::member_type)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationConfig> {
        self.associations.get(name)
    }

    pub fn association_mut(&mut self, name: &str) -> Result<&mut AssociationConfig> {
        self.associations
            .get_mut(name)
            .ok_or_else(|| ReplicationError::config(format!("Association {} is not mapped", name)))
    }

    pub fn associations(&self) -> impl Iterator<Item = &AssociationConfig> {
        self.associations.values()
    }

    /// The association config an alias is routed through, if any.
    pub fn association_for_alias(&self, alias: &str) -> Option<&AssociationConfig> {
        self.route(alias)
            .and_then(FieldRoute::association)
            .and_then(|name| self.associations.get(name))
    }

    /// Single-valued link written through `set_association_value`.
    pub fn treat_field_as_reference(&self, alias: &str) -> bool {
        self.association_for_alias(alias)
            .map(|a| !a.acts_as_reference_set())
            .unwrap_or(false)
    }

    /// Multi-valued link written through `add_association_value`.
    pub fn treat_field_as_reference_set(&self, alias: &str) -> bool {
        self.association_for_alias(alias)
            .map(AssociationConfig::acts_as_reference_set)
            .unwrap_or(false)
    }

    /// Case sensitivity of a field. Association fields follow their
    /// association's keys, main keys their own flag, all others are sensitive.
    pub fn is_case_sensitive(&self, alias: &str) -> bool {
        if let Some(association) = self.association_for_alias(alias) {
            return association.object().is_case_sensitive(alias);
        }
        self.main.keys().get(alias).copied().unwrap_or(true)
    }

    /// Key fields of the main object, ordered by alias. Fields routed through
    /// an association are qualified with the association name.
    pub fn main_key_fields(&self) -> Vec<KeyField> {
        self.main
            .keys()
            .iter()
            .filter_map(|(alias, case_sensitive)| {
                let member = match self.route(alias)? {
                    FieldRoute::Attribute { member, .. } => member.clone(),
                    FieldRoute::Association {
                        association,
                        member,
                        ..
                    } => format!("{}/{}", association, member),
                };
                Some(KeyField {
                    alias: alias.clone(),
                    member,
                    case_sensitive: *case_sensitive,
                })
            })
            .collect()
    }

    /// Key fields of an associated object type, ordered by alias.
    pub fn association_key_fields(&self, association: &str) -> Vec<KeyField> {
        let Some(config) = self.associations.get(association) else {
            return Vec::new();
        };
        let object = config.object();
        object
            .keys()
            .iter()
            .filter_map(|(alias, case_sensitive)| {
                Some(KeyField {
                    alias: alias.clone(),
                    member: object.member_for(alias)?.to_string(),
                    case_sensitive: *case_sensitive,
                })
            })
            .collect()
    }

    /// Whether a member can be written but never read back.
    pub fn is_write_only(&self, object_type: &str, member: &str) -> bool {
        self.schema
            .member(object_type, member)
            .map(|def| def.write_only)
            .unwrap_or(false)
    }

    /// Coerce a raw value for `alias` to its member type.
    pub fn parse_value(&self, alias: &str, raw: &Value) -> Result<Value> {
        let member_type = self.member_type(alias).ok_or_else(|| {
            ReplicationError::config(format!("Field alias {} is not mapped", alias))
        })?;
        self.parser.parse(alias, member_type, raw)
    }

    pub fn parser(&self) -> &ValueParser {
        &self.parser
    }

    pub fn set_date_format(&mut self, alias: &str, format: &str) {
        self.parser.set_date_format(alias, format);
    }

    pub fn set_unknown_object_handler(
        &mut self,
        association: &str,
        handler: Arc<dyn UnknownObjectHandler>,
    ) -> Result<()> {
        self.association_mut(association)?
            .set_unknown_object_handler(handler);
        Ok(())
    }

    /// Link every imported object to a parent object through `association`.
    pub fn set_parent_association(&mut self, association: &str) -> Result<()> {
        let def = self.schema.association(association).ok_or_else(|| {
            ReplicationError::config(format!("Unknown parent association {}", association))
        })?;
        let main_type = self.main.object_type();
        if !self.schema.is_subclass_of(main_type, &def.parent)
            && !self.schema.is_subclass_of(main_type, &def.child)
        {
            return Err(ReplicationError::config(format!(
                "Parent association {} does not involve {}",
                association, main_type
            )));
        }
        self.parent = Some(ParentLink {
            association: association.to_string(),
            object_id: None,
        });
        Ok(())
    }

    pub fn set_parent_object_id(&mut self, object_id: Option<ObjectId>) -> Result<()> {
        let parent = self.parent.as_mut().ok_or_else(|| {
            ReplicationError::config("A parent object id was given but no parent association is configured")
        })?;
        if object_id.is_none() {
            tracing::warn!(
                "No parent object given for association {}, objects will not be linked",
                parent.association
            );
        }
        parent.object_id = object_id;
        Ok(())
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn error_handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.error_handler
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = handler;
    }

    pub fn use_transactions(&self) -> bool {
        self.use_transactions
    }

    pub fn set_use_transactions(&mut self, enabled: bool) {
        self.use_transactions = enabled;
    }

    pub fn retrieve_objects_async(&self) -> bool {
        self.retrieve_objects_async
    }

    pub fn set_retrieve_objects_async(&mut self, enabled: bool) {
        self.retrieve_objects_async = enabled;
    }

    pub fn reset_empty_associations(&self) -> bool {
        self.reset_empty_associations
    }

    pub fn set_reset_empty_associations(&mut self, reset: bool) {
        self.reset_empty_associations = reset;
    }

    pub fn statistics_level(&self) -> StatisticsLevel {
        self.statistics_level
    }

    pub fn set_statistics_level(&mut self, level: StatisticsLevel) {
        self.statistics_level = level;
    }

    pub fn batch(&self) -> &BatchConfiguration {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut BatchConfiguration {
        &mut self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssociationDef, EntityDef};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new()
                .with_entity(
                    EntityDef::new("Crm.Customer")
                        .member("Code", PrimitiveType::String)
                        .member("Name", PrimitiveType::String)
                        .member("Marker", PrimitiveType::Integer)
                        .member("changedDate", PrimitiveType::DateTime)
                        .virtual_member("Display", PrimitiveType::String),
                )
                .with_entity(EntityDef::new("Crm.Country").member("Code", PrimitiveType::String))
                .with_entity(EntityDef::new("Crm.Tag").member("Label", PrimitiveType::String))
                .with_entity(EntityDef::new("Crm.Import"))
                .with_association(AssociationDef::new("Crm.Customer_Country", "Crm.Customer", "Crm.Country"))
                .with_association(AssociationDef::new("Crm.Customer_Tag", "Crm.Customer", "Crm.Tag").reference_set())
                .with_association(AssociationDef::new("Crm.Customer_Import", "Crm.Customer", "Crm.Import")),
        )
    }

    fn settings() -> ReplicationSettings {
        ReplicationSettings::new(schema(), "Crm.Customer").unwrap()
    }

    #[test]
    fn test_unknown_main_type() {
        assert!(ReplicationSettings::new(schema(), "Crm.Nope").is_err());
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let mut settings = settings();
        settings.map_attribute("code", "Code", KeyType::ObjectKey, false, None).unwrap();
        let err = settings.map_attribute("code", "Name", KeyType::NoKey, false, None);
        assert!(matches!(err, Err(ReplicationError::Configuration(_))));
    }

    #[test]
    fn test_read_only_members_only_as_keys() {
        let mut settings = settings();
        assert!(settings.map_attribute("changed", "changedDate", KeyType::NoKey, false, None).is_err());
        assert!(settings.map_attribute("display", "Display", KeyType::NoKey, false, None).is_err());
        assert!(settings.map_attribute("missing", "Missing", KeyType::NoKey, false, None).is_err());
        settings.map_attribute("changed", "changedDate", KeyType::ObjectKey, false, None).unwrap();
        assert!(settings.main().is_key("changed"));
    }

    #[test]
    fn test_association_key_types() {
        let mut settings = settings();
        settings
            .map_association("country", "Crm.Customer_Country", "Crm.Country", "Code", None, KeyType::AssociationAndObjectKey, false)
            .unwrap();
        settings
            .map_association("tag", "Crm.Customer_Tag", "Crm.Tag", "Label", None, KeyType::AssociationKey, true)
            .unwrap();

        assert!(settings.main().is_key("country"));
        assert!(!settings.main().is_key("tag"));
        assert!(settings.association("Crm.Customer_Country").unwrap().object().is_key("country"));
        assert!(settings.treat_field_as_reference("country"));
        assert!(settings.treat_field_as_reference_set("tag"));
        assert!(settings.is_case_sensitive("tag"));
        assert!(!settings.is_case_sensitive("country"));

        let fields = settings.main_key_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].member, "Crm.Customer_Country/Code");
        assert_eq!(settings.association_key_fields("Crm.Customer_Tag")[0].member, "Label");
    }

    #[test]
    fn test_association_target_type_is_fixed() {
        let mut settings = settings();
        settings
            .map_association("country", "Crm.Customer_Country", "Crm.Country", "Code", None, KeyType::AssociationKey, false)
            .unwrap();
        let err = settings.map_association("country2", "Crm.Customer_Country", "Crm.Tag", "Label", None, KeyType::NoKey, false);
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_keyless_associations() {
        let mut settings = settings();
        settings.map_attribute("code", "Code", KeyType::ObjectKey, false, None).unwrap();
        settings
            .map_association("tag", "Crm.Customer_Tag", "Crm.Tag", "Label", None, KeyType::NoKey, false)
            .unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Crm.Customer_Tag"));

        settings
            .association_mut("Crm.Customer_Tag")
            .unwrap()
            .object_mut()
            .set_search_action(SearchAction::CreateEverything);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_key_through_reference_set() {
        let mut settings = settings();
        settings
            .map_association("tag", "Crm.Customer_Tag", "Crm.Tag", "Label", None, KeyType::AssociationAndObjectKey, false)
            .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_checks_tracking_policy_and_page_size() {
        let mut settings = settings();
        settings
            .configure_main_object("Crm.Customer", SearchAction::FindCreate, true, Some(ChangeTracking::RemoveUnchangedObjects), Some("Marker"))
            .unwrap();
        settings.map_attribute("code", "Code", KeyType::ObjectKey, false, None).unwrap();
        settings.map_attribute("name", "Name", KeyType::ObjectKey, false, None).unwrap();
        assert!(settings.validate().is_err());

        settings.main_mut().set_commit_unchanged_objects(true);
        settings.validate().unwrap();
        assert_eq!(settings.batch().lookup_page_size, 840);
    }

    #[test]
    fn test_configure_main_object_after_mapping() {
        let mut settings = settings();
        settings.map_attribute("code", "Code", KeyType::ObjectKey, false, None).unwrap();
        assert!(settings
            .configure_main_object("Crm.Country", SearchAction::FindCreate, true, None, None)
            .is_err());
        let main = settings
            .configure_main_object("Crm.Customer", SearchAction::FindCreate, false, None, None)
            .unwrap();
        assert!(!main.ignore_empty_keys());
        assert!(settings.main().is_key("code"));
    }

    #[test]
    fn test_parent_object_requires_association() {
        let mut settings = settings();
        assert!(settings.set_parent_object_id(Some(4)).is_err());
        assert!(settings.set_parent_association("Crm.Customer_Tagx").is_err());
        settings.set_parent_association("Crm.Customer_Import").unwrap();
        settings.set_parent_object_id(Some(4)).unwrap();
        assert_eq!(settings.parent().unwrap().object_id, Some(4));
    }

    #[test]
    fn test_parse_value_uses_member_type() {
        let mut settings = settings();
        settings
            .configure_main_object("Crm.Customer", SearchAction::FindCreate, true, None, None)
            .unwrap();
        settings.map_attribute("marker", "Marker", KeyType::NoKey, false, None).unwrap();
        assert_eq!(settings.parse_value("marker", &Value::from("1.234,00")).unwrap(), Value::Integer(1234));
        assert!(settings.parse_value("unmapped", &Value::from("x")).is_err());
    }
}
