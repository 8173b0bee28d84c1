// ABOUTME: Library root for object-replicator
// ABOUTME: Declarative upsert engine reconciling staged records against an object store

pub mod error;
pub mod handlers;
pub mod parser;
pub mod policy;
pub mod processor;
pub mod query;
pub mod schema;
pub mod settings;
pub mod staging;
pub mod stats;
pub mod store;
pub mod tracking;
pub mod value;

pub use error::{ReplicationError, Result};
pub use handlers::{AbortOnError, ErrorHandler, SkipAndLog, StagedRecord, UnknownObjectHandler};
pub use policy::SearchAction;
pub use schema::{AssociationDef, EntityDef, Schema};
pub use settings::{
    AssociationConfig, ChangeTracking, DataHandling, KeyType, MappingFile, ObjectConfig,
    ReplicationSettings,
};
pub use staging::ReplicationRun;
pub use stats::{Stat, StatisticsLevel, StatisticsSnapshot};
pub use store::{MemoryStore, ObjectStore, PersistedObject};
pub use value::{ObjectId, PrimitiveType, Value};
