use crate::model::enums::{ActorType, MetadataType};
use crate::registry::MetadataKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[error(transparent)]
pub enum Error {
    FailedConnection(#[from] diesel::r2d2::PoolError),
    FailedQuery(#[from] diesel::result::Error),
    JsonSerialization(#[from] serde_json::Error),
    TaskJoin(#[from] tokio::task::JoinError),
    #[error("Migrations could not be applied: {0}")]
    FailedMigration(Box<dyn std::error::Error + Send + Sync>),
    #[error("Changeset {0} is already in progress; finish or cancel it first")]
    ChangesetInProgress(i64),
    #[error("Changeset with id {0} already exists")]
    ChangesetIdCollision(i64),
    #[error("Changeset {0} not found")]
    ChangesetNotFound(i64),
    #[error("Unknown metadata key {0}")]
    UnknownMetadataKey(MetadataKey),
    #[error("Unknown metadata registry id {0}")]
    UnknownMetadataId(i64),
    #[error("Metadata key {0} has no registry id; was the registry synced?")]
    RegistryNotSynced(MetadataKey),
    #[error("Metadata key {key} expects {expected:?} values, got {got:?}")]
    ValueTypeMismatch {
        key: MetadataKey,
        expected: MetadataType,
        got: MetadataType,
    },
    #[error("Metadata is missing {0} required for persistence")]
    IncompleteMetadata(&'static str),
    #[error("No plugin registered under id {0}")]
    PluginNotFound(String),
    #[error("Plugin {plugin_id} rejected actor config: {reason}")]
    PluginConfig { plugin_id: String, reason: String },
    #[error("Processor {name} ({plugin_id}) is not ready: {reason}")]
    ProcessorNotReady {
        name: String,
        plugin_id: String,
        reason: String,
    },
    #[error("Circular processor dependency detected among: {0}")]
    CircularDependency(String),
    #[error("Actor {id} is not of type {expected:?}")]
    ActorTypeMismatch { id: i64, expected: ActorType },
    #[error("Actor {0} is missing an id")]
    ActorMissingId(String),
    #[error("Collection {0} not found")]
    CollectionNotFound(i64),
    #[error("Operation was canceled")]
    Canceled,
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl Error {
    /// True when the error represents cooperative cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
