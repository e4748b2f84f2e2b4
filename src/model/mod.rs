pub mod actor;
pub mod asset;
pub mod changeset;
pub mod collection;
pub mod enums;
pub mod json;
pub mod metadata;

pub use actor::{Actor, NewActor};
pub use asset::{Asset, AssetIdentity};
pub use changeset::{Changeset, ChangesetRun, ChangesetStats};
pub use collection::{AssetCollection, NewAssetCollection};
pub use enums::{ActorType, ExecutionMode, MetadataType, OpStatus, RefreshMode};
pub use json::Json;
pub use metadata::{Fingerprint, Metadata, MetadataValue};
