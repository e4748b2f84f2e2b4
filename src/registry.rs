use crate::error::{Error, Result};
use crate::model::enums::MetadataType;
use crate::model::metadata::{Metadata, MetadataRegistryRow, MetadataValue, NewMetadataRegistryRow};
use crate::schema::metadata_registry;
use crate::string::SmallString;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Plugin id recorded for keys the engine itself declares.
pub const CORE_PLUGIN_ID: &str = "katalog.core";

/// Name of a metadata key, e.g. `file/size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataKey(SmallString);

impl MetadataKey {
    pub const fn new_static(name: &'static str) -> Self {
        Self(SmallString::new_static(name))
    }

    pub fn new(name: impl Into<SmallString>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for MetadataKey {
    fn from(name: &str) -> Self {
        Self(SmallString::new(name))
    }
}

// Keys used by the engine write paths.

/// Marker written when an asset known to an actor is absent from a fresh scan.
pub const ASSET_LOST: MetadataKey = MetadataKey::new_static("asset/lost");
/// Opaque handle describing how to fetch an asset's bytes from its origin actor.
pub const DATA_FILE_READER: MetadataKey = MetadataKey::new_static("data/file_reader");
/// Full-text document; routed to the search companion table, never persisted as metadata.
pub const ASSET_SEARCH_DOC: MetadataKey = MetadataKey::new_static("asset/search_doc");
/// Membership of an asset in a collection.
pub const COLLECTION_MEMBER: MetadataKey = MetadataKey::new_static("collection/member");

// Built-in content keys.

pub const FILE_ID_PATH: MetadataKey = MetadataKey::new_static("file/id_path");
pub const FILE_NAME: MetadataKey = MetadataKey::new_static("file/filename");
pub const FILE_ORIGINAL_NAME: MetadataKey = MetadataKey::new_static("file/original_filename");
pub const FILE_PATH: MetadataKey = MetadataKey::new_static("file/path");
pub const FILE_TYPE: MetadataKey = MetadataKey::new_static("file/type");
pub const FILE_EXTENSION: MetadataKey = MetadataKey::new_static("file/extension");
pub const FILE_SIZE: MetadataKey = MetadataKey::new_static("file/size");
pub const FILE_VERSION: MetadataKey = MetadataKey::new_static("file/version");
pub const FILE_DOWNLOAD_URI: MetadataKey = MetadataKey::new_static("file/download_uri");
pub const FILE_VIEW_URI: MetadataKey = MetadataKey::new_static("file/web_view_link");
pub const FILE_THUMBNAIL_URI: MetadataKey = MetadataKey::new_static("file/thumbnail_link");
pub const FILE_URI: MetadataKey = MetadataKey::new_static("file/uri");
pub const FILE_TITLE: MetadataKey = MetadataKey::new_static("file/title");
pub const FILE_DESCRIPTION: MetadataKey = MetadataKey::new_static("file/description");
pub const FILE_TAGS: MetadataKey = MetadataKey::new_static("file/tags");
pub const FILE_COMMENT: MetadataKey = MetadataKey::new_static("file/comment");

pub const ACCESS_OWNER: MetadataKey = MetadataKey::new_static("access/owner");
pub const ACCESS_SHARED_WITH: MetadataKey = MetadataKey::new_static("access/shared_with");
pub const ACCESS_SHARING_USER: MetadataKey = MetadataKey::new_static("access/sharing_user");
pub const ACCESS_LAST_MODIFYING_USER: MetadataKey = MetadataKey::new_static("access/last_modifying_user");

pub const TIME_CREATED: MetadataKey = MetadataKey::new_static("time/created");
pub const TIME_MODIFIED: MetadataKey = MetadataKey::new_static("time/modified");
pub const TIME_TRASHED: MetadataKey = MetadataKey::new_static("time/trashed");
pub const TIME_ACCESSED: MetadataKey = MetadataKey::new_static("time/accessed");
pub const TIME_DOWNLOADED: MetadataKey = MetadataKey::new_static("time/downloaded");
pub const TIME_BIRTHTIME: MetadataKey = MetadataKey::new_static("time/birthtime");

pub const FLAG_FAVORITE: MetadataKey = MetadataKey::new_static("flag/starred");
pub const FLAG_HIDDEN: MetadataKey = MetadataKey::new_static("flag/hidden");
pub const FLAG_REVIEW: MetadataKey = MetadataKey::new_static("flag/review");
pub const FLAG_REJECTED: MetadataKey = MetadataKey::new_static("flag/rejected");
pub const FLAG_SHARED: MetadataKey = MetadataKey::new_static("flag/shared");
pub const FLAG_TRASHED: MetadataKey = MetadataKey::new_static("flag/trashed");

pub const HASH_MD5: MetadataKey = MetadataKey::new_static("hash/md5");
pub const HASH_SHA1: MetadataKey = MetadataKey::new_static("hash/sha1");
pub const HASH_MINHASH: MetadataKey = MetadataKey::new_static("fingerprint/minhash");
pub const HASH_SIMHASH: MetadataKey = MetadataKey::new_static("fingerprint/simhash");
pub const HASH_PHASH: MetadataKey = MetadataKey::new_static("fingerprint/phash");

pub const DOC_TEXT: MetadataKey = MetadataKey::new_static("document/text");
pub const DOC_SUMMARY: MetadataKey = MetadataKey::new_static("document/summary");
pub const DOC_BYLINE: MetadataKey = MetadataKey::new_static("document/byline");
pub const DOC_LANG: MetadataKey = MetadataKey::new_static("document/lang");
pub const DOC_AUTHOR: MetadataKey = MetadataKey::new_static("document/author");
pub const DOC_CHARS: MetadataKey = MetadataKey::new_static("document/chars");
pub const DOC_WORDS: MetadataKey = MetadataKey::new_static("document/words");
pub const DOC_PAGES: MetadataKey = MetadataKey::new_static("document/pages");
pub const DOC_CHUNKS: MetadataKey = MetadataKey::new_static("document/chunks");

pub const REL_CHILD_OF: MetadataKey = MetadataKey::new_static("relationship/child_of");
pub const REL_PARENT_OF: MetadataKey = MetadataKey::new_static("relationship/parent_of");
pub const REL_PART_OF: MetadataKey = MetadataKey::new_static("relationship/part_of");
pub const REL_DERIVED_FROM: MetadataKey = MetadataKey::new_static("relationship/derived_from");
pub const REL_VERSION_OF: MetadataKey = MetadataKey::new_static("relationship/version_of");
pub const REL_SIMILAR_TO: MetadataKey = MetadataKey::new_static("relationship/similar_to");
pub const REL_DUPLICATE_OF: MetadataKey = MetadataKey::new_static("relationship/duplicate_of");

pub const WARNING_NAME_READABILITY: MetadataKey = MetadataKey::new_static("warning/name_readability");
pub const WARNING_NAME_CONVENTIONS: MetadataKey = MetadataKey::new_static("warning/name_conventions");

/// Declaration of a metadata key: its value type, display hints and
/// persistence policies.
#[derive(Debug, Clone)]
pub struct MetadataDef {
    pub plugin_id: SmallString,
    pub key: MetadataKey,
    /// Stable store id, assigned by `sync`.
    pub registry_id: Option<i64>,
    pub value_type: MetadataType,
    pub title: SmallString,
    pub description: SmallString,
    pub width: Option<i32>,
    /// Staging a falsey value is ignored.
    pub skip_false: bool,
    /// Staging a falsey value tombstones all prior live values of the key for
    /// the same actor.
    pub clear_on_false: bool,
    pub searchable: Option<bool>,
}

impl MetadataDef {
    pub fn new(key: MetadataKey, value_type: MetadataType) -> Self {
        Self {
            plugin_id: SmallString::new_static(CORE_PLUGIN_ID),
            key,
            registry_id: None,
            value_type,
            title: SmallString::new_static(""),
            description: SmallString::new_static(""),
            width: None,
            skip_false: false,
            clear_on_false: false,
            searchable: None,
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = SmallString::new(title);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = SmallString::new(description);
        self
    }

    pub fn width(mut self, width: i32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn skip_false(mut self) -> Self {
        self.skip_false = true;
        self
    }

    pub fn clear_on_false(mut self) -> Self {
        self.clear_on_false = true;
        self
    }

    pub fn plugin(mut self, plugin_id: &str) -> Self {
        self.plugin_id = SmallString::new(plugin_id);
        self
    }

    pub fn searchable(mut self, searchable: bool) -> Self {
        self.searchable = Some(searchable);
        self
    }
}

/// Maps metadata keys to their definitions and stable store ids. Keys are
/// declared once at startup; `sync` assigns each a `registry_id` that
/// survives restarts and is never reassigned.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    defs: Vec<MetadataDef>,
    by_key: HashMap<MetadataKey, usize>,
    by_id: HashMap<i64, usize>,
    synced: bool,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with every built-in key the engine touches.
    pub fn with_builtin_keys() -> Self {
        use MetadataType::*;

        let mut registry = Self::new();
        let defs = [
            MetadataDef::new(ASSET_LOST, Int)
                .title("Lost flag")
                .description("1 when asset missing from latest scan for actor")
                .width(80),
            MetadataDef::new(DATA_FILE_READER, Json)
                .title("File reader")
                .description("Config for fetching binary data from a specific actor"),
            MetadataDef::new(ASSET_SEARCH_DOC, String).title("Search document"),
            MetadataDef::new(COLLECTION_MEMBER, Collection)
                .title("Collection member")
                .description("Membership in an asset collection"),
            MetadataDef::new(FILE_ID_PATH, String),
            MetadataDef::new(FILE_NAME, String).title("Filename"),
            MetadataDef::new(FILE_ORIGINAL_NAME, String).title("Original filename"),
            MetadataDef::new(FILE_PATH, String).title("Path"),
            MetadataDef::new(FILE_TYPE, String).title("MIME Type"),
            MetadataDef::new(FILE_EXTENSION, String).title("File extension"),
            MetadataDef::new(FILE_SIZE, Int).title("Size").width(120),
            MetadataDef::new(FILE_VERSION, Int).title("Version"),
            MetadataDef::new(FILE_DOWNLOAD_URI, String).title("Download URI"),
            MetadataDef::new(FILE_VIEW_URI, String).title("View URI"),
            MetadataDef::new(FILE_THUMBNAIL_URI, String).title("Thumbnail URI"),
            MetadataDef::new(FILE_URI, String).title("URI"),
            MetadataDef::new(FILE_TITLE, String).title("Title"),
            MetadataDef::new(FILE_DESCRIPTION, String).title("Description"),
            MetadataDef::new(FILE_TAGS, Json).title("Tags"),
            MetadataDef::new(FILE_COMMENT, String).title("Comment"),
            MetadataDef::new(ACCESS_OWNER, String).title("Owner"),
            MetadataDef::new(ACCESS_SHARED_WITH, String).title("Shared with"),
            MetadataDef::new(ACCESS_SHARING_USER, String).title("Sharing user"),
            MetadataDef::new(ACCESS_LAST_MODIFYING_USER, String).title("Last modifying user"),
            MetadataDef::new(TIME_CREATED, Datetime).title("Created"),
            MetadataDef::new(TIME_MODIFIED, Datetime).title("Modified"),
            MetadataDef::new(TIME_TRASHED, Datetime).title("Trashed"),
            MetadataDef::new(TIME_ACCESSED, Datetime).title("Last accessed"),
            MetadataDef::new(TIME_DOWNLOADED, Datetime).title("Downloaded"),
            MetadataDef::new(TIME_BIRTHTIME, Datetime).title("Birth/creation time (fs)"),
            MetadataDef::new(FLAG_FAVORITE, Int)
                .title("Favorited")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(FLAG_HIDDEN, Int)
                .title("Hidden")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(FLAG_REVIEW, Int)
                .title("Review")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(FLAG_REJECTED, Int)
                .title("Rejected")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(FLAG_SHARED, Int)
                .title("Shared")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(FLAG_TRASHED, Int)
                .title("Trashed")
                .width(100)
                .skip_false()
                .clear_on_false(),
            MetadataDef::new(HASH_MD5, String).title("MD5 Hash").width(200),
            MetadataDef::new(HASH_SHA1, String).title("SHA1 Hash"),
            MetadataDef::new(HASH_MINHASH, Json).title("MinHash fingerprint"),
            MetadataDef::new(HASH_SIMHASH, String).title("SimHash (text)"),
            MetadataDef::new(HASH_PHASH, String).title("Perceptual hash (images)"),
            MetadataDef::new(DOC_TEXT, String).title("Extracted text content"),
            MetadataDef::new(DOC_SUMMARY, String).title("Document summary"),
            MetadataDef::new(DOC_BYLINE, String).title("Byline / author string"),
            MetadataDef::new(DOC_LANG, String).title("Document language"),
            MetadataDef::new(DOC_AUTHOR, String).title("Document author"),
            MetadataDef::new(DOC_CHARS, Int).title("Character count"),
            MetadataDef::new(DOC_WORDS, Int).title("Word count"),
            MetadataDef::new(DOC_PAGES, Int).title("Page count"),
            MetadataDef::new(DOC_CHUNKS, Json).title("Chunked content with optional embeddings"),
            MetadataDef::new(REL_CHILD_OF, Relation).title("Child of"),
            MetadataDef::new(REL_PARENT_OF, Relation).title("Parent of"),
            MetadataDef::new(REL_PART_OF, Relation).title("Part of"),
            MetadataDef::new(REL_DERIVED_FROM, Relation).title("Derived from"),
            MetadataDef::new(REL_VERSION_OF, Relation).title("Version of"),
            MetadataDef::new(REL_SIMILAR_TO, Relation).title("Similar to"),
            MetadataDef::new(REL_DUPLICATE_OF, Relation).title("Duplicate of"),
            MetadataDef::new(WARNING_NAME_READABILITY, Json),
            MetadataDef::new(WARNING_NAME_CONVENTIONS, Json),
        ];
        for def in defs {
            registry.declare(def);
        }
        registry
    }

    /// Declares a key. Re-declaring an existing key replaces its definition
    /// but keeps any id already assigned.
    pub fn declare(&mut self, def: MetadataDef) -> MetadataKey {
        let key = def.key.clone();
        match self.by_key.get(&key) {
            Some(&index) => {
                let registry_id = self.defs[index].registry_id;
                self.defs[index] = def;
                self.defs[index].registry_id = registry_id;
            }
            None => {
                self.defs.push(def);
                self.by_key.insert(key.clone(), self.defs.len() - 1);
            }
        }
        key
    }

    /// Upserts every declared key into the store and fills the id lookup.
    /// Existing rows keep their ids; only display fields are refreshed.
    pub fn sync(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        for index in 0..self.defs.len() {
            let def = &self.defs[index];
            let existing: Option<i64> = metadata_registry::table
                .select(metadata_registry::id)
                .filter(metadata_registry::key.eq(def.key.as_str()))
                .first(conn)
                .optional()?;
            let id = match existing {
                Some(id) => {
                    diesel::update(metadata_registry::table.find(id))
                        .set((
                            metadata_registry::plugin_id.eq(def.plugin_id.as_str()),
                            metadata_registry::value_type.eq(def.value_type),
                            metadata_registry::title.eq(def.title.as_str()),
                            metadata_registry::description.eq(def.description.as_str()),
                            metadata_registry::width.eq(def.width),
                        ))
                        .execute(conn)?;
                    id
                }
                None => diesel::insert_into(metadata_registry::table)
                    .values(NewMetadataRegistryRow {
                        plugin_id: &def.plugin_id,
                        key: def.key.as_str(),
                        value_type: def.value_type,
                        title: &def.title,
                        description: &def.description,
                        width: def.width,
                    })
                    .returning(metadata_registry::id)
                    .get_result(conn)?,
            };
            self.defs[index].registry_id = Some(id);
            self.by_id.insert(id, index);
        }
        self.synced = true;
        Ok(())
    }

    pub fn def(&self, key: &MetadataKey) -> Result<&MetadataDef> {
        self.by_key
            .get(key)
            .map(|&index| &self.defs[index])
            .ok_or_else(|| Error::UnknownMetadataKey(key.clone()))
    }

    pub fn def_by_id(&self, registry_id: i64) -> Result<&MetadataDef> {
        self.by_id
            .get(&registry_id)
            .map(|&index| &self.defs[index])
            .ok_or(Error::UnknownMetadataId(registry_id))
    }

    pub fn id_of(&self, key: &MetadataKey) -> Result<i64> {
        self.def(key)?
            .registry_id
            .ok_or_else(|| Error::RegistryNotSynced(key.clone()))
    }

    pub fn key_of(&self, registry_id: i64) -> Result<&MetadataKey> {
        self.def_by_id(registry_id).map(|def| &def.key)
    }

    pub fn defs(&self) -> impl Iterator<Item = &MetadataDef> {
        self.defs.iter()
    }

    /// Builds a staged observation for `key`, checking the value against the
    /// key's declared type. A `None` value is a request to clear the key.
    pub fn make(&self, key: &MetadataKey, value: Option<MetadataValue>, actor_id: i64) -> Result<Metadata> {
        let def = self.def(key)?;
        let registry_id = def.registry_id.ok_or_else(|| Error::RegistryNotSynced(key.clone()))?;
        if let Some(value) = &value {
            if value.value_type() != def.value_type {
                return Err(Error::ValueTypeMismatch {
                    key: key.clone(),
                    expected: def.value_type,
                    got: value.value_type(),
                });
            }
        }
        Ok(Metadata {
            id: None,
            asset_id: None,
            actor_id: Some(actor_id),
            changeset_id: None,
            key_id: registry_id,
            value_type: def.value_type,
            value,
            removed: false,
            confidence: None,
        })
    }

    /// Like `make` but flags the observation as a tombstone for `value`.
    pub fn make_removed(&self, key: &MetadataKey, value: MetadataValue, actor_id: i64) -> Result<Metadata> {
        let mut entry = self.make(key, Some(value), actor_id)?;
        entry.removed = true;
        Ok(entry)
    }
}

/// The registry rows as persisted, ordered by id.
pub fn stored_rows(conn: &mut SqliteConnection) -> Result<Vec<MetadataRegistryRow>> {
    metadata_registry::table
        .select(MetadataRegistryRow::as_select())
        .order(metadata_registry::id.asc())
        .load(conn)
        .map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::CatalogFixture;

    #[test]
    fn make_rejects_type_mismatch() {
        let fx = CatalogFixture::new();
        let result = fx.catalog.registry().make(&FILE_SIZE, Some("forty-two".into()), 1);
        assert!(matches!(
            result,
            Err(Error::ValueTypeMismatch {
                expected: MetadataType::Int,
                got: MetadataType::String,
                ..
            })
        ));
    }

    #[test]
    fn make_accepts_clear_request() {
        let fx = CatalogFixture::new();
        let entry = fx.catalog.registry().make(&FILE_SIZE, None, 1).unwrap();
        assert!(entry.value.is_none());
        assert!(!entry.removed);
        assert!(entry.fingerprint().is_none());
    }

    #[test]
    fn unsynced_registry_has_no_ids() {
        let registry = MetadataRegistry::with_builtin_keys();
        assert!(matches!(registry.id_of(&FILE_SIZE), Err(Error::RegistryNotSynced(_))));
    }

    #[test]
    fn sync_is_stable_across_restarts() {
        let fx = CatalogFixture::new();
        let first = fx.catalog.registry().id_of(&FILE_SIZE).unwrap();

        // A fresh registry synced against the same store sees the same ids.
        let mut registry = MetadataRegistry::with_builtin_keys();
        registry.declare(MetadataDef::new(MetadataKey::from("custom/key"), MetadataType::String));
        let mut conn = fx.catalog.connection().unwrap();
        registry.sync(&mut conn).unwrap();
        assert_eq!(registry.id_of(&FILE_SIZE).unwrap(), first);

        let custom_id = registry.id_of(&MetadataKey::from("custom/key")).unwrap();
        assert_ne!(custom_id, first);
    }

    #[test]
    fn stored_rows_reflect_declarations() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let rows = stored_rows(&mut conn).unwrap();
        let size = rows.iter().find(|row| row.key.as_str() == "file/size").unwrap();
        assert_eq!(size.value_type, MetadataType::Int);
        assert_eq!(size.title.as_str(), "Size");
        assert_eq!(size.width, Some(120));
        assert_eq!(Some(size.id), fx.catalog.registry().def(&FILE_SIZE).unwrap().registry_id);
    }

    #[test]
    fn redeclaring_keeps_assigned_id() {
        let fx = CatalogFixture::new();
        let mut registry = MetadataRegistry::with_builtin_keys();
        let mut conn = fx.catalog.connection().unwrap();
        registry.sync(&mut conn).unwrap();
        let before = registry.id_of(&FILE_SIZE).unwrap();
        registry.declare(MetadataDef::new(FILE_SIZE, MetadataType::Int).title("Byte size"));
        assert_eq!(registry.id_of(&FILE_SIZE).unwrap(), before);
    }
}
