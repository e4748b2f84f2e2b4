diesel::table! {
    actors (id) {
        id -> BigInt,
        name -> Text,
        plugin_id -> Nullable<Text>,
        identity_key -> Nullable<Text>,
        config -> Nullable<Text>,
        #[sql_name = "type"]
        type_ -> SmallInt,
        disabled -> Bool,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    changesets (id) {
        id -> BigInt,
        message -> Nullable<Text>,
        running_time_ms -> Nullable<BigInt>,
        status -> Text,
        data -> Nullable<Text>,
    }
}

diesel::table! {
    changeset_actors (id) {
        id -> BigInt,
        changeset_id -> BigInt,
        actor_id -> BigInt,
    }
}

diesel::table! {
    assets (id) {
        id -> BigInt,
        canonical_asset_id -> Nullable<BigInt>,
        actor_id -> Nullable<BigInt>,
        namespace -> Text,
        external_id -> Text,
        canonical_uri -> Text,
    }
}

diesel::table! {
    metadata_registry (id) {
        id -> BigInt,
        plugin_id -> Text,
        key -> Text,
        value_type -> SmallInt,
        title -> Text,
        description -> Text,
        width -> Nullable<Integer>,
    }
}

diesel::table! {
    asset_collections (id) {
        id -> BigInt,
        name -> Text,
        description -> Nullable<Text>,
        source -> Nullable<Text>,
        membership_key_id -> Nullable<BigInt>,
        item_count -> BigInt,
        refresh_mode -> SmallInt,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    metadata (id) {
        id -> BigInt,
        asset_id -> BigInt,
        actor_id -> BigInt,
        changeset_id -> BigInt,
        metadata_key_id -> BigInt,
        value_type -> SmallInt,
        value_text -> Nullable<Text>,
        value_int -> Nullable<BigInt>,
        value_real -> Nullable<Double>,
        value_datetime -> Nullable<TimestamptzSqlite>,
        value_json -> Nullable<Text>,
        value_relation_id -> Nullable<BigInt>,
        value_collection_id -> Nullable<BigInt>,
        removed -> Bool,
        confidence -> Nullable<Double>,
    }
}

diesel::table! {
    asset_search (rowid) {
        rowid -> BigInt,
        doc -> Text,
    }
}

diesel::joinable!(changeset_actors -> changesets (changeset_id));
diesel::joinable!(changeset_actors -> actors (actor_id));
diesel::joinable!(assets -> actors (actor_id));
diesel::joinable!(metadata -> assets (asset_id));
diesel::joinable!(metadata -> actors (actor_id));
diesel::joinable!(metadata -> changesets (changeset_id));
diesel::joinable!(metadata -> metadata_registry (metadata_key_id));

diesel::allow_tables_to_appear_in_same_query!(
    actors,
    changesets,
    changeset_actors,
    assets,
    metadata_registry,
    asset_collections,
    metadata,
    asset_search,
);
