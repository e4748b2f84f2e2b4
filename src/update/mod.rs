pub mod actor;
pub mod asset;
pub mod changeset;
pub mod collection;
pub mod metadata;

// NOTE: The functions in this module operate on a caller-supplied connection
// and do not open transactions of their own unless stated otherwise. Batch
// entry points wrap all of their writes in a single transaction.
