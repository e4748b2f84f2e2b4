use diesel::FromSqlRow;
use diesel::backend::Backend;
use diesel::deserialize::FromSql;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::{SmallInt, Text};
use diesel::sqlite::{Sqlite, SqliteValue};
use diesel::{AsExpression, deserialize};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

/// Status of an operation (changeset run, scan, processor execution).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = Text)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    InProgress,
    Partial,
    Completed,
    Canceled,
    Skipped,
    Error,
}

impl OpStatus {
    /// Final status for a multi-source run: any error wins, then cancellation,
    /// then partial completion.
    pub fn combine(statuses: impl IntoIterator<Item = OpStatus>) -> OpStatus {
        let mut combined = OpStatus::Completed;
        for status in statuses {
            combined = match (combined, status) {
                (_, OpStatus::Error) | (OpStatus::Error, _) => OpStatus::Error,
                (_, OpStatus::Canceled) | (OpStatus::Canceled, _) => OpStatus::Canceled,
                (_, OpStatus::Partial) | (OpStatus::Partial, _) => OpStatus::Partial,
                (current, _) => current,
            };
        }
        combined
    }
}

impl ToSql<Text, Sqlite> for OpStatus {
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.to_string());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for OpStatus {
    fn from_sql(value: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
        let database_value = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
        OpStatus::from_str(&database_value).map_err(|_| DeserializeOpStatusError.into())
    }
}

/// Role of a registered actor.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Source,
    Processor,
    Analyzer,
    Editor,
    Exporter,
}

impl<DB: Backend> ToSql<SmallInt, DB> for ActorType
where
    i16: ToSql<SmallInt, DB>,
{
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, DB>) -> serialize::Result {
        // I have to do this jank here to get around the fact that to_sql doesn't work when called on a temporary
        const VALUES: [i16; 5] = [0, 1, 2, 3, 4];
        VALUES[self.to_usize().unwrap()].to_sql(out)
    }
}

impl<DB: Backend> FromSql<SmallInt, DB> for ActorType
where
    i16: FromSql<SmallInt, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        let database_value = i16::from_sql(bytes)?;
        ActorType::from_i16(database_value).ok_or(DeserializeActorTypeError.into())
    }
}

/// Discriminant of the tagged metadata value union.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "lowercase")]
pub enum MetadataType {
    String,
    Int,
    Float,
    Datetime,
    Json,
    Relation,
    Collection,
}

impl<DB: Backend> ToSql<SmallInt, DB> for MetadataType
where
    i16: ToSql<SmallInt, DB>,
{
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, DB>) -> serialize::Result {
        // I have to do this jank here to get around the fact that to_sql doesn't work when called on a temporary
        const VALUES: [i16; 7] = [0, 1, 2, 3, 4, 5, 6];
        VALUES[self.to_usize().unwrap()].to_sql(out)
    }
}

impl<DB: Backend> FromSql<SmallInt, DB> for MetadataType
where
    i16: FromSql<SmallInt, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        let database_value = i16::from_sql(bytes)?;
        MetadataType::from_i16(database_value).ok_or(DeserializeMetadataTypeError.into())
    }
}

/// Refresh policy of a query-backed collection.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = SmallInt)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Live,
    OnDemand,
}

impl<DB: Backend> ToSql<SmallInt, DB> for RefreshMode
where
    i16: ToSql<SmallInt, DB>,
{
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, DB>) -> serialize::Result {
        // I have to do this jank here to get around the fact that to_sql doesn't work when called on a temporary
        const VALUES: [i16; 2] = [0, 1];
        VALUES[self.to_usize().unwrap()].to_sql(out)
    }
}

impl<DB: Backend> FromSql<SmallInt, DB> for RefreshMode
where
    i16: FromSql<SmallInt, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        let database_value = i16::from_sql(bytes)?;
        RefreshMode::from_i16(database_value).ok_or(DeserializeRefreshModeError.into())
    }
}

/// Where a processor's `run` executes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// On the async runtime, for I/O-light work.
    Async,
    /// On the blocking thread pool, for blocking I/O.
    Threads,
    /// On the shared rayon pool, for CPU-bound work.
    Cpu,
}

#[derive(Debug, Error)]
#[error("Failed to deserialize operation status")]
struct DeserializeOpStatusError;

#[derive(Debug, Error)]
#[error("Failed to deserialize actor type")]
struct DeserializeActorTypeError;

#[derive(Debug, Error)]
#[error("Failed to deserialize metadata type")]
struct DeserializeMetadataTypeError;

#[derive(Debug, Error)]
#[error("Failed to deserialize refresh mode")]
struct DeserializeRefreshModeError;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(OpStatus::InProgress.to_string(), "in_progress");
        assert_eq!("canceled".parse::<OpStatus>().unwrap(), OpStatus::Canceled);
        assert!("cancelled".parse::<OpStatus>().is_err());
    }

    #[test]
    fn status_combination() {
        assert_eq!(OpStatus::combine([]), OpStatus::Completed);
        assert_eq!(OpStatus::combine([OpStatus::Completed, OpStatus::Partial]), OpStatus::Partial);
        assert_eq!(OpStatus::combine([OpStatus::Partial, OpStatus::Canceled]), OpStatus::Canceled);
        assert_eq!(
            OpStatus::combine([OpStatus::Canceled, OpStatus::Error, OpStatus::Completed]),
            OpStatus::Error
        );
    }

    #[test]
    fn metadata_type_discriminants() {
        assert_eq!(MetadataType::String.to_i16(), Some(0));
        assert_eq!(MetadataType::Collection.to_i16(), Some(6));
        assert_eq!(MetadataType::from_i16(3), Some(MetadataType::Datetime));
        assert_eq!(MetadataType::from_i16(7), None);
    }
}
