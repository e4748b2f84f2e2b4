use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::TimestamptzSqlite;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use time::error::ComponentRange;
use time::format_description::well_known::Rfc3339;
use time::serde::rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};

/// Milliseconds since the Unix epoch. Changeset ids are allocated from this clock.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// A wrapper for time::OffsetDateTime that serializes/deserializes according to RFC 3339.
// Values are always offset-aware, so naive datetimes cannot enter the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = TimestamptzSqlite)]
pub struct DateTime(#[serde(with = "rfc3339")] OffsetDateTime);

impl DateTime {
    pub fn now() -> Self {
        OffsetDateTime::now_utc().into()
    }

    pub fn today() -> Self {
        Self::now().date().midnight().assume_utc().into()
    }

    pub fn from_date(year: i32, month: u8, day: u8) -> Result<Self, ComponentRange> {
        Month::try_from(month)
            .and_then(|month| Date::from_calendar_date(year, month, day))
            .map(Date::midnight)
            .map(PrimitiveDateTime::assume_utc)
            .map(Self::from)
    }

    pub fn from_unix_ms(timestamp_ms: i64) -> Result<Self, ComponentRange> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000).map(Self)
    }

    /// Canonical textual form used for value fingerprints.
    pub fn to_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .expect("RFC 3339 formatting of a valid OffsetDateTime cannot fail")
    }
}

impl Deref for DateTime {
    type Target = OffsetDateTime;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DateTime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<OffsetDateTime> for DateTime {
    fn from(value: OffsetDateTime) -> Self {
        DateTime(value)
    }
}

impl<DB: Backend> ToSql<TimestamptzSqlite, DB> for DateTime
where
    OffsetDateTime: ToSql<TimestamptzSqlite, DB>,
{
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, DB>) -> serialize::Result {
        self.0.to_sql(out)
    }
}

impl<DB: Backend> FromSql<TimestamptzSqlite, DB> for DateTime
where
    OffsetDateTime: FromSql<TimestamptzSqlite, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
        OffsetDateTime::from_sql(bytes).map(DateTime)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rfc3339_fingerprint_form() {
        let value = DateTime::from_date(2024, 3, 9).unwrap();
        assert_eq!(value.to_rfc3339(), "2024-03-09T00:00:00Z");
    }

    #[test]
    fn unix_ms_round_trip() {
        let now = now_ms();
        let restored = DateTime::from_unix_ms(now).unwrap();
        assert_eq!((restored.unix_timestamp_nanos() / 1_000_000) as i64, now);
    }
}
