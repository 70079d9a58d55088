//! Database module for SQLite persistence
//!
//! Entity store for the sync core: products, customers, sales and expenses,
//! with schema initialization and pool construction.

mod customers;
mod expenses;
mod products;
mod sales;
mod schema;

pub use customers::*;
pub use expenses::*;
pub use products::*;
pub use sales::*;
pub use schema::*;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Create a new database connection pool
///
/// The busy timeout makes concurrent push transactions queue on SQLite's
/// write lock instead of failing with SQLITE_BUSY.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Format a timestamp for storage and comparison.
///
/// Fixed-width RFC 3339 UTC with microsecond precision, so lexicographic
/// order in SQL matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub(crate) fn uuid_col(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AppError::Internal(format!("corrupt uuid column '{raw}': {e}")))
}

pub(crate) fn decimal_col(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| AppError::Internal(format!("corrupt decimal column '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fmt_ts_is_fixed_width_utc() {
        let whole = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sub = whole + chrono::Duration::milliseconds(1);

        assert_eq!(fmt_ts(whole), "2024-03-01T12:00:00.000000Z");
        assert_eq!(fmt_ts(sub), "2024-03-01T12:00:00.001000Z");
        // Lexicographic order must match chronological order
        assert!(fmt_ts(sub) > fmt_ts(whole));
    }

    #[test]
    fn parse_ts_round_trips() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_ts(&fmt_ts(ts)).unwrap(), ts);
    }
}
