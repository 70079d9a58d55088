//! Expense records and persistence
//!
//! Append-only, same policy as sales.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{decimal_col, fmt_ts, parse_ts, uuid_col};
use crate::error::Result;

/// A recorded business expense
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub expense_datetime: DateTime<Utc>,
    pub category: String,
    pub amount: Decimal,
    pub note: String,
    pub updated_at: DateTime<Utc>,
}

/// Repository for expense persistence
pub struct ExpenseRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ExpenseRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created expense within the event transaction
    pub async fn insert_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        expense: &Expense,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO expenses (
                id, expense_datetime, category, amount, note, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(expense.id.to_string())
        .bind(fmt_ts(expense.expense_datetime))
        .bind(&expense.category)
        .bind(expense.amount.to_string())
        .bind(&expense.note)
        .bind(fmt_ts(expense.updated_at))
        .bind(fmt_ts(expense.updated_at))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Get expenses modified strictly after a watermark
    pub async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Expense>> {
        let rows = sqlx::query_as::<_, ExpenseRow>(
            r#"
            SELECT id, expense_datetime, category, amount, note, updated_at
            FROM expenses
            WHERE updated_at > ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(fmt_ts(since))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_expense()).collect()
    }

    /// Count all expenses
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM expenses")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct ExpenseRow {
    id: String,
    expense_datetime: String,
    category: String,
    amount: String,
    note: String,
    updated_at: String,
}

impl ExpenseRow {
    fn into_expense(self) -> Result<Expense> {
        Ok(Expense {
            id: uuid_col(&self.id)?,
            expense_datetime: parse_ts(&self.expense_datetime)?,
            category: self.category,
            amount: decimal_col(&self.amount)?,
            note: self.note,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
