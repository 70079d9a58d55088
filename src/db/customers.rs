//! Customer records and persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{fmt_ts, parse_ts, uuid_col};
use crate::error::Result;

/// CRM customer, merged last-writer-wins by logical version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub full_name: String,
    pub phone: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Repository for customer persistence
pub struct CustomerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CustomerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a customer inside an in-flight reconcile transaction
    pub async fn get_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT id, full_name, phone, version, updated_at
            FROM customers
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| r.into_customer()).transpose()
    }

    /// Insert a freshly created customer
    pub async fn insert_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        customer: &Customer,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, full_name, phone, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(customer.id.to_string())
        .bind(&customer.full_name)
        .bind(&customer.phone)
        .bind(customer.version)
        .bind(fmt_ts(customer.updated_at))
        .bind(fmt_ts(customer.updated_at))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Overwrite the mutable fields of an existing customer
    pub async fn overwrite_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        customer: &Customer,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE customers
            SET full_name = ?, phone = ?, version = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&customer.full_name)
        .bind(&customer.phone)
        .bind(customer.version)
        .bind(fmt_ts(customer.updated_at))
        .bind(customer.id.to_string())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Get customers modified strictly after a watermark
    pub async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Customer>> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT id, full_name, phone, version, updated_at
            FROM customers
            WHERE updated_at > ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(fmt_ts(since))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_customer()).collect()
    }

    /// Count all customers
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM customers")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: String,
    full_name: String,
    phone: String,
    version: i64,
    updated_at: String,
}

impl CustomerRow {
    fn into_customer(self) -> Result<Customer> {
        Ok(Customer {
            id: uuid_col(&self.id)?,
            full_name: self.full_name,
            phone: self.phone,
            version: self.version,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
