//! Product records and persistence
//!
//! Products are merged last-writer-wins by logical version; a stale write
//! whose stock diverges from the stored value flags the record for review.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{decimal_col, fmt_ts, parse_ts, uuid_col};
use crate::error::Result;

/// Catalog product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub barcode: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub stock_qty: i64,
    pub version: i64,
    pub needs_review: bool,
    pub updated_at: DateTime<Utc>,
}

/// Repository for product persistence
pub struct ProductRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ProductRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a product inside an in-flight reconcile transaction
    pub async fn get_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, name, barcode, buy_price, sell_price, stock_qty,
                   version, needs_review, updated_at
            FROM products
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| r.into_product()).transpose()
    }

    /// Insert a freshly created product
    pub async fn insert_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        product: &Product,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id, name, barcode, buy_price, sell_price, stock_qty,
                version, needs_review, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(product.id.to_string())
        .bind(&product.name)
        .bind(&product.barcode)
        .bind(product.buy_price.to_string())
        .bind(product.sell_price.to_string())
        .bind(product.stock_qty)
        .bind(product.version)
        .bind(product.needs_review)
        .bind(fmt_ts(product.updated_at))
        .bind(fmt_ts(product.updated_at))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Overwrite the mutable fields of an existing product
    pub async fn overwrite_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        product: &Product,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE products
            SET name = ?, barcode = ?, buy_price = ?, sell_price = ?,
                stock_qty = ?, version = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&product.name)
        .bind(&product.barcode)
        .bind(product.buy_price.to_string())
        .bind(product.sell_price.to_string())
        .bind(product.stock_qty)
        .bind(product.version)
        .bind(fmt_ts(product.updated_at))
        .bind(product.id.to_string())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Flag a product for human review after a stock divergence.
    ///
    /// Does not touch updated_at: flagging is not an apply, so the record
    /// must not re-enter the change feed.
    pub async fn mark_needs_review_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: Uuid,
    ) -> Result<()> {
        sqlx::query("UPDATE products SET needs_review = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Get products modified strictly after a watermark
    pub async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, name, barcode, buy_price, sell_price, stock_qty,
                   version, needs_review, updated_at
            FROM products
            WHERE updated_at > ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(fmt_ts(since))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_product()).collect()
    }

    /// Count all products
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }

    /// Count products flagged for review
    pub async fn count_needs_review(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM products WHERE needs_review = 1")
                .fetch_one(self.pool)
                .await?;

        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: String,
    name: String,
    barcode: String,
    buy_price: String,
    sell_price: String,
    stock_qty: i64,
    version: i64,
    needs_review: bool,
    updated_at: String,
}

impl ProductRow {
    fn into_product(self) -> Result<Product> {
        Ok(Product {
            id: uuid_col(&self.id)?,
            name: self.name,
            barcode: self.barcode,
            buy_price: decimal_col(&self.buy_price)?,
            sell_price: decimal_col(&self.sell_price)?,
            stock_qty: self.stock_qty,
            version: self.version,
            needs_review: self.needs_review,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
