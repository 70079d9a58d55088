//! Sale records and persistence
//!
//! Sales are append-only through the sync channel: created once with their
//! items, never mutated. Corrections happen through a separate, audited
//! process outside this service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{decimal_col, fmt_ts, parse_ts, uuid_col};
use crate::error::Result;

/// A point-of-sale transaction with its line items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub sale_datetime: DateTime<Utc>,
    pub total: Decimal,
    pub payment_type: String,
    pub seller: String,
    pub customer: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<SaleItem>,
}

/// One line of a sale. Owned by its sale, no independent lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleItem {
    pub id: Uuid,
    pub product: Option<Uuid>,
    pub quantity: i64,
    pub price: Decimal,
}

/// Repository for sale persistence
pub struct SaleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SaleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a sale and its items atomically within the event transaction
    pub async fn insert_with_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        sale: &Sale,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sales (
                id, sale_datetime, total, payment_type, seller, customer_id,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sale.id.to_string())
        .bind(fmt_ts(sale.sale_datetime))
        .bind(sale.total.to_string())
        .bind(&sale.payment_type)
        .bind(&sale.seller)
        .bind(sale.customer.map(|c| c.to_string()))
        .bind(fmt_ts(sale.updated_at))
        .bind(fmt_ts(sale.updated_at))
        .execute(&mut **tx)
        .await?;

        for item in &sale.items {
            sqlx::query(
                r#"
                INSERT INTO sale_items (id, sale_id, product_id, quantity, price)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(sale.id.to_string())
            .bind(item.product.map(|p| p.to_string()))
            .bind(item.quantity)
            .bind(item.price.to_string())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Get sales modified strictly after a watermark, items included
    pub async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Sale>> {
        let rows = sqlx::query_as::<_, SaleRow>(
            r#"
            SELECT id, sale_datetime, total, payment_type, seller, customer_id, updated_at
            FROM sales
            WHERE updated_at > ?
            ORDER BY updated_at ASC
            "#,
        )
        .bind(fmt_ts(since))
        .fetch_all(self.pool)
        .await?;

        let mut sales = Vec::with_capacity(rows.len());
        for row in rows {
            let items = self.items_for(&row.id).await?;
            sales.push(row.into_sale(items)?);
        }

        Ok(sales)
    }

    /// Count all sales
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sales")
            .fetch_one(self.pool)
            .await?;

        Ok(row.0)
    }

    async fn items_for(&self, sale_id: &str) -> Result<Vec<SaleItem>> {
        let rows = sqlx::query_as::<_, SaleItemRow>(
            r#"
            SELECT id, product_id, quantity, price
            FROM sale_items
            WHERE sale_id = ?
            "#,
        )
        .bind(sale_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_item()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct SaleRow {
    id: String,
    sale_datetime: String,
    total: String,
    payment_type: String,
    seller: String,
    customer_id: Option<String>,
    updated_at: String,
}

impl SaleRow {
    fn into_sale(self, items: Vec<SaleItem>) -> Result<Sale> {
        Ok(Sale {
            id: uuid_col(&self.id)?,
            sale_datetime: parse_ts(&self.sale_datetime)?,
            total: decimal_col(&self.total)?,
            payment_type: self.payment_type,
            seller: self.seller,
            customer: self.customer_id.as_deref().map(uuid_col).transpose()?,
            updated_at: parse_ts(&self.updated_at)?,
            items,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SaleItemRow {
    id: String,
    product_id: Option<String>,
    quantity: i64,
    price: String,
}

impl SaleItemRow {
    fn into_item(self) -> Result<SaleItem> {
        Ok(SaleItem {
            id: uuid_col(&self.id)?,
            product: self.product_id.as_deref().map(uuid_col).transpose()?,
            quantity: self.quantity,
            price: decimal_col(&self.price)?,
        })
    }
}
