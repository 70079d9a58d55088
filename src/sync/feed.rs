//! Watermark-based change feed
//!
//! Incremental export for pull: every entity mutated strictly after the
//! device's watermark, plus a fresh `server_time` the device stores as its
//! next `since`. The watermark is captured before the queries run so
//! records updated between request and response are never skipped.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::PullResponse;
use crate::db::{
    fmt_ts, CustomerRepository, ExpenseRepository, ProductRepository, SaleRepository,
};
use crate::error::Result;

/// Read-only exporter over the entity store
pub struct ChangeFeed<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChangeFeed<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Snapshot everything changed strictly after `since`.
    ///
    /// No `since` means all time. The boundary is exclusive: a record
    /// updated at exactly `since` does not reappear, otherwise devices
    /// with coarse clocks would redeliver it forever.
    pub async fn snapshot(&self, since: Option<DateTime<Utc>>) -> Result<PullResponse> {
        let server_time = Utc::now();
        let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let products = ProductRepository::new(self.pool).modified_since(since).await?;
        let customers = CustomerRepository::new(self.pool).modified_since(since).await?;
        let sales = SaleRepository::new(self.pool).modified_since(since).await?;
        let expenses = ExpenseRepository::new(self.pool).modified_since(since).await?;

        Ok(PullResponse {
            server_time: fmt_ts(server_time),
            products,
            customers,
            sales,
            expenses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{parse_ts, Product};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn setup_test_db() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        crate::db::initialize_schema(&pool).await.unwrap();
        pool
    }

    async fn insert_product_at(pool: &SqlitePool, updated_at: DateTime<Utc>) -> Uuid {
        let repo = ProductRepository::new(pool);
        let product = Product {
            id: Uuid::new_v4(),
            name: "Marker".to_string(),
            barcode: String::new(),
            buy_price: dec!(100),
            sell_price: dec!(200),
            stock_qty: 1,
            version: 1,
            needs_review: false,
            updated_at,
        };
        let mut tx = pool.begin().await.unwrap();
        repo.insert_with_tx(&mut tx, &product).await.unwrap();
        tx.commit().await.unwrap();
        product.id
    }

    #[tokio::test]
    async fn pull_boundary_is_strictly_greater() {
        let pool = setup_test_db().await;
        let feed = ChangeFeed::new(&pool);

        let updated_at = parse_ts("2024-03-01T12:00:00.000000Z").unwrap();
        insert_product_at(&pool, updated_at).await;

        // A record updated at exactly `since` must not reappear
        let at_boundary = feed.snapshot(Some(updated_at)).await.unwrap();
        assert!(at_boundary.products.is_empty());

        // One millisecond earlier and it is included
        let just_before = updated_at - chrono::Duration::milliseconds(1);
        let before = feed.snapshot(Some(just_before)).await.unwrap();
        assert_eq!(before.products.len(), 1);
    }

    #[tokio::test]
    async fn no_watermark_means_all_time() {
        let pool = setup_test_db().await;
        let feed = ChangeFeed::new(&pool);

        insert_product_at(&pool, Utc::now()).await;

        let all = feed.snapshot(None).await.unwrap();
        assert_eq!(all.products.len(), 1);
        assert!(all.customers.is_empty());
        assert!(all.sales.is_empty());
        assert!(all.expenses.is_empty());
    }

    #[tokio::test]
    async fn server_time_moves_the_watermark_forward() {
        let pool = setup_test_db().await;
        let feed = ChangeFeed::new(&pool);

        insert_product_at(&pool, Utc::now()).await;
        let first = feed.snapshot(None).await.unwrap();
        assert_eq!(first.products.len(), 1);

        // Nothing changed since the returned watermark, so the next pull
        // with it is empty
        let watermark = parse_ts(&first.server_time).unwrap();
        let second = feed.snapshot(Some(watermark)).await.unwrap();
        assert!(second.products.is_empty());

        // A later change shows up against the same watermark
        let id = insert_product_at(&pool, watermark + chrono::Duration::milliseconds(2)).await;
        let third = feed.snapshot(Some(watermark)).await.unwrap();
        assert_eq!(third.products.len(), 1);
        assert_eq!(third.products[0].id, id);
    }
}
