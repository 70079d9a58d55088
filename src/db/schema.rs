//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Catalog products, merged by logical version
CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    barcode TEXT NOT NULL DEFAULT '',
    buy_price TEXT NOT NULL DEFAULT '0',
    sell_price TEXT NOT NULL DEFAULT '0',
    stock_qty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    needs_review INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_products_updated ON products(updated_at);
CREATE INDEX IF NOT EXISTS idx_products_needs_review ON products(needs_review);

-- Customers, merged by logical version
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_customers_updated ON customers(updated_at);

-- Sales are append-only: created once through sync, never mutated
CREATE TABLE IF NOT EXISTS sales (
    id TEXT PRIMARY KEY,
    sale_datetime TEXT NOT NULL,
    total TEXT NOT NULL DEFAULT '0',
    payment_type TEXT NOT NULL DEFAULT 'cash',
    seller TEXT NOT NULL DEFAULT '',
    customer_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sales_updated ON sales(updated_at);

-- Sale items live and die with their sale
CREATE TABLE IF NOT EXISTS sale_items (
    id TEXT PRIMARY KEY,
    sale_id TEXT NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
    product_id TEXT,
    quantity INTEGER NOT NULL DEFAULT 1,
    price TEXT NOT NULL DEFAULT '0'
);

CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);

-- Expenses are append-only, same policy as sales
CREATE TABLE IF NOT EXISTS expenses (
    id TEXT PRIMARY KEY,
    expense_datetime TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT '',
    amount TEXT NOT NULL DEFAULT '0',
    note TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_expenses_updated ON expenses(updated_at);

-- Event ledger: one write-once row per accepted event_id.
-- The primary key is the idempotency gate.
CREATE TABLE IF NOT EXISTS sync_events (
    event_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    device_id TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_events_entity ON sync_events(entity_type, entity_id);

-- Conflict log: write-once audit trail of rejected or merged events
CREATE TABLE IF NOT EXISTS conflict_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    conflict_type TEXT NOT NULL,
    server_payload TEXT NOT NULL DEFAULT '{}',
    client_payload TEXT NOT NULL DEFAULT '{}',
    resolved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflict_log_resolved ON conflict_log(resolved);
CREATE INDEX IF NOT EXISTS idx_conflict_log_entity ON conflict_log(entity_type, entity_id);
"#;
