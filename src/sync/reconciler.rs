//! Per-event merge algorithm
//!
//! Evaluates each pushed event independently against the entity store and
//! the event ledger: dedupe by event_id, version compare for products and
//! customers, append-only enforcement for sales and expenses, conflict
//! classification for everything rejected.
//!
//! Every event runs in its own transaction so the read-decide-write
//! sequence for an entity_id never acts on a stale read, and a later event
//! failing cannot roll back an earlier one.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::store::{ConflictLogRepository, EventLogRepository, NewConflict, NewEvent};
use super::types::{
    datetime_field, decimal_field, int_field, str_field, uuid_field, version_field,
    ConflictType, EntityKind, EventResult, EventStatus, RawEvent,
};
use crate::db::{
    Customer, CustomerRepository, Expense, ExpenseRepository, Product, ProductRepository, Sale,
    SaleItem, SaleRepository,
};
use crate::error::Result;

/// The per-event merge engine
pub struct Reconciler<'a> {
    pool: &'a SqlitePool,
}

/// A raw event with a usable idempotency key.
///
/// The event_id is the only field that must parse: without it the event
/// cannot be deduplicated or ledgered at all. Everything else is carried
/// as submitted so even a malformed event leaves an audit row.
struct PreparedEvent {
    event_id: Uuid,
    entity_type: String,
    kind: Option<EntityKind>,
    entity_id: Option<Uuid>,
    entity_id_raw: String,
    operation: String,
    payload: serde_json::Map<String, Value>,
}

impl PreparedEvent {
    fn from_raw(raw: &RawEvent) -> Option<Self> {
        let event_id = Uuid::parse_str(raw.event_id.as_deref()?.trim()).ok()?;
        let entity_type = raw
            .entity_type
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let entity_id_raw = raw.entity_id.as_deref().unwrap_or_default().trim().to_string();

        Some(Self {
            event_id,
            kind: EntityKind::parse(&entity_type),
            entity_type,
            entity_id: Uuid::parse_str(&entity_id_raw).ok(),
            entity_id_raw,
            operation: raw
                .operation
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_uppercase(),
            payload: raw.payload_json.clone(),
        })
    }
}

/// How one event resolved: a terminal status, plus the conflict row to
/// write when the event was rejected
struct Outcome {
    status: EventStatus,
    conflict: Option<(ConflictType, Value)>,
}

impl Outcome {
    fn applied() -> Self {
        Self {
            status: EventStatus::Applied,
            conflict: None,
        }
    }

    fn invalid() -> Self {
        Self {
            status: EventStatus::Invalid,
            conflict: None,
        }
    }

    fn conflict(conflict_type: ConflictType, server_payload: Value) -> Self {
        Self {
            status: EventStatus::Conflict,
            conflict: Some((conflict_type, server_payload)),
        }
    }

    fn append_only_ignored() -> Self {
        Self {
            status: EventStatus::Ignored,
            conflict: Some((ConflictType::AppendOnly, json!({}))),
        }
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Process one pushed event to its terminal status.
    ///
    /// Returns an error only for transport-level faults (database errors);
    /// everything event-shaped becomes a status in the result.
    pub async fn process(&self, device_id: &str, raw: &RawEvent) -> Result<EventResult> {
        let echo = raw.event_id.clone();

        let Some(event) = PreparedEvent::from_raw(raw) else {
            // No idempotency key means no ledger row can be written for it
            tracing::warn!(device_id, "sync event with missing or malformed event_id");
            return Ok(EventResult {
                event_id: echo,
                status: EventStatus::Invalid,
            });
        };

        let mut tx = self.pool.begin().await?;

        let events = EventLogRepository::new(self.pool);
        if events.seen_with_tx(&mut tx, event.event_id).await? {
            tx.rollback().await?;
            tracing::debug!(event_id = %event.event_id, "duplicate event, already ledgered");
            return Ok(EventResult {
                event_id: echo,
                status: EventStatus::Duplicate,
            });
        }

        let outcome = match (event.kind, event.entity_id) {
            (Some(EntityKind::Product), Some(entity_id)) => {
                self.apply_product(&mut tx, entity_id, &event).await?
            }
            (Some(EntityKind::Customer), Some(entity_id)) => {
                self.apply_customer(&mut tx, entity_id, &event).await?
            }
            (Some(EntityKind::Sale), Some(entity_id)) => {
                self.apply_sale(&mut tx, entity_id, &event).await?
            }
            (Some(EntityKind::Expense), Some(entity_id)) => {
                self.apply_expense(&mut tx, entity_id, &event).await?
            }
            _ => {
                tracing::warn!(
                    event_id = %event.event_id,
                    entity_type = %event.entity_type,
                    "event with unrecognized entity_type or unaddressable entity_id"
                );
                Outcome::invalid()
            }
        };

        let inserted = events
            .record_with_tx(
                &mut tx,
                &NewEvent {
                    event_id: event.event_id,
                    entity_type: &event.entity_type,
                    entity_id: &event.entity_id_raw,
                    operation: &event.operation,
                    payload: &event.payload,
                    device_id,
                    status: outcome.status,
                },
            )
            .await?;

        if !inserted {
            // Lost a race on the event_id; the winner's apply stands.
            tx.rollback().await?;
            return Ok(EventResult {
                event_id: echo,
                status: EventStatus::Duplicate,
            });
        }

        if let (Some((conflict_type, server_payload)), Some(entity_id)) =
            (outcome.conflict, event.entity_id)
        {
            ConflictLogRepository::new(self.pool)
                .record_with_tx(
                    &mut tx,
                    &NewConflict {
                        event_id: event.event_id,
                        entity_type: event.entity_type.clone(),
                        entity_id,
                        conflict_type,
                        server_payload,
                        client_payload: Value::Object(event.payload.clone()),
                    },
                )
                .await?;
            tracing::warn!(
                event_id = %event.event_id,
                entity_id = %entity_id,
                conflict_type = conflict_type.as_str(),
                "sync conflict recorded"
            );
        }

        tx.commit().await?;

        Ok(EventResult {
            event_id: echo,
            status: outcome.status,
        })
    }

    /// Versioned merge for products. The stock comparison makes a stale
    /// write with diverging stock operationally visible: the update is
    /// still rejected, but the stored record is flagged for review.
    async fn apply_product(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: Uuid,
        event: &PreparedEvent,
    ) -> Result<Outcome> {
        let repo = ProductRepository::new(self.pool);
        let incoming_version = version_field(&event.payload);
        let incoming_stock = int_field(&event.payload, "stock_qty");

        match repo.get_with_tx(tx, entity_id).await? {
            Some(existing) => {
                if incoming_version > existing.version {
                    let updated = Product {
                        id: existing.id,
                        name: str_field(&event.payload, "name").unwrap_or(existing.name),
                        barcode: str_field(&event.payload, "barcode").unwrap_or(existing.barcode),
                        buy_price: decimal_field(&event.payload, "buy_price")
                            .unwrap_or(existing.buy_price),
                        sell_price: decimal_field(&event.payload, "sell_price")
                            .unwrap_or(existing.sell_price),
                        stock_qty: incoming_stock.unwrap_or(existing.stock_qty),
                        version: incoming_version,
                        needs_review: existing.needs_review,
                        updated_at: Utc::now(),
                    };
                    repo.overwrite_with_tx(tx, &updated).await?;
                    Ok(Outcome::applied())
                } else if incoming_stock.is_some_and(|stock| stock != existing.stock_qty) {
                    repo.mark_needs_review_with_tx(tx, existing.id).await?;
                    Ok(Outcome::conflict(
                        ConflictType::StockQtyConflict,
                        serde_json::to_value(&existing)?,
                    ))
                } else {
                    Ok(Outcome::conflict(
                        ConflictType::VersionConflict,
                        serde_json::to_value(&existing)?,
                    ))
                }
            }
            None => {
                let product = Product {
                    id: entity_id,
                    name: str_field(&event.payload, "name").unwrap_or_default(),
                    barcode: str_field(&event.payload, "barcode").unwrap_or_default(),
                    buy_price: decimal_field(&event.payload, "buy_price").unwrap_or_default(),
                    sell_price: decimal_field(&event.payload, "sell_price").unwrap_or_default(),
                    stock_qty: incoming_stock.unwrap_or(0),
                    version: incoming_version,
                    needs_review: false,
                    updated_at: Utc::now(),
                };
                repo.insert_with_tx(tx, &product).await?;
                Ok(Outcome::applied())
            }
        }
    }

    /// Versioned merge for customers. Same policy as products except that
    /// conflicts are recorded without flagging the record for review.
    async fn apply_customer(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: Uuid,
        event: &PreparedEvent,
    ) -> Result<Outcome> {
        let repo = CustomerRepository::new(self.pool);
        let incoming_version = version_field(&event.payload);

        match repo.get_with_tx(tx, entity_id).await? {
            Some(existing) => {
                if incoming_version > existing.version {
                    let updated = Customer {
                        id: existing.id,
                        full_name: str_field(&event.payload, "full_name")
                            .unwrap_or(existing.full_name),
                        phone: str_field(&event.payload, "phone").unwrap_or(existing.phone),
                        version: incoming_version,
                        updated_at: Utc::now(),
                    };
                    repo.overwrite_with_tx(tx, &updated).await?;
                    Ok(Outcome::applied())
                } else {
                    Ok(Outcome::conflict(
                        ConflictType::VersionConflict,
                        serde_json::to_value(&existing)?,
                    ))
                }
            }
            None => {
                let customer = Customer {
                    id: entity_id,
                    full_name: str_field(&event.payload, "full_name").unwrap_or_default(),
                    phone: str_field(&event.payload, "phone").unwrap_or_default(),
                    version: incoming_version,
                    updated_at: Utc::now(),
                };
                repo.insert_with_tx(tx, &customer).await?;
                Ok(Outcome::applied())
            }
        }
    }

    /// Append-only policy for sales: CREATE materializes the sale with its
    /// items, anything else is rejected without touching the store.
    async fn apply_sale(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: Uuid,
        event: &PreparedEvent,
    ) -> Result<Outcome> {
        if event.operation != "CREATE" {
            return Ok(Outcome::append_only_ignored());
        }

        let items = event
            .payload
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|item| SaleItem {
                        id: Uuid::new_v4(),
                        product: uuid_field(item, "product"),
                        quantity: int_field(item, "quantity").unwrap_or(1),
                        price: decimal_field(item, "price").unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let sale = Sale {
            id: entity_id,
            sale_datetime: datetime_field(&event.payload, "sale_datetime")
                .unwrap_or_else(Utc::now),
            total: decimal_field(&event.payload, "total").unwrap_or_default(),
            payment_type: str_field(&event.payload, "payment_type")
                .unwrap_or_else(|| "cash".to_string()),
            seller: str_field(&event.payload, "seller").unwrap_or_default(),
            customer: uuid_field(&event.payload, "customer"),
            updated_at: Utc::now(),
            items,
        };
        SaleRepository::new(self.pool)
            .insert_with_tx(tx, &sale)
            .await?;

        Ok(Outcome::applied())
    }

    /// Append-only policy for expenses
    async fn apply_expense(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity_id: Uuid,
        event: &PreparedEvent,
    ) -> Result<Outcome> {
        if event.operation != "CREATE" {
            return Ok(Outcome::append_only_ignored());
        }

        let expense = Expense {
            id: entity_id,
            expense_datetime: datetime_field(&event.payload, "expense_datetime")
                .unwrap_or_else(Utc::now),
            category: str_field(&event.payload, "category").unwrap_or_default(),
            amount: decimal_field(&event.payload, "amount").unwrap_or_default(),
            note: str_field(&event.payload, "note").unwrap_or_default(),
            updated_at: Utc::now(),
        };
        ExpenseRepository::new(self.pool)
            .insert_with_tx(tx, &expense)
            .await?;

        Ok(Outcome::applied())
    }
}
