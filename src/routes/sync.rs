//! Sync API endpoints
//!
//! Thin transport shims over the reconciler and the change feed, plus the
//! read-side the back office uses to triage conflicts.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::fmt_ts;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{
    ChangeFeed, ConflictLogRepository, ConflictRecord, EventLogRepository, PullResponse,
    PushRequest, PushResponse, Reconciler,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_events))
        .route("/pull", get(pull_changes))
        .route("/status", get(sync_status))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:conflict_id/resolve", post(resolve_conflict))
}

/// Push a batch of device events.
///
/// Events are processed one at a time in batch order; each gets exactly
/// one terminal status and a failing event never blocks the rest.
async fn push_events(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let server_time = Utc::now();
    let reconciler = Reconciler::new(state.db());
    let device_id = req.device_id.trim();

    let mut results = Vec::with_capacity(req.events.len());
    for raw in &req.events {
        results.push(reconciler.process(device_id, raw).await?);
    }

    Ok(Json(PushResponse {
        server_time: fmt_ts(server_time),
        results,
    }))
}

#[derive(Debug, Deserialize)]
struct PullParams {
    since: Option<String>,
}

/// Pull everything changed strictly after the device's watermark
async fn pull_changes(
    State(state): State<AppState>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>> {
    let since = params
        .since
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| AppError::BadRequest(format!("invalid since parameter: {e}")))
        })
        .transpose()?;

    let response = ChangeFeed::new(state.db()).snapshot(since).await?;
    Ok(Json(response))
}

/// Store and sync counters for the back office
#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub products: i64,
    pub customers: i64,
    pub sales: i64,
    pub expenses: i64,
    pub events: i64,
    pub unresolved_conflicts: i64,
    pub needs_review_products: i64,
}

async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatusResponse>> {
    let pool = state.db();
    let products = crate::db::ProductRepository::new(pool);

    Ok(Json(SyncStatusResponse {
        products: products.count().await?,
        customers: crate::db::CustomerRepository::new(pool).count().await?,
        sales: crate::db::SaleRepository::new(pool).count().await?,
        expenses: crate::db::ExpenseRepository::new(pool).count().await?,
        events: EventLogRepository::new(pool).count().await?,
        unresolved_conflicts: ConflictLogRepository::new(pool).count_unresolved().await?,
        needs_review_products: products.count_needs_review().await?,
    }))
}

#[derive(Debug, Deserialize)]
struct ConflictParams {
    resolved: Option<bool>,
}

/// List conflict log entries, newest first
async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictParams>,
) -> Result<Json<Vec<ConflictRecord>>> {
    let conflicts = ConflictLogRepository::new(state.db())
        .list(params.resolved)
        .await?;
    Ok(Json(conflicts))
}

/// Mark a conflict as resolved
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(conflict_id): Path<i64>,
) -> Result<StatusCode> {
    let resolved = ConflictLogRepository::new(state.db())
        .resolve(conflict_id)
        .await?;
    if resolved {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "No conflict with id: {conflict_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use uuid::Uuid;

    async fn test_server() -> TestServer {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        crate::db::initialize_schema(&pool).await.unwrap();

        let state = AppState::new(Config::default(), pool);
        let app = Router::new()
            .nest("/api/sync", router())
            .with_state(state);

        TestServer::new(app).unwrap()
    }

    fn create_product_event(event_id: &str, product_id: &str) -> Value {
        json!({
            "event_id": event_id,
            "entity_type": "product",
            "entity_id": product_id,
            "operation": "CREATE",
            "payload_json": {"name": "Book", "sell_price": "1000", "version": 1}
        })
    }

    #[tokio::test]
    async fn push_twice_applies_then_duplicates() {
        let server = test_server().await;
        let event_id = Uuid::new_v4().to_string();
        let product_id = Uuid::new_v4().to_string();
        let body = json!({
            "device_id": "device-1",
            "events": [create_product_event(&event_id, &product_id)]
        });

        let first = server.post("/api/sync/push").json(&body).await;
        first.assert_status_ok();
        let first: Value = first.json();
        assert_eq!(first["results"][0]["status"], "applied");
        assert_eq!(first["results"][0]["event_id"], json!(event_id));

        let second = server.post("/api/sync/push").json(&body).await;
        second.assert_status_ok();
        let second: Value = second.json();
        assert_eq!(second["results"][0]["status"], "duplicate");

        // Exactly one product exists either way
        let pull: Value = server.get("/api/sync/pull").await.json();
        assert_eq!(pull["products"].as_array().unwrap().len(), 1);
        assert_eq!(pull["products"][0]["name"], "Book");
        assert_eq!(pull["products"][0]["version"], 1);
    }

    #[tokio::test]
    async fn results_keep_batch_order() {
        let server = test_server().await;
        let body = json!({
            "device_id": "device-1",
            "events": [
                {"entity_type": "product", "operation": "CREATE", "payload_json": {}},
                create_product_event(&Uuid::new_v4().to_string(), &Uuid::new_v4().to_string())
            ]
        });

        let res: Value = server.post("/api/sync/push").json(&body).await.json();
        let results = res["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["status"], "invalid");
        assert_eq!(results[1]["status"], "applied");
    }

    #[tokio::test]
    async fn stock_conflict_surfaces_in_conflict_listing() {
        let server = test_server().await;
        let product_id = Uuid::new_v4().to_string();

        server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-1",
                "events": [{
                    "event_id": Uuid::new_v4().to_string(),
                    "entity_type": "product",
                    "entity_id": product_id,
                    "operation": "CREATE",
                    "payload_json": {"name": "A", "stock_qty": 5, "version": 2}
                }]
            }))
            .await
            .assert_status_ok();

        let res: Value = server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-2",
                "events": [{
                    "event_id": Uuid::new_v4().to_string(),
                    "entity_type": "product",
                    "entity_id": product_id,
                    "operation": "UPDATE",
                    "payload_json": {"name": "A", "stock_qty": 10, "version": 1}
                }]
            }))
            .await
            .json();
        assert_eq!(res["results"][0]["status"], "conflict");

        let conflicts: Value = server
            .get("/api/sync/conflicts")
            .add_query_param("resolved", "false")
            .await
            .json();
        let list = conflicts.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["conflict_type"], "stock_qty_conflict");

        let status: Value = server.get("/api/sync/status").await.json();
        assert_eq!(status["unresolved_conflicts"], 1);
        assert_eq!(status["needs_review_products"], 1);

        // Resolving clears the triage queue
        let id = list[0]["id"].as_i64().unwrap();
        server
            .post(&format!("/api/sync/conflicts/{id}/resolve"))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        let status: Value = server.get("/api/sync/status").await.json();
        assert_eq!(status["unresolved_conflicts"], 0);
    }

    #[tokio::test]
    async fn pull_watermark_round_trip() {
        let server = test_server().await;

        server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-1",
                "events": [create_product_event(
                    &Uuid::new_v4().to_string(),
                    &Uuid::new_v4().to_string()
                )]
            }))
            .await
            .assert_status_ok();

        // Epoch watermark returns everything
        let all: Value = server
            .get("/api/sync/pull")
            .add_query_param("since", "1970-01-01T00:00:00Z")
            .await
            .json();
        assert_eq!(all["products"].as_array().unwrap().len(), 1);
        let watermark = all["server_time"].as_str().unwrap().to_string();

        // Push one more product after the watermark was taken
        let new_product_id = Uuid::new_v4().to_string();
        server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-1",
                "events": [create_product_event(&Uuid::new_v4().to_string(), &new_product_id)]
            }))
            .await
            .assert_status_ok();

        // Pulling with the stored watermark returns exactly the new record
        let delta: Value = server
            .get("/api/sync/pull")
            .add_query_param("since", &watermark)
            .await
            .json();
        let products = delta["products"].as_array().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0]["id"], json!(new_product_id));
    }

    #[tokio::test]
    async fn malformed_since_is_bad_request() {
        let server = test_server().await;
        let res = server
            .get("/api/sync/pull")
            .add_query_param("since", "not-a-timestamp")
            .await;
        res.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn expense_update_is_ignored_end_to_end() {
        let server = test_server().await;
        let expense_id = Uuid::new_v4().to_string();

        server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-1",
                "events": [{
                    "event_id": Uuid::new_v4().to_string(),
                    "entity_type": "expense",
                    "entity_id": expense_id,
                    "operation": "CREATE",
                    "payload_json": {"category": "rent", "amount": "300000"}
                }]
            }))
            .await
            .assert_status_ok();

        let res: Value = server
            .post("/api/sync/push")
            .json(&json!({
                "device_id": "device-1",
                "events": [{
                    "event_id": Uuid::new_v4().to_string(),
                    "entity_type": "expense",
                    "entity_id": expense_id,
                    "operation": "UPDATE",
                    "payload_json": {"amount": "1000"}
                }]
            }))
            .await
            .json();
        assert_eq!(res["results"][0]["status"], "ignored");

        let status: Value = server.get("/api/sync/status").await.json();
        assert_eq!(status["expenses"], 1);

        let conflicts: Value = server.get("/api/sync/conflicts").await.json();
        assert_eq!(conflicts.as_array().unwrap().len(), 1);
        assert_eq!(conflicts[0]["conflict_type"], "append_only");
    }
}
