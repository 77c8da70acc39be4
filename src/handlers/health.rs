use crate::{db, AppState};
use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

/// Liveness endpoint with a database ping.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match db::check_connection(&state.db).await {
        Ok(()) => "up",
        Err(_) => "down",
    };

    Json(json!({
        "status": "ok",
        "database": database,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
