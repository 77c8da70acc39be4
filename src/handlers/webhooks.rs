//! Payment-gateway webhook intake.
//!
//! The contract with the gateway is "acknowledge fast, always". Whatever the
//! request looks like, this endpoint answers 200 and hands any plausible
//! payment notification to the orchestrator in a background task. Returning
//! an error here would only trigger gateway retry storms; the ledger and the
//! delivery lock already make reprocessing safe.

use crate::AppState;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    /// `data.id` query parameter, the gateway's redundant copy of the
    /// payment id.
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub topic: Option<String>,
}

/// Verifies the gateway's `x-signature` header against the shared secret.
///
/// The header carries `ts=<unix>,v1=<hex hmac>`; the HMAC-SHA256 input is the
/// manifest `id:<data_id>;request-id:<x-request-id>;ts:<ts>;` with the data
/// id lower-cased. Any malformed input verifies as false.
pub(crate) fn verify_signature(
    secret: &str,
    x_signature: &str,
    request_id: &str,
    data_id: &str,
) -> bool {
    let mut ts = None;
    let mut v1 = None;
    for part in x_signature.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next().map(str::trim), kv.next().map(str::trim)) {
            (Some("ts"), Some(value)) => ts = Some(value),
            (Some("v1"), Some(value)) => v1 = Some(value),
            _ => {}
        }
    }
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return false;
    };
    let Ok(expected) = hex::decode(v1) else {
        return false;
    };

    let manifest = format!(
        "id:{};request-id:{};ts:{};",
        data_id.to_lowercase(),
        request_id,
        ts
    );

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(manifest.as_bytes());
    // verify_slice is a constant-time comparison
    mac.verify_slice(&expected).is_ok()
}

fn extract_data_id(payload: &Value, query: &WebhookQuery) -> Option<String> {
    payload
        .pointer("/data/id")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .or_else(|| query.data_id.clone())
        .or_else(|| query.id.clone())
}

pub async fn mercado_pago_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let topic = payload
        .get("type")
        .and_then(Value::as_str)
        .or(query.kind.as_deref())
        .or(query.topic.as_deref())
        .unwrap_or("")
        .to_string();
    let data_id = extract_data_id(&payload, &query);

    if let Some(secret) = &state.config.mp_webhook_secret {
        let signature = headers
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let id_for_manifest = data_id.as_deref().unwrap_or("");
        if !verify_signature(secret, signature, request_id, id_for_manifest) {
            warn!(topic, "webhook signature rejected, discarding notification");
            return StatusCode::OK;
        }
    }

    if topic != "payment" {
        debug!(topic, "ignoring non-payment webhook");
        return StatusCode::OK;
    }

    let Some(payment_id) = data_id else {
        debug!("payment webhook without a payment id, ignoring");
        return StatusCode::OK;
    };

    info!(payment_id = %payment_id, "payment notification accepted");
    let orders = Arc::clone(&state.orders);
    tokio::spawn(async move {
        orders.process_payment(&payment_id).await;
    });

    StatusCode::OK
}
