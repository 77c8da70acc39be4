use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

/// Result of a grant call. `success` follows the game API's truthy
/// indicator; `raw` keeps the full payload for the manual-intervention
/// message when the grant fails.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub raw: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Grants `coins` to `nick` in game. The orchestrator guarantees this is
    /// called at most once per order.
    async fn grant(
        &self,
        nick: &str,
        coins: i32,
        order_id: &str,
    ) -> Result<DeliveryOutcome, ServiceError>;
}

/// HTTP client for the game's credit-grant endpoint.
pub struct GameApiClient {
    http: reqwest::Client,
    api_url: String,
    api_token: String,
}

impl GameApiClient {
    pub fn new(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {e}")))?;

        Ok(Self {
            http,
            api_url: cfg.delivery_api_url.clone(),
            api_token: cfg.delivery_api_token.clone(),
        })
    }
}

#[async_trait]
impl DeliveryClient for GameApiClient {
    #[instrument(skip(self))]
    async fn grant(
        &self,
        nick: &str,
        coins: i32,
        order_id: &str,
    ) -> Result<DeliveryOutcome, ServiceError> {
        if coins <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "coin quantity must be a positive integer, got {coins}"
            )));
        }
        if nick.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "delivery nickname is empty".to_string(),
            ));
        }

        // Token travels only in the query string; keep it out of the logs.
        info!(nick, coins, order_id, "calling game delivery API");

        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("token", self.api_token.as_str()),
                ("player", nick),
                ("coins", &coins.to_string()),
                ("orderId", order_id),
            ])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("delivery call: {e}")))?;

        let status = response.status();
        let raw: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => Value::String(format!("unparseable delivery response: {e}")),
        };

        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "delivery API returned {status}: {raw}"
            )));
        }

        let success = raw.get("ok").and_then(Value::as_bool).unwrap_or(false)
            || raw.get("success").and_then(Value::as_bool).unwrap_or(false);

        info!(order_id, success, "game delivery API responded");
        Ok(DeliveryOutcome { success, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[tokio::test]
    async fn non_positive_quantity_is_rejected_before_any_call() {
        let client = GameApiClient::new(&test_config()).expect("client built");
        for coins in [0, -5] {
            let err = client
                .grant("Steve", coins, "ORD-1-1")
                .await
                .expect_err("must fail");
            assert!(matches!(err, ServiceError::ValidationError(_)));
        }
    }

    #[tokio::test]
    async fn empty_nick_is_rejected_before_any_call() {
        let client = GameApiClient::new(&test_config()).expect("client built");
        let err = client
            .grant("  ", 10, "ORD-1-1")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
