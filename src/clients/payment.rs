use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Request to open a charge with the payment gateway.
#[derive(Debug, Clone)]
pub struct OpenCharge {
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub payer_email: String,
    /// Round-trips verbatim: `get_payment` for the resulting charge reports
    /// exactly this value back as `external_reference`.
    pub external_reference: String,
}

/// An opened charge: gateway-side id plus the customer-facing pay link.
#[derive(Debug, Clone)]
pub struct Charge {
    pub preference_id: String,
    pub pay_link: String,
}

/// Authoritative payment state fetched by id.
#[derive(Debug, Clone)]
pub struct Payment {
    pub status: String,
    pub external_reference: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a charge and returns the pay link.
    async fn open_charge(&self, request: OpenCharge) -> Result<Charge, ServiceError>;

    /// Fetches the authoritative status of a payment. `Ok(None)` means the
    /// gateway does not know the id (stale or malformed webhook) and is a
    /// benign outcome, not an error.
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, ServiceError>;
}

/// Mercado Pago Checkout Pro client.
pub struct MercadoPagoGateway {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    notification_url: Option<String>,
}

impl MercadoPagoGateway {
    pub fn new(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: cfg.mp_base_url.trim_end_matches('/').to_string(),
            access_token: cfg.mp_access_token.clone(),
            notification_url: cfg.mp_notification_url.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    #[instrument(skip(self, request), fields(external_reference = %request.external_reference))]
    async fn open_charge(&self, request: OpenCharge) -> Result<Charge, ServiceError> {
        let mut body = json!({
            "items": [{
                "title": request.title,
                "description": request.description,
                "quantity": 1,
                "unit_price": request.amount.to_f64().unwrap_or_default(),
                "currency_id": "BRL",
            }],
            "payer": { "email": request.payer_email },
            "external_reference": request.external_reference,
            "metadata": { "order_id": request.external_reference },
        });
        if let Some(url) = &self.notification_url {
            body["notification_url"] = json!(url);
        }

        let response = self
            .http
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("open charge: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("open charge body: {e}")))?;

        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway rejected charge creation ({status}): {payload}"
            )));
        }

        let preference_id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let pay_link = payload
            .get("init_point")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if pay_link.is_empty() {
            return Err(ServiceError::ExternalServiceError(
                "gateway returned no pay link (init_point)".to_string(),
            ));
        }

        debug!(preference_id = %preference_id, "charge opened");
        Ok(Charge {
            preference_id,
            pay_link,
        })
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, ServiceError> {
        let response = self
            .http
            .get(format!("{}/v1/payments/{}", self.base_url, payment_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("get payment: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!(payment_id, "gateway does not know this payment id");
            return Ok(None);
        }

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("get payment body: {e}")))?;

        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway payment lookup failed ({status}): {payload}"
            )));
        }

        Ok(Some(Payment {
            status: payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            external_reference: payload
                .get("external_reference")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }))
    }
}
