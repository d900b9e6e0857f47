use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CourierConfig;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, IsTransient};

use super::CourierError;

/// Consignment handed to the courier for one sub-order.
#[derive(Debug, Clone, Serialize)]
pub struct ParcelRequest {
    /// Merchant-side reference; the courier refuses a second parcel with the same one.
    pub invoice: String,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub recipient_address: String,
    pub cod_amount: Decimal,
    pub weight_kg: Decimal,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParcelReceipt {
    pub parcel_id: String,
    pub tracking_code: String,
}

#[async_trait]
pub trait CourierClient: Send + Sync {
    /// Name stored on the sub-order next to the parcel id.
    fn name(&self) -> &str;

    /// Book a parcel. Not idempotent on the courier side.
    async fn create_parcel(&self, request: &ParcelRequest) -> Result<ParcelReceipt, CourierError>;

    /// Raw delivery status word for a tracking code.
    async fn delivery_status(&self, tracking_code: &str) -> Result<String, CourierError>;
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    status: u16,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    consignment: Option<Consignment>,
}

#[derive(Debug, Deserialize)]
struct Consignment {
    consignment_id: serde_json::Value,
    tracking_code: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: u16,
    #[serde(default)]
    delivery_status: Option<String>,
}

/// Courier REST API client (api-key / secret-key headers).
pub struct HttpCourier {
    client: reqwest::Client,
    config: CourierConfig,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
}

impl HttpCourier {
    pub fn new(config: CourierConfig, metrics: Arc<Metrics>) -> Result<Self, CourierError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(CourierError::from_reqwest)?;
        let breaker = CircuitBreaker::new("courier", config.breaker.to_breaker_config());

        Ok(Self { client, config, breaker, metrics })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl std::future::Future<Output = Result<T, CourierError>>,
    ) -> Result<T, CourierError> {
        let started = Instant::now();
        let result = self
            .breaker
            .call(|e: &CourierError| e.is_transient(), call)
            .await
            .map_err(CourierError::from);

        self.metrics
            .record_courier_call(operation, started.elapsed().as_secs_f64(), result.is_ok());
        self.metrics
            .update_circuit_breaker_state(self.breaker.name(), self.breaker.state().await);
        result
    }

    async fn post_order(&self, request: &ParcelRequest) -> Result<ParcelReceipt, CourierError> {
        let response = self
            .client
            .post(self.endpoint("create_order"))
            .header("Api-Key", &self.config.api_key)
            .header("Secret-Key", &self.config.secret_key)
            .json(request)
            .send()
            .await
            .map_err(CourierError::from_reqwest)?;

        if response.status().is_server_error() {
            return Err(CourierError::Unavailable(format!("HTTP {}", response.status())));
        }

        let body: CreateOrderResponse = response.json().await.map_err(CourierError::from_reqwest)?;
        match body.consignment {
            Some(c) if body.status == 200 => {
                // The courier sends the id as a number
                let parcel_id = match c.consignment_id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(ParcelReceipt { parcel_id, tracking_code: c.tracking_code })
            }
            _ => Err(CourierError::Rejected(
                body.message.unwrap_or_else(|| format!("status {}", body.status)),
            )),
        }
    }

    async fn get_status(&self, tracking_code: &str) -> Result<String, CourierError> {
        let response = self
            .client
            .get(self.endpoint(&format!("status_by_trackingcode/{}", tracking_code)))
            .header("Api-Key", &self.config.api_key)
            .header("Secret-Key", &self.config.secret_key)
            .send()
            .await
            .map_err(CourierError::from_reqwest)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CourierError::UnknownParcel(tracking_code.to_string()));
        }
        if response.status().is_server_error() {
            return Err(CourierError::Unavailable(format!("HTTP {}", response.status())));
        }

        let body: StatusResponse = response.json().await.map_err(CourierError::from_reqwest)?;
        match body.delivery_status {
            Some(status) if body.status == 200 => Ok(status),
            _ => Err(CourierError::InvalidResponse(format!("status {}", body.status))),
        }
    }
}

#[async_trait]
impl CourierClient for HttpCourier {
    fn name(&self) -> &str {
        "steadfast"
    }

    async fn create_parcel(&self, request: &ParcelRequest) -> Result<ParcelReceipt, CourierError> {
        debug!(invoice = %request.invoice, cod_amount = %request.cod_amount, "Creating courier parcel");
        let result = self.guarded("create_parcel", self.post_order(request)).await;
        if let Err(e) = &result {
            warn!(invoice = %request.invoice, error = %e, "Courier parcel creation failed");
        }
        result
    }

    async fn delivery_status(&self, tracking_code: &str) -> Result<String, CourierError> {
        self.guarded("delivery_status", self.get_status(tracking_code)).await
    }
}
