use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerError, IsTransient};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway timed out")]
    Timeout,

    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected payment gateway response: {0}")]
    InvalidResponse(String),

    #[error("payment gateway circuit is open")]
    CircuitOpen,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Timeout => ErrorKind::External { timeout: true },
            _ => ErrorKind::External { timeout: false },
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_connect() || e.is_request() {
            GatewayError::Unavailable(e.to_string())
        } else {
            GatewayError::InvalidResponse(e.to_string())
        }
    }
}

impl IsTransient for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout | GatewayError::Unavailable(_) | GatewayError::CircuitOpen
        )
    }
}

impl From<CircuitBreakerError<GatewayError>> for GatewayError {
    fn from(e: CircuitBreakerError<GatewayError>) -> Self {
        match e {
            CircuitBreakerError::CircuitOpen(_) => GatewayError::CircuitOpen,
            CircuitBreakerError::OperationFailed(e) => e,
        }
    }
}

/// Everything the gateway needs to open a hosted checkout.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub customer_address: String,
    pub customer_city: String,
    pub customer_postcode: String,
    pub item_count: usize,
    pub ipn_url: String,
    pub success_url: String,
    pub fail_url: String,
    pub cancel_url: String,
}

/// Gateway-side record of a transaction, from the query API.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayTransaction {
    pub transaction_id: String,
    pub status: String,
    pub amount: Decimal,
    pub validation_id: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a hosted checkout session; returns the buyer redirect url.
    async fn open_session(&self, request: &SessionRequest) -> Result<String, GatewayError>;

    /// Look up what the gateway recorded for a merchant transaction id.
    async fn query_transaction(&self, transaction_id: &str) -> Result<Option<GatewayTransaction>, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    status: String,
    #[serde(default, rename = "failedreason")]
    failed_reason: Option<String>,
    #[serde(default, rename = "GatewayPageURL")]
    gateway_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(rename = "APIConnect")]
    api_connect: String,
    #[serde(default)]
    element: Vec<QueryElement>,
}

#[derive(Debug, Deserialize)]
struct QueryElement {
    tran_id: String,
    status: String,
    amount: String,
    #[serde(default)]
    val_id: Option<String>,
}

/// Hosted-checkout gateway over HTTP.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig, metrics: Arc<Metrics>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(GatewayError::from_reqwest)?;
        let breaker = CircuitBreaker::new("gateway", config.breaker.to_breaker_config());

        Ok(Self { client, config, breaker, metrics })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn guarded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let result = self.breaker.call(|e: &GatewayError| e.is_transient(), call).await;
        self.metrics
            .update_circuit_breaker_state(self.breaker.name(), self.breaker.state().await);
        result.map_err(GatewayError::from)
    }

    async fn post_session(&self, request: &SessionRequest) -> Result<String, GatewayError> {
        let amount = request.amount.round_dp(2).to_string();
        let item_count = request.item_count.to_string();
        let params = [
            ("store_id", self.config.store_id.as_str()),
            ("store_passwd", self.config.store_password.as_str()),
            ("total_amount", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("tran_id", request.transaction_id.as_str()),
            ("success_url", request.success_url.as_str()),
            ("fail_url", request.fail_url.as_str()),
            ("cancel_url", request.cancel_url.as_str()),
            ("ipn_url", request.ipn_url.as_str()),
            ("cus_name", request.customer_name.as_str()),
            ("cus_email", request.customer_email.as_str()),
            ("cus_phone", request.customer_phone.as_str()),
            ("cus_add1", request.customer_address.as_str()),
            ("cus_city", request.customer_city.as_str()),
            ("cus_postcode", request.customer_postcode.as_str()),
            ("cus_country", "Bangladesh"),
            ("shipping_method", "Courier"),
            ("num_of_item", item_count.as_str()),
            ("product_name", "Marketplace order"),
            ("product_category", "General"),
            ("product_profile", "physical-goods"),
        ];

        let response = self
            .client
            .post(self.endpoint("gwprocess/v4/api.php"))
            .form(&params)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        if response.status().is_server_error() {
            return Err(GatewayError::Unavailable(format!("HTTP {}", response.status())));
        }

        let body: SessionResponse = response.json().await.map_err(GatewayError::from_reqwest)?;
        match (body.status.as_str(), body.gateway_page_url) {
            ("SUCCESS", Some(url)) if !url.is_empty() => Ok(url),
            _ => Err(GatewayError::Rejected(
                body.failed_reason.unwrap_or_else(|| body.status.clone()),
            )),
        }
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<GatewayTransaction>, GatewayError> {
        let response = self
            .client
            .get(self.endpoint("validator/api/merchantTransIDvalidationAPI.php"))
            .query(&[
                ("tran_id", transaction_id),
                ("store_id", self.config.store_id.as_str()),
                ("store_passwd", self.config.store_password.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        if response.status().is_server_error() {
            return Err(GatewayError::Unavailable(format!("HTTP {}", response.status())));
        }

        let body: QueryResponse = response.json().await.map_err(GatewayError::from_reqwest)?;
        if body.api_connect != "DONE" {
            return Err(GatewayError::Rejected(format!("query refused: {}", body.api_connect)));
        }

        // A transaction can have several attempts; a validated one wins.
        let best = body
            .element
            .into_iter()
            .filter(|e| e.tran_id == transaction_id)
            .max_by_key(|e| matches!(e.status.as_str(), "VALID" | "VALIDATED"));

        best.map(|e| -> Result<GatewayTransaction, GatewayError> {
            let amount = e
                .amount
                .parse::<Decimal>()
                .map_err(|_| GatewayError::InvalidResponse(format!("amount {}", e.amount)))?;
            Ok(GatewayTransaction {
                transaction_id: e.tran_id,
                status: e.status,
                amount,
                validation_id: e.val_id,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn open_session(&self, request: &SessionRequest) -> Result<String, GatewayError> {
        debug!(transaction_id = %request.transaction_id, amount = %request.amount, "Opening gateway session");
        let result = self.guarded(self.post_session(request)).await;
        if let Err(e) = &result {
            warn!(transaction_id = %request.transaction_id, error = %e, "Gateway session failed");
        }
        result
    }

    async fn query_transaction(&self, transaction_id: &str) -> Result<Option<GatewayTransaction>, GatewayError> {
        self.guarded(self.get_transaction(transaction_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_dependency_faults_are_transient() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::CircuitOpen.is_transient());
        assert!(!GatewayError::Rejected("invalid store".into()).is_transient());
    }

    #[test]
    fn test_timeout_kind_is_distinct() {
        assert_eq!(GatewayError::Timeout.kind(), ErrorKind::External { timeout: true });
        assert_eq!(GatewayError::CircuitOpen.kind(), ErrorKind::External { timeout: false });
    }

    #[test]
    fn test_session_response_shape() {
        let body: SessionResponse = serde_json::from_str(
            r#"{"status":"SUCCESS","failedreason":"","GatewayPageURL":"https://pay.example/checkout/abc"}"#,
        )
        .unwrap();
        assert_eq!(body.gateway_page_url.as_deref(), Some("https://pay.example/checkout/abc"));
    }
}
