use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{FrontendConfig, GatewayConfig};
use crate::domain::order::{
    Order, OrderCommand, OrderCommandHandler, OrderError, PaymentMethod, PaymentStatus,
};
use crate::metrics::Metrics;
use crate::store::{CallbackReceipt, CallbackSource};

use super::callback::{
    new_transaction_id, validate_callback, CallbackForm, CallbackVerdict, GatewayVerdict, VerifiedCallback,
};
use super::gateway::{PaymentGateway, SessionRequest};
use super::signature::SignatureVerifier;
use super::PaymentError;

// ============================================================================
// Payment Service
// ============================================================================
//
// initiate → gateway session → buyer pays → IPN and browser redirect race in.
//
// Both callback paths go through the same compare-and-set command, so
// whichever lands first moves the payment and the other one is a no-op.
//
// ============================================================================

const VERIFYING_MESSAGE: &str =
    "Your payment is being verified. We will update your order as soon as the gateway confirms it.";

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub order_id: Uuid,
    pub transaction_id: String,
    pub redirect_url: String,
}

/// Result of an IPN delivery. Every variant except `Rejected` is answered
/// with 200 so the gateway stops retrying.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpnOutcome {
    Applied { order_id: Uuid, payment_status: PaymentStatus },
    AlreadySettled { order_id: Uuid, payment_status: PaymentStatus },
    Ignored { reason: String },
    Rejected { reason: String },
}

impl IpnOutcome {
    fn label(&self) -> &'static str {
        match self {
            IpnOutcome::Applied { .. } => "applied",
            IpnOutcome::AlreadySettled { .. } => "already_settled",
            IpnOutcome::Ignored { .. } => "ignored",
            IpnOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Where a browser callback sends the buyer.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentRedirect {
    Success { transaction_id: String },
    Failure { transaction_id: Option<String>, message: String },
}

impl PaymentRedirect {
    fn failure(transaction_id: &str, message: impl Into<String>) -> Self {
        PaymentRedirect::Failure {
            transaction_id: Some(transaction_id.to_string()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentUrls {
    callback_base: String,
    success_page: String,
    fail_page: String,
}

impl PaymentUrls {
    pub fn new(gateway: &GatewayConfig, frontend: &FrontendConfig) -> Self {
        Self {
            callback_base: gateway.callback_base_url.trim_end_matches('/').to_string(),
            success_page: frontend.success_url.clone(),
            fail_page: frontend.fail_url.clone(),
        }
    }

    fn callback(&self, kind: &str, transaction_id: &str) -> String {
        format!("{}/api/payments/{}/{}", self.callback_base, kind, transaction_id)
    }

    fn ipn(&self) -> String {
        format!("{}/api/payments/ipn", self.callback_base)
    }

    /// Buyer-facing page for a redirect, with its query parameters.
    pub fn location(&self, redirect: &PaymentRedirect) -> String {
        let (page, params): (&str, Vec<(&str, &str)>) = match redirect {
            PaymentRedirect::Success { transaction_id } => {
                (self.success_page.as_str(), vec![("tran_id", transaction_id.as_str())])
            }
            PaymentRedirect::Failure { transaction_id, message } => {
                let mut params = vec![("message", message.as_str())];
                if let Some(tran_id) = transaction_id {
                    params.push(("tran_id", tran_id.as_str()));
                }
                (self.fail_page.as_str(), params)
            }
        };

        match Url::parse_with_params(page, &params) {
            Ok(url) => url.to_string(),
            Err(e) => {
                error!(page, error = %e, "Configured frontend url is invalid");
                page.to_string()
            }
        }
    }
}

pub struct PaymentService {
    orders: Arc<OrderCommandHandler>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
    urls: PaymentUrls,
    currency: String,
    metrics: Arc<Metrics>,
}

impl PaymentService {
    pub fn new(
        orders: Arc<OrderCommandHandler>,
        gateway: Arc<dyn PaymentGateway>,
        gateway_config: &GatewayConfig,
        frontend: &FrontendConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders,
            gateway,
            verifier: SignatureVerifier::new(&gateway_config.store_password),
            urls: PaymentUrls::new(gateway_config, frontend),
            currency: gateway_config.currency.clone(),
            metrics,
        }
    }

    pub fn urls(&self) -> &PaymentUrls {
        &self.urls
    }

    /// Open (or reopen) a gateway session and return the buyer redirect url.
    pub async fn initiate(&self, order_id: Uuid) -> Result<InitiatedPayment, PaymentError> {
        let order = self.orders.load(order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            return Err(OrderError::AlreadyPaid.into());
        }
        if order.payment_method != PaymentMethod::Online {
            return Err(OrderError::PaymentMethodMismatch.into());
        }

        // Reopening after a failed attempt takes a fresh id; an open session keeps its own
        let command = OrderCommand::OpenPaymentSession { transaction_id: new_transaction_id() };
        let outcome = self.orders.handle(order_id, &command, "buyer").await?;
        let order = outcome.order;
        let Some(transaction_id) = order.transaction_id.clone() else {
            return Err(PaymentError::Internal(format!("order {} has no transaction id", order_id)));
        };

        let request = self.session_request(&order, &transaction_id);
        let redirect_url = self.gateway.open_session(&request).await.map_err(|e| {
            error!(
                order_id = %order_id,
                transaction_id = %transaction_id,
                at = %Utc::now(),
                error = %e,
                "Payment initiation failed"
            );
            e
        })?;

        info!(order_id = %order_id, transaction_id = %transaction_id, amount = %order.total_amount, "Payment initiated");
        Ok(InitiatedPayment { order_id, transaction_id, redirect_url })
    }

    fn session_request(&self, order: &Order, transaction_id: &str) -> SessionRequest {
        SessionRequest {
            transaction_id: transaction_id.to_string(),
            amount: order.total_amount,
            currency: self.currency.clone(),
            customer_name: order.shipping.name.clone(),
            customer_email: order.shipping.email.clone(),
            customer_phone: order.shipping.phone.clone(),
            customer_address: order.shipping.address.clone(),
            customer_city: order.shipping.city.clone(),
            customer_postcode: order.shipping.postal_code.clone().unwrap_or_default(),
            item_count: order.sub_orders.iter().map(|s| s.lines.len()).sum(),
            ipn_url: self.urls.ipn(),
            success_url: self.urls.callback("success", transaction_id),
            fail_url: self.urls.callback("fail", transaction_id),
            cancel_url: self.urls.callback("cancel", transaction_id),
        }
    }

    async fn record(&self, source: CallbackSource, transaction_id: &str, verdict: &str, signature: Option<String>, processed: bool) {
        let receipt = CallbackReceipt {
            id: Uuid::new_v4(),
            transaction_id: transaction_id.to_string(),
            source,
            verdict: verdict.to_string(),
            signature,
            received_at: Utc::now(),
            processed,
        };
        if let Err(e) = self.orders.store().record_callback(&receipt).await {
            warn!(transaction_id, source = source.as_str(), error = %e, "Failed to record callback receipt");
        }
    }

    /// Apply a settlement to the order carrying `transaction_id`.
    ///
    /// Returns the order afterwards and whether this call moved it.
    async fn settle(
        &self,
        order: &Order,
        transaction_id: &str,
        outcome: PaymentStatus,
        reference: Option<String>,
        actor: &str,
    ) -> Result<(Order, bool), PaymentError> {
        let command = OrderCommand::SettlePayment {
            transaction_id: transaction_id.to_string(),
            outcome,
            reference,
        };
        let result = self.orders.handle(order.id, &command, actor).await?;
        let changed = result.changed();
        if changed {
            self.metrics.record_payment_transition(outcome.as_str());
            info!(
                order_id = %order.id,
                transaction_id,
                payment_status = %result.order.payment_status,
                order_status = %result.order.status,
                source = actor,
                "Payment settled"
            );
        }
        Ok((result.order, changed))
    }

    fn amount_matches(order: &Order, callback: &VerifiedCallback) -> bool {
        callback.amount == Some(order.total_amount)
    }

    /// Server-to-server notification. Idempotent: repeats and late arrivals
    /// are acknowledged without side effects.
    pub async fn handle_ipn(&self, form: &CallbackForm) -> Result<IpnOutcome, PaymentError> {
        let verdict = validate_callback(form, &self.verifier);
        let outcome = self.apply_ipn(&verdict).await;

        let label = match &outcome {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        self.metrics.record_callback(CallbackSource::Ipn.as_str(), label);

        if let Some(tran_id) = verdict.transaction_id() {
            let processed = matches!(outcome, Ok(IpnOutcome::Applied { .. }));
            let signature = form.get("verify_sign").cloned();
            self.record(CallbackSource::Ipn, tran_id, verdict.label(), signature, processed).await;
        }
        outcome
    }

    async fn apply_ipn(&self, verdict: &CallbackVerdict) -> Result<IpnOutcome, PaymentError> {
        let (callback, outcome) = match verdict {
            CallbackVerdict::Malformed { transaction_id, reason } => {
                warn!(transaction_id = ?transaction_id, reason = %reason, "Rejected malformed IPN");
                return Ok(IpnOutcome::Rejected { reason: reason.clone() });
            }
            CallbackVerdict::Succeeded(cb) => (cb, PaymentStatus::Paid),
            CallbackVerdict::Failed(cb, status) => (cb, *status),
        };

        let Some(order) = self.orders.store().find_by_transaction(&callback.transaction_id).await? else {
            warn!(transaction_id = %callback.transaction_id, "IPN for unknown transaction");
            return Ok(IpnOutcome::Ignored { reason: "unknown transaction".to_string() });
        };

        if outcome == PaymentStatus::Paid && !Self::amount_matches(&order, callback) {
            warn!(
                order_id = %order.id,
                transaction_id = %callback.transaction_id,
                expected = %order.total_amount,
                reported = ?callback.amount,
                "IPN amount mismatch"
            );
            return Ok(IpnOutcome::Rejected { reason: "amount mismatch".to_string() });
        }

        let (order, changed) = self
            .settle(&order, &callback.transaction_id, outcome, callback.reference(), "gateway-ipn")
            .await?;

        Ok(if changed {
            IpnOutcome::Applied { order_id: order.id, payment_status: order.payment_status }
        } else {
            IpnOutcome::AlreadySettled { order_id: order.id, payment_status: order.payment_status }
        })
    }

    /// Browser redirect after a successful checkout.
    ///
    /// Paid is only applied from a verified payload: the signed form posted
    /// with the redirect, or the gateway's own record of the transaction.
    pub async fn handle_success(&self, transaction_id: &str, form: &CallbackForm) -> PaymentRedirect {
        let redirect = match self.apply_success(transaction_id, form).await {
            Ok(redirect) => redirect,
            Err(e) => {
                error!(transaction_id, at = %Utc::now(), error = %e, "Success redirect could not be applied");
                PaymentRedirect::failure(transaction_id, VERIFYING_MESSAGE)
            }
        };
        let outcome = if matches!(redirect, PaymentRedirect::Success { .. }) { "success" } else { "failure" };
        self.metrics.record_callback(CallbackSource::Success.as_str(), outcome);
        redirect
    }

    async fn apply_success(&self, transaction_id: &str, form: &CallbackForm) -> Result<PaymentRedirect, PaymentError> {
        let Some(order) = self.orders.store().find_by_transaction(transaction_id).await? else {
            warn!(transaction_id, "Success redirect for unknown transaction");
            return Ok(PaymentRedirect::failure(transaction_id, "We could not find this transaction."));
        };
        if order.payment_status == PaymentStatus::Paid {
            self.record(CallbackSource::Success, transaction_id, "already_paid", None, false).await;
            return Ok(PaymentRedirect::Success { transaction_id: transaction_id.to_string() });
        }

        // Signed form first, then the gateway's record
        let signed = match validate_callback(form, &self.verifier) {
            CallbackVerdict::Succeeded(cb)
                if cb.transaction_id == transaction_id && Self::amount_matches(&order, &cb) =>
            {
                Some(cb)
            }
            _ => None,
        };

        let (verdict, reference, signature) = match signed {
            Some(cb) => (Some(GatewayVerdict::Succeeded), cb.reference(), Some(cb.signature)),
            None => match self.gateway.query_transaction(transaction_id).await {
                Ok(Some(tx)) => {
                    let verdict = GatewayVerdict::from_status(&tx.status)
                        .filter(|v| *v != GatewayVerdict::Succeeded || tx.amount == order.total_amount);
                    (verdict, tx.validation_id, None)
                }
                Ok(None) => (None, None, None),
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        transaction_id,
                        at = %Utc::now(),
                        error = %e,
                        "Could not verify payment with gateway"
                    );
                    (None, None, None)
                }
            },
        };

        match verdict {
            Some(GatewayVerdict::Succeeded) => {
                let (order, changed) = self
                    .settle(&order, transaction_id, PaymentStatus::Paid, reference, "gateway-redirect")
                    .await?;
                self.record(CallbackSource::Success, transaction_id, "succeeded", signature, changed).await;
                if order.payment_status == PaymentStatus::Paid {
                    Ok(PaymentRedirect::Success { transaction_id: transaction_id.to_string() })
                } else {
                    Ok(PaymentRedirect::failure(transaction_id, VERIFYING_MESSAGE))
                }
            }
            Some(failure) => {
                let (_, changed) = self
                    .settle(&order, transaction_id, failure.payment_status(), reference, "gateway-redirect")
                    .await?;
                self.record(CallbackSource::Success, transaction_id, "gateway_reports_failure", signature, changed)
                    .await;
                Ok(PaymentRedirect::failure(transaction_id, "Payment was not completed."))
            }
            None => {
                self.record(CallbackSource::Success, transaction_id, "unverified", None, false).await;
                Ok(PaymentRedirect::failure(transaction_id, VERIFYING_MESSAGE))
            }
        }
    }

    /// Browser redirect after a failed checkout.
    pub async fn handle_fail(&self, transaction_id: &str) -> PaymentRedirect {
        self.handle_unsuccessful(transaction_id, CallbackSource::Fail, PaymentStatus::Failed, "Payment failed. Please try again.")
            .await
    }

    /// Browser redirect after the buyer abandoned checkout.
    pub async fn handle_cancel(&self, transaction_id: &str) -> PaymentRedirect {
        self.handle_unsuccessful(transaction_id, CallbackSource::Cancel, PaymentStatus::Cancelled, "Payment was cancelled.")
            .await
    }

    async fn handle_unsuccessful(
        &self,
        transaction_id: &str,
        source: CallbackSource,
        outcome: PaymentStatus,
        message: &str,
    ) -> PaymentRedirect {
        let redirect = match self.apply_unsuccessful(transaction_id, source, outcome, message).await {
            Ok(redirect) => redirect,
            Err(e) => {
                error!(transaction_id, source = source.as_str(), at = %Utc::now(), error = %e, "Redirect could not be applied");
                PaymentRedirect::failure(transaction_id, message)
            }
        };
        self.metrics.record_callback(source.as_str(), outcome.as_str());
        redirect
    }

    async fn apply_unsuccessful(
        &self,
        transaction_id: &str,
        source: CallbackSource,
        outcome: PaymentStatus,
        message: &str,
    ) -> Result<PaymentRedirect, PaymentError> {
        let Some(order) = self.orders.store().find_by_transaction(transaction_id).await? else {
            warn!(transaction_id, source = source.as_str(), "Redirect for unknown transaction");
            return Ok(PaymentRedirect::failure(transaction_id, "We could not find this transaction."));
        };

        let (order, changed) = self
            .settle(&order, transaction_id, outcome, None, "gateway-redirect")
            .await?;
        self.record(source, transaction_id, outcome.as_str(), None, changed).await;

        // The IPN may already have confirmed the money
        if order.payment_status == PaymentStatus::Paid {
            return Ok(PaymentRedirect::Success { transaction_id: transaction_id.to_string() });
        }
        Ok(PaymentRedirect::failure(transaction_id, message))
    }
}
