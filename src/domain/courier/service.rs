use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CourierConfig;
use crate::domain::order::{
    Order, OrderCommand, OrderCommandHandler, OrderError, OrderStatus, PaymentStatus, SubOrder, SubOrderStatus,
};
use crate::utils::{retry_on_transient, RetryConfig};

use super::client::{CourierClient, ParcelRequest};
use super::status::CourierState;
use super::CourierError;

// ============================================================================
// Courier Service
// ============================================================================
//
// createShipment:  claim → courier create_parcel → record (or release claim)
// releaseClaim:    clear a claim whose lease has run out
// syncTracking:    courier status → CourierState → forward-only sub-order move
// webhook:         same mapping, looked up by tracking code or parcel id
//
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreatedShipment {
    pub order_id: Uuid,
    pub sub_order_id: Uuid,
    pub courier: String,
    pub parcel_id: String,
    pub tracking_code: String,
    pub sub_order_status: SubOrderStatus,
    pub order_status: OrderStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingSync {
    pub order_id: Uuid,
    pub sub_order_id: Uuid,
    pub tracking_code: String,
    pub courier_status: String,
    pub state: CourierState,
    pub applied: bool,
    pub sub_order_status: SubOrderStatus,
    pub order_status: OrderStatus,
}

/// Status push from the courier.
#[derive(Debug, Clone, Deserialize)]
pub struct CourierPush {
    #[serde(default)]
    pub consignment_id: Option<serde_json::Value>,
    #[serde(default)]
    pub tracking_code: Option<String>,
    pub status: String,
}

impl CourierPush {
    fn parcel_id(&self) -> Option<String> {
        match &self.consignment_id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackingQuery {
    #[serde(default)]
    pub tracking_code: Option<String>,
    #[serde(default)]
    pub order_id: Option<Uuid>,
}

/// Buyer-safe view of an order's shipments.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingView {
    pub order_id: Uuid,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub city: String,
    pub shipments: Vec<ShipmentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShipmentView {
    pub sub_order_id: Uuid,
    pub status: SubOrderStatus,
    pub courier: Option<String>,
    pub tracking_code: Option<String>,
    /// Live courier status; absent when the courier could not be reached.
    pub courier_status: Option<String>,
    pub item_count: usize,
}

fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().collect();
    let keep = digits.len().min(4);
    let hidden = digits.len() - keep;
    std::iter::repeat('*')
        .take(hidden)
        .chain(digits[hidden..].iter().copied())
        .collect()
}

fn mask_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => std::iter::once(first).chain(chars.map(|_| '*')).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct CourierService {
    orders: Arc<OrderCommandHandler>,
    courier: Arc<dyn CourierClient>,
    retry: RetryConfig,
    webhook_token: Option<String>,
}

impl CourierService {
    pub fn new(orders: Arc<OrderCommandHandler>, courier: Arc<dyn CourierClient>, config: &CourierConfig) -> Self {
        Self {
            orders,
            courier,
            retry: RetryConfig::with_attempts(config.tracking_attempts),
            webhook_token: config.webhook_token.clone().filter(|t| !t.is_empty()),
        }
    }

    /// Whether a presented webhook token matches the configured one.
    /// Without a configured token every push is refused.
    pub fn accepts_webhook_token(&self, presented: Option<&str>) -> bool {
        match (&self.webhook_token, presented) {
            (Some(expected), Some(presented)) => expected.as_str() == presented,
            _ => false,
        }
    }

    fn parcel_request(order: &Order, sub: &SubOrder) -> ParcelRequest {
        let cod_amount = if order.payment_status == PaymentStatus::Paid {
            Decimal::ZERO
        } else {
            sub.payable_amount
        };
        let address = [Some(order.shipping.address.as_str()), order.shipping.area.as_deref(), Some(order.shipping.city.as_str())]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(", ");

        ParcelRequest {
            invoice: sub.id.to_string(),
            recipient_name: order.shipping.name.clone(),
            recipient_phone: order.shipping.phone.clone(),
            recipient_address: address,
            cod_amount,
            weight_kg: sub.total_weight_kg,
            note: Some(format!("Order {}", order.id)),
        }
    }

    /// Hand a Processing sub-order to the courier and mark it Shipped.
    ///
    /// A failed courier call or a failed write of the parcel releases the
    /// claim and leaves the sub-order where it was; the caller decides whether
    /// to try again.
    pub async fn create_shipment(&self, sub_order_id: Uuid, actor: &str) -> Result<CreatedShipment, CourierError> {
        let order_id = self.orders.order_id_for_sub_order(sub_order_id).await?;

        // Stored timestamps keep microseconds; the claim is matched on release
        let requested_at = Utc::now().trunc_subsecs(6);
        let claim = OrderCommand::ClaimShipment { sub_order_id, requested_at };
        let claimed = self.orders.handle(order_id, &claim, actor).await?.order;
        let sub = claimed.sub_order(sub_order_id)?;
        let request = Self::parcel_request(&claimed, sub);

        let receipt = match self.courier.create_parcel(&request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(
                    order_id = %order_id,
                    sub_order_id = %sub_order_id,
                    at = %Utc::now(),
                    error = %e,
                    "Courier shipment creation failed"
                );
                self.release_claim(order_id, sub_order_id, requested_at, actor).await;
                return Err(e);
            }
        };

        let record = OrderCommand::RecordShipment {
            sub_order_id,
            courier: self.courier.name().to_string(),
            parcel_id: receipt.parcel_id.clone(),
            tracking_code: receipt.tracking_code.clone(),
        };
        let order = match self.orders.handle(order_id, &record, actor).await {
            Ok(outcome) => outcome.order,
            Err(e) => {
                // The parcel exists at the courier but not on our side
                error!(
                    order_id = %order_id,
                    sub_order_id = %sub_order_id,
                    parcel_id = %receipt.parcel_id,
                    tracking_code = %receipt.tracking_code,
                    error = %e,
                    "Parcel created but could not be recorded"
                );
                self.release_claim(order_id, sub_order_id, requested_at, actor).await;
                return Err(e.into());
            }
        };
        let sub = order.sub_order(sub_order_id)?;

        info!(
            order_id = %order_id,
            sub_order_id = %sub_order_id,
            parcel_id = %receipt.parcel_id,
            tracking_code = %receipt.tracking_code,
            cod_amount = %request.cod_amount,
            "Shipment created"
        );
        Ok(CreatedShipment {
            order_id,
            sub_order_id,
            courier: self.courier.name().to_string(),
            parcel_id: receipt.parcel_id,
            tracking_code: receipt.tracking_code,
            sub_order_status: sub.status,
            order_status: order.status,
        })
    }

    async fn release_claim(&self, order_id: Uuid, sub_order_id: Uuid, requested_at: DateTime<Utc>, actor: &str) {
        let release = OrderCommand::ReleaseShipment { sub_order_id, requested_at };
        if let Err(e) = self.orders.handle(order_id, &release, actor).await {
            error!(sub_order_id = %sub_order_id, error = %e, "Failed to release shipment claim");
        }
    }

    /// Clear a shipment claim left behind by a request that never finished.
    ///
    /// Refused while the claim is still within its lease.
    pub async fn release_expired_claim(&self, sub_order_id: Uuid, actor: &str) -> Result<Order, CourierError> {
        let order_id = self.orders.order_id_for_sub_order(sub_order_id).await?;
        let command = OrderCommand::ExpireShipmentClaim { sub_order_id, now: Utc::now() };
        let outcome = self.orders.handle(order_id, &command, actor).await?;
        if outcome.changed() {
            warn!(order_id = %order_id, sub_order_id = %sub_order_id, actor, "Expired shipment claim released");
        }
        Ok(outcome.order)
    }

    /// Pull the courier status for a shipped sub-order and apply it.
    pub async fn sync_tracking(&self, sub_order_id: Uuid) -> Result<TrackingSync, CourierError> {
        let order_id = self.orders.order_id_for_sub_order(sub_order_id).await?;
        let order = self.orders.load(order_id).await?;
        let Some(tracking_code) = order.sub_order(sub_order_id)?.tracking_code.clone() else {
            return Err(CourierError::NotShipped(sub_order_id));
        };

        let raw = retry_on_transient(&self.retry, |_| self.courier.delivery_status(&tracking_code)).await?;
        self.apply_courier_status(&order, sub_order_id, &tracking_code, &raw, "courier-sync").await
    }

    /// Apply a status pushed by the courier.
    pub async fn apply_webhook(&self, push: &CourierPush) -> Result<TrackingSync, CourierError> {
        let (order, key) = match (&push.tracking_code, push.parcel_id()) {
            (Some(code), _) => (self.orders.store().find_by_tracking_code(code).await?, code.clone()),
            (None, Some(parcel_id)) => (self.orders.store().find_by_parcel_id(&parcel_id).await?, parcel_id),
            (None, None) => return Err(CourierError::MissingLookupKey),
        };
        let Some(order) = order else {
            warn!(key = %key, status = %push.status, "Courier push for unknown shipment");
            return Err(CourierError::ShipmentNotFound(key));
        };

        let sub = order
            .sub_orders
            .iter()
            .find(|s| s.tracking_code.as_deref() == Some(key.as_str()) || s.parcel_id.as_deref() == Some(key.as_str()))
            .ok_or_else(|| CourierError::ShipmentNotFound(key.clone()))?;
        let sub_order_id = sub.id;
        let tracking_code = sub.tracking_code.clone().unwrap_or_default();

        self.apply_courier_status(&order, sub_order_id, &tracking_code, &push.status, "courier-webhook").await
    }

    async fn apply_courier_status(
        &self,
        order: &Order,
        sub_order_id: Uuid,
        tracking_code: &str,
        raw: &str,
        actor: &str,
    ) -> Result<TrackingSync, CourierError> {
        let state = CourierState::from_courier(raw);
        let current = order.sub_order(sub_order_id)?.status;
        let skipped = |order: &Order, status: SubOrderStatus| TrackingSync {
            order_id: order.id,
            sub_order_id,
            tracking_code: tracking_code.to_string(),
            courier_status: raw.to_string(),
            state: state.clone(),
            applied: false,
            sub_order_status: status,
            order_status: order.status,
        };

        let Some(target) = state.sub_order_target() else {
            if let CourierState::Unrecognized(_) = state {
                warn!(sub_order_id = %sub_order_id, tracking_code, courier_status = raw, "Ignoring unrecognized courier status");
            } else {
                debug!(sub_order_id = %sub_order_id, tracking_code, courier_status = raw, "Parcel still in transit");
            }
            return Ok(skipped(order, current));
        };

        if current == target || !current.can_transition_to(target) {
            debug!(
                sub_order_id = %sub_order_id,
                from = %current,
                to = %target,
                "Courier status is not a forward move, skipping"
            );
            return Ok(skipped(order, current));
        }

        let command = OrderCommand::ChangeSubOrderStatus { sub_order_id, target };
        let outcome = match self.orders.handle(order.id, &command, actor).await {
            Ok(outcome) => outcome,
            // Someone else moved the sub-order first
            Err(OrderError::InvalidSubOrderTransition { from, to }) => {
                debug!(sub_order_id = %sub_order_id, %from, %to, "Sub-order moved concurrently, skipping");
                let latest = self.orders.load(order.id).await?;
                let status = latest.sub_order(sub_order_id)?.status;
                return Ok(skipped(&latest, status));
            }
            Err(e) => return Err(e.into()),
        };

        let status = outcome.order.sub_order(sub_order_id)?.status;
        info!(
            order_id = %order.id,
            sub_order_id = %sub_order_id,
            tracking_code,
            courier_status = raw,
            sub_order_status = %status,
            order_status = %outcome.order.status,
            "Courier status applied"
        );
        Ok(TrackingSync {
            applied: outcome.changed(),
            ..skipped(&outcome.order, status)
        })
    }

    /// Redacted tracking view by tracking code or order id.
    pub async fn tracking(&self, query: &TrackingQuery) -> Result<TrackingView, CourierError> {
        let order = match (&query.tracking_code, query.order_id) {
            (Some(code), _) => self
                .orders
                .store()
                .find_by_tracking_code(code)
                .await?
                .ok_or_else(|| CourierError::ShipmentNotFound(code.clone()))?,
            (None, Some(order_id)) => self.orders.load(order_id).await?,
            (None, None) => return Err(CourierError::MissingLookupKey),
        };

        let mut shipments = Vec::new();
        for sub in &order.sub_orders {
            if let Some(code) = &query.tracking_code {
                if sub.tracking_code.as_ref() != Some(code) {
                    continue;
                }
            }

            let courier_status = match &sub.tracking_code {
                Some(code) => match self.courier.delivery_status(code).await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(sub_order_id = %sub.id, tracking_code = %code, error = %e, "Live courier status unavailable");
                        None
                    }
                },
                None => None,
            };

            shipments.push(ShipmentView {
                sub_order_id: sub.id,
                status: sub.status,
                courier: sub.courier_name.clone(),
                tracking_code: sub.tracking_code.clone(),
                courier_status,
                item_count: sub.lines.len(),
            });
        }

        Ok(TrackingView {
            order_id: order.id,
            order_status: order.status,
            payment_status: order.payment_status,
            recipient_name: mask_name(&order.shipping.name),
            recipient_phone: mask_phone(&order.shipping.phone),
            city: order.shipping.city.clone(),
            shipments,
        })
    }
}
