use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::core::{Aggregate, EventEnvelope};
use crate::metrics::Metrics;
use crate::store::{OrderStore, SaveOutcome, VendorStore};

use super::aggregate::Order;
use super::commands::{OrderCommand, PlaceOrder};
use super::delivery::DeliveryRateTable;
use super::errors::OrderError;
use super::events::{OrderEvent, OrderPlaced};
use super::splitter::split_order;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Command Handler
// ============================================================================
//
// Orchestrates: load → command → events → compare-and-set save
//
// A lost race reloads the order and evaluates the command again, so the
// second of two concurrent callbacks sees the first one's result and turns
// into a no-op instead of overwriting it.
//
// ============================================================================

const MAX_ATTEMPTS: u32 = 5;

/// Result of running a command: the order as stored afterwards and the
/// events it produced (empty when the command was a no-op).
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub order: Order,
    pub events: Vec<OrderEvent>,
}

impl CommandOutcome {
    pub fn changed(&self) -> bool {
        !self.events.is_empty()
    }
}

pub struct OrderCommandHandler {
    orders: Arc<dyn OrderStore>,
    vendors: Arc<dyn VendorStore>,
    rates: Arc<dyn DeliveryRateTable>,
    metrics: Arc<Metrics>,
}

impl OrderCommandHandler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        vendors: Arc<dyn VendorStore>,
        rates: Arc<dyn DeliveryRateTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { orders, vendors, rates, metrics }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    /// Split the cart and persist the order, sub-orders and lines in one write.
    pub async fn place_order(&self, request: PlaceOrder, actor: &str) -> Result<Order, OrderError> {
        let mut vendor_ids: Vec<Uuid> = request.lines.iter().map(|l| l.vendor_id).collect();
        vendor_ids.sort();
        vendor_ids.dedup();

        let vendors = self.vendors.find_vendors(&vendor_ids).await?;
        let mut order = split_order(&request, &vendors, self.rates.as_ref())?;
        order.version = 1;

        let placed = OrderEvent::Placed(OrderPlaced {
            buyer_id: order.buyer_id,
            total_amount: order.total_amount,
            vendor_count: order.sub_orders.len(),
        });
        let envelope = EventEnvelope::new(order.id, order.version, placed, Uuid::new_v4()).with_actor(actor);

        self.orders.insert_order(&order, &[envelope]).await?;
        self.metrics.orders_created.inc();

        info!(
            order_id = %order.id,
            buyer_id = %order.buyer_id,
            total_amount = %order.total_amount,
            sub_orders = order.sub_orders.len(),
            "Order placed"
        );
        Ok(order)
    }

    pub async fn load(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders
            .load_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Resolve the order owning a sub-order.
    pub async fn order_id_for_sub_order(&self, sub_order_id: Uuid) -> Result<Uuid, OrderError> {
        self.orders
            .find_by_sub_order(sub_order_id)
            .await?
            .map(|o| o.id)
            .ok_or(OrderError::SubOrderNotFound(sub_order_id))
    }

    /// Run a command against the latest stored order.
    pub async fn handle(
        &self,
        order_id: Uuid,
        command: &OrderCommand,
        actor: &str,
    ) -> Result<CommandOutcome, OrderError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.load(order_id).await?;
            let (events, mut next) = current.execute(command)?;

            if events.is_empty() {
                debug!(order_id = %order_id, ?command, "Command was a no-op");
                return Ok(CommandOutcome { order: current, events });
            }

            next.version = current.version() + 1;
            let correlation_id = Uuid::new_v4();
            let envelopes: Vec<EventEnvelope<OrderEvent>> = events
                .iter()
                .cloned()
                .map(|event| EventEnvelope::new(order_id, next.version, event, correlation_id).with_actor(actor))
                .collect();

            match self.orders.save_order(&next, current.version(), &envelopes).await? {
                SaveOutcome::Saved => {
                    info!(
                        order_id = %order_id,
                        version = next.version,
                        actor,
                        events = ?envelopes.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
                        "Order updated"
                    );
                    return Ok(CommandOutcome { order: next, events });
                }
                SaveOutcome::VersionConflict => {
                    self.metrics.order_conflict_retries.inc();
                    debug!(order_id = %order_id, attempt, "Lost concurrent update, re-evaluating");
                }
            }
        }

        Err(OrderError::ConcurrencyConflict(order_id))
    }

    /// Administrative request to move the order to `target`.
    pub async fn change_order_status(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        reason: Option<String>,
        actor: &str,
    ) -> Result<CommandOutcome, OrderError> {
        match OrderCommand::for_admin_status(target, reason) {
            Some(command) => self.handle(order_id, &command, actor).await,
            None if target == OrderStatus::Pending => {
                let current = self.load(order_id).await?;
                Err(OrderError::InvalidOrderTransition { from: current.status, to: target })
            }
            None => Err(OrderError::DerivedStatus(target)),
        }
    }
}
