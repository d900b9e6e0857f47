use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::core::Aggregate;
use super::commands::OrderCommand;
use super::errors::OrderError;
use super::events::*;
use super::state_machine::claim_expired;
use super::value_objects::*;

// ============================================================================
// Order Aggregate - Domain Logic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub version: i64,
    pub buyer_id: Uuid,

    pub shipping: ShippingAddress,
    pub delivery_method: DeliveryMethod,

    // Financials
    pub subtotal: Decimal,
    pub delivery_charge: Decimal,
    pub total_amount: Decimal,

    // Payment
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
    /// Ids of earlier gateway sessions, still honoured for late captures.
    #[serde(default)]
    pub previous_transaction_ids: Vec<String>,

    pub status: OrderStatus,
    pub sub_orders: Vec<SubOrder>,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One vendor's share of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOrder {
    pub id: Uuid,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub lines: Vec<OrderLine>,

    pub product_total: Decimal,
    pub delivery_charge: Decimal,
    pub payable_amount: Decimal,

    // Logistics
    pub delivery_method: DeliveryMethod,
    pub total_weight_kg: Decimal,
    pub courier_name: Option<String>,
    pub parcel_id: Option<String>,
    pub tracking_code: Option<String>,
    pub shipment_requested_at: Option<DateTime<Utc>>,

    pub status: SubOrderStatus,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn sub_order(&self, sub_order_id: Uuid) -> Result<&SubOrder, OrderError> {
        self.sub_orders
            .iter()
            .find(|s| s.id == sub_order_id)
            .ok_or(OrderError::SubOrderNotFound(sub_order_id))
    }

    fn sub_order_mut(&mut self, sub_order_id: Uuid) -> Result<&mut SubOrder, OrderError> {
        self.sub_orders
            .iter_mut()
            .find(|s| s.id == sub_order_id)
            .ok_or(OrderError::SubOrderNotFound(sub_order_id))
    }

    /// `total_amount == Σ payable_amount` and `payable == product_total + delivery_charge`.
    pub fn check_totals(&self) -> Result<(), OrderError> {
        let mut sub_order_sum = Decimal::ZERO;
        for sub in &self.sub_orders {
            if sub.payable_amount != sub.product_total + sub.delivery_charge {
                return Err(OrderError::TotalMismatch {
                    sub_order_sum: sub.payable_amount,
                    line_sum: sub.product_total + sub.delivery_charge,
                });
            }
            sub_order_sum += sub.payable_amount;
        }
        if sub_order_sum != self.total_amount {
            return Err(OrderError::TotalMismatch {
                sub_order_sum,
                line_sum: self.total_amount,
            });
        }
        Ok(())
    }

    /// Parent status change implied by moving the given sub-orders.
    fn derived_status_change(&self, changes: &[(Uuid, SubOrderStatus)]) -> Option<OrderEvent> {
        let statuses: Vec<SubOrderStatus> = self
            .sub_orders
            .iter()
            .map(|s| {
                changes
                    .iter()
                    .find(|(id, _)| *id == s.id)
                    .map(|(_, status)| *status)
                    .unwrap_or(s.status)
            })
            .collect();

        let derived = self.status.follow_sub_orders(&statuses)?;
        Some(OrderEvent::StatusChanged(OrderStatusChanged {
            from: self.status,
            to: derived,
            reason: Some("derived from sub-orders".to_string()),
        }))
    }

    fn ensure_sub_orders_mutable(&self) -> Result<(), OrderError> {
        if self.status.freezes_sub_orders() {
            return Err(OrderError::OrderFrozen(self.status));
        }
        Ok(())
    }

    fn handle_settle_payment(
        &self,
        transaction_id: &str,
        outcome: PaymentStatus,
        reference: &Option<String>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        let current = self.transaction_id.as_deref() == Some(transaction_id);
        if !current && !self.previous_transaction_ids.iter().any(|t| t == transaction_id) {
            return Err(OrderError::UnknownTransaction(transaction_id.to_string()));
        }

        let settled = |to: PaymentStatus| {
            OrderEvent::PaymentSettled(PaymentSettled {
                transaction_id: Some(transaction_id.to_string()),
                from: self.payment_status,
                to,
                reference: reference.clone(),
            })
        };

        match outcome {
            PaymentStatus::Paid => match self.payment_status {
                PaymentStatus::Paid | PaymentStatus::Refunded => {
                    if !current {
                        tracing::warn!(
                            order_id = %self.id,
                            transaction_id = %transaction_id,
                            captured = ?self.transaction_id,
                            "Second capture from an earlier payment attempt, refund required"
                        );
                    }
                    Ok(vec![])
                }
                PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Cancelled => {
                    if !current {
                        tracing::info!(
                            order_id = %self.id,
                            transaction_id = %transaction_id,
                            "Capture arrived for an earlier payment attempt"
                        );
                    }
                    let mut events = vec![settled(PaymentStatus::Paid)];
                    if self.status == OrderStatus::Pending {
                        events.push(OrderEvent::StatusChanged(OrderStatusChanged {
                            from: OrderStatus::Pending,
                            to: OrderStatus::Processing,
                            reason: Some("payment received".to_string()),
                        }));
                    } else if self.status == OrderStatus::Cancelled {
                        tracing::warn!(
                            order_id = %self.id,
                            transaction_id = %transaction_id,
                            "Payment captured for a cancelled order, refund required"
                        );
                    }
                    Ok(events)
                }
            },
            // A superseded attempt has nothing left to close
            PaymentStatus::Failed | PaymentStatus::Cancelled if !current => Ok(vec![]),
            PaymentStatus::Failed | PaymentStatus::Cancelled => match self.payment_status {
                PaymentStatus::Pending => Ok(vec![settled(outcome)]),
                _ => Ok(vec![]),
            },
            PaymentStatus::Pending | PaymentStatus::Refunded => {
                Err(OrderError::InvalidPaymentOutcome(outcome))
            }
        }
    }

    fn handle_change_sub_order(
        &self,
        sub_order_id: Uuid,
        target: SubOrderStatus,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_sub_orders_mutable()?;
        let sub = self.sub_order(sub_order_id)?;

        if sub.status == target {
            return Ok(vec![]);
        }
        if !sub.status.can_transition_to(target) {
            return Err(OrderError::InvalidSubOrderTransition { from: sub.status, to: target });
        }
        if sub.shipment_requested_at.is_some() {
            return Err(OrderError::ShipmentInFlight(sub_order_id));
        }
        if target.requires_processing_parent() && self.status == OrderStatus::Pending {
            return Err(OrderError::ParentNotProcessing(self.status));
        }

        let mut events = vec![OrderEvent::SubOrderStatusChanged(SubOrderStatusChanged {
            sub_order_id,
            from: sub.status,
            to: target,
        })];
        events.extend(self.derived_status_change(&[(sub_order_id, target)]));
        Ok(events)
    }

    /// Move every sub-order matching `select` to `target`, returning the events
    /// and the changes for status derivation.
    fn cascade_sub_orders(
        &self,
        select: impl Fn(&SubOrder) -> bool,
        target: SubOrderStatus,
    ) -> (Vec<OrderEvent>, Vec<(Uuid, SubOrderStatus)>) {
        let mut events = Vec::new();
        let mut changes = Vec::new();
        for sub in self.sub_orders.iter().filter(|s| select(s)) {
            events.push(OrderEvent::SubOrderStatusChanged(SubOrderStatusChanged {
                sub_order_id: sub.id,
                from: sub.status,
                to: target,
            }));
            changes.push((sub.id, target));
        }
        (events, changes)
    }

    fn status_change(&self, to: OrderStatus, reason: &Option<String>) -> Result<OrderEvent, OrderError> {
        if !self.status.can_transition_to(to) {
            return Err(OrderError::InvalidOrderTransition { from: self.status, to });
        }
        Ok(OrderEvent::StatusChanged(OrderStatusChanged {
            from: self.status,
            to,
            reason: reason.clone(),
        }))
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for Order {
    type Event = OrderEvent;
    type Command = OrderCommand;
    type Error = OrderError;

    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
        let now = Utc::now();
        self.updated_at = now;

        match event {
            OrderEvent::Placed(_) => {}
            OrderEvent::PaymentSessionOpened(e) => {
                if let Some(previous) = self.transaction_id.replace(e.transaction_id.clone()) {
                    if previous != e.transaction_id && !self.previous_transaction_ids.contains(&previous) {
                        self.previous_transaction_ids.push(previous);
                    }
                }
                self.payment_status = PaymentStatus::Pending;
            }
            OrderEvent::PaymentSettled(e) => {
                // A capture on an earlier attempt becomes the order's transaction
                if let (PaymentStatus::Paid, Some(captured)) = (e.to, &e.transaction_id) {
                    if self.transaction_id.as_ref() != Some(captured) {
                        self.previous_transaction_ids.retain(|t| t != captured);
                        if let Some(open) = self.transaction_id.replace(captured.clone()) {
                            self.previous_transaction_ids.push(open);
                        }
                    }
                }
                self.payment_status = e.to;
            }
            OrderEvent::PaymentRefunded(_) => {
                self.payment_status = PaymentStatus::Refunded;
            }
            OrderEvent::StatusChanged(e) => {
                self.status = e.to;
            }
            OrderEvent::SubOrderStatusChanged(e) => {
                let sub = self.sub_order_mut(e.sub_order_id)?;
                sub.status = e.to;
                sub.updated_at = now;
            }
            OrderEvent::ShipmentRequested(e) => {
                let sub = self.sub_order_mut(e.sub_order_id)?;
                sub.shipment_requested_at = Some(e.requested_at);
                sub.updated_at = now;
            }
            OrderEvent::ShipmentReleased(e) => {
                let sub = self.sub_order_mut(e.sub_order_id)?;
                sub.shipment_requested_at = None;
                sub.updated_at = now;
            }
            OrderEvent::ShipmentCreated(e) => {
                let sub = self.sub_order_mut(e.sub_order_id)?;
                sub.courier_name = Some(e.courier.clone());
                sub.parcel_id = Some(e.parcel_id.clone());
                sub.tracking_code = Some(e.tracking_code.clone());
                sub.shipment_requested_at = None;
                sub.updated_at = now;
            }
        }
        Ok(())
    }

    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::OpenPaymentSession { transaction_id } => {
                if self.payment_method != PaymentMethod::Online {
                    return Err(OrderError::PaymentMethodMismatch);
                }
                if self.status.freezes_sub_orders() {
                    return Err(OrderError::OrderFrozen(self.status));
                }
                match self.payment_status {
                    PaymentStatus::Paid => Err(OrderError::AlreadyPaid),
                    PaymentStatus::Refunded => Err(OrderError::PaymentClosed(self.payment_status)),
                    // An open session keeps its transaction id
                    PaymentStatus::Pending if self.transaction_id.is_some() => Ok(vec![]),
                    PaymentStatus::Pending => {
                        Ok(vec![OrderEvent::PaymentSessionOpened(PaymentSessionOpened {
                            transaction_id: transaction_id.clone(),
                            reopened: false,
                        })])
                    }
                    PaymentStatus::Failed | PaymentStatus::Cancelled => {
                        Ok(vec![OrderEvent::PaymentSessionOpened(PaymentSessionOpened {
                            transaction_id: transaction_id.clone(),
                            reopened: true,
                        })])
                    }
                }
            }

            OrderCommand::SettlePayment { transaction_id, outcome, reference } => {
                self.handle_settle_payment(transaction_id, *outcome, reference)
            }

            OrderCommand::Refund { reason } => {
                if self.payment_status != PaymentStatus::Paid {
                    return Err(OrderError::NotPaid(self.payment_status));
                }
                Ok(vec![OrderEvent::PaymentRefunded(PaymentRefunded { reason: reason.clone() })])
            }

            OrderCommand::Confirm => {
                match self.status {
                    OrderStatus::Processing => return Ok(vec![]),
                    OrderStatus::Pending => {}
                    _ => {
                        return Err(OrderError::InvalidOrderTransition {
                            from: self.status,
                            to: OrderStatus::Processing,
                        })
                    }
                }
                if self.payment_method == PaymentMethod::Online
                    && self.payment_status != PaymentStatus::Paid
                {
                    return Err(OrderError::PaymentNotSettled(self.payment_status));
                }
                Ok(vec![self.status_change(OrderStatus::Processing, &Some("confirmed".to_string()))?])
            }

            OrderCommand::Cancel { reason } => {
                let status_event = self.status_change(OrderStatus::Cancelled, reason)?;
                if let Some(sub) = self.sub_orders.iter().find(|s| s.shipment_requested_at.is_some()) {
                    return Err(OrderError::ShipmentInFlight(sub.id));
                }

                let (mut events, _) =
                    self.cascade_sub_orders(|s| !s.status.is_terminal(), SubOrderStatus::Cancelled);
                if self.payment_status == PaymentStatus::Pending {
                    events.push(OrderEvent::PaymentSettled(PaymentSettled {
                        transaction_id: self.transaction_id.clone(),
                        from: PaymentStatus::Pending,
                        to: PaymentStatus::Cancelled,
                        reference: None,
                    }));
                }
                events.push(status_event);
                Ok(events)
            }

            OrderCommand::RequestReturn { reason } => {
                let status_event = self.status_change(OrderStatus::ReturnRequest, reason)?;
                let (mut events, _) = self.cascade_sub_orders(
                    |s| matches!(s.status, SubOrderStatus::Shipped | SubOrderStatus::Delivered),
                    SubOrderStatus::ReturnRequested,
                );
                events.push(status_event);
                Ok(events)
            }

            OrderCommand::CompleteReturn => {
                let status_event = self.status_change(OrderStatus::Returned, &None)?;
                let (mut events, _) = self.cascade_sub_orders(
                    |s| s.status == SubOrderStatus::ReturnRequested,
                    SubOrderStatus::Returned,
                );
                events.push(status_event);
                Ok(events)
            }

            OrderCommand::ChangeSubOrderStatus { sub_order_id, target } => {
                self.handle_change_sub_order(*sub_order_id, *target)
            }

            OrderCommand::ClaimShipment { sub_order_id, requested_at } => {
                self.ensure_sub_orders_mutable()?;
                let sub = self.sub_order(*sub_order_id)?;
                if !sub.delivery_method.uses_courier() {
                    return Err(OrderError::PickupNotShippable);
                }
                if let Some(parcel_id) = &sub.parcel_id {
                    return Err(OrderError::ShipmentAlreadyCreated {
                        sub_order_id: sub.id,
                        parcel_id: parcel_id.clone(),
                    });
                }
                if let Some(claimed_at) = sub.shipment_requested_at {
                    if !claim_expired(claimed_at, *requested_at) {
                        return Err(OrderError::ShipmentInFlight(sub.id));
                    }
                    tracing::warn!(
                        order_id = %self.id,
                        sub_order_id = %sub.id,
                        claimed_at = %claimed_at,
                        "Taking over an expired shipment claim"
                    );
                }
                if sub.status != SubOrderStatus::Processing {
                    return Err(OrderError::NotShippable { sub_order_id: sub.id, status: sub.status });
                }
                Ok(vec![OrderEvent::ShipmentRequested(ShipmentRequested {
                    sub_order_id: sub.id,
                    requested_at: *requested_at,
                })])
            }

            OrderCommand::RecordShipment { sub_order_id, courier, parcel_id, tracking_code } => {
                self.ensure_sub_orders_mutable()?;
                let sub = self.sub_order(*sub_order_id)?;
                if let Some(existing) = &sub.parcel_id {
                    if existing == parcel_id {
                        return Ok(vec![]);
                    }
                    return Err(OrderError::ShipmentAlreadyCreated {
                        sub_order_id: sub.id,
                        parcel_id: existing.clone(),
                    });
                }
                if sub.status != SubOrderStatus::Processing {
                    return Err(OrderError::NotShippable { sub_order_id: sub.id, status: sub.status });
                }

                let mut events = vec![
                    OrderEvent::ShipmentCreated(ShipmentCreated {
                        sub_order_id: sub.id,
                        courier: courier.clone(),
                        parcel_id: parcel_id.clone(),
                        tracking_code: tracking_code.clone(),
                    }),
                    OrderEvent::SubOrderStatusChanged(SubOrderStatusChanged {
                        sub_order_id: sub.id,
                        from: sub.status,
                        to: SubOrderStatus::Shipped,
                    }),
                ];
                events.extend(self.derived_status_change(&[(sub.id, SubOrderStatus::Shipped)]));
                Ok(events)
            }

            OrderCommand::ReleaseShipment { sub_order_id, requested_at } => {
                let sub = self.sub_order(*sub_order_id)?;
                // Only the holder of the claim may drop it
                if sub.shipment_requested_at != Some(*requested_at) || sub.parcel_id.is_some() {
                    return Ok(vec![]);
                }
                Ok(vec![OrderEvent::ShipmentReleased(ShipmentReleased { sub_order_id: sub.id })])
            }

            OrderCommand::ExpireShipmentClaim { sub_order_id, now } => {
                let sub = self.sub_order(*sub_order_id)?;
                match sub.shipment_requested_at {
                    None => Ok(vec![]),
                    Some(_) if sub.parcel_id.is_some() => Ok(vec![]),
                    Some(claimed_at) if !claim_expired(claimed_at, *now) => {
                        Err(OrderError::ShipmentInFlight(sub.id))
                    }
                    Some(_) => Ok(vec![OrderEvent::ShipmentReleased(ShipmentReleased { sub_order_id: sub.id })]),
                }
            }
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sub_order(order_id: Uuid, payable: Decimal, method: DeliveryMethod) -> SubOrder {
        SubOrder {
            id: Uuid::new_v4(),
            order_id,
            vendor_id: Uuid::new_v4(),
            lines: vec![],
            product_total: payable - dec!(60),
            delivery_charge: dec!(60),
            payable_amount: payable,
            delivery_method: method,
            total_weight_kg: dec!(1),
            courier_name: None,
            parcel_id: None,
            tracking_code: None,
            shipment_requested_at: None,
            status: SubOrderStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    pub(crate) fn two_vendor_order(payment_method: PaymentMethod) -> Order {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let subs = vec![
            sub_order(id, dec!(1060), DeliveryMethod::HomeDelivery),
            sub_order(id, dec!(360), DeliveryMethod::HomeDelivery),
        ];
        Order {
            id,
            version: 1,
            buyer_id: Uuid::new_v4(),
            shipping: ShippingAddress {
                name: "Rahim Uddin".to_string(),
                phone: "01711223344".to_string(),
                email: "rahim@example.com".to_string(),
                address: "House 4, Road 7".to_string(),
                city: "Dhaka".to_string(),
                area: None,
                postal_code: None,
            },
            delivery_method: DeliveryMethod::HomeDelivery,
            subtotal: dec!(1300),
            delivery_charge: dec!(120),
            total_amount: dec!(1420),
            payment_method,
            payment_status: PaymentStatus::Pending,
            transaction_id: Some("MKT0123456789abcdef0123456789abcdef".to_string()),
            previous_transaction_ids: Vec::new(),
            status: OrderStatus::Pending,
            sub_orders: subs,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::two_vendor_order;
    use crate::domain::order::state_machine::SHIPMENT_CLAIM_TTL_MINUTES;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn run(order: &Order, command: OrderCommand) -> Order {
        let (_, next) = order.execute(&command).unwrap();
        next
    }

    fn settle(outcome: PaymentStatus) -> OrderCommand {
        OrderCommand::SettlePayment {
            transaction_id: "MKT0123456789abcdef0123456789abcdef".to_string(),
            outcome,
            reference: Some("VAL-1".to_string()),
        }
    }

    fn paid_processing_order() -> Order {
        run(&two_vendor_order(PaymentMethod::Online), settle(PaymentStatus::Paid))
    }

    #[test]
    fn test_check_totals_accepts_consistent_order() {
        assert!(two_vendor_order(PaymentMethod::Online).check_totals().is_ok());
    }

    #[test]
    fn test_check_totals_rejects_drift() {
        let mut order = two_vendor_order(PaymentMethod::Online);
        order.total_amount = dec!(1421);
        assert!(matches!(order.check_totals(), Err(OrderError::TotalMismatch { .. })));

        let mut order = two_vendor_order(PaymentMethod::Online);
        order.sub_orders[0].delivery_charge = dec!(70);
        assert!(matches!(order.check_totals(), Err(OrderError::TotalMismatch { .. })));
    }

    #[test]
    fn test_paid_settlement_advances_order_to_processing() {
        let order = two_vendor_order(PaymentMethod::Online);
        let (events, next) = order.execute(&settle(PaymentStatus::Paid)).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(next.payment_status, PaymentStatus::Paid);
        assert_eq!(next.status, OrderStatus::Processing);
    }

    #[test]
    fn test_repeated_paid_settlement_is_a_no_op() {
        let order = paid_processing_order();
        let events = order.handle_command(&settle(PaymentStatus::Paid)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_failure_after_paid_is_ignored() {
        let order = paid_processing_order();
        assert!(order.handle_command(&settle(PaymentStatus::Failed)).unwrap().is_empty());
        assert!(order.handle_command(&settle(PaymentStatus::Cancelled)).unwrap().is_empty());
    }

    #[test]
    fn test_failed_payment_keeps_order_pending() {
        let order = two_vendor_order(PaymentMethod::Online);
        let next = run(&order, settle(PaymentStatus::Failed));
        assert_eq!(next.payment_status, PaymentStatus::Failed);
        assert_eq!(next.status, OrderStatus::Pending);
    }

    #[test]
    fn test_late_verified_success_overrides_failure() {
        let failed = run(&two_vendor_order(PaymentMethod::Online), settle(PaymentStatus::Failed));
        let next = run(&failed, settle(PaymentStatus::Paid));
        assert_eq!(next.payment_status, PaymentStatus::Paid);
        assert_eq!(next.status, OrderStatus::Processing);
    }

    #[test]
    fn test_callbacks_cannot_report_refund() {
        let order = paid_processing_order();
        let result = order.handle_command(&settle(PaymentStatus::Refunded));
        assert!(matches!(result, Err(OrderError::InvalidPaymentOutcome(PaymentStatus::Refunded))));
    }

    #[test]
    fn test_open_session_rejects_paid_and_cod() {
        let command = OrderCommand::OpenPaymentSession { transaction_id: "MKTx".to_string() };
        assert!(matches!(paid_processing_order().handle_command(&command), Err(OrderError::AlreadyPaid)));

        let cod = two_vendor_order(PaymentMethod::CashOnDelivery);
        assert!(matches!(cod.handle_command(&command), Err(OrderError::PaymentMethodMismatch)));
    }

    #[test]
    fn test_open_session_reuses_pending_transaction_and_rotates_failed_one() {
        let order = two_vendor_order(PaymentMethod::Online);
        let command = OrderCommand::OpenPaymentSession { transaction_id: "MKTnew".to_string() };
        assert!(order.handle_command(&command).unwrap().is_empty());

        let failed = run(&order, settle(PaymentStatus::Failed));
        let reopened = run(&failed, command);
        assert_eq!(reopened.transaction_id.as_deref(), Some("MKTnew"));
        assert_eq!(reopened.payment_status, PaymentStatus::Pending);
    }

    fn reopened_as(order: &Order, transaction_id: &str) -> Order {
        let failed = run(order, settle(PaymentStatus::Failed));
        run(&failed, OrderCommand::OpenPaymentSession { transaction_id: transaction_id.to_string() })
    }

    #[test]
    fn test_stale_outcome_does_not_close_the_new_session() {
        let order = reopened_as(&two_vendor_order(PaymentMethod::Online), "MKTnew");
        assert_eq!(order.previous_transaction_ids, vec!["MKT0123456789abcdef0123456789abcdef".to_string()]);

        assert!(order.handle_command(&settle(PaymentStatus::Failed)).unwrap().is_empty());
        assert!(order.handle_command(&settle(PaymentStatus::Cancelled)).unwrap().is_empty());

        let current = OrderCommand::SettlePayment {
            transaction_id: "MKTnew".to_string(),
            outcome: PaymentStatus::Cancelled,
            reference: None,
        };
        assert_eq!(run(&order, current).payment_status, PaymentStatus::Cancelled);
    }

    #[test]
    fn test_unknown_transaction_is_rejected() {
        let order = two_vendor_order(PaymentMethod::Online);
        let result = order.handle_command(&OrderCommand::SettlePayment {
            transaction_id: "MKTforeign".to_string(),
            outcome: PaymentStatus::Paid,
            reference: None,
        });
        assert!(matches!(result, Err(OrderError::UnknownTransaction(id)) if id == "MKTforeign"));
    }

    #[test]
    fn test_late_capture_on_earlier_attempt_pays_the_order() {
        let order = reopened_as(&two_vendor_order(PaymentMethod::Online), "MKTnew");
        let paid = run(&order, settle(PaymentStatus::Paid));

        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.status, OrderStatus::Processing);
        assert_eq!(paid.transaction_id.as_deref(), Some("MKT0123456789abcdef0123456789abcdef"));
        assert_eq!(paid.previous_transaction_ids, vec!["MKTnew".to_string()]);

        // A second capture on the other attempt changes nothing
        let second = OrderCommand::SettlePayment {
            transaction_id: "MKTnew".to_string(),
            outcome: PaymentStatus::Paid,
            reference: None,
        };
        assert!(paid.handle_command(&second).unwrap().is_empty());
    }

    #[test]
    fn test_confirm_requires_payment_for_online_orders() {
        let order = two_vendor_order(PaymentMethod::Online);
        assert!(matches!(
            order.handle_command(&OrderCommand::Confirm),
            Err(OrderError::PaymentNotSettled(PaymentStatus::Pending))
        ));

        let cod = two_vendor_order(PaymentMethod::CashOnDelivery);
        assert_eq!(run(&cod, OrderCommand::Confirm).status, OrderStatus::Processing);
    }

    #[test]
    fn test_vendor_cannot_process_before_parent_is_processing() {
        let order = two_vendor_order(PaymentMethod::Online);
        let sub_id = order.sub_orders[0].id;

        let accepted = run(&order, OrderCommand::ChangeSubOrderStatus {
            sub_order_id: sub_id,
            target: SubOrderStatus::Accepted,
        });
        assert_eq!(accepted.sub_orders[0].status, SubOrderStatus::Accepted);

        let result = order.handle_command(&OrderCommand::ChangeSubOrderStatus {
            sub_order_id: sub_id,
            target: SubOrderStatus::Processing,
        });
        assert!(matches!(result, Err(OrderError::ParentNotProcessing(OrderStatus::Pending))));
    }

    #[test]
    fn test_sub_order_moves_derive_parent_status() {
        let mut order = paid_processing_order();
        let (a, b) = (order.sub_orders[0].id, order.sub_orders[1].id);

        for (id, target) in [
            (a, SubOrderStatus::Processing),
            (a, SubOrderStatus::Shipped),
        ] {
            order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: id, target });
        }
        assert_eq!(order.status, OrderStatus::PartiallyShipped);

        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: b, target: SubOrderStatus::Shipped });
        assert_eq!(order.status, OrderStatus::Shipped);

        // One delivered, one still on the road
        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Delivered });
        assert_eq!(order.status, OrderStatus::PartiallyShipped);

        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: b, target: SubOrderStatus::Delivered });
        assert_eq!(order.status, OrderStatus::Delivered);
    }

    #[test]
    fn test_same_sub_order_set_gives_same_parent_whatever_the_path() {
        let start = paid_processing_order();
        let (a, b) = (start.sub_orders[0].id, start.sub_orders[1].id);
        let walk = |moves: &[(Uuid, SubOrderStatus)]| {
            moves.iter().fold(start.clone(), |order, (id, target)| {
                run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: *id, target: *target })
            })
        };

        let via_full_shipment = walk(&[
            (a, SubOrderStatus::Shipped),
            (b, SubOrderStatus::Shipped),
            (a, SubOrderStatus::Delivered),
        ]);
        let direct = walk(&[(a, SubOrderStatus::Delivered), (b, SubOrderStatus::Shipped)]);

        for order in [&via_full_shipment, &direct] {
            assert_eq!(order.sub_order(a).unwrap().status, SubOrderStatus::Delivered);
            assert_eq!(order.sub_order(b).unwrap().status, SubOrderStatus::Shipped);
        }
        assert_eq!(via_full_shipment.status, direct.status);
        assert_eq!(direct.status, OrderStatus::PartiallyShipped);

        // Cancelling the only shipped sub-order returns the parent to Processing
        let shipped_then_cancelled = walk(&[(a, SubOrderStatus::Shipped), (a, SubOrderStatus::Cancelled)]);
        let cancelled = walk(&[(a, SubOrderStatus::Cancelled)]);
        assert_eq!(shipped_then_cancelled.status, OrderStatus::Processing);
        assert_eq!(cancelled.status, OrderStatus::Processing);
    }

    #[test]
    fn test_backward_sub_order_move_is_rejected() {
        let mut order = paid_processing_order();
        let a = order.sub_orders[0].id;
        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Shipped });

        let result = order.handle_command(&OrderCommand::ChangeSubOrderStatus {
            sub_order_id: a,
            target: SubOrderStatus::Processing,
        });
        assert!(matches!(result, Err(OrderError::InvalidSubOrderTransition { .. })));
    }

    #[test]
    fn test_delivered_order_cannot_go_back_to_processing() {
        let mut order = paid_processing_order();
        order.status = OrderStatus::Delivered;
        let result = order.handle_command(&OrderCommand::Confirm);
        assert!(matches!(
            result,
            Err(OrderError::InvalidOrderTransition { from: OrderStatus::Delivered, to: OrderStatus::Processing })
        ));
    }

    #[test]
    fn test_cancel_cascades_and_closes_pending_payment() {
        let order = two_vendor_order(PaymentMethod::Online);
        let next = run(&order, OrderCommand::Cancel { reason: Some("buyer request".to_string()) });

        assert_eq!(next.status, OrderStatus::Cancelled);
        assert_eq!(next.payment_status, PaymentStatus::Cancelled);
        assert!(next.sub_orders.iter().all(|s| s.status == SubOrderStatus::Cancelled));
    }

    #[test]
    fn test_cancelled_order_freezes_sub_orders() {
        let order = run(&two_vendor_order(PaymentMethod::Online), OrderCommand::Cancel { reason: None });
        let result = order.handle_command(&OrderCommand::ChangeSubOrderStatus {
            sub_order_id: order.sub_orders[0].id,
            target: SubOrderStatus::Accepted,
        });
        assert!(matches!(result, Err(OrderError::OrderFrozen(OrderStatus::Cancelled))));
    }

    #[test]
    fn test_all_sub_orders_cancelled_cancels_parent() {
        let mut order = two_vendor_order(PaymentMethod::CashOnDelivery);
        for i in 0..2 {
            let id = order.sub_orders[i].id;
            order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: id, target: SubOrderStatus::Cancelled });
        }
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_return_flow() {
        let mut order = paid_processing_order();
        for i in 0..2 {
            let id = order.sub_orders[i].id;
            order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: id, target: SubOrderStatus::Delivered });
        }
        assert_eq!(order.status, OrderStatus::Delivered);

        order = run(&order, OrderCommand::RequestReturn { reason: Some("damaged".to_string()) });
        assert_eq!(order.status, OrderStatus::ReturnRequest);
        assert!(order.sub_orders.iter().all(|s| s.status == SubOrderStatus::ReturnRequested));

        order = run(&order, OrderCommand::CompleteReturn);
        assert_eq!(order.status, OrderStatus::Returned);
        assert!(order.sub_orders.iter().all(|s| s.status == SubOrderStatus::Returned));

        order = run(&order, OrderCommand::Refund { reason: None });
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_shipment_claim_guards_double_booking() {
        let mut order = paid_processing_order();
        let a = order.sub_orders[0].id;
        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Processing });

        let claim = OrderCommand::ClaimShipment { sub_order_id: a, requested_at: Utc::now() };
        order = run(&order, claim.clone());
        assert!(matches!(order.handle_command(&claim), Err(OrderError::ShipmentInFlight(_))));

        order = run(&order, OrderCommand::RecordShipment {
            sub_order_id: a,
            courier: "steadfast".to_string(),
            parcel_id: "P-1".to_string(),
            tracking_code: "TRK1".to_string(),
        });
        let sub = order.sub_order(a).unwrap();
        assert_eq!(sub.status, SubOrderStatus::Shipped);
        assert_eq!(sub.parcel_id.as_deref(), Some("P-1"));
        assert!(sub.shipment_requested_at.is_none());
        assert_eq!(order.status, OrderStatus::PartiallyShipped);

        assert!(matches!(
            order.handle_command(&claim),
            Err(OrderError::ShipmentAlreadyCreated { .. })
        ));
    }

    #[test]
    fn test_release_clears_claim() {
        let mut order = paid_processing_order();
        let a = order.sub_orders[0].id;
        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Processing });
        order = run(&order, OrderCommand::ClaimShipment { sub_order_id: a, requested_at: Utc::now() });
        let requested_at = order.sub_order(a).unwrap().shipment_requested_at.unwrap();

        // Someone else's token leaves the claim in place
        let other = OrderCommand::ReleaseShipment { sub_order_id: a, requested_at: requested_at - Duration::seconds(1) };
        assert!(order.handle_command(&other).unwrap().is_empty());

        order = run(&order, OrderCommand::ReleaseShipment { sub_order_id: a, requested_at });
        let sub = order.sub_order(a).unwrap();
        assert!(sub.shipment_requested_at.is_none());
        assert_eq!(sub.status, SubOrderStatus::Processing);
    }

    fn claimed_order(claimed_at: DateTime<Utc>) -> (Order, Uuid) {
        let mut order = paid_processing_order();
        let a = order.sub_orders[0].id;
        order = run(&order, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Processing });
        order = run(&order, OrderCommand::ClaimShipment { sub_order_id: a, requested_at: claimed_at });
        (order, a)
    }

    #[test]
    fn test_claimed_sub_order_cannot_be_moved_by_hand() {
        let (order, a) = claimed_order(Utc::now());
        for target in [SubOrderStatus::Shipped, SubOrderStatus::Delivered, SubOrderStatus::Cancelled] {
            let result = order.handle_command(&OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target });
            assert!(matches!(result, Err(OrderError::ShipmentInFlight(id)) if id == a), "{:?}", target);
        }

        // The courier can still record the parcel it was asked for
        let recorded = run(&order, OrderCommand::RecordShipment {
            sub_order_id: a,
            courier: "steadfast".to_string(),
            parcel_id: "P-9".to_string(),
            tracking_code: "TRK9".to_string(),
        });
        assert_eq!(recorded.sub_order(a).unwrap().status, SubOrderStatus::Shipped);
    }

    #[test]
    fn test_expired_claim_can_be_taken_over_or_cleared() {
        let claimed_at = Utc::now() - Duration::minutes(SHIPMENT_CLAIM_TTL_MINUTES + 1);
        let (order, a) = claimed_order(claimed_at);

        let retaken = run(&order, OrderCommand::ClaimShipment { sub_order_id: a, requested_at: Utc::now() });
        assert!(retaken.sub_order(a).unwrap().shipment_requested_at.unwrap() > claimed_at);

        // The old holder can no longer drop the new claim
        let stale_release = OrderCommand::ReleaseShipment { sub_order_id: a, requested_at: claimed_at };
        assert!(retaken.handle_command(&stale_release).unwrap().is_empty());

        let cleared = run(&order, OrderCommand::ExpireShipmentClaim { sub_order_id: a, now: Utc::now() });
        assert!(cleared.sub_order(a).unwrap().shipment_requested_at.is_none());
        let cancelled = run(&cleared, OrderCommand::ChangeSubOrderStatus { sub_order_id: a, target: SubOrderStatus::Cancelled });
        assert_eq!(cancelled.sub_order(a).unwrap().status, SubOrderStatus::Cancelled);
    }

    #[test]
    fn test_live_claim_is_not_expired() {
        let (order, a) = claimed_order(Utc::now());
        let result = order.handle_command(&OrderCommand::ExpireShipmentClaim { sub_order_id: a, now: Utc::now() });
        assert!(matches!(result, Err(OrderError::ShipmentInFlight(_))));
        assert!(matches!(
            order.handle_command(&OrderCommand::ClaimShipment { sub_order_id: a, requested_at: Utc::now() }),
            Err(OrderError::ShipmentInFlight(_))
        ));
    }

    #[test]
    fn test_pickup_sub_orders_are_not_shipped_by_courier() {
        let mut order = paid_processing_order();
        order.sub_orders[0].delivery_method = DeliveryMethod::Pickup;
        order.sub_orders[0].status = SubOrderStatus::Processing;
        let result = order.handle_command(&OrderCommand::ClaimShipment {
            sub_order_id: order.sub_orders[0].id,
            requested_at: Utc::now(),
        });
        assert!(matches!(result, Err(OrderError::PickupNotShippable)));
    }
}
