use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::core::EventEnvelope;
use crate::domain::order::{Order, OrderEvent, SubOrderStatus, Vendor};
use super::*;

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    events: HashMap<Uuid, Vec<EventEnvelope<OrderEvent>>>,
    receipts: Vec<CallbackReceipt>,
    vendors: HashMap<Uuid, Vendor>,
    balances: HashMap<Uuid, VendorBalance>,
}

impl State {
    fn transaction_taken(&self, order: &Order) -> bool {
        match &order.transaction_id {
            Some(tran_id) => self
                .orders
                .values()
                .any(|o| o.id != order.id && o.transaction_id.as_deref() == Some(tran_id.as_str())),
            None => false,
        }
    }

    fn find(&self, predicate: impl Fn(&Order) -> bool) -> Option<Order> {
        self.orders.values().find(|o| predicate(o)).cloned()
    }
}

/// Process-local store for tests and database-less development runs.
///
/// All collections sit behind one lock so each write is atomic; no await
/// happens while it is held.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn callback_receipts(&self, transaction_id: &str) -> Vec<CallbackReceipt> {
        let state = self.state.read().await;
        state
            .receipts
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &Order, events: &[EventEnvelope<OrderEvent>]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate { entity: "order", key: order.id.to_string() });
        }
        if state.transaction_taken(order) {
            return Err(StoreError::Duplicate {
                entity: "transaction",
                key: order.transaction_id.clone().unwrap_or_default(),
            });
        }
        state.orders.insert(order.id, order.clone());
        state.events.insert(order.id, events.to_vec());
        Ok(())
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn find_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state.find(|o| {
            o.transaction_id.as_deref() == Some(transaction_id)
                || o.previous_transaction_ids.iter().any(|t| t == transaction_id)
        }))
    }

    async fn find_by_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state.find(|o| o.sub_orders.iter().any(|s| s.id == sub_order_id)))
    }

    async fn find_by_tracking_code(&self, tracking_code: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state.find(|o| {
            o.sub_orders
                .iter()
                .any(|s| s.tracking_code.as_deref() == Some(tracking_code))
        }))
    }

    async fn find_by_parcel_id(&self, parcel_id: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.read().await;
        Ok(state.find(|o| o.sub_orders.iter().any(|s| s.parcel_id.as_deref() == Some(parcel_id))))
    }

    async fn save_order(
        &self,
        order: &Order,
        expected_version: i64,
        events: &[EventEnvelope<OrderEvent>],
    ) -> Result<SaveOutcome, StoreError> {
        let mut state = self.state.write().await;
        match state.orders.get(&order.id) {
            Some(current) if current.version == expected_version => {}
            Some(_) | None => return Ok(SaveOutcome::VersionConflict),
        }
        if state.transaction_taken(order) {
            return Err(StoreError::Duplicate {
                entity: "transaction",
                key: order.transaction_id.clone().unwrap_or_default(),
            });
        }

        state.orders.insert(order.id, order.clone());
        state.events.entry(order.id).or_default().extend_from_slice(events);
        Ok(SaveOutcome::Saved)
    }

    async fn load_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError> {
        Ok(self.state.read().await.events.get(&order_id).cloned().unwrap_or_default())
    }

    async fn record_callback(&self, receipt: &CallbackReceipt) -> Result<(), StoreError> {
        self.state.write().await.receipts.push(receipt.clone());
        Ok(())
    }

    async fn delivered_sub_orders(&self) -> Result<Vec<DeliveredSubOrder>, StoreError> {
        let state = self.state.read().await;
        let rows = state
            .orders
            .values()
            .flat_map(|o| o.sub_orders.iter())
            .filter(|s| s.status == SubOrderStatus::Delivered)
            .map(|s| DeliveredSubOrder {
                sub_order_id: s.id,
                order_id: s.order_id,
                vendor_id: s.vendor_id,
                payable_amount: s.payable_amount,
                commission_rate: state.vendors.get(&s.vendor_id).map(|v| v.commission_rate),
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl VendorStore for MemoryStore {
    async fn upsert_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        self.state.write().await.vendors.insert(vendor.id, vendor.clone());
        Ok(())
    }

    async fn find_vendors(&self, vendor_ids: &[Uuid]) -> Result<HashMap<Uuid, Vendor>, StoreError> {
        let state = self.state.read().await;
        Ok(vendor_ids
            .iter()
            .filter_map(|id| state.vendors.get(id).map(|v| (*id, v.clone())))
            .collect())
    }

    async fn replace_balances(&self, balances: &[VendorBalance]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for balance in balances {
            state.balances.insert(balance.vendor_id, balance.clone());
        }
        Ok(())
    }

    async fn balance(&self, vendor_id: Uuid) -> Result<Option<VendorBalance>, StoreError> {
        Ok(self.state.read().await.balances.get(&vendor_id).cloned())
    }
}
