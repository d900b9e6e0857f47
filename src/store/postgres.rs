use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::domain::core::EventEnvelope;
use crate::domain::order::*;
use super::{
    CallbackReceipt, DeliveredSubOrder, OrderStore, SaveOutcome, StoreError, VendorBalance, VendorStore,
};

/// Applied in order on every start; each script is idempotent.
const MIGRATIONS: [&str; 2] = [
    include_str!("../../migrations/0001_init.sql"),
    include_str!("../../migrations/0002_payment_attempts.sql"),
];

/// PostgreSQL-backed store. Orders, sub-orders, lines and events are written
/// in one transaction per command.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(skip_all)]
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await?;

        info!("PostgreSQL pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for script in MIGRATIONS {
            sqlx::raw_sql(script).execute(&self.pool).await?;
        }
        info!("Schema applied");
        Ok(())
    }

    async fn load_by(&self, sql: &str, key: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(sql).bind(key).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => self.load_order(row.try_get("id")?).await,
            None => Ok(None),
        }
    }

    async fn load_sub_orders(&self, order_id: Uuid) -> Result<Vec<SubOrder>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, order_id, vendor_id, product_total, delivery_charge, payable_amount,
                      delivery_method, total_weight_kg, courier_name, parcel_id, tracking_code,
                      shipment_requested_at, status, updated_at
               FROM sub_orders
               WHERE order_id = $1
               ORDER BY position"#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        let line_rows = sqlx::query(
            r#"SELECT l.sub_order_id, l.product_id, l.size, l.color, l.unit_price, l.discount_price,
                      l.quantity, l.line_total, l.weight_kg
               FROM order_lines l
               JOIN sub_orders s ON s.id = l.sub_order_id
               WHERE s.order_id = $1
               ORDER BY l.sub_order_id, l.position"#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        let mut lines: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for row in &line_rows {
            let sub_order_id: Uuid = row.try_get("sub_order_id")?;
            lines.entry(sub_order_id).or_default().push(map_line(row)?);
        }

        rows.iter()
            .map(|row| -> Result<SubOrder, StoreError> {
                let mut sub = map_sub_order(row)?;
                sub.lines = lines.remove(&sub.id).unwrap_or_default();
                Ok(sub)
            })
            .collect()
    }
}

fn parse<T: std::str::FromStr>(entity: &'static str, id: &impl ToString, raw: String) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn map_order(row: &PgRow, sub_orders: Vec<SubOrder>) -> Result<Order, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let shipping: serde_json::Value = row.try_get("shipping")?;

    Ok(Order {
        id,
        version: row.try_get("version")?,
        buyer_id: row.try_get("buyer_id")?,
        shipping: serde_json::from_value(shipping)?,
        delivery_method: parse("order", &id, row.try_get("delivery_method")?)?,
        subtotal: row.try_get("subtotal")?,
        delivery_charge: row.try_get("delivery_charge")?,
        total_amount: row.try_get("total_amount")?,
        payment_method: parse("order", &id, row.try_get("payment_method")?)?,
        payment_status: parse("order", &id, row.try_get("payment_status")?)?,
        transaction_id: row.try_get("transaction_id")?,
        previous_transaction_ids: row.try_get("previous_transaction_ids")?,
        status: parse("order", &id, row.try_get("status")?)?,
        sub_orders,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_sub_order(row: &PgRow) -> Result<SubOrder, StoreError> {
    let id: Uuid = row.try_get("id")?;

    Ok(SubOrder {
        id,
        order_id: row.try_get("order_id")?,
        vendor_id: row.try_get("vendor_id")?,
        lines: Vec::new(),
        product_total: row.try_get("product_total")?,
        delivery_charge: row.try_get("delivery_charge")?,
        payable_amount: row.try_get("payable_amount")?,
        delivery_method: parse("sub_order", &id, row.try_get("delivery_method")?)?,
        total_weight_kg: row.try_get("total_weight_kg")?,
        courier_name: row.try_get("courier_name")?,
        parcel_id: row.try_get("parcel_id")?,
        tracking_code: row.try_get("tracking_code")?,
        shipment_requested_at: row.try_get("shipment_requested_at")?,
        status: parse("sub_order", &id, row.try_get("status")?)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_line(row: &PgRow) -> Result<OrderLine, StoreError> {
    Ok(OrderLine {
        product_id: row.try_get("product_id")?,
        size: row.try_get("size")?,
        color: row.try_get("color")?,
        unit_price: row.try_get("unit_price")?,
        discount_price: row.try_get("discount_price")?,
        quantity: row.try_get("quantity")?,
        line_total: row.try_get("line_total")?,
        weight_kg: row.try_get("weight_kg")?,
    })
}

fn map_vendor(row: &PgRow) -> Result<Vendor, StoreError> {
    Ok(Vendor {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        commission_rate: row.try_get("commission_rate")?,
        active: row.try_get("active")?,
    })
}

fn map_duplicate(e: sqlx::Error, entity: &'static str, key: String) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate { entity, key },
        _ => StoreError::Database(e),
    }
}

async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[EventEnvelope<OrderEvent>],
) -> Result<(), StoreError> {
    for (position, envelope) in events.iter().enumerate() {
        sqlx::query(
            r#"INSERT INTO order_events
               (event_id, order_id, sequence_number, position, event_type, event_data,
                correlation_id, actor, metadata, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(envelope.event_id)
        .bind(envelope.aggregate_id)
        .bind(envelope.sequence_number)
        .bind(position as i32)
        .bind(&envelope.event_type)
        .bind(serde_json::to_value(&envelope.event_data)?)
        .bind(envelope.correlation_id)
        .bind(&envelope.actor)
        .bind(serde_json::to_value(&envelope.metadata)?)
        .bind(envelope.timestamp)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl OrderStore for PgStore {
    #[instrument(skip_all, fields(order_id = %order.id))]
    async fn insert_order(&self, order: &Order, events: &[EventEnvelope<OrderEvent>]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO orders
               (id, version, buyer_id, shipping, delivery_method, subtotal, delivery_charge,
                total_amount, payment_method, payment_status, transaction_id,
                previous_transaction_ids, status, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(order.id)
        .bind(order.version)
        .bind(order.buyer_id)
        .bind(serde_json::to_value(&order.shipping)?)
        .bind(order.delivery_method.as_str())
        .bind(order.subtotal)
        .bind(order.delivery_charge)
        .bind(order.total_amount)
        .bind(order.payment_method.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.transaction_id)
        .bind(&order.previous_transaction_ids)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_duplicate(e, "order", order.id.to_string()))?;

        for (position, sub) in order.sub_orders.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO sub_orders
                   (id, order_id, position, vendor_id, product_total, delivery_charge,
                    payable_amount, delivery_method, total_weight_kg, courier_name, parcel_id,
                    tracking_code, shipment_requested_at, status, updated_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
            )
            .bind(sub.id)
            .bind(order.id)
            .bind(position as i32)
            .bind(sub.vendor_id)
            .bind(sub.product_total)
            .bind(sub.delivery_charge)
            .bind(sub.payable_amount)
            .bind(sub.delivery_method.as_str())
            .bind(sub.total_weight_kg)
            .bind(&sub.courier_name)
            .bind(&sub.parcel_id)
            .bind(&sub.tracking_code)
            .bind(sub.shipment_requested_at)
            .bind(sub.status.as_str())
            .bind(sub.updated_at)
            .execute(&mut *tx)
            .await?;

            for (line_position, line) in sub.lines.iter().enumerate() {
                sqlx::query(
                    r#"INSERT INTO order_lines
                       (sub_order_id, position, product_id, size, color, unit_price,
                        discount_price, quantity, line_total, weight_kg)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
                )
                .bind(sub.id)
                .bind(line_position as i32)
                .bind(line.product_id)
                .bind(&line.size)
                .bind(&line.color)
                .bind(line.unit_price)
                .bind(line.discount_price)
                .bind(line.quantity)
                .bind(line.line_total)
                .bind(line.weight_kg)
                .execute(&mut *tx)
                .await?;
            }
        }

        insert_events(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, version, buyer_id, shipping, delivery_method, subtotal, delivery_charge,
                      total_amount, payment_method, payment_status, transaction_id,
                      previous_transaction_ids, status, created_at, updated_at
               FROM orders
               WHERE id = $1"#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sub_orders = self.load_sub_orders(order_id).await?;
        Ok(Some(map_order(&row, sub_orders)?))
    }

    async fn find_by_transaction(&self, transaction_id: &str) -> Result<Option<Order>, StoreError> {
        self.load_by(
            "SELECT id FROM orders WHERE transaction_id = $1 OR $1 = ANY(previous_transaction_ids)",
            transaction_id,
        )
        .await
    }

    async fn find_by_sub_order(&self, sub_order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT order_id FROM sub_orders WHERE id = $1")
            .bind(sub_order_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.load_order(row.try_get("order_id")?).await,
            None => Ok(None),
        }
    }

    async fn find_by_tracking_code(&self, tracking_code: &str) -> Result<Option<Order>, StoreError> {
        self.load_by(
            "SELECT order_id AS id FROM sub_orders WHERE tracking_code = $1 LIMIT 1",
            tracking_code,
        )
        .await
    }

    async fn find_by_parcel_id(&self, parcel_id: &str) -> Result<Option<Order>, StoreError> {
        self.load_by("SELECT order_id AS id FROM sub_orders WHERE parcel_id = $1", parcel_id).await
    }

    #[instrument(skip_all, fields(order_id = %order.id, expected_version))]
    async fn save_order(
        &self,
        order: &Order,
        expected_version: i64,
        events: &[EventEnvelope<OrderEvent>],
    ) -> Result<SaveOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE orders
               SET version = $3, payment_status = $4, transaction_id = $5, status = $6,
                   updated_at = $7, previous_transaction_ids = $8
               WHERE id = $1 AND version = $2"#,
        )
        .bind(order.id)
        .bind(expected_version)
        .bind(order.version)
        .bind(order.payment_status.as_str())
        .bind(&order.transaction_id)
        .bind(order.status.as_str())
        .bind(order.updated_at)
        .bind(&order.previous_transaction_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_duplicate(e, "transaction", order.transaction_id.clone().unwrap_or_default()))?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SaveOutcome::VersionConflict);
        }

        for sub in &order.sub_orders {
            sqlx::query(
                r#"UPDATE sub_orders
                   SET courier_name = $2, parcel_id = $3, tracking_code = $4,
                       shipment_requested_at = $5, status = $6, updated_at = $7
                   WHERE id = $1"#,
            )
            .bind(sub.id)
            .bind(&sub.courier_name)
            .bind(&sub.parcel_id)
            .bind(&sub.tracking_code)
            .bind(sub.shipment_requested_at)
            .bind(sub.status.as_str())
            .bind(sub.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_duplicate(e, "parcel", sub.parcel_id.clone().unwrap_or_default()))?;
        }

        insert_events(&mut tx, events).await?;
        tx.commit().await?;
        Ok(SaveOutcome::Saved)
    }

    async fn load_events(&self, order_id: Uuid) -> Result<Vec<EventEnvelope<OrderEvent>>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT event_id, order_id, sequence_number, event_type, event_data, correlation_id,
                      actor, metadata, created_at
               FROM order_events
               WHERE order_id = $1
               ORDER BY sequence_number, position"#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<EventEnvelope<OrderEvent>, StoreError> {
                let event_data: serde_json::Value = row.try_get("event_data")?;
                let metadata: serde_json::Value = row.try_get("metadata")?;
                Ok(EventEnvelope {
                    event_id: row.try_get("event_id")?,
                    aggregate_id: row.try_get("order_id")?,
                    sequence_number: row.try_get("sequence_number")?,
                    event_type: row.try_get("event_type")?,
                    event_data: serde_json::from_value(event_data)?,
                    correlation_id: row.try_get("correlation_id")?,
                    actor: row.try_get("actor")?,
                    timestamp: row.try_get("created_at")?,
                    metadata: serde_json::from_value(metadata)?,
                })
            })
            .collect()
    }

    async fn record_callback(&self, receipt: &CallbackReceipt) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO payment_callback_receipts
               (id, transaction_id, source, verdict, signature, received_at, processed)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(receipt.id)
        .bind(&receipt.transaction_id)
        .bind(receipt.source.as_str())
        .bind(&receipt.verdict)
        .bind(&receipt.signature)
        .bind(receipt.received_at)
        .bind(receipt.processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delivered_sub_orders(&self) -> Result<Vec<DeliveredSubOrder>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT s.id, s.order_id, s.vendor_id, s.payable_amount, v.commission_rate
               FROM sub_orders s
               LEFT JOIN vendors v ON v.id = s.vendor_id
               WHERE s.status = $1"#,
        )
        .bind(SubOrderStatus::Delivered.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeliveredSubOrder, StoreError> {
                Ok(DeliveredSubOrder {
                    sub_order_id: row.try_get("id")?,
                    order_id: row.try_get("order_id")?,
                    vendor_id: row.try_get("vendor_id")?,
                    payable_amount: row.try_get("payable_amount")?,
                    commission_rate: row.try_get("commission_rate")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VendorStore for PgStore {
    async fn upsert_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO vendors (id, name, commission_rate, active)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name, commission_rate = EXCLUDED.commission_rate,
                   active = EXCLUDED.active"#,
        )
        .bind(vendor.id)
        .bind(&vendor.name)
        .bind(vendor.commission_rate)
        .bind(vendor.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_vendors(&self, vendor_ids: &[Uuid]) -> Result<HashMap<Uuid, Vendor>, StoreError> {
        let rows = sqlx::query("SELECT id, name, commission_rate, active FROM vendors WHERE id = ANY($1)")
            .bind(vendor_ids)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| map_vendor(row).map(|v| (v.id, v)))
            .collect()
    }

    #[instrument(skip_all, fields(vendors = balances.len()))]
    async fn replace_balances(&self, balances: &[VendorBalance]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for balance in balances {
            sqlx::query(
                r#"UPDATE vendors
                   SET total_earned = $2, available_balance = $3, balance_updated_at = $4
                   WHERE id = $1"#,
            )
            .bind(balance.vendor_id)
            .bind(balance.total_earned)
            .bind(balance.available_balance)
            .bind(balance.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn balance(&self, vendor_id: Uuid) -> Result<Option<VendorBalance>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, total_earned, available_balance, balance_updated_at
               FROM vendors
               WHERE id = $1 AND balance_updated_at IS NOT NULL"#,
        )
        .bind(vendor_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<VendorBalance, StoreError> {
            Ok(VendorBalance {
                vendor_id: row.try_get("id")?,
                total_earned: row.try_get("total_earned")?,
                available_balance: row.try_get("available_balance")?,
                updated_at: row.try_get("balance_updated_at")?,
            })
        })
        .transpose()
    }
}
