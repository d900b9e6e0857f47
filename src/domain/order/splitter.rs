use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::aggregate::{Order, SubOrder};
use super::commands::{NewOrderLine, PlaceOrder};
use super::delivery::DeliveryRateTable;
use super::errors::OrderError;
use super::value_objects::*;

// ============================================================================
// Vendor Order Splitter
// ============================================================================
//
// Cart lines → one SubOrder per vendor (first appearance order preserved)
//            → parent Order whose total is the sum of sub-order payables.
//
// The total is computed a second time from the raw lines; a disagreement is
// a construction error and nothing is persisted.
//
// ============================================================================

pub fn validate_shipping(shipping: &ShippingAddress) -> Result<(), OrderError> {
    let required = [
        ("name", &shipping.name),
        ("phone", &shipping.phone),
        ("address", &shipping.address),
        ("city", &shipping.city),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(OrderError::MissingShippingField(field));
        }
    }
    Ok(())
}

fn validate_line(line: &NewOrderLine) -> Result<(), OrderError> {
    if line.quantity <= 0 {
        return Err(OrderError::InvalidQuantity(line.quantity));
    }
    if line.unit_price < Decimal::ZERO {
        return Err(OrderError::InvalidPrice {
            product_id: line.product_id,
            reason: "unit price is negative",
        });
    }
    if let Some(discount) = line.discount_price {
        if discount < Decimal::ZERO {
            return Err(OrderError::InvalidPrice {
                product_id: line.product_id,
                reason: "discount price is negative",
            });
        }
        if discount > line.unit_price {
            return Err(OrderError::InvalidPrice {
                product_id: line.product_id,
                reason: "discount price exceeds unit price",
            });
        }
    }
    if matches!(line.weight_kg, Some(w) if w < Decimal::ZERO) {
        return Err(OrderError::InvalidWeight(line.product_id));
    }
    Ok(())
}

fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal, OrderError> {
    a.checked_mul(b).ok_or(OrderError::AmountOutOfRange)
}

fn checked_sum(values: impl IntoIterator<Item = Decimal>) -> Result<Decimal, OrderError> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v).ok_or(OrderError::AmountOutOfRange))
}

fn snapshot_line(line: &NewOrderLine) -> Result<OrderLine, OrderError> {
    let mut snapshot = OrderLine {
        product_id: line.product_id,
        size: line.size.clone(),
        color: line.color.clone(),
        unit_price: line.unit_price,
        discount_price: line.discount_price,
        quantity: line.quantity,
        line_total: Decimal::ZERO,
        weight_kg: line.weight_kg.unwrap_or(Decimal::ZERO),
    };
    snapshot.line_total = checked_mul(snapshot.effective_price(), Decimal::from(line.quantity))?;
    Ok(snapshot)
}

/// Build the Order and its SubOrders from a checkout request.
///
/// `vendors` must contain every vendor referenced by the cart; unknown or
/// inactive vendors reject the whole request.
pub fn split_order(
    request: &PlaceOrder,
    vendors: &HashMap<Uuid, Vendor>,
    rates: &dyn DeliveryRateTable,
) -> Result<Order, OrderError> {
    validate_shipping(&request.shipping)?;
    if request.lines.is_empty() {
        return Err(OrderError::EmptyItems);
    }

    // Stable grouping: vendor order follows first appearance in the cart
    let mut groups: Vec<(Uuid, Vec<&NewOrderLine>)> = Vec::new();
    for line in &request.lines {
        validate_line(line)?;
        match vendors.get(&line.vendor_id) {
            None => return Err(OrderError::UnknownVendor(line.vendor_id)),
            Some(vendor) if !vendor.active => return Err(OrderError::InactiveVendor(vendor.id)),
            Some(_) => {}
        }
        match groups.iter_mut().find(|(vendor_id, _)| *vendor_id == line.vendor_id) {
            Some((_, lines)) => lines.push(line),
            None => groups.push((line.vendor_id, vec![line])),
        }
    }

    let order_id = Uuid::now_v7();
    let now = Utc::now();
    let mut sub_orders = Vec::with_capacity(groups.len());

    for (vendor_id, lines) in groups {
        if lines.is_empty() {
            return Err(OrderError::EmptyVendorGroup(vendor_id));
        }

        let lines = lines.into_iter().map(snapshot_line).collect::<Result<Vec<_>, _>>()?;
        let product_total = checked_sum(lines.iter().map(|l| l.line_total))?;
        let total_weight_kg = checked_sum(
            lines
                .iter()
                .map(|l| checked_mul(l.weight_kg, Decimal::from(l.quantity)))
                .collect::<Result<Vec<_>, _>>()?,
        )?;
        let delivery_charge = rates.charge(total_weight_kg, &request.shipping, request.delivery_method)?;
        let payable_amount = checked_sum([product_total, delivery_charge])?;

        sub_orders.push(SubOrder {
            id: Uuid::now_v7(),
            order_id,
            vendor_id,
            lines,
            product_total,
            delivery_charge,
            payable_amount,
            delivery_method: request.delivery_method,
            total_weight_kg,
            courier_name: None,
            parcel_id: None,
            tracking_code: None,
            shipment_requested_at: None,
            status: SubOrderStatus::Pending,
            updated_at: now,
        });
    }

    let subtotal = checked_sum(sub_orders.iter().map(|s| s.product_total))?;
    let delivery_charge = checked_sum(sub_orders.iter().map(|s| s.delivery_charge))?;
    let total_amount = checked_sum(sub_orders.iter().map(|s| s.payable_amount))?;

    // Independent recomputation straight from the request lines
    let line_totals = request
        .lines
        .iter()
        .map(|l| checked_mul(l.discount_price.unwrap_or(l.unit_price), Decimal::from(l.quantity)))
        .collect::<Result<Vec<_>, _>>()?;
    let line_sum = checked_sum(line_totals.into_iter().chain([delivery_charge]))?;
    if line_sum != total_amount {
        return Err(OrderError::TotalMismatch { sub_order_sum: total_amount, line_sum });
    }

    let order = Order {
        id: order_id,
        version: 0,
        buyer_id: request.buyer_id,
        shipping: request.shipping.clone(),
        delivery_method: request.delivery_method,
        subtotal,
        delivery_charge,
        total_amount,
        payment_method: request.payment_method,
        payment_status: PaymentStatus::Pending,
        transaction_id: None,
        previous_transaction_ids: Vec::new(),
        status: OrderStatus::Pending,
        sub_orders,
        created_at: now,
        updated_at: now,
    };
    order.check_totals()?;

    Ok(order)
}
