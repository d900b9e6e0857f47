use serde::Serialize;

use crate::domain::order::SubOrderStatus;

/// Courier delivery state, reduced to what the sub-order cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "raw", rename_all = "snake_case")]
pub enum CourierState {
    InTransit,
    Delivered,
    Cancelled,
    Unrecognized(String),
}

impl CourierState {
    /// Map a raw courier status word.
    ///
    /// Approval-pending states are still with the courier, so they count as
    /// in transit until the courier settles them.
    pub fn from_courier(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "delivered" | "partial_delivered" => CourierState::Delivered,
            "cancelled" => CourierState::Cancelled,
            "pending" | "in_review" | "hold" => CourierState::InTransit,
            s if s.ends_with("_approval_pending") => CourierState::InTransit,
            _ => CourierState::Unrecognized(raw.to_string()),
        }
    }

    /// Sub-order status this state drives, if any.
    pub fn sub_order_target(&self) -> Option<SubOrderStatus> {
        match self {
            CourierState::Delivered => Some(SubOrderStatus::Delivered),
            CourierState::Cancelled => Some(SubOrderStatus::Cancelled),
            CourierState::InTransit | CourierState::Unrecognized(_) => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            CourierState::InTransit => "in_transit",
            CourierState::Delivered => "delivered",
            CourierState::Cancelled => "cancelled",
            CourierState::Unrecognized(_) => "unrecognized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_states_map_to_sub_order_statuses() {
        assert_eq!(CourierState::from_courier("delivered"), CourierState::Delivered);
        assert_eq!(CourierState::from_courier("Partial_Delivered"), CourierState::Delivered);
        assert_eq!(CourierState::from_courier("cancelled"), CourierState::Cancelled);
        assert_eq!(
            CourierState::from_courier("delivered").sub_order_target(),
            Some(SubOrderStatus::Delivered)
        );
    }

    #[test]
    fn test_pending_states_do_not_move_sub_order() {
        for raw in ["pending", "in_review", "hold", "delivered_approval_pending", "cancelled_approval_pending"] {
            let state = CourierState::from_courier(raw);
            assert_eq!(state, CourierState::InTransit, "{raw}");
            assert_eq!(state.sub_order_target(), None);
        }
    }

    #[test]
    fn test_unknown_state_is_kept_raw() {
        let state = CourierState::from_courier("lost_in_space");
        assert_eq!(state, CourierState::Unrecognized("lost_in_space".to_string()));
        assert_eq!(state.sub_order_target(), None);
        assert_eq!(state.label(), "unrecognized");
    }
}
