use chrono::{DateTime, Duration, Utc};

use super::value_objects::{OrderStatus, SubOrderStatus};

// ============================================================================
// Order State Machine
// ============================================================================
//
// Order:     Pending → Processing → Partially Shipped → Shipped → Delivered
//            Pending | Processing → Cancelled
//            Partially Shipped | Shipped | Delivered → Return Request → Returned
//
// Sub-Order: Pending → Accepted → Processing → Shipped → Delivered
//            any non-terminal → Cancelled
//            any non-terminal | Delivered → Return Requested → Returned
//
// Forward moves along the main chain may skip steps. Backward moves are
// rejected for direct requests. Once an order is Processing its status
// mirrors the sub-order set and may step back along the chain.
//
// ============================================================================

impl OrderStatus {
    fn chain_rank(&self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Processing => Some(1),
            OrderStatus::PartiallyShipped => Some(2),
            OrderStatus::Shipped => Some(3),
            OrderStatus::Delivered => Some(4),
            OrderStatus::Cancelled | OrderStatus::ReturnRequest | OrderStatus::Returned => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Returned)
    }

    /// Sub-orders of an order in this state are frozen.
    pub fn freezes_sub_orders(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Returned)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        if *self == next {
            return false;
        }

        match (self, next) {
            (Pending | Processing, Cancelled) => true,
            (PartiallyShipped | Shipped | Delivered, ReturnRequest) => true,
            (ReturnRequest, Returned) => true,
            _ => match (self.chain_rank(), next.chain_rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }

    /// New parent status implied by `statuses`, or `None` when it stays put.
    ///
    /// From Processing on, the parent is a function of the sub-order set, so
    /// the same set gives the same parent whatever order the moves came in.
    /// A pending parent waits on payment or confirmation and only takes legal
    /// moves. Cancelled and returned orders are closed.
    pub fn follow_sub_orders(&self, statuses: &[SubOrderStatus]) -> Option<OrderStatus> {
        use OrderStatus::*;

        let target = match (self, derive_order_status(statuses)) {
            (Cancelled | Returned, _) => return None,
            (Pending, derived) => derived.filter(|d| self.can_transition_to(*d))?,
            (_, Some(derived)) => derived,
            // Nothing live has left the vendor yet
            (_, None) => Processing,
        };
        (target != *self).then_some(target)
    }
}

/// How long a shipment claim blocks other work on its sub-order.
pub const SHIPMENT_CLAIM_TTL_MINUTES: i64 = 10;

/// Whether a claim taken at `claimed_at` has lapsed by `now`.
pub fn claim_expired(claimed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - claimed_at >= Duration::minutes(SHIPMENT_CLAIM_TTL_MINUTES)
}

impl SubOrderStatus {
    fn chain_rank(&self) -> Option<u8> {
        match self {
            SubOrderStatus::Pending => Some(0),
            SubOrderStatus::Accepted => Some(1),
            SubOrderStatus::Processing => Some(2),
            SubOrderStatus::Shipped => Some(3),
            SubOrderStatus::Delivered => Some(4),
            SubOrderStatus::Cancelled
            | SubOrderStatus::ReturnRequested
            | SubOrderStatus::Returned => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubOrderStatus::Delivered | SubOrderStatus::Cancelled | SubOrderStatus::Returned
        )
    }

    /// Whether reaching this state means the vendor is actively fulfilling.
    pub fn requires_processing_parent(&self) -> bool {
        matches!(self.chain_rank(), Some(rank) if rank >= 2)
    }

    pub fn can_transition_to(&self, next: SubOrderStatus) -> bool {
        use SubOrderStatus::*;

        if *self == next {
            return false;
        }

        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (from, ReturnRequested) => !from.is_terminal() || *from == Delivered,
            (ReturnRequested, Returned) => true,
            _ => match (self.chain_rank(), next.chain_rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

/// Derive the parent order status from its sub-orders.
///
/// Returns `None` while every live sub-order is still pre-shipment; in that
/// phase the parent is driven by payment and administrative confirmation.
/// Only set membership is inspected, so the result does not depend on the
/// order of `statuses`.
pub fn derive_order_status(statuses: &[SubOrderStatus]) -> Option<OrderStatus> {
    use SubOrderStatus::*;

    if statuses.is_empty() {
        return None;
    }

    let live: Vec<SubOrderStatus> = statuses.iter().copied().filter(|s| *s != Cancelled).collect();
    if live.is_empty() {
        return Some(OrderStatus::Cancelled);
    }
    if live.iter().all(|s| *s == Returned) {
        return Some(OrderStatus::Returned);
    }
    if live.contains(&ReturnRequested) {
        return Some(OrderStatus::ReturnRequest);
    }

    // Returned sub-orders are closed; the remainder decides.
    let open: Vec<SubOrderStatus> = live.into_iter().filter(|s| *s != Returned).collect();

    if open.iter().all(|s| *s == Delivered) {
        Some(OrderStatus::Delivered)
    } else if open.iter().all(|s| *s == Shipped) {
        Some(OrderStatus::Shipped)
    } else if open.iter().any(|s| matches!(s, Shipped | Delivered)) {
        Some(OrderStatus::PartiallyShipped)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubOrderStatus as S;

    #[test]
    fn test_order_main_chain_moves_forward_only() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::PartiallyShipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Processing));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Processing.can_transition_to(OrderStatus::Processing));
    }

    #[test]
    fn test_order_side_branches() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Delivered.can_transition_to(OrderStatus::ReturnRequest));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::ReturnRequest));
        assert!(!OrderStatus::Processing.can_transition_to(OrderStatus::ReturnRequest));
        assert!(OrderStatus::ReturnRequest.can_transition_to(OrderStatus::Returned));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Processing));
        assert!(!OrderStatus::Returned.can_transition_to(OrderStatus::Delivered));
    }

    #[test]
    fn test_sub_order_transitions() {
        assert!(S::Pending.can_transition_to(S::Accepted));
        assert!(S::Pending.can_transition_to(S::Processing));
        assert!(S::Shipped.can_transition_to(S::Cancelled));
        assert!(S::ReturnRequested.can_transition_to(S::Cancelled));
        assert!(S::Delivered.can_transition_to(S::ReturnRequested));
        assert!(S::ReturnRequested.can_transition_to(S::Returned));
        assert!(!S::Delivered.can_transition_to(S::Shipped));
        assert!(!S::Delivered.can_transition_to(S::Cancelled));
        assert!(!S::Cancelled.can_transition_to(S::Processing));
        assert!(!S::Returned.can_transition_to(S::ReturnRequested));
    }

    #[test]
    fn test_requires_processing_parent() {
        assert!(!S::Accepted.requires_processing_parent());
        assert!(S::Processing.requires_processing_parent());
        assert!(S::Delivered.requires_processing_parent());
    }

    #[test]
    fn test_derivation_rules() {
        assert_eq!(derive_order_status(&[S::Delivered, S::Delivered]), Some(OrderStatus::Delivered));
        assert_eq!(derive_order_status(&[S::Cancelled, S::Cancelled]), Some(OrderStatus::Cancelled));
        assert_eq!(derive_order_status(&[S::Shipped, S::Delivered]), Some(OrderStatus::PartiallyShipped));
        assert_eq!(derive_order_status(&[S::Shipped, S::Processing]), Some(OrderStatus::PartiallyShipped));
        assert_eq!(derive_order_status(&[S::Shipped, S::Shipped]), Some(OrderStatus::Shipped));
        assert_eq!(derive_order_status(&[S::Delivered, S::Cancelled]), Some(OrderStatus::Delivered));
        assert_eq!(derive_order_status(&[S::Returned, S::Returned]), Some(OrderStatus::Returned));
        assert_eq!(derive_order_status(&[S::ReturnRequested, S::Delivered]), Some(OrderStatus::ReturnRequest));
        assert_eq!(derive_order_status(&[S::Returned, S::Delivered]), Some(OrderStatus::Delivered));
        assert_eq!(derive_order_status(&[S::Pending, S::Processing]), None);
        assert_eq!(derive_order_status(&[]), None);
    }

    #[test]
    fn test_parent_follows_sub_order_set_in_both_directions() {
        use OrderStatus as O;

        assert_eq!(O::Shipped.follow_sub_orders(&[S::Delivered, S::Shipped]), Some(O::PartiallyShipped));
        assert_eq!(O::Processing.follow_sub_orders(&[S::Delivered, S::Shipped]), Some(O::PartiallyShipped));
        assert_eq!(O::PartiallyShipped.follow_sub_orders(&[S::Cancelled, S::Processing]), Some(O::Processing));
        assert_eq!(O::Processing.follow_sub_orders(&[S::Cancelled, S::Processing]), None);
        assert_eq!(O::ReturnRequest.follow_sub_orders(&[S::Cancelled, S::Delivered]), Some(O::Delivered));
        assert_eq!(O::Shipped.follow_sub_orders(&[S::Shipped, S::Shipped]), None);
    }

    #[test]
    fn test_pending_and_closed_parents_do_not_follow_freely() {
        use OrderStatus as O;

        assert_eq!(O::Pending.follow_sub_orders(&[S::Accepted, S::Pending]), None);
        assert_eq!(O::Pending.follow_sub_orders(&[S::Cancelled, S::Cancelled]), Some(O::Cancelled));
        assert_eq!(O::Cancelled.follow_sub_orders(&[S::Delivered, S::Delivered]), None);
        assert_eq!(O::Returned.follow_sub_orders(&[S::Shipped]), None);
    }

    #[test]
    fn test_parent_is_a_function_of_the_sub_order_set() {
        let all = [
            S::Pending, S::Accepted, S::Processing, S::Shipped,
            S::Delivered, S::Cancelled, S::ReturnRequested, S::Returned,
        ];
        let open_parents = [
            OrderStatus::Processing, OrderStatus::PartiallyShipped, OrderStatus::Shipped,
            OrderStatus::Delivered, OrderStatus::ReturnRequest,
        ];

        for a in all {
            for b in all {
                let set = [a, b];
                let landed: Vec<OrderStatus> = open_parents
                    .iter()
                    .map(|parent| parent.follow_sub_orders(&set).unwrap_or(*parent))
                    .collect();
                assert!(landed.windows(2).all(|w| w[0] == w[1]), "{:?} -> {:?}", set, landed);
            }
        }
    }

    #[test]
    fn test_claim_expiry() {
        let claimed = Utc::now();
        assert!(!claim_expired(claimed, claimed + Duration::minutes(SHIPMENT_CLAIM_TTL_MINUTES - 1)));
        assert!(claim_expired(claimed, claimed + Duration::minutes(SHIPMENT_CLAIM_TTL_MINUTES)));
    }

    fn permutations(items: &[SubOrderStatus]) -> Vec<Vec<SubOrderStatus>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                result.push(tail);
            }
        }
        result
    }

    #[test]
    fn test_derivation_ignores_evaluation_order() {
        let all = [
            S::Pending, S::Accepted, S::Processing, S::Shipped,
            S::Delivered, S::Cancelled, S::ReturnRequested, S::Returned,
        ];

        // Every multiset of three statuses, every ordering of it.
        for a in all {
            for b in all {
                for c in all {
                    let input = [a, b, c];
                    let expected = derive_order_status(&input);
                    for ordering in permutations(&input) {
                        assert_eq!(derive_order_status(&ordering), expected, "{:?}", ordering);
                    }
                }
            }
        }
    }
}
