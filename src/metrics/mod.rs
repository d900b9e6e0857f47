mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::utils::CircuitState;

pub use server::start_metrics_server;

// ============================================================================
// Metrics - Prometheus metrics for the order core
// ============================================================================
//
// - Orders created and command conflicts
// - Payment callbacks (by source and outcome) and payment transitions
// - Courier calls (count and latency)
// - Reconciliation runs
// - Circuit breaker state per dependency
//
// Owned by the application and handed to each service; scraped via /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    pub orders_created: IntCounter,
    pub order_conflict_retries: IntCounter,

    pub payment_callbacks: IntCounterVec,
    pub payment_transitions: IntCounterVec,

    pub courier_requests: IntCounterVec,
    pub courier_request_duration: HistogramVec,

    pub reconciliation_runs: IntCounterVec,
    pub vendors_credited: IntGauge,

    pub circuit_breaker_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_created = IntCounter::new("orders_created_total", "Orders accepted at checkout")?;
        registry.register(Box::new(orders_created.clone()))?;

        let order_conflict_retries = IntCounter::new(
            "order_conflict_retries_total",
            "Commands re-run after losing a concurrent write",
        )?;
        registry.register(Box::new(order_conflict_retries.clone()))?;

        let payment_callbacks = IntCounterVec::new(
            Opts::new("payment_callbacks_total", "Gateway callbacks received"),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(payment_callbacks.clone()))?;

        let payment_transitions = IntCounterVec::new(
            Opts::new("payment_transitions_total", "Payment status transitions applied"),
            &["to"],
        )?;
        registry.register(Box::new(payment_transitions.clone()))?;

        let courier_requests = IntCounterVec::new(
            Opts::new("courier_requests_total", "Courier API calls"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(courier_requests.clone()))?;

        let courier_request_duration = HistogramVec::new(
            HistogramOpts::new("courier_request_duration_seconds", "Courier API call latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["operation"],
        )?;
        registry.register(Box::new(courier_request_duration.clone()))?;

        let reconciliation_runs = IntCounterVec::new(
            Opts::new("reconciliation_runs_total", "Balance reconciliation runs"),
            &["outcome"],
        )?;
        registry.register(Box::new(reconciliation_runs.clone()))?;

        let vendors_credited = IntGauge::new(
            "reconciliation_vendors_credited",
            "Vendors whose balances were rewritten by the last run",
        )?;
        registry.register(Box::new(vendors_credited.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "Circuit state (0=Closed, 1=HalfOpen, 2=Open)"),
            &["dependency"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            orders_created,
            order_conflict_retries,
            payment_callbacks,
            payment_transitions,
            courier_requests,
            courier_request_duration,
            reconciliation_runs,
            vendors_credited,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_callback(&self, source: &str, outcome: &str) {
        self.payment_callbacks.with_label_values(&[source, outcome]).inc();
    }

    pub fn record_payment_transition(&self, to: &str) {
        self.payment_transitions.with_label_values(&[to]).inc();
    }

    pub fn record_courier_call(&self, operation: &str, duration_secs: f64, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.courier_requests.with_label_values(&[operation, outcome]).inc();
        self.courier_request_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn record_reconciliation(&self, vendors: usize, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.reconciliation_runs.with_label_values(&[outcome]).inc();
        if success {
            self.vendors_credited.set(vendors as i64);
        }
    }

    pub fn update_circuit_breaker_state(&self, dependency: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[dependency])
            .set(state.as_gauge());
    }
}
