// ============================================================================
// HTTP API
// ============================================================================
//
// Thin actix-web layer over the services. Handlers translate requests into
// service calls and service errors into `AppError` responses; gateway browser
// redirects always end in a 302/303 to a buyer-facing page.
//
// ============================================================================

pub mod handlers;

use std::sync::Arc;

use actix_web::{web, App, HttpServer};

use crate::config::ServerConfig;
use crate::domain::balance::ReconciliationService;
use crate::domain::courier::CourierService;
use crate::domain::order::OrderCommandHandler;
use crate::domain::payment::PaymentService;

/// Services shared by every worker.
#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderCommandHandler>,
    pub payments: Arc<PaymentService>,
    pub couriers: Arc<CourierService>,
    pub reconciliation: Arc<ReconciliationService>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    use handlers::*;

    cfg.service(
        web::scope("/api")
            .route("/orders", web::post().to(create_order))
            .route("/orders/{id}", web::get().to(get_order))
            .route("/orders/{id}/events", web::get().to(get_order_events))
            .route("/orders/{id}/status", web::post().to(change_order_status))
            .route("/orders/{id}/refund", web::post().to(refund_order))
            .route("/sub-orders/{id}/status", web::post().to(change_sub_order_status))
            .route("/sub-orders/{id}/shipment", web::post().to(create_shipment))
            .route("/sub-orders/{id}/shipment/release", web::post().to(release_shipment_claim))
            .route("/sub-orders/{id}/tracking/sync", web::post().to(sync_tracking))
            .route("/tracking", web::get().to(tracking))
            .route("/courier/webhook", web::post().to(courier_webhook))
            .route("/payments/initiate", web::post().to(initiate_payment))
            .route("/payments/ipn", web::post().to(payment_ipn))
            .route("/payments/success/{tran_id}", web::get().to(payment_success_get))
            .route("/payments/success/{tran_id}", web::post().to(payment_success_post))
            .route("/payments/fail/{tran_id}", web::route().to(payment_fail))
            .route("/payments/cancel/{tran_id}", web::route().to(payment_cancel))
            .route("/admin/balances/reconcile", web::post().to(reconcile_balances)),
    );
}

pub async fn start_api_server(state: AppState, config: &ServerConfig) -> std::io::Result<()> {
    tracing::info!(host = %config.host, port = config.port, "Starting API server");

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }

    server.bind((config.host.as_str(), config.port))?.run().await
}
