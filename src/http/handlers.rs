use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::courier::{CourierPush, TrackingQuery};
use crate::domain::order::{OrderCommand, OrderStatus, PlaceOrder, SubOrderStatus};
use crate::domain::payment::{CallbackForm, IpnOutcome, PaymentRedirect};
use crate::error::AppError;

use super::AppState;

type Result<T> = std::result::Result<T, AppError>;

/// Caller identity recorded on audit events; defaults per route.
fn actor<'a>(req: &'a HttpRequest, default: &'a str) -> &'a str {
    req.headers()
        .get("X-Actor")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

// ============================================================================
// Orders
// ============================================================================

#[derive(Debug, Serialize)]
struct CreatedOrder {
    order_id: Uuid,
    total_amount: Decimal,
    sub_orders: Vec<CreatedSubOrder>,
}

#[derive(Debug, Serialize)]
struct CreatedSubOrder {
    sub_order_id: Uuid,
    vendor_id: Uuid,
    product_total: Decimal,
    delivery_charge: Decimal,
    payable_amount: Decimal,
}

pub async fn create_order(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<PlaceOrder>,
) -> Result<HttpResponse> {
    let order = state.orders.place_order(body.into_inner(), actor(&req, "buyer")).await?;

    Ok(HttpResponse::Created().json(CreatedOrder {
        order_id: order.id,
        total_amount: order.total_amount,
        sub_orders: order
            .sub_orders
            .iter()
            .map(|s| CreatedSubOrder {
                sub_order_id: s.id,
                vendor_id: s.vendor_id,
                product_total: s.product_total,
                delivery_charge: s.delivery_charge,
                payable_amount: s.payable_amount,
            })
            .collect(),
    }))
}

pub async fn get_order(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let order = state.orders.load(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

pub async fn get_order_events(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let order_id = path.into_inner();
    // 404 for unknown orders rather than an empty list
    state.orders.load(order_id).await?;
    let events = state.orders.store().load_events(order_id).await?;
    Ok(HttpResponse::Ok().json(events))
}

#[derive(Debug, Deserialize)]
pub struct OrderStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn change_order_status(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<OrderStatusRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let outcome = state
        .orders
        .change_order_status(path.into_inner(), body.status, body.reason, actor(&req, "admin"))
        .await?;
    Ok(HttpResponse::Ok().json(outcome.order))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn refund_order(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: Option<web::Json<RefundRequest>>,
) -> Result<HttpResponse> {
    let reason = body.map(|b| b.into_inner()).unwrap_or_default().reason;
    let outcome = state
        .orders
        .handle(path.into_inner(), &OrderCommand::Refund { reason }, actor(&req, "admin"))
        .await?;
    Ok(HttpResponse::Ok().json(outcome.order))
}

// ============================================================================
// Sub-orders and courier
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubOrderStatusRequest {
    pub status: SubOrderStatus,
}

pub async fn change_sub_order_status(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<SubOrderStatusRequest>,
) -> Result<HttpResponse> {
    let sub_order_id = path.into_inner();
    let order_id = state.orders.order_id_for_sub_order(sub_order_id).await?;
    let command = OrderCommand::ChangeSubOrderStatus { sub_order_id, target: body.status };
    let outcome = state.orders.handle(order_id, &command, actor(&req, "vendor")).await?;
    Ok(HttpResponse::Ok().json(outcome.order))
}

pub async fn create_shipment(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let created = state.couriers.create_shipment(path.into_inner(), actor(&req, "vendor")).await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn release_shipment_claim(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let order = state.couriers.release_expired_claim(path.into_inner(), actor(&req, "admin")).await?;
    Ok(HttpResponse::Ok().json(order))
}

pub async fn sync_tracking(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let sync = state.couriers.sync_tracking(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(sync))
}

pub async fn tracking(state: web::Data<AppState>, query: web::Query<TrackingQuery>) -> Result<HttpResponse> {
    let view = state.couriers.tracking(&query).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn courier_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<CourierPush>,
) -> Result<HttpResponse> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if !state.couriers.accepts_webhook_token(token) {
        tracing::warn!("Courier push with missing or wrong token");
        return Err(AppError::Unauthorized);
    }

    let sync = state.couriers.apply_webhook(&body).await?;
    Ok(HttpResponse::Ok().json(sync))
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub order_id: Uuid,
}

pub async fn initiate_payment(
    state: web::Data<AppState>,
    body: web::Json<InitiatePaymentRequest>,
) -> Result<HttpResponse> {
    let initiated = state.payments.initiate(body.order_id).await?;
    Ok(HttpResponse::Ok().json(initiated))
}

/// Gateway IPN. Anything but a rejected payload answers 200 so the gateway
/// does not keep retrying a notification that was already handled.
pub async fn payment_ipn(state: web::Data<AppState>, form: web::Form<CallbackForm>) -> Result<HttpResponse> {
    let outcome = state.payments.handle_ipn(&form).await?;
    let status = match outcome {
        IpnOutcome::Rejected { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    Ok(HttpResponse::build(status).json(outcome))
}

fn redirect(state: &AppState, status: StatusCode, target: &PaymentRedirect) -> HttpResponse {
    HttpResponse::build(status)
        .insert_header((header::LOCATION, state.payments.urls().location(target)))
        .finish()
}

pub async fn payment_success_get(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<CallbackForm>,
) -> HttpResponse {
    let target = state.payments.handle_success(&path, &query).await;
    redirect(&state, StatusCode::FOUND, &target)
}

pub async fn payment_success_post(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Form<CallbackForm>,
) -> HttpResponse {
    let target = state.payments.handle_success(&path, &form).await;
    redirect(&state, StatusCode::SEE_OTHER, &target)
}

pub async fn payment_fail(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let target = state.payments.handle_fail(&path).await;
    redirect(&state, StatusCode::SEE_OTHER, &target)
}

pub async fn payment_cancel(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let target = state.payments.handle_cancel(&path).await;
    redirect(&state, StatusCode::SEE_OTHER, &target)
}

// ============================================================================
// Admin
// ============================================================================

pub async fn reconcile_balances(state: web::Data<AppState>) -> Result<HttpResponse> {
    let report = state.reconciliation.run().await?;
    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CourierConfig, FrontendConfig, GatewayConfig};
    use crate::domain::balance::ReconciliationService;
    use crate::domain::courier::{CourierClient, CourierError, CourierService, ParcelReceipt, ParcelRequest};
    use crate::domain::order::{FlatRate, OrderCommandHandler, Vendor};
    use crate::domain::payment::{GatewayError, GatewayTransaction, PaymentGateway, PaymentService, SessionRequest};
    use crate::metrics::Metrics;
    use crate::store::{MemoryStore, VendorStore};
    use actix_web::{test, App};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct NoGateway;

    #[async_trait]
    impl PaymentGateway for NoGateway {
        async fn open_session(&self, request: &SessionRequest) -> std::result::Result<String, GatewayError> {
            Ok(format!("https://pay.example/{}", request.transaction_id))
        }

        async fn query_transaction(
            &self,
            _: &str,
        ) -> std::result::Result<Option<GatewayTransaction>, GatewayError> {
            Err(GatewayError::Timeout)
        }
    }

    struct NoCourier;

    #[async_trait]
    impl CourierClient for NoCourier {
        fn name(&self) -> &str {
            "none"
        }

        async fn create_parcel(&self, _: &ParcelRequest) -> std::result::Result<ParcelReceipt, CourierError> {
            Err(CourierError::Unavailable("offline".into()))
        }

        async fn delivery_status(&self, _: &str) -> std::result::Result<String, CourierError> {
            Err(CourierError::Unavailable("offline".into()))
        }
    }

    async fn state() -> (AppState, Vendor) {
        let store = Arc::new(MemoryStore::new());
        let vendor = Vendor { id: Uuid::new_v4(), name: "V".into(), commission_rate: dec!(10), active: true };
        store.upsert_vendor(&vendor).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let orders = Arc::new(OrderCommandHandler::new(
            store.clone(),
            store.clone(),
            Arc::new(FlatRate(dec!(60))),
            metrics.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            orders.clone(),
            Arc::new(NoGateway),
            &GatewayConfig::default(),
            &FrontendConfig::default(),
            metrics.clone(),
        ));
        let couriers = Arc::new(CourierService::new(
            orders.clone(),
            Arc::new(NoCourier),
            &CourierConfig { webhook_token: Some("t0k".into()), ..CourierConfig::default() },
        ));
        let reconciliation = Arc::new(ReconciliationService::new(store.clone(), store, dec!(10), metrics));

        (AppState { orders, payments, couriers, reconciliation }, vendor)
    }

    fn order_body(vendor_id: Uuid) -> Value {
        json!({
            "buyer_id": Uuid::new_v4(),
            "shipping": {
                "name": "Mim", "phone": "01311000000", "email": "mim@example.com",
                "address": "Road 9", "city": "Dhaka"
            },
            "delivery_method": "home_delivery",
            "payment_method": "online",
            "lines": [{ "product_id": Uuid::new_v4(), "vendor_id": vendor_id, "quantity": 2, "unit_price": "500" }]
        })
    }

    #[actix_web::test]
    async fn test_create_then_load_order() {
        let (state, vendor) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post().uri("/api/orders").set_json(order_body(vendor.id)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Value = test::read_body_json(resp).await;
        let total: Decimal = created["total_amount"].as_str().unwrap().parse().unwrap();
        assert_eq!(total, dec!(1060));

        let uri = format!("/api/orders/{}", created["order_id"].as_str().unwrap());
        let order: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(order["status"], "Pending");
    }

    #[actix_web::test]
    async fn test_validation_error_is_400_and_missing_order_is_404() {
        let (state, _) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post().uri("/api/orders").set_json(order_body(Uuid::new_v4())).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "validation");

        let uri = format!("/api/orders/{}", Uuid::new_v4());
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_derived_status_request_is_rejected() {
        let (state, vendor) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post().uri("/api/orders").set_json(order_body(vendor.id)).to_request();
        let created: Value = test::call_and_read_body_json(&app, req).await;
        let uri = format!("/api/orders/{}/status", created["order_id"].as_str().unwrap());

        let req = test::TestRequest::post().uri(&uri).set_json(json!({ "status": "Shipped" })).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unverified_success_redirects_to_fail_page() {
        let (state, vendor) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post().uri("/api/orders").set_json(order_body(vendor.id)).to_request();
        let created: Value = test::call_and_read_body_json(&app, req).await;
        let req = test::TestRequest::post()
            .uri("/api/payments/initiate")
            .set_json(json!({ "order_id": created["order_id"] }))
            .to_request();
        let initiated: Value = test::call_and_read_body_json(&app, req).await;
        let tran_id = initiated["transaction_id"].as_str().unwrap();

        let req = test::TestRequest::get().uri(&format!("/api/payments/success/{}", tran_id)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("http://localhost:3000/payment/fail?"));
    }

    #[actix_web::test]
    async fn test_ipn_rejects_unsigned_payload() {
        let (state, _) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/payments/ipn")
            .set_form([("tran_id", "MKT0123456789abcdef0123456789abcdef"), ("status", "VALID")])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "rejected");
    }

    #[actix_web::test]
    async fn test_courier_webhook_requires_token() {
        let (state, _) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let push = json!({ "tracking_code": "TRK1", "status": "delivered" });
        let req = test::TestRequest::post().uri("/api/courier/webhook").set_json(&push).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/api/courier/webhook")
            .insert_header((header::AUTHORIZATION, "Bearer t0k"))
            .set_json(&push)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_reconcile_endpoint_returns_report() {
        let (state, _) = state().await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(super::super::configure)).await;

        let req = test::TestRequest::post().uri("/api/admin/balances/reconcile").to_request();
        let report: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["delivered_sub_orders"], 0);
        assert_eq!(report["balances"], json!([]));
    }
}
