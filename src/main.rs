use std::sync::Arc;
use std::time::Duration;

use actix::Actor;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketplace_orders::actors::ReconciliationActor;
use marketplace_orders::config::AppConfig;
use marketplace_orders::domain::balance::ReconciliationService;
use marketplace_orders::domain::courier::{CourierService, HttpCourier};
use marketplace_orders::domain::order::{OrderCommandHandler, ZoneRateTable};
use marketplace_orders::domain::payment::{HttpGateway, PaymentService};
use marketplace_orders::http::{start_api_server, AppState};
use marketplace_orders::metrics::{start_metrics_server, Metrics};
use marketplace_orders::store::{MemoryStore, OrderStore, PgStore, VendorStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // RUST_LOG wins over the configured filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_filter)),
        )
        .init();

    tracing::info!(environment = %config.environment, "Starting marketplace order service");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 2. Storage ===
    let (orders_store, vendor_store): (Arc<dyn OrderStore>, Arc<dyn VendorStore>) = match &config.database.url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let store = Arc::new(PgStore::connect(url, &config.database).await?);
            if config.database.run_migrations {
                store.migrate().await?;
            }
            let orders: Arc<dyn OrderStore> = store.clone();
            let vendors: Arc<dyn VendorStore> = store;
            (orders, vendors)
        }
        None => {
            tracing::warn!("No database url configured, orders are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            let orders: Arc<dyn OrderStore> = store.clone();
            let vendors: Arc<dyn VendorStore> = store;
            (orders, vendors)
        }
    };

    // Vendors listed in config are upserted on every start
    for seed in &config.vendors {
        let vendor = seed.to_vendor(config.reconciliation.default_commission_rate);
        vendor_store.upsert_vendor(&vendor).await?;
        tracing::info!(vendor_id = %vendor.id, name = %vendor.name, "Vendor seeded");
    }
    if config.vendors.is_empty() && config.database.url.is_none() {
        tracing::warn!("No vendors configured for the in-memory store; orders will be rejected until [[vendors]] are listed");
    }

    // === 3. Services ===
    let orders = Arc::new(OrderCommandHandler::new(
        orders_store.clone(),
        vendor_store.clone(),
        Arc::new(ZoneRateTable::from_config(&config.delivery)),
        metrics.clone(),
    ));

    let gateway = Arc::new(HttpGateway::new(config.gateway.clone(), metrics.clone())?);
    let payments = Arc::new(PaymentService::new(
        orders.clone(),
        gateway,
        &config.gateway,
        &config.frontend,
        metrics.clone(),
    ));

    let courier = Arc::new(HttpCourier::new(config.courier.clone(), metrics.clone())?);
    let couriers = Arc::new(CourierService::new(orders.clone(), courier, &config.courier));

    let reconciliation = Arc::new(ReconciliationService::new(
        orders_store,
        vendor_store,
        config.reconciliation.default_commission_rate,
        metrics.clone(),
    ));

    // === 4. Scheduled reconciliation ===
    let _reconciler = if config.reconciliation.enabled {
        let interval = Duration::from_secs(config.reconciliation.interval_secs.max(1));
        Some(ReconciliationActor::new(reconciliation.clone(), interval).start())
    } else {
        tracing::info!("Scheduled reconciliation disabled");
        None
    };

    // === 5. Servers ===
    let state = AppState { orders, payments, couriers, reconciliation };
    let api = start_api_server(state, &config.server);
    let metrics_server = start_metrics_server(metrics.clone(), config.observability.metrics_port);

    futures_util::future::try_join(api, metrics_server).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
