//! Service configuration.
//!
//! Sources are layered, later ones overriding earlier ones:
//! 1. `config/default.toml`
//! 2. `config/{MARKET_ENV}.toml`
//! 3. environment variables prefixed `MARKET`, sections split by `__`
//!    (`MARKET__DATABASE__URL` → `database.url`)

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::order::Vendor;
use crate::utils::CircuitBreakerConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: None,
        }
    }
}

/// Without a `url` the service runs on the in-memory store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_secs: u64,
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 30,
            success_threshold: 2,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_secs(self.open_secs),
            success_threshold: self.success_threshold,
        }
    }
}

/// Hosted payment gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub store_id: String,
    pub store_password: String,
    pub currency: String,
    /// Public base url the gateway calls back into (IPN and browser redirects).
    pub callback_base_url: String,
    pub timeout_secs: u64,
    pub breaker: BreakerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.sslcommerz.com".to_string(),
            store_id: "testbox".to_string(),
            store_password: "qwerty".to_string(),
            currency: "BDT".to_string(),
            callback_base_url: "http://localhost:8080".to_string(),
            timeout_secs: 10,
            breaker: BreakerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub base_url: String,
    pub api_key: String,
    pub secret_key: String,
    /// Bearer token the courier sends on status pushes; pushes are refused when unset.
    pub webhook_token: Option<String>,
    pub timeout_secs: u64,
    pub tracking_attempts: u32,
    pub breaker: BreakerSettings,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://portal.packzy.com/api/v1".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            webhook_token: None,
            timeout_secs: 10,
            tracking_attempts: 3,
            breaker: BreakerSettings::default(),
        }
    }
}

/// Buyer-facing pages the payment redirects land on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub success_url: String,
    pub fail_url: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            success_url: "http://localhost:3000/payment/success".to_string(),
            fail_url: "http://localhost:3000/payment/fail".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub home_city: String,
    pub inside_city_charge: Decimal,
    pub outside_city_charge: Decimal,
    pub included_weight_kg: Decimal,
    pub extra_kg_charge: Decimal,
    pub express_surcharge: Decimal,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            home_city: "Dhaka".to_string(),
            inside_city_charge: dec!(60),
            outside_city_charge: dec!(120),
            included_weight_kg: dec!(1),
            extra_kg_charge: dec!(20),
            express_surcharge: dec!(50),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Commission percentage for vendors without a stored rate.
    pub default_commission_rate: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            default_commission_rate: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_port: u16,
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            log_filter: "info,marketplace_orders=debug".to_string(),
        }
    }
}

/// Vendor written to the vendor store at startup.
///
/// The in-memory store starts empty, so without seeds every order is
/// rejected for naming an unknown vendor.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorSeed {
    pub id: Uuid,
    pub name: String,
    /// Falls back to `reconciliation.default_commission_rate`.
    #[serde(default)]
    pub commission_rate: Option<Decimal>,
    #[serde(default = "enabled")]
    pub active: bool,
}

fn enabled() -> bool {
    true
}

impl VendorSeed {
    pub fn to_vendor(&self, default_commission_rate: Decimal) -> Vendor {
        Vendor {
            id: self.id,
            name: self.name.clone(),
            commission_rate: self.commission_rate.unwrap_or(default_commission_rate),
            active: self.active,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub courier: CourierConfig,
    pub frontend: FrontendConfig,
    pub delivery: DeliveryConfig,
    pub reconciliation: ReconciliationConfig,
    pub observability: ObservabilityConfig,
    pub vendors: Vec<VendorSeed>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("MARKET_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Config::builder()
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false))
            .add_source(
                Environment::with_prefix("MARKET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_in_memory_store() {
        let config = AppConfig::default();
        assert!(config.database.url.is_none());
        assert_eq!(config.gateway.timeout_secs, 10);
        assert_eq!(config.reconciliation.default_commission_rate, dec!(10));
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [database]
                url = "postgres://localhost/market"

                [delivery]
                home_city = "Chattogram"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/market"));
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.delivery.home_city, "Chattogram");
        assert_eq!(config.delivery.inside_city_charge, dec!(60));
        assert_eq!(config.server.port, 8080);
        assert!(config.vendors.is_empty());
    }

    #[test]
    fn test_vendor_seeds() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [[vendors]]
                id = "6f1c2a4e-0d3b-4c55-9a8e-2b7f41e0c001"
                name = "Karim Textiles"
                commission_rate = 12.5

                [[vendors]]
                id = "6f1c2a4e-0d3b-4c55-9a8e-2b7f41e0c002"
                name = "Nodi Crafts"
                active = false
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.vendors.len(), 2);
        let karim = config.vendors[0].to_vendor(dec!(10));
        assert_eq!(karim.name, "Karim Textiles");
        assert_eq!(karim.commission_rate, dec!(12.5));
        assert!(karim.active);

        let nodi = config.vendors[1].to_vendor(dec!(10));
        assert_eq!(nodi.commission_rate, dec!(10));
        assert!(!nodi.active);
        assert_eq!(nodi.id, "6f1c2a4e-0d3b-4c55-9a8e-2b7f41e0c002".parse::<Uuid>().unwrap());
    }
}
