use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::DeliveryConfig;
use super::errors::OrderError;
use super::value_objects::{DeliveryMethod, ShippingAddress};

/// Prices one shipment by weight and destination.
pub trait DeliveryRateTable: Send + Sync {
    fn charge(
        &self,
        weight_kg: Decimal,
        destination: &ShippingAddress,
        method: DeliveryMethod,
    ) -> Result<Decimal, OrderError>;
}

/// Two-zone table: inside the home city or outside it, plus a per-kg charge
/// above the included weight.
#[derive(Debug, Clone)]
pub struct ZoneRateTable {
    home_city: String,
    inside_city: Decimal,
    outside_city: Decimal,
    included_weight_kg: Decimal,
    extra_kg_charge: Decimal,
    express_surcharge: Decimal,
}

impl ZoneRateTable {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            home_city: config.home_city.trim().to_lowercase(),
            inside_city: config.inside_city_charge,
            outside_city: config.outside_city_charge,
            included_weight_kg: config.included_weight_kg,
            extra_kg_charge: config.extra_kg_charge,
            express_surcharge: config.express_surcharge,
        }
    }
}

impl DeliveryRateTable for ZoneRateTable {
    fn charge(
        &self,
        weight_kg: Decimal,
        destination: &ShippingAddress,
        method: DeliveryMethod,
    ) -> Result<Decimal, OrderError> {
        if method == DeliveryMethod::Pickup {
            return Ok(Decimal::ZERO);
        }

        let base = if destination.city.trim().to_lowercase() == self.home_city {
            self.inside_city
        } else {
            self.outside_city
        };

        let surcharge = if method == DeliveryMethod::Express { self.express_surcharge } else { Decimal::ZERO };
        let extra_kg = weight_kg
            .checked_sub(self.included_weight_kg)
            .map(|kg| kg.max(Decimal::ZERO).ceil());
        let charge = extra_kg
            .and_then(|kg| kg.checked_mul(self.extra_kg_charge))
            .and_then(|extra| extra.checked_add(base))
            .and_then(|c| c.checked_add(surcharge))
            .ok_or(OrderError::AmountOutOfRange)?;

        Ok(charge.round_dp(2))
    }
}

/// Flat charge per shipment, regardless of weight. Handy for tests.
#[derive(Debug, Clone)]
pub struct FlatRate(pub Decimal);

impl Default for FlatRate {
    fn default() -> Self {
        FlatRate(dec!(60))
    }
}

impl DeliveryRateTable for FlatRate {
    fn charge(&self, _: Decimal, _: &ShippingAddress, method: DeliveryMethod) -> Result<Decimal, OrderError> {
        match method {
            DeliveryMethod::Pickup => Ok(Decimal::ZERO),
            _ => Ok(self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ZoneRateTable {
        ZoneRateTable::from_config(&DeliveryConfig {
            home_city: "Dhaka".to_string(),
            inside_city_charge: dec!(60),
            outside_city_charge: dec!(120),
            included_weight_kg: dec!(1),
            extra_kg_charge: dec!(20),
            express_surcharge: dec!(50),
        })
    }

    fn address(city: &str) -> ShippingAddress {
        ShippingAddress {
            name: "Karim".to_string(),
            phone: "01811000000".to_string(),
            email: String::new(),
            address: "Road 1".to_string(),
            city: city.to_string(),
            area: None,
            postal_code: None,
        }
    }

    #[test]
    fn test_zone_is_chosen_by_city_case_insensitively() {
        let t = table();
        assert_eq!(t.charge(dec!(0.5), &address(" dhaka "), DeliveryMethod::HomeDelivery).unwrap(), dec!(60));
        assert_eq!(t.charge(dec!(0.5), &address("Chattogram"), DeliveryMethod::HomeDelivery).unwrap(), dec!(120));
    }

    #[test]
    fn test_extra_weight_is_charged_per_started_kg() {
        let t = table();
        // 2.3kg: 1.3kg over the allowance rounds up to 2
        assert_eq!(t.charge(dec!(2.3), &address("Dhaka"), DeliveryMethod::HomeDelivery).unwrap(), dec!(100));
    }

    #[test]
    fn test_express_and_pickup() {
        let t = table();
        assert_eq!(t.charge(dec!(1), &address("Dhaka"), DeliveryMethod::Express).unwrap(), dec!(110));
        assert_eq!(t.charge(dec!(9), &address("Sylhet"), DeliveryMethod::Pickup).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_absurd_weight_is_rejected() {
        let result = table().charge(Decimal::MAX, &address("Dhaka"), DeliveryMethod::HomeDelivery);
        assert!(matches!(result, Err(OrderError::AmountOutOfRange)));
    }
}
