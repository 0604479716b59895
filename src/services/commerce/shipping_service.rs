use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, EntityTrait};
use uuid::Uuid;

use crate::entities::commerce::{city, shipping_address, City, ShippingAddress};
use crate::errors::ServiceError;

/// A shipping address resolved together with its city, as frozen onto an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedShipping {
    pub address: shipping_address::Model,
    pub city: city::Model,
}

impl ResolvedShipping {
    pub fn cost(&self) -> Decimal {
        self.city.shipping_price
    }
}

/// Looks up shipping cost at checkout time from the address's city.
#[derive(Debug, Clone, Default)]
pub struct ShippingService;

impl ShippingService {
    pub fn new() -> Self {
        Self
    }

    /// Resolves `address_id` for `owner_id`. An address that does not exist,
    /// belongs to someone else, or points at a missing city is invalid.
    pub async fn resolve(
        &self,
        conn: &impl ConnectionTrait,
        owner_id: Uuid,
        address_id: Uuid,
    ) -> Result<ResolvedShipping, ServiceError> {
        let address = ShippingAddress::find_by_id(address_id)
            .one(conn)
            .await?
            .filter(|a| a.owner_id == owner_id)
            .ok_or_else(|| {
                ServiceError::InvalidShippingAddress(format!(
                    "Shipping address {} not found",
                    address_id
                ))
            })?;

        let city = City::find_by_id(address.city_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidShippingAddress(format!(
                    "City {} of shipping address {} not found",
                    address.city_id, address_id
                ))
            })?;

        if city.shipping_price < Decimal::ZERO {
            return Err(ServiceError::InvalidShippingAddress(format!(
                "City {} has a negative shipping price",
                city.name
            )));
        }

        Ok(ResolvedShipping { address, city })
    }
}
