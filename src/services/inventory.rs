use std::collections::BTreeMap;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::entities::commerce::product::{self, Entity as ProductEntity};
use crate::errors::{ServiceError, StockShortfall};

/// Total requested quantity per product, summing lines that share a product
/// (different color or size of the same product draw from one stock count).
pub fn aggregate_demand(lines: impl IntoIterator<Item = (Uuid, i32)>) -> BTreeMap<Uuid, i32> {
    let mut demand = BTreeMap::new();
    for (product_id, quantity) in lines {
        *demand.entry(product_id).or_insert(0) += quantity;
    }
    demand
}

/// Stock reads and the conditional decrement used at settlement.
///
/// Stock is never soft-held: it is checked when carts change and at
/// checkout, and only decremented when an order is confirmed.
#[derive(Debug, Clone, Default)]
pub struct InventoryService;

impl InventoryService {
    pub fn new() -> Self {
        Self
    }

    /// Loads a sellable product.
    pub async fn product(
        &self,
        conn: &impl ConnectionTrait,
        product_id: Uuid,
    ) -> Result<product::Model, ServiceError> {
        ProductEntity::find_by_id(product_id)
            .one(conn)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    /// Fails with `OutOfStock` when `requested` exceeds the units on hand.
    pub async fn ensure_available(
        &self,
        conn: &impl ConnectionTrait,
        product_id: Uuid,
        requested: i32,
    ) -> Result<product::Model, ServiceError> {
        let product = self.product(conn, product_id).await?;
        if requested > product.stock {
            return Err(ServiceError::OutOfStock {
                product_id,
                requested,
                available: product.stock.max(0),
            });
        }
        Ok(product)
    }

    /// Locks the product rows in `demand` and reports every product that
    /// cannot cover its requested quantity. Missing or inactive products
    /// count as zero stock.
    #[instrument(skip(self, conn))]
    pub async fn shortfalls(
        &self,
        conn: &impl ConnectionTrait,
        demand: &BTreeMap<Uuid, i32>,
    ) -> Result<Vec<StockShortfall>, ServiceError> {
        if demand.is_empty() {
            return Ok(Vec::new());
        }
        let products: BTreeMap<Uuid, product::Model> = ProductEntity::find()
            .filter(product::Column::Id.is_in(demand.keys().copied()))
            .lock_exclusive()
            .all(conn)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        Ok(demand
            .iter()
            .filter_map(|(product_id, requested)| {
                let available = products
                    .get(product_id)
                    .filter(|p| p.is_active)
                    .map_or(0, |p| p.stock.max(0));
                (*requested > available).then_some(StockShortfall {
                    product_id: *product_id,
                    requested: *requested,
                    available,
                })
            })
            .collect())
    }

    /// Takes `quantity` units if and only if that many are on hand.
    ///
    /// The check and the write are one statement, so concurrent decrements
    /// can never drive stock below zero. Returns `false` when stock was short.
    pub async fn decrement(
        &self,
        conn: &impl ConnectionTrait,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<bool, ServiceError> {
        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Decrements every product in `demand`, returning the ones that could not
    /// be covered. Products that could be covered are decremented either way;
    /// callers that need all-or-nothing roll back their transaction on a
    /// non-empty result.
    pub async fn decrement_all(
        &self,
        conn: &impl ConnectionTrait,
        demand: &BTreeMap<Uuid, i32>,
    ) -> Result<Vec<StockShortfall>, ServiceError> {
        let mut short = Vec::new();
        for (product_id, quantity) in demand {
            if !self.decrement(conn, *product_id, *quantity).await? {
                let available = ProductEntity::find_by_id(*product_id)
                    .one(conn)
                    .await?
                    .map_or(0, |p| p.stock.max(0));
                warn!(%product_id, requested = quantity, available, "Stock decrement refused");
                short.push(StockShortfall {
                    product_id: *product_id,
                    requested: *quantity,
                    available,
                });
            }
        }
        Ok(short)
    }
}
