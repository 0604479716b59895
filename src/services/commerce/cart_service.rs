use crate::{
    entities::commerce::{cart, cart_item, coupon, Cart, CartItem, CartModel, Coupon},
    errors::ServiceError,
    events::{Event, EventSender},
    services::commerce::{
        coupon_service::{check_coupon, CouponService},
        pricing_service::{self, LineInput},
    },
    services::inventory::InventoryService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Input for adding a product to the caller's cart.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddToCartInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(length(min = 1, max = 64))]
    pub color: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub size: Option<String>,
}

/// Something the shopper should be told about a mutation that otherwise succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartNotice {
    pub kind: String,
    pub coupon_code: String,
    pub message: String,
}

/// A cart with its lines, as returned by every cart operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    #[serde(flatten)]
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<CartNotice>,
}

impl CartView {
    pub fn item_count(&self) -> i32 {
        self.items.iter().map(|i| i.quantity).sum()
    }
}

/// Shopping cart service: the only writer of carts and cart lines.
///
/// Every mutation runs in one database transaction that
///
/// 1. gets or creates the owner's cart and locks its row,
/// 2. applies the change to the lines (checking stock against the catalog),
/// 3. re-prices the whole cart from its lines and coupon reference, and
/// 4. writes the totals back guarded by the cart's `version`.
///
/// Totals are therefore always a pure function of the persisted lines and
/// coupon, and two concurrent mutations of one cart are serialized.
///
/// # Examples
///
/// ```ignore
/// let view = cart_service
///     .add_item(owner_id, AddToCartInput {
///         product_id,
///         quantity: 2,
///         color: Some("red".into()),
///         size: None,
///     })
///     .await?;
/// assert_eq!(view.cart.subtotal, view.items.iter().map(|i| i.line_total).sum());
/// ```
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    coupons: Arc<CouponService>,
    inventory: Arc<InventoryService>,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `coupons` - Coupon validation shared with checkout
    /// * `inventory` - Catalog stock lookups
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        coupons: Arc<CouponService>,
        inventory: Arc<InventoryService>,
    ) -> Self {
        Self {
            db,
            event_sender,
            coupons,
            inventory,
        }
    }

    /// Returns the owner's cart, creating an empty one on first access.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, owner_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        self.ensure_cart(&txn, owner_id).await?;
        let cart = Cart::find()
            .filter(cart::Column::OwnerId.eq(owner_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for {} not found", owner_id)))?;
        let items = self.items(&txn, cart.id).await?;
        txn.commit().await?;

        Ok(CartView {
            cart,
            items,
            notice: None,
        })
    }

    /// Adds a product to the cart.
    ///
    /// A line with the same product, color and size is merged by adding to
    /// its quantity and keeps the unit price captured when it was first
    /// added. Otherwise a new line is created at the current catalog price.
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The re-priced cart
    /// * `Err(ServiceError::ValidationError)` - Quantity below 1
    /// * `Err(ServiceError::NotFound)` - Unknown or inactive product
    /// * `Err(ServiceError::OutOfStock)` - The cart would hold more units of
    ///   the product than are in stock
    #[instrument(skip(self, input), fields(product_id = %input.product_id, quantity = input.quantity))]
    pub async fn add_item(
        &self,
        owner_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartView, ServiceError> {
        input.validate()?;
        let color = normalize_option(input.color);
        let size = normalize_option(input.size);

        let txn = self.db.begin().await?;
        let cart = self.lock_cart(&txn, owner_id).await?;
        let items = self.items(&txn, cart.id).await?;

        let existing = items
            .iter()
            .find(|i| i.same_variant(input.product_id, color.as_deref(), size.as_deref()));
        let already_in_cart: i32 = items
            .iter()
            .filter(|i| i.product_id == input.product_id)
            .map(|i| i.quantity)
            .sum();
        let requested = already_in_cart
            .checked_add(input.quantity)
            .ok_or_else(|| ServiceError::ValidationError("Quantity is too large".into()))?;
        let product = self
            .inventory
            .ensure_available(&txn, input.product_id, requested)
            .await?;

        let now = Utc::now();
        match existing {
            Some(line) => {
                let quantity = line.quantity + input.quantity;
                let mut active: cart_item::ActiveModel = line.clone().into();
                active.quantity = Set(quantity);
                active.line_total = Set(pricing_service::line_total(line.unit_price, quantity));
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    unit_price: Set(product.price),
                    quantity: Set(input.quantity),
                    color: Set(color),
                    size: Set(size),
                    line_total: Set(pricing_service::line_total(product.price, input.quantity)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        let view = self.reprice(&txn, cart).await?;
        txn.commit().await?;
        self.published(view, "add_item")
    }

    /// Sets the quantity of one line.
    ///
    /// If the new subtotal drops below the attached coupon's minimum order
    /// value the coupon is detached and the returned view carries a notice.
    #[instrument(skip(self))]
    pub async fn update_item(
        &self,
        owner_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let cart = self.lock_cart(&txn, owner_id).await?;
        let items = self.items(&txn, cart.id).await?;
        let line = items
            .iter()
            .find(|i| i.id == item_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        let other_lines: i32 = items
            .iter()
            .filter(|i| i.product_id == line.product_id && i.id != item_id)
            .map(|i| i.quantity)
            .sum();
        self.inventory
            .ensure_available(&txn, line.product_id, other_lines.saturating_add(quantity))
            .await?;

        let mut active: cart_item::ActiveModel = line.clone().into();
        active.quantity = Set(quantity);
        active.line_total = Set(pricing_service::line_total(line.unit_price, quantity));
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let view = self.reprice(&txn, cart).await?;
        txn.commit().await?;
        self.published(view, "update_item")
    }

    /// Deletes one line. Same coupon handling as [`update_item`](Self::update_item).
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        owner_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = self.lock_cart(&txn, owner_id).await?;

        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::Id.eq(item_id))
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Cart item {} not found",
                item_id
            )));
        }

        let view = self.reprice(&txn, cart).await?;
        txn.commit().await?;
        self.published(view, "remove_item")
    }

    /// Attaches a coupon, replacing any coupon already attached.
    ///
    /// The coupon is checked against the current gross subtotal. On failure
    /// the cart is left untouched and the specific reason is returned
    /// (`CouponNotFound`, `CouponInactive`, `CouponExpired`,
    /// `CouponUsageExceeded` or `CouponBelowMinOrder`). Usage is not consumed
    /// here; that happens when an order is confirmed.
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, owner_id: Uuid, code: &str) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let mut cart = self.lock_cart(&txn, owner_id).await?;
        let items = self.items(&txn, cart.id).await?;
        let subtotal = pricing_service::compute_subtotal(&lines_of(&items));

        let validated = self.coupons.validate_in(&txn, code, subtotal).await?;
        cart.coupon_id = Some(validated.coupon.id);
        cart.coupon_code = Some(validated.coupon.code.clone());

        let view = self.reprice(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::CouponApplied {
            cart_id: view.cart.id,
            code: validated.coupon.code,
        });
        self.published(view, "apply_coupon")
    }

    /// Detaches the coupon. Succeeds whether or not one was attached.
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, owner_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let mut cart = self.lock_cart(&txn, owner_id).await?;
        cart.coupon_id = None;
        cart.coupon_code = None;

        let view = self.reprice(&txn, cart).await?;
        txn.commit().await?;
        self.published(view, "remove_coupon")
    }

    /// Removes every line and the coupon.
    #[instrument(skip(self))]
    pub async fn clear(&self, owner_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;
        let cart = self.lock_cart(&txn, owner_id).await?;
        let cart_id = cart.id;
        self.clear_in(&txn, cart_id).await?;
        let view = CartView {
            cart: Cart::find_by_id(cart_id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?,
            items: Vec::new(),
            notice: None,
        };
        txn.commit().await?;

        info!("Cleared cart: {}", cart_id);
        self.event_sender.send_or_log(Event::CartCleared(cart_id));
        Ok(view)
    }

    /// Empties a cart inside the caller's transaction: lines, coupon and
    /// totals. Used after an order is confirmed.
    pub(crate) async fn clear_in(
        &self,
        conn: &impl ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;

        Cart::update_many()
            .col_expr(cart::Column::CouponId, Expr::value(Option::<Uuid>::None))
            .col_expr(cart::Column::CouponCode, Expr::value(Option::<String>::None))
            .col_expr(cart::Column::Subtotal, Expr::value(Decimal::ZERO))
            .col_expr(cart::Column::Discount, Expr::value(Decimal::ZERO))
            .col_expr(cart::Column::Total, Expr::value(Decimal::ZERO))
            .col_expr(cart::Column::Version, Expr::col(cart::Column::Version).add(1))
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(cart_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Gets or creates the owner's cart and takes a row lock on it.
    pub(crate) async fn lock_cart(
        &self,
        conn: &impl ConnectionTrait,
        owner_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        self.ensure_cart(conn, owner_id).await?;
        Cart::find()
            .filter(cart::Column::OwnerId.eq(owner_id))
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for {} not found", owner_id)))
    }

    pub(crate) async fn items(
        &self,
        conn: &impl ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<Vec<cart_item::Model>, ServiceError> {
        Ok(CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?)
    }

    /// Inserts an empty cart unless the owner already has one. The unique
    /// owner index turns a racing second insert into a no-op.
    async fn ensure_cart(&self, conn: &impl ConnectionTrait, owner_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let fresh = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id),
            coupon_id: Set(None),
            coupon_code: Set(None),
            subtotal: Set(Decimal::ZERO),
            discount: Set(Decimal::ZERO),
            total: Set(Decimal::ZERO),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Cart::insert(fresh)
            .on_conflict(
                OnConflict::column(cart::Column::OwnerId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    /// Recomputes totals from the persisted lines and the coupon reference
    /// on `cart`, then writes them with an optimistic version check.
    ///
    /// A coupon that no longer passes validation against the new subtotal
    /// is detached and reported through the view's notice.
    async fn reprice(
        &self,
        conn: &impl ConnectionTrait,
        mut cart: CartModel,
    ) -> Result<CartView, ServiceError> {
        let items = self.items(conn, cart.id).await?;
        let subtotal = pricing_service::compute_subtotal(&lines_of(&items));

        let mut notice = None;
        let mut discount = Decimal::ZERO;
        if let Some(coupon_id) = cart.coupon_id {
            let code = cart.coupon_code.clone().unwrap_or_default();
            let found: Option<coupon::Model> = Coupon::find_by_id(coupon_id).one(conn).await?;
            match check_coupon(&code, found.as_ref(), subtotal, Utc::now()) {
                Ok(d) => discount = d,
                Err(reason) => {
                    warn!(cart_id = %cart.id, %code, %reason, "Detaching coupon");
                    notice = Some(CartNotice {
                        kind: "coupon_removed".into(),
                        coupon_code: code,
                        message: reason.to_string(),
                    });
                    cart.coupon_id = None;
                    cart.coupon_code = None;
                }
            }
        }
        let total = pricing_service::compute_total(subtotal, discount, Decimal::ZERO);

        let now = Utc::now();
        let updated = Cart::update_many()
            .col_expr(cart::Column::CouponId, Expr::value(cart.coupon_id))
            .col_expr(cart::Column::CouponCode, Expr::value(cart.coupon_code.clone()))
            .col_expr(cart::Column::Subtotal, Expr::value(subtotal))
            .col_expr(cart::Column::Discount, Expr::value(discount))
            .col_expr(cart::Column::Total, Expr::value(total))
            .col_expr(cart::Column::Version, Expr::value(cart.version + 1))
            .col_expr(cart::Column::UpdatedAt, Expr::value(now))
            .filter(cart::Column::Id.eq(cart.id))
            .filter(cart::Column::Version.eq(cart.version))
            .exec(conn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(cart.id));
        }

        cart.subtotal = subtotal;
        cart.discount = discount;
        cart.total = total;
        cart.version += 1;
        cart.updated_at = now;

        Ok(CartView {
            cart,
            items,
            notice,
        })
    }

    fn published(&self, view: CartView, operation: &'static str) -> Result<CartView, ServiceError> {
        metrics::counter!("cart_mutations_total", 1, "operation" => operation);
        if let Some(notice) = &view.notice {
            self.event_sender.send_or_log(Event::CouponDetached {
                cart_id: view.cart.id,
                code: notice.coupon_code.clone(),
                reason: notice.message.clone(),
            });
        }
        self.event_sender.send_or_log(Event::CartUpdated {
            cart_id: view.cart.id,
            owner_id: view.cart.owner_id,
            version: view.cart.version,
        });
        Ok(view)
    }
}

pub(crate) fn lines_of(items: &[cart_item::Model]) -> Vec<LineInput> {
    items
        .iter()
        .map(|i| LineInput {
            unit_price: i.unit_price,
            quantity: i.quantity,
        })
        .collect()
}

fn normalize_option(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_variant_attributes_are_treated_as_absent() {
        assert_eq!(normalize_option(Some("  ".into())), None);
        assert_eq!(normalize_option(Some(" red ".into())), Some("red".into()));
        assert_eq!(normalize_option(None), None);
    }

    #[test]
    fn add_input_rejects_non_positive_quantity() {
        let input = AddToCartInput {
            product_id: Uuid::new_v4(),
            quantity: 0,
            color: None,
            size: None,
        };
        assert!(input.validate().is_err());
    }
}
