use crate::{
    config::AppConfig,
    entities::{
        commerce::{checkout_session, product, CheckoutSession, Coupon, Product, SessionStatus},
        order::{self, Entity as Order, OrderStatus, PaymentMethod, PaymentStatus},
        order_item::{self, Entity as OrderItem},
    },
    errors::{ServiceError, StockShortfall},
    events::{Event, EventSender},
    services::commerce::{
        cart_service::{lines_of, CartService},
        coupon_service::{check_coupon, CouponService},
        pricing_service::{self, CouponTerms},
        shipping_service::ShippingService,
    },
    services::inventory::{aggregate_demand, InventoryService},
    services::orders::update_guarded,
    services::payments::{
        GatewayError, PaymentGateway, PaymentNotification, SessionRequest, SessionState,
        SESSION_ID_PLACEHOLDER,
    },
};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::Expr,
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, NotSet, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Request to turn the caller's cart into an order.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutInput {
    pub payment_method: PaymentMethod,
    pub shipping_address_id: Uuid,
    /// Where the shopper lands after a successful card payment.
    #[serde(default)]
    #[validate(url)]
    pub success_url: Option<String>,
    /// Where the shopper lands after abandoning or failing a card payment.
    #[serde(default)]
    #[validate(url)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, max = 255))]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResult {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    /// Hosted payment page for card orders with an open session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

/// What a provider callback did to its order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Confirmed(order::Model),
    Cancelled(order::Model),
    /// The order had already left `PENDING`; nothing changed.
    AlreadyFinalized(order::Model),
    /// The session ended without payment but a newer session for the same
    /// order is still open, so the order stays pending.
    Superseded(order::Model),
}

impl Settlement {
    pub fn order(&self) -> &order::Model {
        match self {
            Settlement::Confirmed(o)
            | Settlement::Cancelled(o)
            | Settlement::AlreadyFinalized(o)
            | Settlement::Superseded(o) => o,
        }
    }
}

/// Shopper outcome carried by the provider's return redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::EnumString, strum::AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReturnOutcome {
    Success,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    /// Our redirect landing, handed to the provider.
    pub return_url: String,
    /// Used when the shopper supplied no success or cancel URL.
    pub fallback_redirect_url: String,
    pub session_ttl: Duration,
}

impl From<&AppConfig> for CheckoutSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            currency: config.default_currency.to_ascii_uppercase(),
            return_url: config.checkout_return_url(),
            fallback_redirect_url: config.public_base_url.trim_end_matches('/').to_string(),
            session_ttl: Duration::seconds(
                i64::try_from(config.payment_session_ttl_secs).unwrap_or(1800),
            ),
        }
    }
}

/// Checkout orchestrator: converts a cart into an order and drives card
/// orders through their hosted payment session.
///
/// Steps up to the order insert are side-effect free. A cash order is
/// confirmed in the same transaction that creates it; a card order is
/// committed as `PENDING` before the provider is contacted, so it is never
/// lost when the provider misbehaves.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    carts: Arc<CartService>,
    coupons: Arc<CouponService>,
    inventory: Arc<InventoryService>,
    shipping: Arc<ShippingService>,
    gateway: Arc<dyn PaymentGateway>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        carts: Arc<CartService>,
        coupons: Arc<CouponService>,
        inventory: Arc<InventoryService>,
        shipping: Arc<ShippingService>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            carts,
            coupons,
            inventory,
            shipping,
            gateway,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    /// Places an order from the caller's cart.
    ///
    /// # Returns
    ///
    /// * `Ok(CheckoutResult)` - The order; card orders carry the hosted page URL
    /// * `Err(ServiceError::InvalidOperation)` - The cart is empty
    /// * `Err(ServiceError::InsufficientStock)` - Products that ran short
    /// * `Err(ServiceError::Coupon*)` - The attached coupon no longer applies
    /// * `Err(ServiceError::InvalidShippingAddress)` - Unknown or foreign address
    /// * `Err(ServiceError::PaymentSessionFailed)` - The card order was saved as
    ///   pending but the provider refused a session
    #[instrument(skip(self, input), fields(payment_method = input.payment_method.as_ref()))]
    pub async fn checkout(
        &self,
        owner_id: Uuid,
        input: CheckoutInput,
    ) -> Result<CheckoutResult, ServiceError> {
        input.validate()?;
        let idempotency_key = input
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let txn = self.db.begin().await?;
        // Serializes checkouts of one cart, including idempotent replays.
        let cart = self.carts.lock_cart(&txn, owner_id).await?;

        if let Some(key) = &idempotency_key {
            if let Some(existing) = Order::find()
                .filter(order::Column::OwnerId.eq(owner_id))
                .filter(order::Column::IdempotencyKey.eq(key.as_str()))
                .one(&txn)
                .await?
            {
                txn.commit().await?;
                info!(order_id = %existing.id, "Replaying checkout for idempotency key");
                return self.result_for(existing).await;
            }
        }

        let items = self.carts.items(&txn, cart.id).await?;
        if items.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        let demand = aggregate_demand(items.iter().map(|i| (i.product_id, i.quantity)));
        let short = self.inventory.shortfalls(&txn, &demand).await?;
        if !short.is_empty() {
            return Err(ServiceError::InsufficientStock(short));
        }

        let lines = lines_of(&items);
        let subtotal = pricing_service::compute_subtotal(&lines);
        let applied_coupon = match cart.coupon_id {
            Some(coupon_id) => {
                let code = cart.coupon_code.clone().unwrap_or_default();
                let found = Coupon::find_by_id(coupon_id).one(&txn).await?;
                check_coupon(&code, found.as_ref(), subtotal, Utc::now())?;
                found
            }
            None => None,
        };

        let shipping = self
            .shipping
            .resolve(&txn, owner_id, input.shipping_address_id)
            .await?;

        let terms = applied_coupon.as_ref().map(CouponTerms::from);
        let totals = pricing_service::price(&lines, terms.as_ref(), shipping.cost());

        let names: HashMap<Uuid, String> = Product::find()
            .filter(product::Column::Id.is_in(demand.keys().copied()))
            .all(&txn)
            .await?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let new_order = order::ActiveModel {
            id: Set(order_id),
            order_number: NotSet,
            owner_id: Set(owner_id),
            cart_id: Set(cart.id),
            idempotency_key: Set(idempotency_key),
            payment_method: Set(input.payment_method),
            payment_status: Set(PaymentStatus::Pending),
            status: Set(OrderStatus::Pending),
            subtotal: Set(totals.subtotal),
            discount: Set(totals.discount),
            shipping_cost: Set(totals.shipping),
            total: Set(totals.total),
            currency: Set(self.settings.currency.clone()),
            coupon_id: Set(applied_coupon.as_ref().map(|c| c.id)),
            coupon_code: Set(applied_coupon.as_ref().map(|c| c.code.clone())),
            shipping_address_id: Set(shipping.address.id),
            shipping_address: Set(shipping.address.address.clone()),
            shipping_phone: Set(shipping.address.phone.clone()),
            shipping_city: Set(shipping.city.name.clone()),
            is_paid: Set(false),
            paid_at: Set(None),
            is_delivered: Set(false),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        };
        let mut order = insert_with_order_number(&txn, new_order, generate_order_number).await?;

        let order_items: Vec<order_item::ActiveModel> = items
            .iter()
            .map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(names.get(&line.product_id).cloned().unwrap_or_default()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                color: Set(line.color.clone()),
                size: Set(line.size.clone()),
                line_total: Set(pricing_service::line_total(line.unit_price, line.quantity)),
                created_at: Set(now),
            })
            .collect();
        OrderItem::insert_many(order_items).exec(&txn).await?;

        match input.payment_method {
            PaymentMethod::Cash => {
                let short = self.inventory.decrement_all(&txn, &demand).await?;
                if !short.is_empty() {
                    return Err(ServiceError::InsufficientStock(short));
                }
                if let Some(coupon) = &applied_coupon {
                    if !self.coupons.consume(&txn, coupon.id).await? {
                        return Err(ServiceError::CouponUsageExceeded(coupon.code.clone()));
                    }
                }
                order = update_guarded(
                    &txn,
                    &order,
                    vec![(order::Column::Status, Expr::value(OrderStatus::Completed))],
                )
                .await?;
                self.carts.clear_in(&txn, cart.id).await?;
                txn.commit().await?;

                info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Cash order confirmed");
                metrics::counter!("orders_created_total", 1, "payment_method" => "cash");
                self.event_sender.send_or_log(Event::OrderCreated {
                    order_id: order.id,
                    payment_method: order.payment_method,
                });
                self.event_sender.send_or_log(Event::OrderCompleted(order.id));
                self.event_sender.send_or_log(Event::CartCleared(cart.id));

                let items = self.order_items(order.id).await?;
                Ok(CheckoutResult {
                    order,
                    items,
                    checkout_url: None,
                })
            }
            PaymentMethod::CreditCard => {
                txn.commit().await?;

                info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Card order awaiting payment");
                metrics::counter!("orders_created_total", 1, "payment_method" => "credit_card");
                self.event_sender.send_or_log(Event::OrderCreated {
                    order_id: order.id,
                    payment_method: order.payment_method,
                });

                let session = self
                    .open_session(&order, input.success_url, input.cancel_url)
                    .await?;
                let items = self.order_items(order.id).await?;
                Ok(CheckoutResult {
                    order,
                    items,
                    checkout_url: Some(session.checkout_url),
                })
            }
        }
    }

    /// Opens a fresh hosted session for a pending card order whose session
    /// could not be created or has lapsed. An open, unexpired session is
    /// returned as is.
    #[instrument(skip(self))]
    pub async fn retry_payment(
        &self,
        owner_id: Uuid,
        order_id: Uuid,
    ) -> Result<CheckoutResult, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.owner_id == owner_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_method != PaymentMethod::CreditCard {
            return Err(ServiceError::InvalidOperation(
                "Only card orders have payment sessions".to_string(),
            ));
        }
        if order.is_finalized() {
            return Err(ServiceError::OrderAlreadyFinalized(order.id));
        }

        let latest = self.latest_session(&*self.db, order.id).await?;
        if let Some(open) = latest
            .as_ref()
            .filter(|s| s.status == SessionStatus::Open && s.expires_at > Utc::now())
        {
            let checkout_url = open.checkout_url.clone();
            let items = self.order_items(order.id).await?;
            return Ok(CheckoutResult {
                order,
                items,
                checkout_url: Some(checkout_url),
            });
        }

        let (success_url, cancel_url) = latest
            .map(|s| (s.success_url, s.cancel_url))
            .unwrap_or_default();
        let session = self.open_session(&order, success_url, cancel_url).await?;
        let items = self.order_items(order.id).await?;
        Ok(CheckoutResult {
            order,
            items,
            checkout_url: Some(session.checkout_url),
        })
    }

    /// Verifies a provider webhook and applies it.
    ///
    /// Returns `Ok(None)` for authentic notifications that carry nothing to act on.
    pub async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<Option<Settlement>, ServiceError> {
        let Some(PaymentNotification {
            event_id,
            reference,
            state,
        }) = self.gateway.parse_notification(headers, payload)?
        else {
            return Ok(None);
        };
        info!(?event_id, %reference, ?state, "Payment notification received");
        self.settle(&reference, state).await.map(Some)
    }

    /// Applies a provider-reported outcome to the session's order.
    ///
    /// Safe under repeated delivery: the order is re-read under lock and
    /// anything but a `PENDING` order is left alone.
    #[instrument(skip(self))]
    pub async fn settle(
        &self,
        reference: &str,
        state: SessionState,
    ) -> Result<Settlement, ServiceError> {
        if !state.is_settled() {
            return Err(ServiceError::InvalidOperation(
                "Payment session is still open".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let session = CheckoutSession::find()
            .filter(checkout_session::Column::ProviderReference.eq(reference))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment session {} not found", reference))
            })?;
        let order = Order::find_by_id(session.order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", session.order_id)))?;

        if order.status != OrderStatus::Pending {
            // a capture on a session other than the one that confirmed the order
            let late_payment =
                state == SessionState::Paid && session.status != SessionStatus::Completed;
            if late_payment {
                set_session_status(&txn, session.id, SessionStatus::Completed).await?;
            } else if session.status == SessionStatus::Open {
                set_session_status(&txn, session.id, closed_status(state)).await?;
            }
            txn.commit().await?;

            if late_payment {
                error!(
                    order_id = %order.id,
                    reference = %session.provider_reference,
                    status = order.status.as_ref(),
                    "Payment captured for an order that was already finalized"
                );
                metrics::counter!("payments_settled_total", 1, "outcome" => "paid_after_finalized");
                self.event_sender.send_or_log(Event::PaymentOnFinalizedOrder {
                    order_id: order.id,
                    provider_reference: session.provider_reference.clone(),
                    status: order.status,
                });
            } else {
                info!(order_id = %order.id, status = order.status.as_ref(), "Order already finalized, ignoring callback");
            }
            return Ok(Settlement::AlreadyFinalized(order));
        }

        match state {
            SessionState::Paid => self.confirm_paid(txn, session, order).await,
            _ => self.close_unpaid(txn, session, order, state).await,
        }
    }

    async fn confirm_paid(
        &self,
        txn: sea_orm::DatabaseTransaction,
        session: checkout_session::Model,
        order: order::Model,
    ) -> Result<Settlement, ServiceError> {
        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;
        let demand = aggregate_demand(items.iter().map(|i| (i.product_id, i.quantity)));

        // Money has been captured; the order is confirmed even if stock or
        // the coupon ran out meanwhile, and the gap is flagged for follow-up.
        let short: Vec<StockShortfall> = self.inventory.decrement_all(&txn, &demand).await?;
        let coupon_exhausted = match order.coupon_id {
            Some(coupon_id) => !self.coupons.consume(&txn, coupon_id).await?,
            None => false,
        };

        let now = Utc::now();
        let order = update_guarded(
            &txn,
            &order,
            vec![
                (order::Column::IsPaid, Expr::value(true)),
                (order::Column::PaidAt, Expr::value(Some(now))),
                (order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid)),
                (order::Column::Status, Expr::value(OrderStatus::Completed)),
            ],
        )
        .await?;

        set_session_status(&txn, session.id, SessionStatus::Completed).await?;
        CheckoutSession::update_many()
            .col_expr(
                checkout_session::Column::Status,
                Expr::value(SessionStatus::Cancelled),
            )
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::OrderId.eq(order.id))
            .filter(checkout_session::Column::Status.eq(SessionStatus::Open))
            .exec(&txn)
            .await?;
        self.carts.clear_in(&txn, order.cart_id).await?;
        txn.commit().await?;

        info!(order_id = %order.id, reference = %session.provider_reference, "Card payment settled");
        metrics::counter!("payments_settled_total", 1, "outcome" => "paid");
        self.event_sender.send_or_log(Event::PaymentSettled(order.id));
        self.event_sender.send_or_log(Event::OrderCompleted(order.id));
        self.event_sender.send_or_log(Event::CartCleared(order.cart_id));
        if !short.is_empty() {
            error!(order_id = %order.id, ?short, "Paid order could not be fully covered by stock");
            self.event_sender
                .send_or_log(Event::StockShortfallAtSettlement {
                    order_id: order.id,
                    shortfalls: short,
                });
        }
        if coupon_exhausted {
            let code = order.coupon_code.clone().unwrap_or_default();
            warn!(order_id = %order.id, %code, "Coupon cap reached before payment settled");
            self.event_sender
                .send_or_log(Event::CouponExhaustedAtSettlement {
                    order_id: order.id,
                    code,
                });
        }
        Ok(Settlement::Confirmed(order))
    }

    async fn close_unpaid(
        &self,
        txn: sea_orm::DatabaseTransaction,
        session: checkout_session::Model,
        order: order::Model,
        state: SessionState,
    ) -> Result<Settlement, ServiceError> {
        set_session_status(&txn, session.id, closed_status(state)).await?;

        let newer_open = CheckoutSession::find()
            .filter(checkout_session::Column::OrderId.eq(order.id))
            .filter(checkout_session::Column::Id.ne(session.id))
            .filter(checkout_session::Column::Status.eq(SessionStatus::Open))
            .filter(checkout_session::Column::ExpiresAt.gt(Utc::now()))
            .one(&txn)
            .await?;
        if newer_open.is_some() {
            txn.commit().await?;
            info!(order_id = %order.id, reference = %session.provider_reference, "Superseded session closed");
            return Ok(Settlement::Superseded(order));
        }

        let order = update_guarded(
            &txn,
            &order,
            vec![
                (order::Column::PaymentStatus, Expr::value(PaymentStatus::Failed)),
                (order::Column::Status, Expr::value(OrderStatus::Cancelled)),
            ],
        )
        .await?;
        txn.commit().await?;

        let reason = format!("payment {}", closed_status(state).as_ref());
        info!(order_id = %order.id, %reason, "Card order cancelled");
        metrics::counter!("payments_settled_total", 1, "outcome" => "unpaid");
        self.event_sender.send_or_log(Event::OrderCancelled {
            order_id: order.id,
            reason,
        });
        Ok(Settlement::Cancelled(order))
    }

    /// Handles the browser coming back from the hosted page.
    ///
    /// The redirect itself proves nothing; the provider is asked for the
    /// session's real state. A cancel landing on a still-open session expires
    /// it at the provider first and the order follows whatever state the
    /// provider reports back, so a session that can still be paid never
    /// leaves behind a cancelled order. Returns the shopper-facing URL to
    /// redirect to, with `order_id` attached.
    #[instrument(skip(self))]
    pub async fn complete_return(
        &self,
        session_reference: Option<&str>,
        order_id: Option<Uuid>,
        outcome: ReturnOutcome,
    ) -> Result<String, ServiceError> {
        let session = match (session_reference, order_id) {
            (Some(reference), _) if reference != SESSION_ID_PLACEHOLDER => {
                CheckoutSession::find()
                    .filter(checkout_session::Column::ProviderReference.eq(reference))
                    .one(&*self.db)
                    .await?
            }
            (_, Some(order_id)) => self.latest_session(&*self.db, order_id).await?,
            _ => None,
        }
        .ok_or_else(|| ServiceError::NotFound("Payment session not found".to_string()))?;

        let reference = session.provider_reference.as_str();
        let provider_state = match (self.gateway.session_state(reference).await?, outcome) {
            (SessionState::Open, ReturnOutcome::Cancel) => {
                match self.gateway.expire_session(reference).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(%reference, error = %e, "Could not expire abandoned session; order stays pending");
                        SessionState::Open
                    }
                }
            }
            (state, _) => state,
        };
        let settlement = if provider_state.is_settled() {
            Some(self.settle(reference, provider_state).await?)
        } else {
            None
        };

        let order = match settlement {
            Some(s) => s.order().clone(),
            None => Order::find_by_id(session.order_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Order {} not found", session.order_id))
                })?,
        };

        let target = match (order.status, outcome) {
            (OrderStatus::Cancelled, _) | (OrderStatus::Pending, ReturnOutcome::Cancel) => {
                session.cancel_url
            }
            _ => session.success_url,
        };
        Ok(with_order_id(
            target.as_deref().unwrap_or(&self.settings.fallback_redirect_url),
            order.id,
        ))
    }

    /// Sweeps open sessions past their expiry. The provider's own answer
    /// decides the outcome; a session it still calls open is expired there
    /// first. Returns how many orders changed state.
    #[instrument(skip(self))]
    pub async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let stale = CheckoutSession::find()
            .filter(checkout_session::Column::Status.eq(SessionStatus::Open))
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .order_by_asc(checkout_session::Column::ExpiresAt)
            .all(&*self.db)
            .await?;

        let mut changed = 0;
        for session in stale {
            let reference = session.provider_reference.as_str();
            let state = match self.gateway.session_state(reference).await {
                Ok(SessionState::Open) => match self.gateway.expire_session(reference).await {
                    Ok(SessionState::Open) => {
                        warn!(%reference, "Provider kept a stale session open");
                        continue;
                    }
                    Ok(state) => state,
                    Err(GatewayError::UnknownSession(_)) => SessionState::Expired,
                    Err(e) => {
                        warn!(%reference, error = %e, "Could not expire stale session");
                        continue;
                    }
                },
                Err(GatewayError::UnknownSession(_)) => SessionState::Expired,
                Ok(state) => state,
                Err(e) => {
                    warn!(reference = %session.provider_reference, error = %e, "Could not reconcile session");
                    continue;
                }
            };
            match self.settle(&session.provider_reference, state).await {
                Ok(Settlement::Confirmed(_)) | Ok(Settlement::Cancelled(_)) => changed += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(reference = %session.provider_reference, error = %e, "Reconciliation failed")
                }
            }
        }
        if changed > 0 {
            info!(changed, "Reconciled stale payment sessions");
        }
        Ok(changed)
    }

    async fn open_session(
        &self,
        order: &order::Model,
        success_url: Option<String>,
        cancel_url: Option<String>,
    ) -> Result<checkout_session::Model, ServiceError> {
        let request = SessionRequest {
            order_id: order.id,
            order_number: order.order_number.clone(),
            owner_id: order.owner_id,
            amount: order.total,
            currency: order.currency.clone(),
            success_url: format!(
                "{}?outcome=success&session_id={}",
                self.settings.return_url, SESSION_ID_PLACEHOLDER
            ),
            cancel_url: format!(
                "{}?outcome=cancel&order_id={}",
                self.settings.return_url, order.id
            ),
            expires_at: Utc::now() + self.settings.session_ttl,
            idempotency_key: Uuid::new_v4().to_string(),
        };

        let hosted = match self.gateway.create_session(&request).await {
            Ok(hosted) => hosted,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Payment session creation failed");
                metrics::counter!("payment_sessions_failed_total", 1);
                self.event_sender.send_or_log(Event::PaymentSessionFailed {
                    order_id: order.id,
                    reason: e.to_string(),
                });
                return Err(ServiceError::PaymentSessionFailed {
                    order_id: order.id,
                    reason: e.to_string(),
                });
            }
        };

        let now = Utc::now();
        let session = checkout_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            provider: Set(self.gateway.name().to_string()),
            provider_reference: Set(hosted.reference.clone()),
            checkout_url: Set(hosted.checkout_url.clone()),
            success_url: Set(success_url),
            cancel_url: Set(cancel_url),
            status: Set(SessionStatus::Open),
            expires_at: Set(hosted.expires_at),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(order_id = %order.id, reference = %hosted.reference, "Payment session opened");
        self.event_sender.send_or_log(Event::PaymentSessionCreated {
            order_id: order.id,
            provider_reference: hosted.reference,
            expires_at: hosted.expires_at,
        });
        Ok(session)
    }

    async fn latest_session(
        &self,
        conn: &impl ConnectionTrait,
        order_id: Uuid,
    ) -> Result<Option<checkout_session::Model>, ServiceError> {
        Ok(CheckoutSession::find()
            .filter(checkout_session::Column::OrderId.eq(order_id))
            .order_by_desc(checkout_session::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn result_for(&self, order: order::Model) -> Result<CheckoutResult, ServiceError> {
        let checkout_url = if order.status == OrderStatus::Pending {
            self.latest_session(&*self.db, order.id)
                .await?
                .filter(|s| s.status == SessionStatus::Open && s.expires_at > Utc::now())
                .map(|s| s.checkout_url)
        } else {
            None
        };
        let items = self.order_items(order.id).await?;
        Ok(CheckoutResult {
            order,
            items,
            checkout_url,
        })
    }
}

/// Runs [`CheckoutService::expire_stale_sessions`] every `every` until the
/// runtime shuts down.
pub fn spawn_reconciler(
    checkout: Arc<CheckoutService>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "Payment session reconciler started");
        loop {
            ticker.tick().await;
            if let Err(e) = checkout.expire_stale_sessions(Utc::now()).await {
                warn!(error = %e, "Payment session sweep failed");
            }
        }
    })
}

async fn set_session_status(
    conn: &impl ConnectionTrait,
    session_id: Uuid,
    status: SessionStatus,
) -> Result<(), ServiceError> {
    CheckoutSession::update_many()
        .col_expr(checkout_session::Column::Status, Expr::value(status))
        .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(checkout_session::Column::Id.eq(session_id))
        .exec(conn)
        .await?;
    Ok(())
}

fn closed_status(state: SessionState) -> SessionStatus {
    match state {
        SessionState::Paid => SessionStatus::Completed,
        SessionState::Expired => SessionStatus::Expired,
        SessionState::Open | SessionState::Failed | SessionState::Cancelled => {
            SessionStatus::Cancelled
        }
    }
}

const ORDER_NUMBER_ATTEMPTS: usize = 5;

/// `ORD-` followed by twelve uppercase hex characters.
pub fn generate_order_number() -> String {
    let raw = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ORD-{}", &raw[..12])
}

/// Inserts `order` under a number from `next_number`, drawing a new one when
/// the number is already taken. Each attempt runs in a savepoint so a
/// collision leaves the surrounding transaction usable.
async fn insert_with_order_number(
    txn: &DatabaseTransaction,
    order: order::ActiveModel,
    mut next_number: impl FnMut() -> String,
) -> Result<order::Model, ServiceError> {
    for attempt in 1..=ORDER_NUMBER_ATTEMPTS {
        let mut candidate = order.clone();
        candidate.order_number = Set(next_number());
        let savepoint = txn.begin().await?;
        match candidate.insert(&savepoint).await {
            Ok(inserted) => {
                savepoint.commit().await?;
                return Ok(inserted);
            }
            Err(e) if is_order_number_collision(&e) => {
                savepoint.rollback().await?;
                warn!(attempt, "Order number already taken, drawing another");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ServiceError::InternalError(
        "Could not allocate a unique order number".to_string(),
    ))
}

fn is_order_number_collision(err: &sea_orm::DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(SqlErr::UniqueConstraintViolation(message)) if message.contains("order_number")
    )
}

fn with_order_id(target: &str, order_id: Uuid) -> String {
    match url::Url::parse(target) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("order_id", &order_id.to_string());
            url.to_string()
        }
        Err(_) => {
            let separator = if target.contains('?') { '&' } else { '?' };
            format!("{}{}order_id={}", target, separator, order_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DbConfig};
    use rust_decimal::Decimal;

    async fn memory_db() -> DatabaseConnection {
        let pool = db::establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: std::time::Duration::from_secs(5),
            idle_timeout: std::time::Duration::from_secs(60),
            acquire_timeout: std::time::Duration::from_secs(5),
        })
        .await
        .unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    fn pending_order() -> order::ActiveModel {
        let now = Utc::now();
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: NotSet,
            owner_id: Set(Uuid::new_v4()),
            cart_id: Set(Uuid::new_v4()),
            idempotency_key: Set(None),
            payment_method: Set(PaymentMethod::Cash),
            payment_status: Set(PaymentStatus::Pending),
            status: Set(OrderStatus::Pending),
            subtotal: Set(Decimal::TEN),
            discount: Set(Decimal::ZERO),
            shipping_cost: Set(Decimal::ZERO),
            total: Set(Decimal::TEN),
            currency: Set("USD".to_string()),
            coupon_id: Set(None),
            coupon_code: Set(None),
            shipping_address_id: Set(Uuid::new_v4()),
            shipping_address: Set("1 Main St".to_string()),
            shipping_phone: Set("555".to_string()),
            shipping_city: Set("Springfield".to_string()),
            is_paid: Set(false),
            paid_at: Set(None),
            is_delivered: Set(false),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
    }

    #[tokio::test]
    async fn taken_order_number_is_redrawn() {
        let conn = memory_db().await;
        let txn = conn.begin().await.unwrap();
        insert_with_order_number(&txn, pending_order(), || "ORD-TAKEN".to_string())
            .await
            .unwrap();

        let mut draws = vec!["ORD-FRESH".to_string(), "ORD-TAKEN".to_string()];
        let inserted = insert_with_order_number(&txn, pending_order(), || {
            draws.pop().unwrap()
        })
        .await
        .unwrap();
        assert_eq!(inserted.order_number, "ORD-FRESH");
        assert!(draws.is_empty());
        txn.commit().await.unwrap();

        assert_eq!(Order::find().all(&conn).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn order_number_allocation_gives_up_eventually() {
        let conn = memory_db().await;
        let txn = conn.begin().await.unwrap();
        insert_with_order_number(&txn, pending_order(), || "ORD-TAKEN".to_string())
            .await
            .unwrap();

        let mut draws = 0;
        let err = insert_with_order_number(&txn, pending_order(), || {
            draws += 1;
            "ORD-TAKEN".to_string()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InternalError(_)));
        assert_eq!(draws, ORDER_NUMBER_ATTEMPTS);
    }

    #[test]
    fn order_numbers_have_fixed_shape() {
        let number = generate_order_number();
        assert_eq!(number.len(), 16);
        assert!(number.starts_with("ORD-"));
        assert!(number[4..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(number, generate_order_number());
    }

    #[test]
    fn order_id_is_appended_to_redirects() {
        let id = Uuid::nil();
        assert_eq!(
            with_order_id("https://shop.test/thanks", id),
            format!("https://shop.test/thanks?order_id={}", id)
        );
        assert_eq!(
            with_order_id("https://shop.test/thanks?ref=mail", id),
            format!("https://shop.test/thanks?ref=mail&order_id={}", id)
        );
    }

    #[test]
    fn closed_session_status_follows_provider_state() {
        assert_eq!(closed_status(SessionState::Expired), SessionStatus::Expired);
        assert_eq!(closed_status(SessionState::Failed), SessionStatus::Cancelled);
        assert_eq!(closed_status(SessionState::Cancelled), SessionStatus::Cancelled);
    }
}
