use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        commerce::{CartService, CheckoutService, CheckoutSettings, CouponService, ShippingService},
        inventory::InventoryService,
        orders::OrderService,
        payments::{self, PaymentGateway},
    },
};

pub mod commerce;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

/// Services shared by every HTTP handler
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
}

impl AppServices {
    /// Wires the services over one pool, one event channel and one payment provider.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        let coupons = Arc::new(CouponService::new(db_pool.clone()));
        let inventory = Arc::new(InventoryService::new());
        let shipping = Arc::new(ShippingService::new());
        let cart = Arc::new(CartService::new(
            db_pool.clone(),
            event_sender.clone(),
            coupons.clone(),
            inventory.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            event_sender.clone(),
            cart.clone(),
            coupons.clone(),
            inventory,
            shipping,
            gateway,
            settings,
        ));
        let orders = Arc::new(OrderService::new(db_pool, event_sender));

        Self {
            cart,
            checkout,
            coupons,
            orders,
        }
    }

    /// Same as [`new`](Self::new) with the provider and settings taken from config.
    pub fn from_config(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let gateway = payments::gateway_from_config(config)?;
        Ok(Self::new(
            db_pool,
            event_sender,
            gateway,
            CheckoutSettings::from(config),
        ))
    }
}
