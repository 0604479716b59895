/// Commerce services module - cart pricing and checkout
pub mod cart_service;
pub mod checkout_service;
pub mod coupon_service;
pub mod pricing_service;
pub mod shipping_service;

// Re-export services for convenience
pub use cart_service::{AddToCartInput, CartNotice, CartService, CartView};
pub use checkout_service::{
    spawn_reconciler, CheckoutInput, CheckoutResult, CheckoutService, CheckoutSettings,
    ReturnOutcome, Settlement,
};
pub use coupon_service::{CouponService, ValidatedCoupon};
pub use pricing_service::Totals;
pub use shipping_service::{ResolvedShipping, ShippingService};
