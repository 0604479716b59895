/// Commerce entities module
pub mod cart;
pub mod cart_item;
pub mod checkout_session;
pub mod city;
pub mod coupon;
pub mod product;
pub mod shipping_address;

// Re-export entities
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use checkout_session::{Entity as CheckoutSession, Model as CheckoutSessionModel, SessionStatus};
pub use city::{Entity as City, Model as CityModel};
pub use coupon::{DiscountType, Entity as Coupon, Model as CouponModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use shipping_address::{Entity as ShippingAddress, Model as ShippingAddressModel};
