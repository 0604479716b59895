// Cart, coupon, pricing, shipping and checkout
pub mod commerce;

// Catalog stock checks and settlement decrements
pub mod inventory;

// Order queries and post-checkout transitions
pub mod orders;

// Hosted card payment providers
pub mod payments;
