//! Pure money arithmetic for carts and orders.
//!
//! Every function here is deterministic and side-effect free. Amounts are
//! rounded to two decimal places (midpoint away from zero) once, at the end
//! of each computation, never on intermediate values.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::entities::commerce::{coupon, DiscountType};

const MONEY_SCALE: u32 = 2;

/// One priced line: the captured unit price and its quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInput {
    pub unit_price: Decimal,
    pub quantity: i32,
}

/// The parts of a coupon that affect price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CouponTerms {
    pub discount_type: DiscountType,
    pub value: Decimal,
}

impl From<&coupon::Model> for CouponTerms {
    fn from(c: &coupon::Model) -> Self {
        Self {
            discount_type: c.discount_type,
            value: c.discount_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

pub fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    round_money(unit_price * Decimal::from(quantity))
}

/// `Σ unit_price × quantity`
pub fn compute_subtotal(lines: &[LineInput]) -> Decimal {
    let sum: Decimal = lines
        .iter()
        .map(|l| l.unit_price * Decimal::from(l.quantity))
        .sum();
    round_money(sum)
}

/// Discount a coupon grants on `subtotal`, always within `[0, subtotal]`.
pub fn compute_discount(subtotal: Decimal, coupon: Option<&CouponTerms>) -> Decimal {
    let Some(terms) = coupon else {
        return Decimal::ZERO;
    };
    if subtotal <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = match terms.discount_type {
        DiscountType::Percentage => subtotal * terms.value / Decimal::ONE_HUNDRED,
        DiscountType::Fixed => terms.value,
    };
    round_money(raw.max(Decimal::ZERO).min(subtotal))
}

/// `subtotal − discount + shipping`, never below zero.
pub fn compute_total(subtotal: Decimal, discount: Decimal, shipping: Decimal) -> Decimal {
    round_money((subtotal - discount + shipping).max(Decimal::ZERO))
}

/// Full pricing pass over a set of lines.
pub fn price(lines: &[LineInput], coupon: Option<&CouponTerms>, shipping: Decimal) -> Totals {
    let subtotal = compute_subtotal(lines);
    let discount = compute_discount(subtotal, coupon);
    let shipping = round_money(shipping.max(Decimal::ZERO));
    Totals {
        subtotal,
        discount,
        shipping,
        total: compute_total(subtotal, discount, shipping),
    }
}
