//! Property-based tests over the pure parts of checkout: pricing, minor-unit
//! conversion and webhook signatures.

use axum::http::{HeaderMap, HeaderValue};
use proptest::prelude::*;
use rust_decimal::Decimal;
use storefront_checkout::{
    entities::commerce::DiscountType,
    services::{
        commerce::pricing_service::{price, CouponTerms, LineInput},
        payments::{signature, to_minor_units},
    },
};

const SECRET: &str = "whsec_property";

fn money_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn lines_strategy() -> impl Strategy<Value = Vec<LineInput>> {
    proptest::collection::vec(
        (money_strategy(), 1i32..50).prop_map(|(unit_price, quantity)| LineInput {
            unit_price,
            quantity,
        }),
        0..10,
    )
}

fn coupon_strategy() -> impl Strategy<Value = Option<CouponTerms>> {
    prop_oneof![
        Just(None),
        (0i64..=100).prop_map(|pct| Some(CouponTerms {
            discount_type: DiscountType::Percentage,
            value: Decimal::from(pct),
        })),
        money_strategy().prop_map(|value| Some(CouponTerms {
            discount_type: DiscountType::Fixed,
            value,
        })),
    ]
}

fn plain_headers(timestamp: i64, sig: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        signature::TIMESTAMP_HEADER,
        HeaderValue::from_str(&timestamp.to_string()).unwrap(),
    );
    headers.insert(signature::SIGNATURE_HEADER, HeaderValue::from_str(sig).unwrap());
    headers
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn totals_stay_within_bounds(
        lines in lines_strategy(),
        coupon in coupon_strategy(),
        shipping in money_strategy(),
    ) {
        let totals = price(&lines, coupon.as_ref(), shipping);
        prop_assert!(totals.discount >= Decimal::ZERO);
        prop_assert!(totals.discount <= totals.subtotal);
        prop_assert!(totals.total >= Decimal::ZERO);
        prop_assert_eq!(totals.total, totals.subtotal - totals.discount + totals.shipping);
        prop_assert!(totals.total.scale() <= 2);
    }

    #[test]
    fn minor_units_are_exact_for_cent_amounts(cents in 0i64..1_000_000_000) {
        prop_assert_eq!(to_minor_units(Decimal::new(cents, 2)).unwrap(), cents);
    }

    #[test]
    fn signed_payloads_verify_and_tampered_ones_do_not(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        flip in any::<prop::sample::Index>(),
    ) {
        let now = 1_700_000_000i64;
        let sig = signature::sign(SECRET, now, &payload).unwrap();
        let headers = plain_headers(now, &sig);
        prop_assert!(signature::verify_plain(&headers, &payload, SECRET, 300, now).is_ok());

        let mut tampered = payload.clone();
        let i = flip.index(tampered.len());
        tampered[i] ^= 0x01;
        prop_assert!(signature::verify_plain(&headers, &tampered, SECRET, 300, now).is_err());
    }
}
