mod common;

use assert_matches::assert_matches;
use common::{add_input, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use storefront_checkout::{
    entities::commerce::{product, DiscountType},
    errors::ServiceError,
    services::commerce::AddToCartInput,
};
use uuid::Uuid;

#[tokio::test]
async fn get_cart_creates_an_empty_cart_once() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();

    let first = app.services().cart.get_cart(owner).await.unwrap();
    let second = app.services().cart.get_cart(owner).await.unwrap();

    assert_eq!(first.cart.id, second.cart.id);
    assert!(first.items.is_empty());
    assert_eq!(first.cart.total, Decimal::ZERO);
}

#[tokio::test]
async fn same_variant_is_merged_and_keeps_captured_price() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Tee", dec!(20), 10).await;

    app.add(owner, product.id, 1).await;
    // catalog price changes after the line exists
    let mut active: product::ActiveModel = product.clone().into();
    active.price = Set(dec!(25));
    active.update(&*app.state.db).await.unwrap();

    let view = app
        .services()
        .cart
        .add_item(owner, add_input(product.id, 2))
        .await
        .unwrap();

    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 3);
    assert_eq!(view.items[0].unit_price, dec!(20));
    assert_eq!(view.cart.subtotal, dec!(60));
    assert_eq!(view.item_count(), 3);
}

#[tokio::test]
async fn different_variants_get_separate_lines() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Tee", dec!(20), 10).await;

    for color in ["red", "blue"] {
        app.services()
            .cart
            .add_item(
                owner,
                AddToCartInput {
                    product_id: product.id,
                    quantity: 1,
                    color: Some(color.to_string()),
                    size: Some("M".to_string()),
                },
            )
            .await
            .unwrap();
    }
    let view = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(view.items.len(), 2);
    assert_eq!(view.cart.subtotal, dec!(40));
}

#[tokio::test]
async fn stock_check_counts_every_line_of_the_product() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Mug", dec!(8), 3).await;

    app.services()
        .cart
        .add_item(
            owner,
            AddToCartInput {
                product_id: product.id,
                quantity: 2,
                color: Some("white".into()),
                size: None,
            },
        )
        .await
        .unwrap();

    let err = app
        .services()
        .cart
        .add_item(
            owner,
            AddToCartInput {
                product_id: product.id,
                quantity: 2,
                color: Some("black".into()),
                size: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::OutOfStock { requested: 4, available: 3, .. }
    );

    let view = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(view.item_count(), 2);
}

#[tokio::test]
async fn non_positive_quantities_are_rejected() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Mug", dec!(8), 3).await;

    assert_matches!(
        app.services().cart.add_item(owner, add_input(product.id, 0)).await,
        Err(ServiceError::ValidationError(_))
    );

    app.add(owner, product.id, 1).await;
    let item = app.services().cart.get_cart(owner).await.unwrap().items[0].clone();
    assert_matches!(
        app.services().cart.update_item(owner, item.id, 0).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let app = TestApp::new().await;
    assert_matches!(
        app.services()
            .cart
            .add_item(Uuid::new_v4(), add_input(Uuid::new_v4(), 1))
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn update_and_remove_reprice_the_cart() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let tee = app.seed_product("Tee", dec!(20), 10).await;
    let mug = app.seed_product("Mug", dec!(8), 10).await;
    app.add(owner, tee.id, 1).await;
    app.add(owner, mug.id, 2).await;

    let view = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(view.cart.subtotal, dec!(36));
    let tee_line = view.items.iter().find(|i| i.product_id == tee.id).unwrap().clone();
    let mug_line = view.items.iter().find(|i| i.product_id == mug.id).unwrap().clone();

    let view = app
        .services()
        .cart
        .update_item(owner, tee_line.id, 3)
        .await
        .unwrap();
    assert_eq!(view.cart.subtotal, dec!(76));

    let view = app
        .services()
        .cart
        .remove_item(owner, mug_line.id)
        .await
        .unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.cart.subtotal, dec!(60));
    assert_eq!(view.cart.total, dec!(60));

    assert_matches!(
        app.services().cart.remove_item(owner, mug_line.id).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn another_owners_line_cannot_be_touched() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Tee", dec!(20), 10).await;
    app.add(owner, product.id, 1).await;
    let line = app.services().cart.get_cart(owner).await.unwrap().items[0].clone();

    let stranger = Uuid::new_v4();
    assert_matches!(
        app.services().cart.update_item(stranger, line.id, 2).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        app.services().cart.remove_item(stranger, line.id).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn percentage_coupon_discounts_the_subtotal() {
    // 1000.00 subtotal with 10% off and a 100 minimum
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Bike", dec!(500), 5).await;
    app.seed_coupon("SAVE10", DiscountType::Percentage, dec!(10), 10, dec!(100))
        .await;
    app.add(owner, product.id, 2).await;

    let view = app
        .services()
        .cart
        .apply_coupon(owner, " save10 ")
        .await
        .unwrap();
    assert_eq!(view.cart.subtotal, dec!(1000));
    assert_eq!(view.cart.discount, dec!(100));
    assert_eq!(view.cart.total, dec!(900));
    assert_eq!(view.cart.coupon_code.as_deref(), Some("SAVE10"));
}

#[tokio::test]
async fn coupon_below_minimum_leaves_cart_unchanged() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Lamp", dec!(25), 5).await;
    app.seed_coupon("BIG100", DiscountType::Fixed, dec!(20), 10, dec!(100))
        .await;
    app.add(owner, product.id, 2).await;
    let before = app.services().cart.get_cart(owner).await.unwrap();

    let err = app
        .services()
        .cart
        .apply_coupon(owner, "BIG100")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::CouponBelowMinOrder { shortfall, .. } if shortfall == dec!(50)
    );

    let after = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(after.cart.subtotal, dec!(50));
    assert_eq!(after.cart.discount, Decimal::ZERO);
    assert!(after.cart.coupon_id.is_none());
    assert_eq!(after.cart.version, before.cart.version);
}

#[tokio::test]
async fn unknown_inactive_and_exhausted_coupons_are_reported() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Lamp", dec!(50), 5).await;
    app.add(owner, product.id, 1).await;

    assert_matches!(
        app.services().cart.apply_coupon(owner, "NOPE").await,
        Err(ServiceError::CouponNotFound(_))
    );

    let inactive = app
        .seed_coupon("OFF", DiscountType::Fixed, dec!(5), 10, Decimal::ZERO)
        .await;
    app.update_coupon(inactive, |c| c.is_active = Set(false))
        .await;
    assert_matches!(
        app.services().cart.apply_coupon(owner, "OFF").await,
        Err(ServiceError::CouponInactive(_))
    );

    let used = app
        .seed_coupon("USED", DiscountType::Fixed, dec!(5), 1, Decimal::ZERO)
        .await;
    app.update_coupon(used, |c| c.used_count = Set(1)).await;
    assert_matches!(
        app.services().cart.apply_coupon(owner, "USED").await,
        Err(ServiceError::CouponUsageExceeded(_))
    );
}

#[tokio::test]
async fn coupon_is_detached_when_the_cart_drops_below_minimum() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Chair", dec!(40), 10).await;
    app.seed_coupon("MIN100", DiscountType::Fixed, dec!(15), 10, dec!(100))
        .await;
    app.add(owner, product.id, 3).await;
    let view = app.services().cart.apply_coupon(owner, "MIN100").await.unwrap();
    assert_eq!(view.cart.total, dec!(105));
    let line = view.items[0].clone();

    let view = app
        .services()
        .cart
        .update_item(owner, line.id, 2)
        .await
        .unwrap();

    assert!(view.cart.coupon_id.is_none());
    assert_eq!(view.cart.discount, Decimal::ZERO);
    assert_eq!(view.cart.total, dec!(80));
    let notice = view.notice.expect("detach notice");
    assert_eq!(notice.kind, "coupon_removed");
    assert_eq!(notice.coupon_code, "MIN100");
}

#[tokio::test]
async fn apply_then_remove_restores_totals() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Desk", dec!(150), 3).await;
    app.seed_coupon("TAKE25", DiscountType::Fixed, dec!(25), 10, Decimal::ZERO)
        .await;
    app.add(owner, product.id, 1).await;

    let before = app.services().cart.get_cart(owner).await.unwrap();
    let applied = app.services().cart.apply_coupon(owner, "TAKE25").await.unwrap();
    assert_eq!(applied.cart.total, dec!(125));

    let removed = app.services().cart.remove_coupon(owner).await.unwrap();
    assert_eq!(removed.cart.subtotal, before.cart.subtotal);
    assert_eq!(removed.cart.discount, before.cart.discount);
    assert_eq!(removed.cart.total, before.cart.total);

    // idempotent
    let again = app.services().cart.remove_coupon(owner).await.unwrap();
    assert_eq!(again.cart.total, before.cart.total);
}

#[tokio::test]
async fn fixed_coupon_never_drives_total_negative() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Sticker", dec!(2), 50).await;
    app.seed_coupon("HUGE", DiscountType::Fixed, dec!(500), 10, Decimal::ZERO)
        .await;
    app.add(owner, product.id, 3).await;

    let view = app.services().cart.apply_coupon(owner, "HUGE").await.unwrap();
    assert_eq!(view.cart.discount, dec!(6));
    assert_eq!(view.cart.total, Decimal::ZERO);
}

#[tokio::test]
async fn clear_removes_lines_and_coupon() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Desk", dec!(150), 3).await;
    app.seed_coupon("TAKE25", DiscountType::Fixed, dec!(25), 10, Decimal::ZERO)
        .await;
    app.add(owner, product.id, 1).await;
    app.services().cart.apply_coupon(owner, "TAKE25").await.unwrap();

    let view = app.services().cart.clear(owner).await.unwrap();
    assert!(view.items.is_empty());
    assert!(view.cart.coupon_code.is_none());
    assert_eq!(view.cart.total, Decimal::ZERO);
}

#[tokio::test]
async fn every_mutation_bumps_the_version() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Pen", dec!(1.5), 100).await;

    let v0 = app.services().cart.get_cart(owner).await.unwrap().cart.version;
    app.add(owner, product.id, 1).await;
    app.add(owner, product.id, 1).await;
    let view = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(view.cart.version, v0 + 2);
    assert_eq!(view.cart.subtotal, dec!(3));
}

#[tokio::test]
async fn concurrent_adds_never_duplicate_lines() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let product = app.seed_product("Pen", dec!(1), 100).await;

    let cart = app.services().cart.clone();
    let (a, b, c) = tokio::join!(
        cart.add_item(owner, add_input(product.id, 1)),
        cart.add_item(owner, add_input(product.id, 2)),
        cart.add_item(owner, add_input(product.id, 3)),
    );
    for result in [a, b, c] {
        assert!(result.is_ok());
    }

    let view = app.services().cart.get_cart(owner).await.unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 6);
    assert_eq!(view.cart.subtotal, dec!(6));
}
