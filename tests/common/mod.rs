#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, HeaderValue, Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use storefront_checkout::{
    build_router,
    config::AppConfig,
    db,
    entities::commerce::{city, coupon, product, shipping_address, Coupon, DiscountType, Product},
    events::{self, Event, EventSender},
    handlers::{common::USER_ID_HEADER, AppServices},
    services::{
        commerce::{AddToCartInput, CheckoutSettings},
        payments::{signature, PaymentGateway, SandboxGateway},
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const PUBLIC_BASE_URL: &str = "http://shop.test";

/// Application state over a throwaway SQLite database and the sandbox
/// payment provider.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    pub gateway: Arc<SandboxGateway>,
    _event_task: Option<tokio::task::JoinHandle<()>>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        Self::build(event_tx, Some(event_task)).await
    }

    /// Like [`TestApp::new`], but hands the event stream to the test instead
    /// of draining it.
    pub async fn with_events() -> (Self, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        (Self::build(event_tx, None).await, event_rx)
    }

    async fn build(
        event_tx: mpsc::Sender<Event>,
        event_task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.public_base_url = PUBLIC_BASE_URL.to_string();
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        // one connection: SQLite serializes writers, so racing checkouts run
        // one transaction after the other
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let event_sender = EventSender::new(event_tx);

        let gateway = Arc::new(
            SandboxGateway::new(PUBLIC_BASE_URL).with_webhook_secret(
                cfg.payment_webhook_secret.clone(),
                cfg.payment_webhook_tolerance_secs,
            ),
        );
        let services = AppServices::new(
            db_arc.clone(),
            Arc::new(event_sender.clone()),
            gateway.clone() as Arc<dyn PaymentGateway>,
            CheckoutSettings::from(&cfg),
        );

        let state = Arc::new(AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        });

        Self {
            router: build_router(state.clone()),
            state,
            gateway,
            _event_task: event_task,
            _dir: dir,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Sends a request as `user`, or anonymously.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<Uuid>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    /// Posts a raw payload, as a provider would.
    pub async fn post_raw(&self, uri: &str, payload: Vec<u8>, headers: &[(&str, String)]) -> Response {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(payload)).expect("build request"))
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        max_usage: i32,
        min_order_value: Decimal,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            max_usage: Set(max_usage),
            used_count: Set(0),
            min_order_value: Set(min_order_value),
            expired_at: Set(now + Duration::days(7)),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    /// A city with the given flat shipping price and one address in it owned by `owner`.
    pub async fn seed_address(&self, owner: Uuid, shipping_price: Decimal) -> shipping_address::Model {
        let now = Utc::now();
        let city = city::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Springfield".to_string()),
            country: Set("US".to_string()),
            shipping_price: Set(shipping_price),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed city");

        shipping_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner),
            address: Set("742 Evergreen Terrace".to_string()),
            phone: Set("+1-555-0100".to_string()),
            city_id: Set(city.id),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed address")
    }

    pub async fn add(&self, owner: Uuid, product_id: Uuid, quantity: i32) {
        self.services()
            .cart
            .add_item(owner, add_input(product_id, quantity))
            .await
            .expect("add item");
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        Product::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    pub async fn coupon_uses(&self, coupon_id: Uuid) -> i32 {
        Coupon::find_by_id(coupon_id)
            .one(&*self.state.db)
            .await
            .expect("query coupon")
            .expect("coupon exists")
            .used_count
    }

    pub async fn update_coupon(&self, coupon: coupon::Model, f: impl FnOnce(&mut coupon::ActiveModel)) {
        let mut active: coupon::ActiveModel = coupon.into();
        f(&mut active);
        active.update(&*self.state.db).await.expect("update coupon");
    }

    pub async fn set_stock(&self, product: &product::Model, stock: i32) {
        let mut active: product::ActiveModel = product.clone().into();
        active.stock = Set(stock);
        active.update(&*self.state.db).await.expect("update stock");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(task) = &self._event_task {
            task.abort();
        }
    }
}

/// Events published so far, in order.
pub fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn add_input(product_id: Uuid, quantity: i32) -> AddToCartInput {
    AddToCartInput {
        product_id,
        quantity,
        color: None,
        size: None,
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response is JSON")
}

/// Headers the sandbox provider would attach to `payload`.
pub fn signed_headers(payload: &[u8]) -> Vec<(&'static str, String)> {
    let timestamp = Utc::now().timestamp();
    let sig = signature::sign(WEBHOOK_SECRET, timestamp, payload).expect("sign payload");
    vec![
        (signature::TIMESTAMP_HEADER, timestamp.to_string()),
        (signature::SIGNATURE_HEADER, sig),
        ("content-type", "application/json".to_string()),
    ]
}

pub fn header_map(pairs: &[(&'static str, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(*name, HeaderValue::from_str(value).expect("header value"));
    }
    headers
}

/// Provider reference embedded in a sandbox checkout URL.
pub fn reference_in(checkout_url: &str) -> String {
    checkout_url
        .rsplit('/')
        .next()
        .expect("checkout url has a reference")
        .to_string()
}
