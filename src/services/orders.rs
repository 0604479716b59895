use crate::{
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentMethod, PaymentStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, SimpleExpr},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

/// An order with its frozen lines.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrdersQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

impl ListOrdersQuery {
    /// Page numbers start at 1; page size is clamped to `1..=MAX_PER_PAGE`.
    pub fn normalized(self) -> (u64, u64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Read access to orders and the post-checkout transitions: delivery and
/// the administrative status override.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Loads one of the caller's orders. Another owner's order is reported
    /// as missing.
    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: Uuid, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.owner_id == owner_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.detail(order).await
    }

    /// Lists the caller's orders, newest first
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        owner_id: Uuid,
        query: ListOrdersQuery,
    ) -> Result<OrderPage, ServiceError> {
        let (page, per_page) = query.normalized();
        let paginator = OrderEntity::find()
            .filter(order::Column::OwnerId.eq(owner_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, per_page);

        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Records delivery of a completed order. Delivering a cash order also
    /// records the cash collected at the door.
    #[instrument(skip(self))]
    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<OrderDetail, ServiceError> {
        let txn = self.db.begin().await?;
        let order = self.locked(&txn, order_id).await?;

        if order.status != OrderStatus::Completed {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is {} and cannot be delivered",
                order.order_number,
                order.status.as_ref()
            )));
        }
        if order.is_delivered {
            txn.commit().await?;
            return self.detail(order).await;
        }

        let now = Utc::now();
        let mut changes = vec![
            (order::Column::IsDelivered, Expr::value(true)),
            (order::Column::DeliveredAt, Expr::value(Some(now))),
        ];
        if order.payment_method == PaymentMethod::Cash && !order.is_paid {
            changes.push((order::Column::IsPaid, Expr::value(true)));
            changes.push((order::Column::PaidAt, Expr::value(Some(now))));
            changes.push((order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid)));
        }
        let order = update_guarded(&txn, &order, changes).await?;
        txn.commit().await?;

        info!(order_id = %order.id, "Order delivered");
        self.event_sender.send_or_log(Event::OrderDelivered(order.id));
        self.detail(order).await
    }

    /// Administrative status override. Subject to the same state machine as
    /// every other transition; cancelling releases nothing because stock and
    /// coupon usage are only taken at confirmation. An unpaid card order is
    /// only completed by its payment settling, which is what takes its stock
    /// and coupon use.
    #[instrument(skip(self))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderDetail, ServiceError> {
        let txn = self.db.begin().await?;
        let order = self.locked(&txn, order_id).await?;

        if !order.status.can_transition_to(next) {
            return Err(ServiceError::InvalidStatusTransition {
                from: order.status.as_ref().to_string(),
                to: next.as_ref().to_string(),
            });
        }

        if next == OrderStatus::Completed
            && order.payment_method == PaymentMethod::CreditCard
            && !order.is_paid
        {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is awaiting card payment and completes when the payment settles",
                order.order_number
            )));
        }

        let mut changes = vec![(order::Column::Status, Expr::value(next))];
        if next == OrderStatus::Cancelled
            && order.payment_status.can_transition_to(PaymentStatus::Failed)
        {
            changes.push((order::Column::PaymentStatus, Expr::value(PaymentStatus::Failed)));
        }
        let order = update_guarded(&txn, &order, changes).await?;
        txn.commit().await?;

        info!(order_id = %order.id, status = order.status.as_ref(), "Order status overridden");
        match next {
            OrderStatus::Completed => self.event_sender.send_or_log(Event::OrderCompleted(order.id)),
            OrderStatus::Cancelled => self.event_sender.send_or_log(Event::OrderCancelled {
                order_id: order.id,
                reason: "administrative override".to_string(),
            }),
            OrderStatus::Pending => {}
        }
        self.detail(order).await
    }

    async fn locked(
        &self,
        conn: &impl ConnectionTrait,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn detail(&self, order: order::Model) -> Result<OrderDetail, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(OrderDetail { order, items })
    }
}

/// Writes `changes` to `order` only if its `version` is unchanged since it
/// was read, bumping the version. Returns the updated row.
pub(crate) async fn update_guarded(
    conn: &impl ConnectionTrait,
    order: &order::Model,
    changes: Vec<(order::Column, SimpleExpr)>,
) -> Result<order::Model, ServiceError> {
    let mut update = OrderEntity::update_many()
        .col_expr(order::Column::Version, Expr::value(order.version + 1))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
    for (column, value) in changes {
        update = update.col_expr(column, value);
    }
    let result = update
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(order.id));
    }
    OrderEntity::find_by_id(order.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))
}
