use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::commerce::coupon::{self, normalize_code, Entity as CouponEntity};
use crate::errors::ServiceError;
use crate::services::commerce::pricing_service::{self, round_money, CouponTerms};

/// A coupon that passed every check, with the discount it grants on the
/// subtotal it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCoupon {
    pub coupon: coupon::Model,
    pub discount: Decimal,
}

/// Runs the coupon checks in their fixed order; the first failure wins.
///
/// `subtotal` is the gross (pre-discount) cart subtotal. Nothing is mutated.
pub fn check_coupon(
    code: &str,
    found: Option<&coupon::Model>,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<Decimal, ServiceError> {
    let coupon = found.ok_or_else(|| ServiceError::CouponNotFound(code.to_string()))?;
    if !coupon.is_active {
        return Err(ServiceError::CouponInactive(coupon.code.clone()));
    }
    if now > coupon.expired_at {
        return Err(ServiceError::CouponExpired(coupon.code.clone()));
    }
    if coupon.used_count >= coupon.max_usage {
        return Err(ServiceError::CouponUsageExceeded(coupon.code.clone()));
    }
    if subtotal < coupon.min_order_value {
        return Err(ServiceError::CouponBelowMinOrder {
            code: coupon.code.clone(),
            minimum: round_money(coupon.min_order_value),
            shortfall: round_money(coupon.min_order_value - subtotal),
        });
    }
    Ok(pricing_service::compute_discount(
        subtotal,
        Some(&CouponTerms::from(coupon)),
    ))
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_code(
        &self,
        conn: &impl ConnectionTrait,
        code: &str,
    ) -> Result<Option<coupon::Model>, ServiceError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Ok(None);
        }
        Ok(CouponEntity::find()
            .filter(coupon::Column::Code.eq(normalized))
            .one(conn)
            .await?)
    }

    /// Validates `code` against `subtotal` without touching usage counters.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Decimal,
    ) -> Result<ValidatedCoupon, ServiceError> {
        self.validate_in(self.db.as_ref(), code, subtotal).await
    }

    /// Same as [`validate`](Self::validate), reading through the caller's
    /// connection or transaction.
    pub async fn validate_in(
        &self,
        conn: &impl ConnectionTrait,
        code: &str,
        subtotal: Decimal,
    ) -> Result<ValidatedCoupon, ServiceError> {
        let normalized = normalize_code(code);
        let found = self.find_by_code(conn, &normalized).await?;
        let discount = check_coupon(&normalized, found.as_ref(), subtotal, Utc::now())?;
        let coupon = found.ok_or_else(|| ServiceError::CouponNotFound(normalized.clone()))?;
        debug!(code = %coupon.code, %discount, "Coupon validated");
        Ok(ValidatedCoupon { coupon, discount })
    }

    /// Atomically takes one use of the coupon.
    ///
    /// The increment only happens while `used_count < max_usage`, so two
    /// racing orders cannot both take the last use. Returns `false` when the
    /// cap was already reached.
    pub async fn consume(
        &self,
        conn: &impl ConnectionTrait,
        coupon_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let result = CouponEntity::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon_id))
            .filter(Expr::col(coupon::Column::UsedCount).lt(Expr::col(coupon::Column::MaxUsage)))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(%coupon_id, "Coupon usage cap reached while consuming");
            return Ok(false);
        }
        metrics::counter!("coupons_consumed_total", 1);
        Ok(true)
    }
}
