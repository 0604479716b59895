use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{OrderStatus, PaymentMethod};
use crate::errors::StockShortfall;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes without waiting. A full or closed channel is logged and the
    /// event dropped; the committed state change it describes stands.
    pub fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", e);
        }
    }
}

/// Domain events emitted after the corresponding transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartUpdated {
        cart_id: Uuid,
        owner_id: Uuid,
        version: i32,
    },
    CartCleared(Uuid),
    CouponApplied {
        cart_id: Uuid,
        code: String,
    },
    CouponDetached {
        cart_id: Uuid,
        code: String,
        reason: String,
    },
    OrderCreated {
        order_id: Uuid,
        payment_method: PaymentMethod,
    },
    OrderCompleted(Uuid),
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    OrderDelivered(Uuid),
    PaymentSessionCreated {
        order_id: Uuid,
        provider_reference: String,
        expires_at: DateTime<Utc>,
    },
    PaymentSessionFailed {
        order_id: Uuid,
        reason: String,
    },
    PaymentSettled(Uuid),
    /// Card payment captured but stock ran out between checkout and settlement.
    StockShortfallAtSettlement {
        order_id: Uuid,
        shortfalls: Vec<StockShortfall>,
    },
    /// Card payment captured but the coupon cap was reached in the meantime.
    CouponExhaustedAtSettlement {
        order_id: Uuid,
        code: String,
    },
    /// The provider captured a payment for an order that had already been
    /// finalized by another path. Needs a refund or manual confirmation.
    PaymentOnFinalizedOrder {
        order_id: Uuid,
        provider_reference: String,
        status: OrderStatus,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartUpdated { .. } => "cart.updated",
            Event::CartCleared(_) => "cart.cleared",
            Event::CouponApplied { .. } => "cart.coupon_applied",
            Event::CouponDetached { .. } => "cart.coupon_detached",
            Event::OrderCreated { .. } => "order.created",
            Event::OrderCompleted(_) => "order.completed",
            Event::OrderCancelled { .. } => "order.cancelled",
            Event::OrderDelivered(_) => "order.delivered",
            Event::PaymentSessionCreated { .. } => "payment.session_created",
            Event::PaymentSessionFailed { .. } => "payment.session_failed",
            Event::PaymentSettled(_) => "payment.settled",
            Event::StockShortfallAtSettlement { .. } => "order.stock_shortfall",
            Event::CouponExhaustedAtSettlement { .. } => "order.coupon_exhausted",
            Event::PaymentOnFinalizedOrder { .. } => "payment.on_finalized_order",
        }
    }

    /// Events that need a human to reconcile stock or promotions.
    pub fn requires_attention(&self) -> bool {
        matches!(
            self,
            Event::StockShortfallAtSettlement { .. }
                | Event::CouponExhaustedAtSettlement { .. }
                | Event::PaymentOnFinalizedOrder { .. }
        )
    }
}

/// Drains the event channel, logging every event. Runs until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("domain_events_total", 1, "event" => event.name());
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));
        if event.requires_attention() {
            error!(event = event.name(), payload = %payload, "Settlement anomaly");
        } else {
            info!(event = event.name(), payload = %payload, "Domain event");
        }
    }

    info!("Event channel closed; event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_never_blocks_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();
        sender.send_or_log(Event::OrderCompleted(id));
        sender.send_or_log(Event::OrderDelivered(id));

        assert_eq!(rx.recv().await, Some(Event::OrderCompleted(id)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn settlement_anomalies_are_flagged() {
        let id = Uuid::new_v4();
        assert!(Event::StockShortfallAtSettlement {
            order_id: id,
            shortfalls: vec![],
        }
        .requires_attention());
        assert!(Event::PaymentOnFinalizedOrder {
            order_id: id,
            provider_reference: "sbx_1".into(),
            status: OrderStatus::Cancelled,
        }
        .requires_attention());
        assert!(!Event::PaymentSettled(id).requires_attention());
    }
}
