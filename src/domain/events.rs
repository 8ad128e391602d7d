use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::order::{OrderStatus, PaymentOrder};
use crate::domain::refund::RefundOrder;

/// Integration events, written to the outbox in the same transaction as the
/// aggregate and relayed to the event stream afterwards. Consumers see them
/// at-least-once; `dedup_key` lets the store drop same-transition replays.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    PaymentCreated {
        order_id: String,
        merchant_order_id: String,
        user_id: String,
        amount: Decimal,
        currency: String,
        method: String,
        status: OrderStatus,
        occurred_at: DateTime<Utc>,
    },
    PaymentSucceeded {
        order_id: String,
        merchant_order_id: String,
        user_id: String,
        paid_amount: Decimal,
        currency: String,
        gateway_order_id: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        occurred_at: DateTime<Utc>,
    },
    PaymentFailed {
        order_id: String,
        merchant_order_id: String,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    StatusChanged {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
        occurred_at: DateTime<Utc>,
    },
    RefundCreated {
        order_id: String,
        refund_id: String,
        amount: Decimal,
        currency: String,
        reason: String,
        operator_id: String,
        occurred_at: DateTime<Utc>,
    },
    RefundSucceeded {
        order_id: String,
        refund_id: String,
        amount: Decimal,
        currency: String,
        order_status: OrderStatus,
        occurred_at: DateTime<Utc>,
    },
    RefundFailed {
        order_id: String,
        refund_id: String,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
}

impl OrderEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::PaymentCreated { .. } => "payment.created",
            OrderEvent::PaymentSucceeded { .. } => "payment.succeeded",
            OrderEvent::PaymentFailed { .. } => "payment.failed",
            OrderEvent::StatusChanged { .. } => "payment.status_changed",
            OrderEvent::RefundCreated { .. } => "refund.created",
            OrderEvent::RefundSucceeded { .. } => "refund.succeeded",
            OrderEvent::RefundFailed { .. } => "refund.failed",
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::PaymentCreated { order_id, .. }
            | OrderEvent::PaymentSucceeded { order_id, .. }
            | OrderEvent::PaymentFailed { order_id, .. }
            | OrderEvent::StatusChanged { order_id, .. }
            | OrderEvent::RefundCreated { order_id, .. }
            | OrderEvent::RefundSucceeded { order_id, .. }
            | OrderEvent::RefundFailed { order_id, .. } => order_id,
        }
    }

    /// Unique within one order and event type; a redelivered callback that
    /// produces the same logical event collides here and is dropped.
    pub fn dedup_key(&self) -> String {
        match self {
            OrderEvent::PaymentCreated { .. } => "created".to_string(),
            OrderEvent::PaymentSucceeded { .. } => "paid".to_string(),
            OrderEvent::PaymentFailed { .. } => "pay_failed".to_string(),
            OrderEvent::StatusChanged { from, to, .. } => {
                format!("status:{}->{}", from.as_str(), to.as_str())
            }
            OrderEvent::RefundCreated { refund_id, .. } => format!("refund:{refund_id}:created"),
            OrderEvent::RefundSucceeded { refund_id, .. } => {
                format!("refund:{refund_id}:succeeded")
            }
            OrderEvent::RefundFailed { refund_id, .. } => format!("refund:{refund_id}:failed"),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

pub fn payment_created(order: &PaymentOrder, now: DateTime<Utc>) -> OrderEvent {
    OrderEvent::PaymentCreated {
        order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        user_id: order.user_id().to_string(),
        amount: order.amount().amount(),
        currency: order.amount().currency().code().to_string(),
        method: order.method().as_str().to_string(),
        status: order.status(),
        occurred_at: now,
    }
}

pub fn payment_succeeded(order: &PaymentOrder, now: DateTime<Utc>) -> OrderEvent {
    let paid = order.paid_amount().unwrap_or(order.amount());
    OrderEvent::PaymentSucceeded {
        order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        user_id: order.user_id().to_string(),
        paid_amount: paid.amount(),
        currency: paid.currency().code().to_string(),
        gateway_order_id: order.gateway_order_id().map(str::to_string),
        paid_at: order.paid_at(),
        occurred_at: now,
    }
}

pub fn payment_failed(order: &PaymentOrder, now: DateTime<Utc>) -> OrderEvent {
    OrderEvent::PaymentFailed {
        order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        reason: order
            .failure_reason()
            .unwrap_or("payment failed")
            .to_string(),
        occurred_at: now,
    }
}

pub fn status_changed(
    order: &PaymentOrder,
    from: OrderStatus,
    to: OrderStatus,
    now: DateTime<Utc>,
) -> OrderEvent {
    OrderEvent::StatusChanged {
        order_id: order.id().to_string(),
        from,
        to,
        occurred_at: now,
    }
}

pub fn refund_created(order: &PaymentOrder, refund: &RefundOrder, now: DateTime<Utc>) -> OrderEvent {
    OrderEvent::RefundCreated {
        order_id: order.id().to_string(),
        refund_id: refund.id().to_string(),
        amount: refund.amount().amount(),
        currency: refund.amount().currency().code().to_string(),
        reason: refund.reason().to_string(),
        operator_id: refund.operator_id().to_string(),
        occurred_at: now,
    }
}

pub fn refund_succeeded(
    order: &PaymentOrder,
    refund: &RefundOrder,
    now: DateTime<Utc>,
) -> OrderEvent {
    OrderEvent::RefundSucceeded {
        order_id: order.id().to_string(),
        refund_id: refund.id().to_string(),
        amount: refund.amount().amount(),
        currency: refund.amount().currency().code().to_string(),
        order_status: order.status(),
        occurred_at: now,
    }
}

pub fn refund_failed(
    order: &PaymentOrder,
    refund: &RefundOrder,
    reason: &str,
    now: DateTime<Utc>,
) -> OrderEvent {
    OrderEvent::RefundFailed {
        order_id: order.id().to_string(),
        refund_id: refund.id().to_string(),
        reason: reason.to_string(),
        occurred_at: now,
    }
}
