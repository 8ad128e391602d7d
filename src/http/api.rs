use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::{OrderStatus, PaymentMethod, PaymentOrder};
use crate::domain::refund::{RefundOrder, RefundStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub merchant_order_id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub subject: Option<String>,
    pub idempotency_key: Option<String>,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub expire_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderResponse {
    pub payment_order_id: String,
    pub merchant_order_id: String,
    pub status: OrderStatus,
    pub pay_url: Option<String>,
    pub qr_code: Option<String>,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundView {
    pub refund_id: String,
    pub payment_order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: String,
    pub operator_id: String,
    pub gateway_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    pub payment_order_id: String,
    pub merchant_order_id: String,
    pub user_id: String,
    pub subject: String,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: OrderStatus,
    pub gateway_order_id: Option<String>,
    pub pay_url: Option<String>,
    pub qr_code: Option<String>,
    pub paid_amount: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub expire_time: DateTime<Utc>,
    pub refunded_amount: Decimal,
    pub refundable_amount: Decimal,
    pub refunds: Vec<RefundView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListOrdersQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseOrderRequest {
    pub reason: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub payment_order_id: String,
    pub status: OrderStatus,
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

pub fn refund_view(refund: &RefundOrder) -> RefundView {
    RefundView {
        refund_id: refund.id().to_string(),
        payment_order_id: refund.payment_order_id().to_string(),
        amount: refund.amount().amount(),
        currency: refund.amount().currency().code().to_string(),
        status: refund.status(),
        reason: refund.reason().to_string(),
        operator_id: refund.operator_id().to_string(),
        gateway_refund_id: refund.gateway_refund_id().map(str::to_string),
        failure_reason: refund.failure_reason().map(str::to_string),
        refunded_at: refund.refunded_at(),
        created_at: refund.created_at(),
    }
}

pub fn order_detail(order: &PaymentOrder) -> OrderDetail {
    OrderDetail {
        payment_order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        user_id: order.user_id().to_string(),
        subject: order.subject().to_string(),
        amount: order.amount().amount(),
        currency: order.amount().currency().code().to_string(),
        method: order.method(),
        status: order.status(),
        gateway_order_id: order.gateway_order_id().map(str::to_string),
        pay_url: order.pay_url().map(str::to_string),
        qr_code: order.qr_code().map(str::to_string),
        paid_amount: order.paid_amount().map(|m| m.amount()),
        paid_at: order.paid_at(),
        failure_reason: order.failure_reason().map(str::to_string),
        expire_time: order.expire_time(),
        refunded_amount: order
            .refunded_amount()
            .map(|m| m.amount())
            .unwrap_or_default(),
        refundable_amount: order
            .refundable_amount()
            .map(|m| m.amount())
            .unwrap_or_default(),
        refunds: order.refunds().iter().map(refund_view).collect(),
        created_at: order.created_at(),
        updated_at: order.updated_at(),
    }
}

pub fn create_order_response(order: &PaymentOrder) -> CreateOrderResponse {
    CreateOrderResponse {
        payment_order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        status: order.status(),
        pay_url: order.pay_url().map(str::to_string),
        qr_code: order.qr_code().map(str::to_string),
        expire_time: order.expire_time(),
    }
}
