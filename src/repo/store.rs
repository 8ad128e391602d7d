use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::events::OrderEvent;
use crate::domain::order::PaymentOrder;

/// Storage failures the services act on. Conflict and UniqueViolation drive
/// control flow (retry, replay); everything else is plumbing failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer got there first; reload and re-decide.
    #[error("concurrent update on order {0}")]
    Conflict(String),

    /// A uniqueness guarantee fired; `0` names the constraint.
    #[error("unique constraint {0} violated")]
    UniqueViolation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "idempotency_key";
pub const MERCHANT_ORDER_CONSTRAINT: &str = "merchant_order_id";

#[derive(Debug, Clone, Serialize)]
pub struct OrderPage {
    pub orders: Vec<OrderSummary>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Listing row; full aggregates are only hydrated for single-order reads.
#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub payment_order_id: String,
    pub merchant_order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrencyTotal {
    pub currency: String,
    pub paid_amount: Decimal,
    pub refunded_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OrderStatistics {
    pub total_orders: i64,
    pub succeeded_orders: i64,
    pub failed_orders: i64,
    pub cancelled_orders: i64,
    pub refunded_orders: i64,
    pub totals: Vec<CurrencyTotal>,
}

/// Persistence port for the order aggregate. Writes take the events that the
/// same transaction must make durable; reads hydrate full aggregates,
/// refunds included.
///
/// `update` enforces optimistic concurrency: it matches on the version the
/// aggregate was loaded with and returns `Conflict` when another writer has
/// bumped it since.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError>;

    async fn update(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<PaymentOrder>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentOrder>, StoreError>;

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError>;

    async fn find_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError>;

    async fn find_by_user_id(
        &self,
        user_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<OrderPage, StoreError>;

    /// PROCESSING orders whose last update is older than the cutoff; the
    /// status poller's work queue.
    async fn find_processing_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, StoreError>;

    /// PENDING orders whose payment window has elapsed.
    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, StoreError>;

    async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<OrderStatistics, StoreError>;
}

pub fn summarize(order: &PaymentOrder) -> OrderSummary {
    OrderSummary {
        payment_order_id: order.id().to_string(),
        merchant_order_id: order.merchant_order_id().to_string(),
        amount: order.amount().amount(),
        currency: order.amount().currency().code().to_string(),
        method: order.method().as_str().to_string(),
        status: order.status().as_str().to_string(),
        created_at: order.created_at(),
    }
}
