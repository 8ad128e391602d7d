use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::events::OrderEvent;
use crate::domain::order::{OrderStatus, PaymentOrder};
use crate::domain::refund::RefundStatus;
use crate::repo::store::{
    summarize, CurrencyTotal, OrderPage, OrderStatistics, OrderStore, StoreError,
    IDEMPOTENCY_KEY_CONSTRAINT, MERCHANT_ORDER_CONSTRAINT,
};

#[derive(Default)]
struct MemoryInner {
    orders: HashMap<String, PaymentOrder>,
    events: Vec<OrderEvent>,
    event_keys: HashSet<(String, String, String)>,
    conflict_once: bool,
}

/// In-memory `OrderStore` with the same contract as the Postgres one:
/// uniqueness on merchant order id and idempotency key, version-checked
/// updates, and replay-deduplicated event recording. Tests lean on the
/// read/write counters and the scripted one-shot conflict.
#[derive(Default)]
pub struct MemoryOrderStore {
    inner: Mutex<MemoryInner>,
    reads: AtomicU32,
    writes: AtomicU32,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// The next `update` fails with `Conflict` once, as if a concurrent
    /// writer had bumped the version in between.
    pub fn fail_next_update_with_conflict(&self) {
        self.inner.lock().unwrap().conflict_once = true;
    }

    pub fn recorded_events(&self) -> Vec<OrderEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn event_types_for(&self, order_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.order_id() == order_id)
            .map(|e| e.event_type().to_string())
            .collect()
    }

    fn record_events(inner: &mut MemoryInner, events: &[OrderEvent]) {
        for event in events {
            let key = (
                event.order_id().to_string(),
                event.event_type().to_string(),
                event.dedup_key(),
            );
            if inner.event_keys.insert(key) {
                inner.events.push(event.clone());
            }
        }
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        if inner
            .orders
            .values()
            .any(|o| o.merchant_order_id() == order.merchant_order_id())
        {
            return Err(StoreError::UniqueViolation(
                MERCHANT_ORDER_CONSTRAINT.to_string(),
            ));
        }
        if let Some(key) = order.idempotency_key() {
            if inner
                .orders
                .values()
                .any(|o| o.idempotency_key() == Some(key))
            {
                return Err(StoreError::UniqueViolation(
                    IDEMPOTENCY_KEY_CONSTRAINT.to_string(),
                ));
            }
        }

        inner.orders.insert(order.id().to_string(), order.clone());
        Self::record_events(&mut inner, events);
        Ok(())
    }

    async fn update(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();

        if inner.conflict_once {
            inner.conflict_once = false;
            return Err(StoreError::Conflict(order.id().to_string()));
        }

        let current_version = match inner.orders.get(order.id().as_str()) {
            Some(existing) => existing.version(),
            None => {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "order {} not found",
                    order.id()
                )))
            }
        };
        if current_version != order.version() {
            return Err(StoreError::Conflict(order.id().to_string()));
        }

        let mut stored = order.clone();
        stored.version += 1;
        inner.orders.insert(order.id().to_string(), stored);
        Self::record_events(&mut inner, events);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner.orders.get(id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .find(|o| o.idempotency_key() == Some(key))
            .cloned())
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .find(|o| o.merchant_order_id() == merchant_order_id)
            .cloned())
    }

    async fn find_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .find(|o| o.gateway_order_id() == Some(gateway_order_id))
            .cloned())
    }

    async fn find_by_user_id(
        &self,
        user_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<OrderPage, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();

        let mut matched: Vec<&PaymentOrder> = inner
            .orders
            .values()
            .filter(|o| o.user_id() == user_id)
            .collect();
        matched.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().as_str().cmp(a.id().as_str()))
        });

        let total = matched.len() as i64;
        let offset = ((page - 1) * page_size).max(0) as usize;
        let orders = matched
            .into_iter()
            .skip(offset)
            .take(page_size.max(0) as usize)
            .map(summarize)
            .collect();

        Ok(OrderPage {
            orders,
            total,
            page,
            page_size,
        })
    }

    async fn find_processing_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();

        let mut matched: Vec<PaymentOrder> = inner
            .orders
            .values()
            .filter(|o| o.status() == OrderStatus::Processing && o.updated_at() <= cutoff)
            .cloned()
            .collect();
        matched.sort_by_key(|o| o.updated_at());
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();

        let mut matched: Vec<PaymentOrder> = inner
            .orders
            .values()
            .filter(|o| o.status() == OrderStatus::Pending && o.expire_time() <= now)
            .cloned()
            .collect();
        matched.sort_by_key(|o| o.expire_time());
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }

    async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<OrderStatistics, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();

        let mut stats = OrderStatistics::default();
        let mut totals: BTreeMap<String, CurrencyTotal> = BTreeMap::new();

        for order in inner
            .orders
            .values()
            .filter(|o| o.created_at() >= from && o.created_at() < to)
        {
            stats.total_orders += 1;
            match order.status() {
                OrderStatus::Success | OrderStatus::PartialRefunded | OrderStatus::Refunded => {
                    stats.succeeded_orders += 1
                }
                OrderStatus::Failed => stats.failed_orders += 1,
                OrderStatus::Cancelled => stats.cancelled_orders += 1,
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            if matches!(
                order.status(),
                OrderStatus::PartialRefunded | OrderStatus::Refunded
            ) {
                stats.refunded_orders += 1;
            }

            let code = order.amount().currency().code().to_string();
            let entry = totals.entry(code.clone()).or_insert_with(|| CurrencyTotal {
                currency: code,
                paid_amount: Decimal::ZERO,
                refunded_amount: Decimal::ZERO,
            });
            if let Some(paid) = order.paid_amount() {
                entry.paid_amount += paid.amount();
            }
            for refund in order.refunds() {
                if refund.status() == RefundStatus::Success {
                    entry.refunded_amount += refund.amount().amount();
                }
            }
        }

        stats.totals = totals.into_values().collect();
        Ok(stats)
    }
}
