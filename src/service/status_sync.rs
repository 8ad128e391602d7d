use std::sync::Arc;
use std::time::Duration as PollInterval;

use chrono::{Duration, Utc};

use crate::domain::events::status_changed;
use crate::domain::order::OrderStatus;
use crate::gateways::selector::GatewaySelector;
use crate::repo::store::OrderStore;
use crate::service::reconciler::Reconciler;

/// The compensating control loop. Two sweeps per cycle: PENDING orders past
/// their payment window are closed, and PROCESSING orders that have been
/// quiet longer than the grace period are re-queried through the
/// reconciler's shared apply path.
pub struct StatusSync {
    pub store: Arc<dyn OrderStore>,
    pub selector: Arc<GatewaySelector>,
    pub reconciler: Reconciler,
    pub interval: PollInterval,
    pub grace: Duration,
    pub batch_size: i64,
}

impl StatusSync {
    pub async fn run(self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.grace.num_seconds(),
            batch_size = self.batch_size,
            "status sync worker started"
        );
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "status sync cycle failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        self.close_expired().await?;
        self.poll_stuck().await
    }

    async fn close_expired(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let expired = self.store.find_expired_pending(now, self.batch_size).await?;
        let mut closed = 0u32;
        for mut order in expired {
            let from = order.status();
            if let Err(e) = order.close("expired", "system", now) {
                // A callback can land between the query and here.
                tracing::debug!(
                    order_id = order.id().as_str(),
                    error = %e,
                    "expired order is no longer closable, skipping"
                );
                continue;
            }
            let events = vec![status_changed(&order, from, OrderStatus::Cancelled, now)];
            match self.store.update(&order, &events).await {
                Ok(()) => {
                    closed += 1;
                    if order.gateway_order_id().is_some() {
                        if let Some(adapter) = self.selector.for_method(order.method()) {
                            if let Err(e) = adapter.close_payment(&order).await {
                                tracing::warn!(
                                    order_id = order.id().as_str(),
                                    gateway = adapter.name(),
                                    error = %e,
                                    "gateway close failed for expired order"
                                );
                            }
                        }
                    }
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        order_id = order.id().as_str(),
                        "expired order changed concurrently, skipping"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        if closed > 0 {
            tracing::info!(closed, "closed expired orders");
        }
        Ok(())
    }

    async fn poll_stuck(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - self.grace;
        let stuck = self
            .store
            .find_processing_before(cutoff, self.batch_size)
            .await?;
        for order in stuck {
            let order_id = order.id().to_string();
            match self.reconciler.sync_order(order).await {
                Ok(outcome) if outcome.changed => {
                    tracing::info!(
                        order_id = order_id.as_str(),
                        status = outcome.status.as_str(),
                        "poll resolved a stuck order"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    // One unreachable rail must not stall the rest of the batch.
                    tracing::warn!(order_id = order_id.as_str(), error = %e, "poll failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::payment_created;
    use crate::domain::money::{Currency, Money};
    use crate::domain::order::{CreateOrder, PaymentMethod, PaymentOrder};
    use crate::gateways::mock::MockAdapter;
    use crate::gateways::{GatewayAdapter, RetryPolicy};
    use crate::repo::memory::MemoryOrderStore;
    use rust_decimal_macros::dec;

    fn overdue_order(merchant_order_id: &str) -> PaymentOrder {
        let now = Utc::now();
        let mut order = PaymentOrder::create(
            CreateOrder {
                merchant_order_id: merchant_order_id.to_string(),
                user_id: "u_3001".to_string(),
                amount: Money::new(dec!(50.00), Currency::Cny).unwrap(),
                method: PaymentMethod::Mock,
                subject: "expiring order".to_string(),
                idempotency_key: None,
                notify_url: None,
                return_url: None,
                expire_minutes: None,
            },
            now,
        )
        .unwrap();
        order.attach_gateway_order("mock_gw_overdue".to_string(), None, None, now);
        order.expire_time = now - Duration::minutes(5);
        order
    }

    fn worker(
        store: Arc<MemoryOrderStore>,
        mock: Arc<MockAdapter>,
    ) -> StatusSync {
        let rail: Arc<dyn GatewayAdapter> = mock;
        let selector = Arc::new(GatewaySelector::new(vec![rail]).unwrap());
        StatusSync {
            store: store.clone(),
            selector: selector.clone(),
            reconciler: Reconciler {
                store,
                selector,
                retry: RetryPolicy::default(),
            },
            interval: PollInterval::from_secs(60),
            grace: Duration::seconds(300),
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn expired_pending_orders_are_closed() {
        let store = Arc::new(MemoryOrderStore::new());
        let mock = Arc::new(MockAdapter::new(PaymentMethod::Mock));
        let order = overdue_order("M-3001");
        let order_id = order.id().to_string();
        store
            .insert(&order, &[payment_created(&order, Utc::now())])
            .await
            .unwrap();

        worker(store.clone(), mock.clone()).tick().await.unwrap();

        let closed = store.find_by_id(&order_id).await.unwrap().unwrap();
        assert_eq!(closed.status(), OrderStatus::Cancelled);
        assert!(closed.failure_reason().unwrap().contains("expired"));
        assert_eq!(mock.close_calls(), 1);
        assert!(store
            .event_types_for(&order_id)
            .contains(&"payment.status_changed".to_string()));
    }

    #[tokio::test]
    async fn fresh_pending_orders_are_left_alone() {
        let store = Arc::new(MemoryOrderStore::new());
        let mock = Arc::new(MockAdapter::new(PaymentMethod::Mock));
        let mut order = overdue_order("M-3002");
        order.expire_time = Utc::now() + Duration::minutes(30);
        let order_id = order.id().to_string();
        store
            .insert(&order, &[payment_created(&order, Utc::now())])
            .await
            .unwrap();

        worker(store.clone(), mock.clone()).tick().await.unwrap();

        let untouched = store.find_by_id(&order_id).await.unwrap().unwrap();
        assert_eq!(untouched.status(), OrderStatus::Pending);
        assert_eq!(mock.close_calls(), 0);
    }

    #[tokio::test]
    async fn conflicting_expiry_close_waits_for_the_next_cycle() {
        let store = Arc::new(MemoryOrderStore::new());
        let mock = Arc::new(MockAdapter::new(PaymentMethod::Mock));
        let order = overdue_order("M-3003");
        let order_id = order.id().to_string();
        store
            .insert(&order, &[payment_created(&order, Utc::now())])
            .await
            .unwrap();

        store.fail_next_update_with_conflict();
        worker(store.clone(), mock.clone()).tick().await.unwrap();

        // The sweep skipped it; the order is picked up again next cycle.
        let waiting = store.find_by_id(&order_id).await.unwrap().unwrap();
        assert_eq!(waiting.status(), OrderStatus::Pending);
        assert_eq!(mock.close_calls(), 0);
    }
}
