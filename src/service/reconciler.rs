use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;

use crate::domain::error::DomainError;
use crate::domain::events::{
    payment_failed, payment_succeeded, refund_failed, refund_succeeded, status_changed, OrderEvent,
};
use crate::domain::order::{CallbackUpdate, OrderStatus, PaymentOrder, RefundOutcome};
use crate::domain::refund::{RefundResolution, RefundStatus};
use crate::gateways::selector::GatewaySelector;
use crate::gateways::{call_with_retry, CallbackAck, CallbackEnvelope, GatewayAdapter, RetryPolicy};
use crate::repo::store::{OrderStore, StoreError};

/// What one observation did to an order.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub status: OrderStatus,
    pub changed: bool,
}

/// Applies gateway observations to orders. Callbacks, the status poller and
/// manual sync all funnel through `apply_observation`; there is exactly one
/// code path from "the rail said X" to a persisted transition.
#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn OrderStore>,
    pub selector: Arc<GatewaySelector>,
    pub retry: RetryPolicy,
}

impl Reconciler {
    /// Inbound payment callback. The signature gate comes first; nothing
    /// touches the store until the payload is proven to come from the rail.
    /// Observations the state machine rejects are acknowledged anyway so the
    /// rail stops redelivering them.
    pub async fn handle_payment_callback(
        &self,
        adapter: &Arc<dyn GatewayAdapter>,
        envelope: &CallbackEnvelope,
    ) -> CallbackAck {
        if !adapter.verify_callback(envelope) {
            tracing::warn!(gateway = adapter.name(), "callback failed signature check");
            return adapter.ack_failure();
        }
        let notice = match adapter.parse_callback(envelope) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(gateway = adapter.name(), error = %e, "callback payload rejected");
                return adapter.ack_failure();
            }
        };

        let order = match self
            .resolve_order(
                notice.gateway_order_id.as_deref(),
                notice.merchant_order_id.as_deref(),
            )
            .await
        {
            Ok(Some(order)) => order,
            Ok(None) => {
                tracing::warn!(
                    gateway = adapter.name(),
                    gateway_order_id = notice.gateway_order_id.as_deref().unwrap_or("-"),
                    merchant_order_id = notice.merchant_order_id.as_deref().unwrap_or("-"),
                    "callback for unknown order, acknowledging"
                );
                return adapter.ack_success();
            }
            Err(e) => {
                tracing::error!(gateway = adapter.name(), error = %e, "order lookup failed, asking rail to redeliver");
                return adapter.ack_failure();
            }
        };

        let update = self.translate(adapter, &notice.native_status, || CallbackUpdate {
            status: OrderStatus::Failed,
            gateway_order_id: notice.gateway_order_id.clone(),
            paid_amount: notice.paid_amount.clone(),
            paid_at: notice.paid_at,
            failure_reason: None,
        });

        match self.apply_observation(order, update).await {
            Ok(_) => adapter.ack_success(),
            Err(e) => {
                tracing::error!(gateway = adapter.name(), error = %e, "failed to persist callback observation");
                adapter.ack_failure()
            }
        }
    }

    /// Inbound refund callback; same gate order as payments. Unlike payment
    /// observations, a refund that cannot be persisted is NOT acknowledged:
    /// the poller does not re-query refunds, so redelivery is the only
    /// compensator.
    pub async fn handle_refund_callback(
        &self,
        adapter: &Arc<dyn GatewayAdapter>,
        envelope: &CallbackEnvelope,
    ) -> CallbackAck {
        if !adapter.verify_callback(envelope) {
            tracing::warn!(gateway = adapter.name(), "refund callback failed signature check");
            return adapter.ack_failure();
        }
        let notice = match adapter.parse_refund_callback(envelope) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!(gateway = adapter.name(), error = %e, "refund payload rejected");
                return adapter.ack_failure();
            }
        };

        let order = match self
            .resolve_order(
                notice.gateway_order_id.as_deref(),
                notice.merchant_order_id.as_deref(),
            )
            .await
        {
            Ok(Some(order)) => order,
            Ok(None) => {
                tracing::warn!(
                    gateway = adapter.name(),
                    refund_id = notice.refund_id.as_str(),
                    "refund callback for unknown order, acknowledging"
                );
                return adapter.ack_success();
            }
            Err(e) => {
                tracing::error!(gateway = adapter.name(), error = %e, "order lookup failed, asking rail to redeliver");
                return adapter.ack_failure();
            }
        };

        let resolution = RefundResolution {
            success: notice.success,
            gateway_refund_id: notice.gateway_refund_id,
            failure_reason: notice.failure_reason,
            refunded_at: notice.refunded_at,
        };
        match self
            .apply_refund_observation(order, &notice.refund_id, resolution)
            .await
        {
            Ok(()) => adapter.ack_success(),
            Err(e) => {
                tracing::error!(
                    gateway = adapter.name(),
                    refund_id = notice.refund_id.as_str(),
                    error = %e,
                    "failed to persist refund observation"
                );
                adapter.ack_failure()
            }
        }
    }

    /// Polls the rail for one order and runs the result through the same
    /// apply path a callback would take.
    pub async fn sync_order(&self, order: PaymentOrder) -> anyhow::Result<SyncOutcome> {
        let adapter = self
            .selector
            .for_method(order.method())
            .ok_or_else(|| anyhow!("no rail registered for {}", order.method().as_str()))?;

        let snapshot =
            call_with_retry(&self.retry, "query_status", || adapter.query_status(&order)).await?;

        let update = self.translate(adapter, &snapshot.native_status, || CallbackUpdate {
            status: OrderStatus::Failed,
            gateway_order_id: snapshot.gateway_order_id.clone(),
            paid_amount: snapshot.paid_amount.clone(),
            paid_at: snapshot.paid_at,
            failure_reason: None,
        });

        self.apply_observation(order, update).await
    }

    pub async fn sync_by_id(&self, order_id: &str) -> anyhow::Result<Option<SyncOutcome>> {
        match self.store.find_by_id(order_id).await? {
            Some(order) => Ok(Some(self.sync_order(order).await?)),
            None => Ok(None),
        }
    }

    /// Maps a native status through the adapter's table (fail-closed) and
    /// stamps a failure reason when the outcome is FAILED or CANCELLED.
    fn translate(
        &self,
        adapter: &Arc<dyn GatewayAdapter>,
        native_status: &str,
        base: impl FnOnce() -> CallbackUpdate,
    ) -> CallbackUpdate {
        let resolved = adapter.status_map().resolve(native_status);
        if !adapter.status_map().contains(native_status) {
            tracing::warn!(
                gateway = adapter.name(),
                native_status,
                "native status outside the adapter's vocabulary, resolving to FAILED"
            );
        }
        let mut update = base();
        update.status = resolved;
        update.failure_reason = matches!(resolved, OrderStatus::Failed | OrderStatus::Cancelled)
            .then(|| format!("gateway status {native_status}"));
        update
    }

    /// The single apply/persist path. A version conflict reloads and
    /// re-applies once; a second conflict is logged and left for the next
    /// poll cycle, since the observation will be made again.
    pub(crate) async fn apply_observation(
        &self,
        mut order: PaymentOrder,
        update: CallbackUpdate,
    ) -> anyhow::Result<SyncOutcome> {
        let now = Utc::now();
        let from = order.status();
        if !order.apply_callback(update.clone(), now) {
            tracing::debug!(
                order_id = order.id().as_str(),
                status = from.as_str(),
                observed = update.status.as_str(),
                "observation is a no-op"
            );
            return Ok(SyncOutcome {
                status: order.status(),
                changed: false,
            });
        }

        let events = observation_events(&order, from, now);
        match self.store.update(&order, &events).await {
            Ok(()) => Ok(SyncOutcome {
                status: order.status(),
                changed: true,
            }),
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    order_id = order.id().as_str(),
                    "conflict persisting observation, reloading once"
                );
                let mut fresh = self
                    .store
                    .find_by_id(order.id().as_str())
                    .await?
                    .ok_or_else(|| anyhow!("order {} vanished during reconcile", order.id()))?;

                let now = Utc::now();
                let from = fresh.status();
                if !fresh.apply_callback(update, now) {
                    return Ok(SyncOutcome {
                        status: fresh.status(),
                        changed: false,
                    });
                }
                let events = observation_events(&fresh, from, now);
                match self.store.update(&fresh, &events).await {
                    Ok(()) => Ok(SyncOutcome {
                        status: fresh.status(),
                        changed: true,
                    }),
                    Err(e) if e.is_conflict() => {
                        tracing::error!(
                            order_id = fresh.id().as_str(),
                            "second conflict persisting observation, leaving for the poller"
                        );
                        Ok(SyncOutcome {
                            status: fresh.status(),
                            changed: false,
                        })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_refund_observation(
        &self,
        mut order: PaymentOrder,
        refund_id: &str,
        resolution: RefundResolution,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let outcome = match order.apply_refund_callback(refund_id, resolution.clone(), now) {
            Ok(outcome) => outcome,
            Err(DomainError::RefundNotFound(_)) => {
                tracing::warn!(
                    order_id = order.id().as_str(),
                    refund_id,
                    "refund callback for unknown refund, acknowledging"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    order_id = order.id().as_str(),
                    refund_id,
                    error = %e,
                    "refund observation rejected by the aggregate, acknowledging"
                );
                return Ok(());
            }
        };
        let RefundOutcome::Applied {
            refund,
            status_change,
        } = outcome
        else {
            tracing::debug!(
                order_id = order.id().as_str(),
                refund_id,
                "refund already settled, duplicate delivery"
            );
            return Ok(());
        };

        let events = refund_events(&order, &refund, status_change, now);
        match self.store.update(&order, &events).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    order_id = order.id().as_str(),
                    refund_id,
                    "conflict persisting refund observation, reloading once"
                );
                let mut fresh = self
                    .store
                    .find_by_id(order.id().as_str())
                    .await?
                    .ok_or_else(|| anyhow!("order {} vanished during reconcile", order.id()))?;

                let now = Utc::now();
                match fresh.apply_refund_callback(refund_id, resolution, now)? {
                    RefundOutcome::NoOp => Ok(()),
                    RefundOutcome::Applied {
                        refund,
                        status_change,
                    } => {
                        let events = refund_events(&fresh, &refund, status_change, now);
                        self.store.update(&fresh, &events).await.map_err(Into::into)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_order(
        &self,
        gateway_order_id: Option<&str>,
        merchant_order_id: Option<&str>,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        if let Some(id) = gateway_order_id {
            if let Some(order) = self.store.find_by_gateway_order_id(id).await? {
                return Ok(Some(order));
            }
        }
        if let Some(id) = merchant_order_id {
            if let Some(order) = self.store.find_by_merchant_order_id(id).await? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }
}

fn observation_events(
    order: &PaymentOrder,
    from: OrderStatus,
    now: chrono::DateTime<Utc>,
) -> Vec<OrderEvent> {
    let mut events = vec![status_changed(order, from, order.status(), now)];
    match order.status() {
        OrderStatus::Success => events.push(payment_succeeded(order, now)),
        OrderStatus::Failed => events.push(payment_failed(order, now)),
        _ => {}
    }
    events
}

fn refund_events(
    order: &PaymentOrder,
    refund: &crate::domain::refund::RefundOrder,
    status_change: Option<(OrderStatus, OrderStatus)>,
    now: chrono::DateTime<Utc>,
) -> Vec<OrderEvent> {
    let mut events = Vec::new();
    if refund.status() == RefundStatus::Success {
        events.push(refund_succeeded(order, refund, now));
    } else {
        let reason = refund.failure_reason().unwrap_or("refund failed at gateway");
        events.push(refund_failed(order, refund, reason, now));
    }
    if let Some((from, to)) = status_change {
        events.push(status_changed(order, from, to, now));
    }
    events
}
