use std::sync::Arc;

use anyhow::anyhow;
use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::domain::error::DomainError;
use crate::domain::events::{
    payment_created, payment_failed, refund_created, refund_failed, status_changed, OrderEvent,
};
use crate::domain::money::{Currency, Money};
use crate::domain::order::{
    CallbackUpdate, CreateOrder, OrderStatus, PaymentMethod, PaymentOrder,
};
use crate::gateways::selector::GatewaySelector;
use crate::gateways::{call_with_retry, GatewayAdapter, GatewayError, RetryPolicy};
use crate::http::api::{
    create_order_response, order_detail, refund_view, CloseOrderRequest, CreateOrderRequest,
    CreateOrderResponse, ErrorEnvelope, ErrorPayload, ListOrdersQuery, OrderDetail, RefundRequest,
    RefundView, StatsQuery,
};
use crate::repo::store::{
    OrderPage, OrderStatistics, OrderStore, StoreError, IDEMPOTENCY_KEY_CONSTRAINT,
};
use crate::service::risk::{RiskContext, RiskLevel, RiskScorer};

/// Command side of the engine: creation, refunds, close, projections.
/// Observation-driven transitions (callbacks, polls) live in the
/// reconciler; this service only initiates work.
#[derive(Clone)]
pub struct OrderService {
    pub store: Arc<dyn OrderStore>,
    pub selector: Arc<GatewaySelector>,
    pub risk: Arc<dyn RiskScorer>,
    pub retry: RetryPolicy,
    pub refund_window_days: i64,
}

impl OrderService {
    /// Creation. The idempotency-key lookup runs before any side effect, so
    /// a replayed request returns the original projection without touching
    /// the rail. A permanent rail failure still persists the order, as
    /// FAILED, so the merchant gets an auditable record.
    pub async fn create_order(
        &self,
        req: CreateOrderRequest,
        ctx: RiskContext,
    ) -> Result<CreateOrderResponse, (StatusCode, ErrorEnvelope)> {
        if let Some(key) = req.idempotency_key.as_deref() {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(key)
                .await
                .map_err(|e| internal(e.into()))?
            {
                tracing::info!(
                    order_id = existing.id().as_str(),
                    "idempotent replay, returning original order"
                );
                return Ok(create_order_response(&existing));
            }
        }

        let amount = money_from(req.amount, &req.currency)?;
        let subject = req
            .subject
            .clone()
            .unwrap_or_else(|| format!("Order {}", req.merchant_order_id));
        let command = CreateOrder {
            merchant_order_id: req.merchant_order_id,
            user_id: req.user_id,
            amount,
            method: req.method,
            subject,
            idempotency_key: req.idempotency_key,
            notify_url: req.notify_url,
            return_url: req.return_url,
            expire_minutes: req.expire_minutes,
        };

        match self.risk.assess(&command, &ctx).await.map_err(internal)? {
            RiskLevel::High => {
                tracing::warn!(
                    merchant_order_id = command.merchant_order_id.as_str(),
                    user_id = command.user_id.as_str(),
                    "creation rejected by risk assessment"
                );
                return Err((
                    StatusCode::FORBIDDEN,
                    err("RISK_REJECTED", "order rejected by risk assessment"),
                ));
            }
            RiskLevel::Elevated => {
                tracing::warn!(
                    merchant_order_id = command.merchant_order_id.as_str(),
                    user_id = command.user_id.as_str(),
                    "elevated risk, allowing creation"
                );
            }
            RiskLevel::Low => {}
        }

        let now = Utc::now();
        let mut order = PaymentOrder::create(command, now).map_err(domain)?;
        let adapter = self.adapter_for(order.method())?;

        let mut events = vec![payment_created(&order, now)];
        let created = call_with_retry(&self.retry, "create_payment", || {
            adapter.create_payment(&order)
        })
        .await;
        match created {
            Ok(gateway_order) => {
                order.attach_gateway_order(
                    gateway_order.gateway_order_id,
                    gateway_order.pay_url,
                    gateway_order.qr_code,
                    Utc::now(),
                );
            }
            Err(e) => {
                tracing::warn!(
                    order_id = order.id().as_str(),
                    gateway = adapter.name(),
                    error = %e,
                    "rail refused creation, persisting order as FAILED"
                );
                let failed_at = Utc::now();
                order.apply_callback(
                    CallbackUpdate {
                        status: OrderStatus::Failed,
                        gateway_order_id: None,
                        paid_amount: None,
                        paid_at: None,
                        failure_reason: Some(e.to_string()),
                    },
                    failed_at,
                );
                events.push(payment_failed(&order, failed_at));
            }
        }

        match self.store.insert(&order, &events).await {
            Ok(()) => Ok(create_order_response(&order)),
            Err(StoreError::UniqueViolation(constraint))
                if constraint == IDEMPOTENCY_KEY_CONSTRAINT =>
            {
                // Lost an insert race on the key; the winner's order is the
                // canonical one.
                let key = order
                    .idempotency_key()
                    .ok_or_else(|| internal(anyhow!("idempotency violation without a key")))?;
                let existing = self
                    .store
                    .find_by_idempotency_key(key)
                    .await
                    .map_err(|e| internal(e.into()))?
                    .ok_or_else(|| internal(anyhow!("idempotency race winner not found")))?;
                tracing::info!(
                    order_id = existing.id().as_str(),
                    "idempotent replay after insert race"
                );
                Ok(create_order_response(&existing))
            }
            Err(StoreError::UniqueViolation(_)) => Err((
                StatusCode::CONFLICT,
                err("INVALID_OPERATION", "merchant_order_id already exists"),
            )),
            Err(e) => Err(internal(e.into())),
        }
    }

    pub async fn get_order(
        &self,
        order_id: &str,
    ) -> Result<OrderDetail, (StatusCode, ErrorEnvelope)> {
        let order = self.load_required(order_id).await?;
        Ok(order_detail(&order))
    }

    pub async fn list_user_orders(
        &self,
        user_id: &str,
        query: ListOrdersQuery,
    ) -> Result<OrderPage, (StatusCode, ErrorEnvelope)> {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query.page_size.unwrap_or(20).clamp(1, 100);
        self.store
            .find_by_user_id(user_id, page, page_size)
            .await
            .map_err(|e| internal(e.into()))
    }

    pub async fn close_order(
        &self,
        order_id: &str,
        req: CloseOrderRequest,
    ) -> Result<OrderDetail, (StatusCode, ErrorEnvelope)> {
        let mut order = self.load_required(order_id).await?;
        let events = close_mutation(&mut order, &req, Utc::now())?;
        if !self.try_update(&order, &events).await? {
            tracing::warn!(order_id, "close hit a concurrent update, retrying once");
            order = self.load_required(order_id).await?;
            let events = close_mutation(&mut order, &req, Utc::now())?;
            if !self.try_update(&order, &events).await? {
                return Err(concurrent_update(order_id));
            }
        }

        if order.gateway_order_id().is_some() {
            if let Some(adapter) = self.selector.for_method(order.method()) {
                if let Err(e) = adapter.close_payment(&order).await {
                    tracing::warn!(
                        order_id,
                        gateway = adapter.name(),
                        error = %e,
                        "gateway close failed, order is closed locally"
                    );
                }
            }
        }

        Ok(order_detail(&order))
    }

    /// Opens a refund and dispatches it to the rail. The PENDING refund is
    /// persisted before the dispatch so the reservation survives a crash;
    /// a rail refusal flips it to FAILED rather than erasing it.
    pub async fn request_refund(
        &self,
        order_id: &str,
        req: RefundRequest,
    ) -> Result<RefundView, (StatusCode, ErrorEnvelope)> {
        let amount = money_from(req.amount, &req.currency)?;

        let mut order = self.load_required(order_id).await?;
        let (events, mut refund_id) =
            open_refund_mutation(&mut order, &amount, &req, self.refund_window_days)?;
        if !self.try_update(&order, &events).await? {
            tracing::warn!(order_id, "refund open hit a concurrent update, retrying once");
            order = self.load_required(order_id).await?;
            let (events, retried_id) =
                open_refund_mutation(&mut order, &amount, &req, self.refund_window_days)?;
            if !self.try_update(&order, &events).await? {
                return Err(concurrent_update(order_id));
            }
            refund_id = retried_id;
        }

        // The persisted version moved; reload before the next save.
        let mut order = self.load_required(order_id).await?;
        let adapter = self.adapter_for(order.method())?;
        let dispatch = {
            let refund = order
                .refund(&refund_id)
                .ok_or_else(|| internal(anyhow!("refund {refund_id} vanished after persist")))?;
            call_with_retry(&self.retry, "create_refund", || {
                adapter.create_refund(&order, refund)
            })
            .await
        };
        if let Err(e) = &dispatch {
            tracing::warn!(
                order_id,
                refund_id = refund_id.as_str(),
                gateway = adapter.name(),
                error = %e,
                "refund dispatch failed, marking refund FAILED"
            );
        }

        let events = settle_dispatch(&mut order, &refund_id, &dispatch, Utc::now())?;
        if !self.try_update(&order, &events).await? {
            order = self.load_required(order_id).await?;
            let events = settle_dispatch(&mut order, &refund_id, &dispatch, Utc::now())?;
            if !self.try_update(&order, &events).await? {
                return Err(concurrent_update(order_id));
            }
        }

        let refund = order
            .refund(&refund_id)
            .ok_or_else(|| internal(anyhow!("refund {refund_id} vanished after dispatch")))?;
        Ok(refund_view(refund))
    }

    pub async fn statistics(
        &self,
        query: StatsQuery,
    ) -> Result<OrderStatistics, (StatusCode, ErrorEnvelope)> {
        let to = query.to.unwrap_or_else(Utc::now);
        let from = query.from.unwrap_or(to - Duration::hours(24));
        if from >= to {
            return Err((
                StatusCode::BAD_REQUEST,
                err("VALIDATION_ERROR", "`from` must be earlier than `to`"),
            ));
        }
        self.store
            .statistics(from, to)
            .await
            .map_err(|e| internal(e.into()))
    }

    async fn load_required(
        &self,
        order_id: &str,
    ) -> Result<PaymentOrder, (StatusCode, ErrorEnvelope)> {
        self.store
            .find_by_id(order_id)
            .await
            .map_err(|e| internal(e.into()))?
            .ok_or_else(|| not_found(order_id))
    }

    fn adapter_for(
        &self,
        method: PaymentMethod,
    ) -> Result<&Arc<dyn GatewayAdapter>, (StatusCode, ErrorEnvelope)> {
        self.selector.for_method(method).ok_or_else(|| {
            (
                StatusCode::BAD_GATEWAY,
                err(
                    "GATEWAY_UNAVAILABLE",
                    &format!("no rail registered for {}", method.as_str()),
                ),
            )
        })
    }

    async fn try_update(
        &self,
        order: &PaymentOrder,
        events: &[OrderEvent],
    ) -> Result<bool, (StatusCode, ErrorEnvelope)> {
        match self.store.update(order, events).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(internal(e.into())),
        }
    }
}

fn close_mutation(
    order: &mut PaymentOrder,
    req: &CloseOrderRequest,
    now: DateTime<Utc>,
) -> Result<Vec<OrderEvent>, (StatusCode, ErrorEnvelope)> {
    let from = order.status();
    order
        .close(&req.reason, &req.operator_id, now)
        .map_err(domain)?;
    Ok(vec![status_changed(order, from, OrderStatus::Cancelled, now)])
}

fn open_refund_mutation(
    order: &mut PaymentOrder,
    amount: &Money,
    req: &RefundRequest,
    window_days: i64,
) -> Result<(Vec<OrderEvent>, String), (StatusCode, ErrorEnvelope)> {
    let now = Utc::now();
    let refund = order
        .create_refund(amount.clone(), &req.reason, &req.operator_id, window_days, now)
        .map_err(domain)?;
    let refund_id = refund.id().to_string();
    Ok((vec![refund_created(order, &refund, now)], refund_id))
}

fn settle_dispatch(
    order: &mut PaymentOrder,
    refund_id: &str,
    dispatch: &Result<crate::gateways::GatewayRefund, GatewayError>,
    now: DateTime<Utc>,
) -> Result<Vec<OrderEvent>, (StatusCode, ErrorEnvelope)> {
    match dispatch {
        Ok(gateway_refund) => {
            order
                .mark_refund_processing(
                    refund_id,
                    Some(gateway_refund.gateway_refund_id.clone()),
                    now,
                )
                .map_err(domain)?;
            Ok(Vec::new())
        }
        Err(e) => {
            let reason = e.to_string();
            order
                .mark_refund_failed(refund_id, &reason, now)
                .map_err(domain)?;
            let refund = order
                .refund(refund_id)
                .ok_or_else(|| internal(anyhow!("refund {refund_id} missing after failure")))?;
            Ok(vec![refund_failed(order, refund, &reason, now)])
        }
    }
}

fn money_from(amount: Decimal, currency: &str) -> Result<Money, (StatusCode, ErrorEnvelope)> {
    let currency: Currency = currency.parse().map_err(domain)?;
    Money::new(amount, currency).map_err(domain)
}

fn domain(e: DomainError) -> (StatusCode, ErrorEnvelope) {
    match &e {
        DomainError::InvalidOperation { .. } | DomainError::RefundWindowClosed { .. } => {
            (StatusCode::CONFLICT, err("INVALID_OPERATION", &e.to_string()))
        }
        DomainError::InsufficientRefundable { .. } => (
            StatusCode::CONFLICT,
            err("INSUFFICIENT_REFUNDABLE", &e.to_string()),
        ),
        DomainError::RefundNotFound(_) => {
            (StatusCode::NOT_FOUND, err("ORDER_NOT_FOUND", &e.to_string()))
        }
        _ => (
            StatusCode::BAD_REQUEST,
            err("VALIDATION_ERROR", &e.to_string()),
        ),
    }
}

fn not_found(order_id: &str) -> (StatusCode, ErrorEnvelope) {
    (
        StatusCode::NOT_FOUND,
        err("ORDER_NOT_FOUND", &format!("order {order_id} not found")),
    )
}

fn concurrent_update(order_id: &str) -> (StatusCode, ErrorEnvelope) {
    (
        StatusCode::CONFLICT,
        err(
            "CONCURRENT_UPDATE",
            &format!("order {order_id} was modified concurrently, retry the request"),
        ),
    )
}

pub(crate) fn err(code: &str, message: &str) -> ErrorEnvelope {
    ErrorEnvelope {
        error: ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        },
    }
}

pub(crate) fn internal(e: anyhow::Error) -> (StatusCode, ErrorEnvelope) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        err("INTERNAL_ERROR", &e.to_string()),
    )
}
