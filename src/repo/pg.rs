use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::events::OrderEvent;
use crate::domain::ids::{PaymentOrderId, RefundOrderId};
use crate::domain::money::{Currency, Money};
use crate::domain::order::{OrderStatus, PaymentMethod, PaymentOrder};
use crate::domain::refund::{RefundOrder, RefundStatus};
use crate::repo::outbox_repo::OutboxRepo;
use crate::repo::store::{
    CurrencyTotal, OrderPage, OrderStatistics, OrderStore, OrderSummary, StoreError,
    IDEMPOTENCY_KEY_CONSTRAINT, MERCHANT_ORDER_CONSTRAINT,
};

const ORDER_COLS: &str = "id, merchant_order_id, user_id, amount, currency, method, subject, \
     status, gateway_order_id, pay_url, qr_code, paid_amount, paid_at, failure_reason, \
     idempotency_key, notify_url, return_url, expire_time, version, created_at, updated_at";

/// Postgres-backed order store. Aggregate writes, refund rows and outbox
/// events share one transaction; optimistic concurrency rides on the
/// `version` column.
#[derive(Clone)]
pub struct PgOrderStore {
    pub pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        PgOrderStore { pool }
    }

    async fn find_one(&self, sql: &str, bind: &str) -> Result<Option<PaymentOrder>, StoreError> {
        let row = sqlx::query(sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let order = order_from_row(&row)?;
        let mut orders = self.attach_refunds(vec![order]).await?;
        Ok(orders.pop())
    }

    async fn attach_refunds(
        &self,
        mut orders: Vec<PaymentOrder>,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        if orders.is_empty() {
            return Ok(orders);
        }
        let ids: Vec<String> = orders.iter().map(|o| o.id().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, payment_order_id, amount, currency, reason, operator_id, status,
                   gateway_refund_id, failure_reason, refunded_at, created_at, updated_at
            FROM refund_orders
            WHERE payment_order_id = ANY($1)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        let mut grouped: HashMap<String, Vec<RefundOrder>> = HashMap::new();
        for row in &rows {
            let refund = refund_from_row(row)?;
            grouped
                .entry(refund.payment_order_id().to_string())
                .or_default()
                .push(refund);
        }
        for order in &mut orders {
            order.refunds = grouped.remove(order.id().as_str()).unwrap_or_default();
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(other)?;

        sqlx::query(
            r#"
            INSERT INTO payment_orders (
                id, merchant_order_id, user_id, amount, currency, method, subject, status,
                gateway_order_id, pay_url, qr_code, paid_amount, paid_at, failure_reason,
                idempotency_key, notify_url, return_url, expire_time, version, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)
            "#,
        )
        .bind(order.id().as_str())
        .bind(order.merchant_order_id())
        .bind(order.user_id())
        .bind(order.amount().amount())
        .bind(order.amount().currency().code())
        .bind(order.method().as_str())
        .bind(order.subject())
        .bind(order.status().as_str())
        .bind(order.gateway_order_id())
        .bind(order.pay_url())
        .bind(order.qr_code())
        .bind(order.paid_amount().map(|m| m.amount()))
        .bind(order.paid_at())
        .bind(order.failure_reason())
        .bind(order.idempotency_key())
        .bind(order.notify_url())
        .bind(order.return_url())
        .bind(order.expire_time())
        .bind(order.version())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(tx.as_mut())
        .await
        .map_err(map_write_error)?;

        for refund in order.refunds() {
            upsert_refund(&mut tx, refund).await?;
        }
        for event in events {
            OutboxRepo::insert_tx(&mut tx, event).await?;
        }

        tx.commit().await.map_err(other)?;
        Ok(())
    }

    async fn update(&self, order: &PaymentOrder, events: &[OrderEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(other)?;

        let result = sqlx::query(
            r#"
            UPDATE payment_orders
            SET status=$2, gateway_order_id=$3, pay_url=$4, qr_code=$5, paid_amount=$6,
                paid_at=$7, failure_reason=$8, updated_at=$9, version=version+1
            WHERE id=$1 AND version=$10
            "#,
        )
        .bind(order.id().as_str())
        .bind(order.status().as_str())
        .bind(order.gateway_order_id())
        .bind(order.pay_url())
        .bind(order.qr_code())
        .bind(order.paid_amount().map(|m| m.amount()))
        .bind(order.paid_at())
        .bind(order.failure_reason())
        .bind(order.updated_at())
        .bind(order.version())
        .execute(tx.as_mut())
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            let _ = tx.rollback().await;
            return Err(StoreError::Conflict(order.id().to_string()));
        }

        for refund in order.refunds() {
            upsert_refund(&mut tx, refund).await?;
        }
        for event in events {
            OutboxRepo::insert_tx(&mut tx, event).await?;
        }

        tx.commit().await.map_err(other)?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<PaymentOrder>, StoreError> {
        self.find_one(
            &format!("SELECT {ORDER_COLS} FROM payment_orders WHERE id=$1"),
            id,
        )
        .await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.find_one(
            &format!("SELECT {ORDER_COLS} FROM payment_orders WHERE idempotency_key=$1"),
            key,
        )
        .await
    }

    async fn find_by_merchant_order_id(
        &self,
        merchant_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.find_one(
            &format!("SELECT {ORDER_COLS} FROM payment_orders WHERE merchant_order_id=$1"),
            merchant_order_id,
        )
        .await
    }

    async fn find_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentOrder>, StoreError> {
        self.find_one(
            &format!("SELECT {ORDER_COLS} FROM payment_orders WHERE gateway_order_id=$1"),
            gateway_order_id,
        )
        .await
    }

    async fn find_by_user_id(
        &self,
        user_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<OrderPage, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM payment_orders WHERE user_id=$1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(other)?
            .get("n");

        let rows = sqlx::query(
            r#"
            SELECT id, merchant_order_id, amount, currency, method, status, created_at
            FROM payment_orders
            WHERE user_id=$1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        let orders = rows
            .into_iter()
            .map(|row| OrderSummary {
                payment_order_id: row.get("id"),
                merchant_order_id: row.get("merchant_order_id"),
                amount: row.get("amount"),
                currency: row.get("currency"),
                method: row.get("method"),
                status: row.get("status"),
                created_at: row.get("created_at"),
            })
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
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLS} FROM payment_orders \
             WHERE status='PROCESSING' AND updated_at <= $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        let orders = rows
            .iter()
            .map(order_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.attach_refunds(orders).await
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLS} FROM payment_orders \
             WHERE status='PENDING' AND expire_time <= $1 \
             ORDER BY expire_time ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        let orders = rows
            .iter()
            .map(order_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.attach_refunds(orders).await
    }

    async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<OrderStatistics, StoreError> {
        let counts = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status IN ('SUCCESS','PARTIAL_REFUNDED','REFUNDED')) AS succeeded,
                   COUNT(*) FILTER (WHERE status='FAILED') AS failed,
                   COUNT(*) FILTER (WHERE status='CANCELLED') AS cancelled,
                   COUNT(*) FILTER (WHERE status IN ('PARTIAL_REFUNDED','REFUNDED')) AS refunded
            FROM payment_orders
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(other)?;

        let mut totals: BTreeMap<String, CurrencyTotal> = BTreeMap::new();

        let paid_rows = sqlx::query(
            r#"
            SELECT currency, SUM(paid_amount) AS paid
            FROM payment_orders
            WHERE created_at >= $1 AND created_at < $2 AND paid_amount IS NOT NULL
            GROUP BY currency
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        for row in paid_rows {
            let currency: String = row.get("currency");
            totals
                .entry(currency.clone())
                .or_insert_with(|| CurrencyTotal {
                    currency,
                    paid_amount: Decimal::ZERO,
                    refunded_amount: Decimal::ZERO,
                })
                .paid_amount = row.get("paid");
        }

        let refunded_rows = sqlx::query(
            r#"
            SELECT o.currency AS currency, SUM(r.amount) AS refunded
            FROM refund_orders r
            JOIN payment_orders o ON o.id = r.payment_order_id
            WHERE r.status='SUCCESS' AND o.created_at >= $1 AND o.created_at < $2
            GROUP BY o.currency
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;
        for row in refunded_rows {
            let currency: String = row.get("currency");
            totals
                .entry(currency.clone())
                .or_insert_with(|| CurrencyTotal {
                    currency,
                    paid_amount: Decimal::ZERO,
                    refunded_amount: Decimal::ZERO,
                })
                .refunded_amount = row.get("refunded");
        }

        Ok(OrderStatistics {
            total_orders: counts.get("total"),
            succeeded_orders: counts.get("succeeded"),
            failed_orders: counts.get("failed"),
            cancelled_orders: counts.get("cancelled"),
            refunded_orders: counts.get("refunded"),
            totals: totals.into_values().collect(),
        })
    }
}

async fn upsert_refund(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    refund: &RefundOrder,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO refund_orders (
            id, payment_order_id, amount, currency, reason, operator_id, status,
            gateway_refund_id, failure_reason, refunded_at, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        ON CONFLICT (id) DO UPDATE SET
            status=EXCLUDED.status,
            gateway_refund_id=EXCLUDED.gateway_refund_id,
            failure_reason=EXCLUDED.failure_reason,
            refunded_at=EXCLUDED.refunded_at,
            updated_at=EXCLUDED.updated_at
        "#,
    )
    .bind(refund.id().as_str())
    .bind(refund.payment_order_id().as_str())
    .bind(refund.amount().amount())
    .bind(refund.amount().currency().code())
    .bind(refund.reason())
    .bind(refund.operator_id())
    .bind(refund.status().as_str())
    .bind(refund.gateway_refund_id())
    .bind(refund.failure_reason())
    .bind(refund.refunded_at())
    .bind(refund.created_at())
    .bind(refund.updated_at())
    .execute(tx.as_mut())
    .await
    .map_err(other)?;
    Ok(())
}

fn order_from_row(row: &PgRow) -> anyhow::Result<PaymentOrder> {
    let currency: Currency = row.get::<String, _>("currency").parse()?;
    let status_raw: String = row.get("status");
    let status = OrderStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown order status {status_raw:?} in store"))?;
    let method_raw: String = row.get("method");
    let method = PaymentMethod::parse(&method_raw)
        .ok_or_else(|| anyhow!("unknown payment method {method_raw:?} in store"))?;
    let amount = Money::new(row.get("amount"), currency)?;
    let paid_amount = row
        .get::<Option<Decimal>, _>("paid_amount")
        .map(|raw| Money::new(raw, currency))
        .transpose()?;

    Ok(PaymentOrder {
        id: PaymentOrderId::from_string(row.get("id")),
        merchant_order_id: row.get("merchant_order_id"),
        user_id: row.get("user_id"),
        amount,
        method,
        subject: row.get("subject"),
        status,
        gateway_order_id: row.get("gateway_order_id"),
        pay_url: row.get("pay_url"),
        qr_code: row.get("qr_code"),
        paid_amount,
        paid_at: row.get("paid_at"),
        failure_reason: row.get("failure_reason"),
        idempotency_key: row.get("idempotency_key"),
        notify_url: row.get("notify_url"),
        return_url: row.get("return_url"),
        expire_time: row.get("expire_time"),
        refunds: Vec::new(),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn refund_from_row(row: &PgRow) -> Result<RefundOrder, StoreError> {
    let currency: Currency = row
        .get::<String, _>("currency")
        .parse()
        .map_err(anyhow::Error::from)?;
    let status_raw: String = row.get("status");
    let status = RefundStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown refund status {status_raw:?} in store"))?;
    let amount = Money::new(row.get("amount"), currency).map_err(anyhow::Error::from)?;

    Ok(RefundOrder {
        id: RefundOrderId::from_string(row.get("id")),
        payment_order_id: PaymentOrderId::from_string(row.get("payment_order_id")),
        amount,
        reason: row.get("reason"),
        operator_id: row.get("operator_id"),
        status,
        gateway_refund_id: row.get("gateway_refund_id"),
        failure_reason: row.get("failure_reason"),
        refunded_at: row.get("refunded_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            let constraint = db.constraint().unwrap_or_default();
            if constraint.contains("idempotency") {
                return StoreError::UniqueViolation(IDEMPOTENCY_KEY_CONSTRAINT.to_string());
            }
            if constraint.contains("merchant") {
                return StoreError::UniqueViolation(MERCHANT_ORDER_CONSTRAINT.to_string());
            }
            return StoreError::UniqueViolation(constraint.to_string());
        }
    }
    other(e)
}

fn other(e: sqlx::Error) -> StoreError {
    StoreError::Other(e.into())
}
