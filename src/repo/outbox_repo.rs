use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::domain::events::OrderEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub order_id: String,
    pub event_type: String,
    pub payload_json: serde_json::Value,
    pub attempts: i32,
}

/// Transactional outbox for order events. Rows are written inside the same
/// transaction that persists the aggregate, so an event exists exactly when
/// its state change does; the relay drains them afterwards.
#[derive(Clone)]
pub struct OutboxRepo {
    pub pool: PgPool,
}

impl OutboxRepo {
    /// The (order_id, event_type, dedup_key) unique index swallows replays:
    /// a redelivered callback that produces the same logical event inserts
    /// nothing.
    pub async fn insert_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: &OrderEvent,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_events_outbox (order_id, event_type, dedup_key, payload_json, status, attempts, next_attempt_at)
            VALUES ($1, $2, $3, $4, 'PENDING', 0, now())
            ON CONFLICT (order_id, event_type, dedup_key) DO NOTHING
            "#,
        )
        .bind(event.order_id())
        .bind(event.event_type())
        .bind(event.dedup_key())
        .bind(event.payload())
        .execute(tx.as_mut())
        .await?;

        Ok(())
    }

    pub async fn lock_pending(&self, batch_size: i64) -> Result<Vec<OutboxRow>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, event_type, payload_json, attempts
            FROM order_events_outbox
            WHERE status = 'PENDING' AND next_attempt_at <= now()
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size)
        .fetch_all(tx.as_mut())
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        sqlx::query(
            "UPDATE order_events_outbox SET status = 'PROCESSING', updated_at = now() WHERE id = ANY($1)",
        )
        .bind(&ids)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|r| OutboxRow {
                id: r.get("id"),
                order_id: r.get("order_id"),
                event_type: r.get("event_type"),
                payload_json: r.get("payload_json"),
                attempts: r.get("attempts"),
            })
            .collect())
    }

    pub async fn mark_published(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE order_events_outbox SET status='PUBLISHED', published_at=now(), updated_at=now() WHERE id=$1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_retry(
        &self,
        id: i64,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE order_events_outbox SET status='PENDING', attempts=$2, next_attempt_at=$3, updated_at=now() WHERE id=$1",
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
