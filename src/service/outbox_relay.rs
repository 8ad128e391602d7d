use anyhow::Result;
use chrono::{Duration, Utc};

use crate::repo::outbox_repo::OutboxRepo;

/// Drains the order-event outbox into a Redis stream. Locked batches keep
/// multiple relay instances from double-publishing; an XADD failure reschedules
/// the row with capped exponential backoff.
#[derive(Clone)]
pub struct OutboxRelay {
    pub outbox_repo: OutboxRepo,
    pub redis_client: redis::Client,
    pub stream_key: String,
}

impl OutboxRelay {
    pub async fn run(self) {
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "outbox relay cycle failed");
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn tick(&self) -> Result<()> {
        let batch = self.outbox_repo.lock_pending(100).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        for row in batch {
            let payload = serde_json::to_string(&row.payload_json)?;
            let added: redis::RedisResult<String> = redis::cmd("XADD")
                .arg(&self.stream_key)
                .arg("MAXLEN")
                .arg("~")
                .arg(1_000_000)
                .arg("*")
                .arg("event_type")
                .arg(&row.event_type)
                .arg("order_id")
                .arg(&row.order_id)
                .arg("payload")
                .arg(payload)
                .query_async(&mut conn)
                .await;

            match added {
                Ok(_) => {
                    self.outbox_repo.mark_published(row.id).await?;
                }
                Err(e) => {
                    let attempts = row.attempts + 1;
                    let backoff = i64::min(300, 2_i64.pow(attempts.min(8) as u32));
                    let next_attempt_at = Utc::now() + Duration::seconds(backoff);
                    self.outbox_repo
                        .mark_retry(row.id, attempts, next_attempt_at)
                        .await?;
                    tracing::warn!(
                        outbox_id = row.id,
                        event_type = row.event_type.as_str(),
                        error = %e,
                        "xadd failed, rescheduled"
                    );
                }
            }
        }

        Ok(())
    }
}
