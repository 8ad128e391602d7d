use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::domain::money::Money;
use crate::domain::order::{OrderStatus, PaymentMethod, PaymentOrder};
use crate::domain::refund::RefundOrder;

pub mod alipay;
pub mod card;
pub mod crypto;
pub mod mock;
pub mod selector;

/// Outbound gateway failures, split by what the caller should do about them.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Worth retrying: timeouts, connection resets, 5xx.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The rail said no and will keep saying no: 4xx, rejected business rule.
    #[error("gateway rejected request: {0}")]
    Permanent(String),

    #[error("malformed callback payload: {0}")]
    MalformedPayload(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            GatewayError::Permanent(e.to_string())
        } else {
            // timeouts, connect failures, dropped connections
            GatewayError::Transient(e.to_string())
        }
    }
}

/// What a rail returns when a payment is opened.
#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub pay_url: Option<String>,
    pub qr_code: Option<String>,
}

/// A polled view of the rail's current opinion of one payment.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub native_status: String,
    pub gateway_order_id: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub gateway_refund_id: String,
}

/// Raw inbound callback material, captured before any interpretation.
/// Adapters know where their rail hides the signature.
#[derive(Debug, Clone, Default)]
pub struct CallbackEnvelope {
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl CallbackEnvelope {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }
}

/// A parsed payment callback in rail vocabulary. `native_status` is mapped
/// through the adapter's `StatusMap` by the reconciler, never here.
#[derive(Debug, Clone)]
pub struct CallbackNotice {
    pub native_status: String,
    pub gateway_order_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// A parsed refund callback. `refund_id` is the engine's own refund id,
/// echoed back by the rail.
#[derive(Debug, Clone)]
pub struct RefundNotice {
    pub refund_id: String,
    pub gateway_order_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
}

/// The exact response a rail expects as callback acknowledgment. Wallet
/// rails read a bare text token and retry on anything but "success"; JSON
/// rails retry on a non-2xx status, so the adapter picks the status too.
#[derive(Debug, Clone)]
pub struct CallbackAck {
    pub body: String,
    pub content_type: &'static str,
    pub status: u16,
}

impl CallbackAck {
    pub fn text(body: &str) -> Self {
        CallbackAck {
            body: body.to_string(),
            content_type: "text/plain",
            status: 200,
        }
    }

    pub fn json(body: serde_json::Value) -> Self {
        CallbackAck {
            body: body.to_string(),
            content_type: "application/json",
            status: 200,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Translation table from one rail's native status strings into the
/// engine's order statuses. Validated when the adapter is registered, and
/// fail-closed afterwards: an unknown native status resolves to FAILED so a
/// new gateway vocabulary can never invent a success.
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    entries: HashMap<String, OrderStatus>,
}

impl StatusMap {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, OrderStatus)>,
        S: Into<String>,
    {
        StatusMap {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn resolve(&self, native: &str) -> OrderStatus {
        self.entries
            .get(native)
            .copied()
            .unwrap_or(OrderStatus::Failed)
    }

    pub fn contains(&self, native: &str) -> bool {
        self.entries.contains_key(native)
    }

    /// A usable map names at least one success and one failure outcome and
    /// only targets observable payment statuses. Refund statuses are driven
    /// by refund callbacks, not by this table.
    pub fn validate(&self, adapter: &str) -> anyhow::Result<()> {
        use OrderStatus::*;
        if self.entries.is_empty() {
            anyhow::bail!("adapter {adapter}: status map is empty");
        }
        for (native, status) in &self.entries {
            if !matches!(status, Processing | Success | Failed | Cancelled) {
                anyhow::bail!(
                    "adapter {adapter}: native status {native:?} maps to {status:?}, which callbacks may not produce"
                );
            }
        }
        if !self.entries.values().any(|s| *s == Success) {
            anyhow::bail!("adapter {adapter}: status map has no SUCCESS mapping");
        }
        if !self.entries.values().any(|s| *s == Failed) {
            anyhow::bail!("adapter {adapter}: status map has no FAILED mapping");
        }
        Ok(())
    }
}

/// One payment rail. Creation, querying, refunds and close go out through
/// this; callback verification and parsing come back in through it. Exactly
/// one adapter serves each payment method.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn method(&self) -> PaymentMethod;

    fn status_map(&self) -> &StatusMap;

    async fn create_payment(&self, order: &PaymentOrder) -> Result<GatewayOrder, GatewayError>;

    async fn query_status(&self, order: &PaymentOrder) -> Result<StatusSnapshot, GatewayError>;

    /// Must pass before anything else looks at the payload. A failed check
    /// means the callback is untrusted noise, not data.
    fn verify_callback(&self, envelope: &CallbackEnvelope) -> bool;

    fn parse_callback(&self, envelope: &CallbackEnvelope) -> Result<CallbackNotice, GatewayError>;

    fn parse_refund_callback(
        &self,
        envelope: &CallbackEnvelope,
    ) -> Result<RefundNotice, GatewayError>;

    async fn create_refund(
        &self,
        order: &PaymentOrder,
        refund: &RefundOrder,
    ) -> Result<GatewayRefund, GatewayError>;

    async fn close_payment(&self, order: &PaymentOrder) -> Result<(), GatewayError>;

    fn ack_success(&self) -> CallbackAck;

    fn ack_failure(&self) -> CallbackAck;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let shifted = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        shifted.min(self.max_backoff)
    }
}

/// Runs one outbound gateway call with bounded retries. Only Transient
/// errors are retried; everything else surfaces immediately.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient gateway error, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Signature over sorted `key=value` pairs joined with `&`, with the shared
/// secret appended: base64(sha256(canonical + secret)). Empty values and the
/// signature field itself stay out of the canonical string.
pub(crate) fn sign_sorted_params(
    params: &[(String, String)],
    signature_field: &str,
    secret: &str,
) -> String {
    let mut kept: Vec<&(String, String)> = params
        .iter()
        .filter(|(k, v)| k != signature_field && !v.is_empty())
        .collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical = kept
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(secret.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Signature over a raw body: base64(sha256(body + secret)). Used by rails
/// that sign the whole JSON payload into a header.
pub(crate) fn sign_raw(body: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(secret.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub(crate) fn signature_matches(expected: &str, provided: &str) -> bool {
    constant_time_eq::constant_time_eq(expected.as_bytes(), provided.as_bytes())
}
