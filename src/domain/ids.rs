use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;

/// Engine-assigned order id, `po_<UTC timestamp>_<8 hex>`. The timestamp
/// prefix keeps ids roughly sortable in logs and support tooling; the random
/// tail makes them unguessable enough for URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentOrderId(String);

impl PaymentOrderId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        PaymentOrderId(format!(
            "po_{}_{}",
            now.format("%Y%m%d%H%M%S"),
            random_tail()
        ))
    }

    pub fn from_string(raw: String) -> Self {
        PaymentOrderId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Refund id, `rf_<UTC timestamp>_<8 hex>`. Sent to the rail as the
/// idempotent refund reference and echoed back in refund callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefundOrderId(String);

impl RefundOrderId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        RefundOrderId(format!(
            "rf_{}_{}",
            now.format("%Y%m%d%H%M%S"),
            random_tail()
        ))
    }

    pub fn from_string(raw: String) -> Self {
        RefundOrderId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefundOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_tail() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}

fn is_reference_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Merchant-side order reference: 1 to 64 chars of `[A-Za-z0-9_-]`.
pub fn validate_merchant_order_id(raw: &str) -> Result<(), DomainError> {
    if raw.is_empty() || raw.len() > 64 {
        return Err(DomainError::validation(
            "merchant_order_id must be 1 to 64 characters",
        ));
    }
    if !raw.chars().all(is_reference_char) {
        return Err(DomainError::validation(
            "merchant_order_id may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Idempotency key: 8 to 64 chars of `[A-Za-z0-9_-]`. Short keys are refused
/// because they tend to be accidental collisions, not deliberate replays.
pub fn validate_idempotency_key(raw: &str) -> Result<(), DomainError> {
    if raw.len() < 8 || raw.len() > 64 {
        return Err(DomainError::validation(
            "idempotency_key must be 8 to 64 characters",
        ));
    }
    if !raw.chars().all(is_reference_char) {
        return Err(DomainError::validation(
            "idempotency_key may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_tail() {
        let now = Utc::now();
        let po = PaymentOrderId::generate(now);
        let rf = RefundOrderId::generate(now);
        assert!(po.as_str().starts_with("po_"));
        assert!(rf.as_str().starts_with("rf_"));
        assert_eq!(po.as_str().len(), "po_".len() + 14 + 1 + 8);
    }

    #[test]
    fn generated_ids_differ() {
        let now = Utc::now();
        assert_ne!(PaymentOrderId::generate(now), PaymentOrderId::generate(now));
    }

    #[test]
    fn merchant_order_id_charset() {
        assert!(validate_merchant_order_id("ORDER-2024_001").is_ok());
        assert!(validate_merchant_order_id("a").is_ok());
        assert!(validate_merchant_order_id("").is_err());
        assert!(validate_merchant_order_id("has space").is_err());
        assert!(validate_merchant_order_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn idempotency_key_length_bounds() {
        assert!(validate_idempotency_key("retry-key-01").is_ok());
        assert!(validate_idempotency_key("short").is_err());
        assert!(validate_idempotency_key(&"k".repeat(64)).is_ok());
        assert!(validate_idempotency_key(&"k".repeat(65)).is_err());
        assert!(validate_idempotency_key("bad key 123").is_err());
    }
}
