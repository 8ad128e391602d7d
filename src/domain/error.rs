use rust_decimal::Decimal;

use crate::domain::order::OrderStatus;

/// Errors raised by the order aggregate and its value objects. Service code
/// maps these onto HTTP error envelopes; they never carry transport detail.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("{0}")]
    Validation(String),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("amount {amount} exceeds {currency} precision of {scale} decimal places")]
    ExcessPrecision {
        amount: Decimal,
        currency: String,
        scale: u32,
    },

    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("payment method {method} does not support {currency}")]
    UnsupportedCurrency { method: String, currency: String },

    #[error("operation {operation} is not allowed while order is {status}")]
    InvalidOperation {
        operation: &'static str,
        status: OrderStatus,
    },

    #[error("requested refund {requested} exceeds refundable {refundable}")]
    InsufficientRefundable {
        requested: Decimal,
        refundable: Decimal,
    },

    #[error("refund window closed {days} days after payment")]
    RefundWindowClosed { days: i64 },

    #[error("refund {0} not found on this order")]
    RefundNotFound(String),

    #[error("amount overflow")]
    AmountOverflow,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DomainError::Validation(msg.into())
    }
}
