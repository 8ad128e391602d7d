use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::{PaymentOrderId, RefundOrderId};
use crate::domain::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl RefundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Processing => "PROCESSING",
            RefundStatus::Success => "SUCCESS",
            RefundStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(RefundStatus::Pending),
            "PROCESSING" => Some(RefundStatus::Processing),
            "SUCCESS" => Some(RefundStatus::Success),
            "FAILED" => Some(RefundStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RefundStatus::Success | RefundStatus::Failed)
    }

    /// PENDING and PROCESSING refunds still hold a claim on the paid amount.
    pub fn reserves_funds(self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Processing)
    }
}

/// A refund attempt against one payment order. Owned and mutated exclusively
/// through the parent `PaymentOrder`; nothing else changes a refund's status.
#[derive(Debug, Clone)]
pub struct RefundOrder {
    pub(crate) id: RefundOrderId,
    pub(crate) payment_order_id: PaymentOrderId,
    pub(crate) amount: Money,
    pub(crate) reason: String,
    pub(crate) operator_id: String,
    pub(crate) status: RefundStatus,
    pub(crate) gateway_refund_id: Option<String>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) refunded_at: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl RefundOrder {
    pub(crate) fn new(
        payment_order_id: PaymentOrderId,
        amount: Money,
        reason: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        RefundOrder {
            id: RefundOrderId::generate(now),
            payment_order_id,
            amount,
            reason: reason.to_string(),
            operator_id: operator_id.to_string(),
            status: RefundStatus::Pending,
            gateway_refund_id: None,
            failure_reason: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &RefundOrderId {
        &self.id
    }

    pub fn payment_order_id(&self) -> &PaymentOrderId {
        &self.payment_order_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn status(&self) -> RefundStatus {
        self.status
    }

    pub fn gateway_refund_id(&self) -> Option<&str> {
        self.gateway_refund_id.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn refunded_at(&self) -> Option<DateTime<Utc>> {
        self.refunded_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// What a refund callback tells us about one refund attempt.
#[derive(Debug, Clone)]
pub struct RefundResolution {
    pub success: bool,
    pub gateway_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
}
