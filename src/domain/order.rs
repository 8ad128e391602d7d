use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;
use crate::domain::ids::{self, PaymentOrderId};
use crate::domain::money::{Currency, Money};
use crate::domain::refund::{RefundOrder, RefundResolution, RefundStatus};

pub const DEFAULT_EXPIRE_MINUTES: i64 = 30;
pub const MAX_EXPIRE_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Alipay,
    Card,
    Usdt,
    Mock,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Alipay => "ALIPAY",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Usdt => "USDT",
            PaymentMethod::Mock => "MOCK",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "ALIPAY" => Some(PaymentMethod::Alipay),
            "CARD" => Some(PaymentMethod::Card),
            "USDT" => Some(PaymentMethod::Usdt),
            "MOCK" => Some(PaymentMethod::Mock),
            _ => None,
        }
    }

    pub fn supports(self, currency: Currency) -> bool {
        match self {
            PaymentMethod::Alipay => currency == Currency::Cny,
            PaymentMethod::Card => {
                matches!(currency, Currency::Cny | Currency::Usd | Currency::Eur)
            }
            PaymentMethod::Usdt => currency == Currency::Usdt,
            PaymentMethod::Mock => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
    Refunded,
    PartialRefunded,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
            OrderStatus::PartialRefunded => "PARTIAL_REFUNDED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(OrderStatus::Pending),
            "PROCESSING" => Some(OrderStatus::Processing),
            "SUCCESS" => Some(OrderStatus::Success),
            "FAILED" => Some(OrderStatus::Failed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REFUNDED" => Some(OrderStatus::Refunded),
            "PARTIAL_REFUNDED" => Some(OrderStatus::PartialRefunded),
            _ => None,
        }
    }

    /// No further payment-status transitions leave these states. SUCCESS is
    /// deliberately not terminal: refunds still move it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Failed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// PENDING may jump straight to a terminal payment outcome: the
    /// PROCESSING observation is not guaranteed to arrive first, and the
    /// result must not depend on delivery order.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Processing | Success | Failed | Cancelled)
                | (Processing, Success | Failed | Cancelled)
                | (Success, PartialRefunded | Refunded)
                | (PartialRefunded, Refunded)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway-reported payment status observation, already translated into
/// the engine's vocabulary. Both callbacks and status polls produce these.
#[derive(Debug, Clone)]
pub struct CallbackUpdate {
    pub status: OrderStatus,
    pub gateway_order_id: Option<String>,
    pub paid_amount: Option<Money>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RefundOutcome {
    /// The refund moved to a terminal state; `status_change` is set when the
    /// order itself moved to PARTIAL_REFUNDED or REFUNDED.
    Applied {
        refund: RefundOrder,
        status_change: Option<(OrderStatus, OrderStatus)>,
    },
    /// Duplicate delivery for an already-settled refund.
    NoOp,
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub merchant_order_id: String,
    pub user_id: String,
    pub amount: Money,
    pub method: PaymentMethod,
    pub subject: String,
    pub idempotency_key: Option<String>,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub expire_minutes: Option<i64>,
}

/// The payment order aggregate. Refunds live inside it and every mutation
/// goes through a named method; fields are crate-visible only so the stores
/// can hydrate and persist without a parallel record type.
#[derive(Debug, Clone)]
pub struct PaymentOrder {
    pub(crate) id: PaymentOrderId,
    pub(crate) merchant_order_id: String,
    pub(crate) user_id: String,
    pub(crate) amount: Money,
    pub(crate) method: PaymentMethod,
    pub(crate) subject: String,
    pub(crate) status: OrderStatus,
    pub(crate) gateway_order_id: Option<String>,
    pub(crate) pay_url: Option<String>,
    pub(crate) qr_code: Option<String>,
    pub(crate) paid_amount: Option<Money>,
    pub(crate) paid_at: Option<DateTime<Utc>>,
    pub(crate) failure_reason: Option<String>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) notify_url: Option<String>,
    pub(crate) return_url: Option<String>,
    pub(crate) expire_time: DateTime<Utc>,
    pub(crate) refunds: Vec<RefundOrder>,
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl PaymentOrder {
    pub fn create(req: CreateOrder, now: DateTime<Utc>) -> Result<Self, DomainError> {
        ids::validate_merchant_order_id(&req.merchant_order_id)?;
        if req.user_id.is_empty() || req.user_id.len() > 64 {
            return Err(DomainError::validation("user_id must be 1 to 64 characters"));
        }
        if req.subject.is_empty() || req.subject.len() > 256 {
            return Err(DomainError::validation("subject must be 1 to 256 characters"));
        }
        if req.amount.is_zero() {
            return Err(DomainError::NonPositiveAmount(req.amount.amount()));
        }
        if !req.method.supports(req.amount.currency()) {
            return Err(DomainError::UnsupportedCurrency {
                method: req.method.as_str().to_string(),
                currency: req.amount.currency().code().to_string(),
            });
        }
        if let Some(key) = &req.idempotency_key {
            ids::validate_idempotency_key(key)?;
        }
        let expire_minutes = req.expire_minutes.unwrap_or(DEFAULT_EXPIRE_MINUTES);
        if !(1..=MAX_EXPIRE_MINUTES).contains(&expire_minutes) {
            return Err(DomainError::validation(format!(
                "expire_minutes must be between 1 and {MAX_EXPIRE_MINUTES}"
            )));
        }

        Ok(PaymentOrder {
            id: PaymentOrderId::generate(now),
            merchant_order_id: req.merchant_order_id,
            user_id: req.user_id,
            amount: req.amount,
            method: req.method,
            subject: req.subject,
            status: OrderStatus::Pending,
            gateway_order_id: None,
            pay_url: None,
            qr_code: None,
            paid_amount: None,
            paid_at: None,
            failure_reason: None,
            idempotency_key: req.idempotency_key,
            notify_url: req.notify_url,
            return_url: req.return_url,
            expire_time: now + Duration::minutes(expire_minutes),
            refunds: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> &PaymentOrderId {
        &self.id
    }

    pub fn merchant_order_id(&self) -> &str {
        &self.merchant_order_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn method(&self) -> PaymentMethod {
        self.method
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn gateway_order_id(&self) -> Option<&str> {
        self.gateway_order_id.as_deref()
    }

    pub fn pay_url(&self) -> Option<&str> {
        self.pay_url.as_deref()
    }

    pub fn qr_code(&self) -> Option<&str> {
        self.qr_code.as_deref()
    }

    pub fn paid_amount(&self) -> Option<&Money> {
        self.paid_amount.as_ref()
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn notify_url(&self) -> Option<&str> {
        self.notify_url.as_deref()
    }

    pub fn return_url(&self) -> Option<&str> {
        self.return_url.as_deref()
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        self.expire_time
    }

    pub fn refunds(&self) -> &[RefundOrder] {
        &self.refunds
    }

    pub fn refund(&self, refund_id: &str) -> Option<&RefundOrder> {
        self.refunds.iter().find(|r| r.id.as_str() == refund_id)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && now >= self.expire_time
    }

    /// Records what the rail handed back at creation time.
    pub fn attach_gateway_order(
        &mut self,
        gateway_order_id: String,
        pay_url: Option<String>,
        qr_code: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.gateway_order_id = Some(gateway_order_id);
        self.pay_url = pay_url;
        self.qr_code = qr_code;
        self.updated_at = now;
    }

    /// The single mutation point for payment-status observations, shared by
    /// signed callbacks, the status poller and manual sync.
    ///
    /// Returns `false` without touching the order when the observation is a
    /// duplicate of the current status, targets a state the machine does not
    /// allow from here, or carries a status outside the payment vocabulary.
    /// `false` means "nothing to persist, acknowledge anyway".
    pub fn apply_callback(&mut self, update: CallbackUpdate, now: DateTime<Utc>) -> bool {
        use OrderStatus::*;
        if !matches!(update.status, Processing | Success | Failed | Cancelled) {
            return false;
        }
        if update.status == self.status {
            return false;
        }
        if !self.status.can_transition_to(update.status) {
            return false;
        }
        if update.status == Success {
            if let Some(paid) = &update.paid_amount {
                if paid.currency() != self.amount.currency() {
                    return false;
                }
            }
        }

        match update.status {
            Success => {
                self.paid_amount = update.paid_amount.or_else(|| Some(self.amount.clone()));
                self.paid_at = update.paid_at.or(Some(now));
                self.failure_reason = None;
            }
            Failed => {
                self.failure_reason = update
                    .failure_reason
                    .or_else(|| Some("payment failed at gateway".to_string()));
            }
            Cancelled => {
                self.failure_reason = update
                    .failure_reason
                    .or_else(|| Some("cancelled at gateway".to_string()));
            }
            Processing => {}
            _ => return false,
        }
        if self.gateway_order_id.is_none() {
            self.gateway_order_id = update.gateway_order_id;
        }
        self.status = update.status;
        self.updated_at = now;
        true
    }

    /// Opens a refund, reserving its amount immediately so concurrent
    /// requests cannot oversubscribe the paid total. The reservation counts
    /// in-flight refunds as well as settled ones.
    pub fn create_refund(
        &mut self,
        amount: Money,
        reason: &str,
        operator_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<RefundOrder, DomainError> {
        if !matches!(
            self.status,
            OrderStatus::Success | OrderStatus::PartialRefunded
        ) {
            return Err(DomainError::InvalidOperation {
                operation: "create_refund",
                status: self.status,
            });
        }
        let paid = self.paid_amount.clone().ok_or(DomainError::InvalidOperation {
            operation: "create_refund",
            status: self.status,
        })?;
        if amount.is_zero() {
            return Err(DomainError::NonPositiveAmount(amount.amount()));
        }
        if amount.currency() != paid.currency() {
            return Err(DomainError::CurrencyMismatch {
                left: amount.currency().code().to_string(),
                right: paid.currency().code().to_string(),
            });
        }
        if reason.is_empty() || reason.len() > 256 {
            return Err(DomainError::validation("reason must be 1 to 256 characters"));
        }
        if let Some(paid_at) = self.paid_at {
            if now > paid_at + Duration::days(window_days) {
                return Err(DomainError::RefundWindowClosed { days: window_days });
            }
        }
        let reserved = self.reserved_refund_amount()?;
        let refundable = paid.checked_sub(&reserved)?;
        if !refundable.covers(&amount)? {
            return Err(DomainError::InsufficientRefundable {
                requested: amount.amount(),
                refundable: refundable.amount(),
            });
        }

        let refund = RefundOrder::new(self.id.clone(), amount, reason, operator_id, now);
        self.refunds.push(refund.clone());
        self.updated_at = now;
        Ok(refund)
    }

    /// The rail accepted the refund; it is now in the gateway's hands.
    pub fn mark_refund_processing(
        &mut self,
        refund_id: &str,
        gateway_refund_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let refund = self.refund_mut(refund_id)?;
        if refund.status != RefundStatus::Pending {
            return Ok(());
        }
        refund.status = RefundStatus::Processing;
        refund.gateway_refund_id = gateway_refund_id;
        refund.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Dispatch never reached the rail; release the reservation.
    pub fn mark_refund_failed(
        &mut self,
        refund_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let refund = self.refund_mut(refund_id)?;
        if refund.status.is_terminal() {
            return Ok(());
        }
        refund.status = RefundStatus::Failed;
        refund.failure_reason = Some(reason.to_string());
        refund.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Settles one refund from a signed refund callback and recomputes the
    /// order status from the refunded total. Duplicate deliveries for an
    /// already-terminal refund are a NoOp.
    pub fn apply_refund_callback(
        &mut self,
        refund_id: &str,
        resolution: RefundResolution,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, DomainError> {
        let paid = self.paid_amount.clone();
        let refund = self.refund_mut(refund_id)?;
        if refund.status.is_terminal() {
            return Ok(RefundOutcome::NoOp);
        }

        if resolution.success {
            refund.status = RefundStatus::Success;
            refund.refunded_at = resolution.refunded_at.or(Some(now));
        } else {
            refund.status = RefundStatus::Failed;
            refund.failure_reason = resolution
                .failure_reason
                .or_else(|| Some("refund failed at gateway".to_string()));
        }
        if refund.gateway_refund_id.is_none() {
            refund.gateway_refund_id = resolution.gateway_refund_id;
        }
        refund.updated_at = now;
        let settled = refund.clone();

        let mut status_change = None;
        if resolution.success {
            if let Some(paid) = paid {
                let refunded = self.refunded_amount()?;
                let next = if refunded.covers(&paid)? {
                    OrderStatus::Refunded
                } else {
                    OrderStatus::PartialRefunded
                };
                if next != self.status && self.status.can_transition_to(next) {
                    status_change = Some((self.status, next));
                    self.status = next;
                }
            }
        }
        self.updated_at = now;
        Ok(RefundOutcome::Applied {
            refund: settled,
            status_change,
        })
    }

    /// Closes a not-yet-paid order. Expiry sweeps and operator action both
    /// land here; a paid order cannot be closed, only refunded.
    pub fn close(
        &mut self,
        reason: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !matches!(self.status, OrderStatus::Pending | OrderStatus::Processing) {
            return Err(DomainError::InvalidOperation {
                operation: "close",
                status: self.status,
            });
        }
        self.status = OrderStatus::Cancelled;
        self.failure_reason = Some(format!("closed by {operator_id}: {reason}"));
        self.updated_at = now;
        Ok(())
    }

    /// Sum of settled (SUCCESS) refunds.
    pub fn refunded_amount(&self) -> Result<Money, DomainError> {
        self.sum_refunds(|r| r.status == RefundStatus::Success)
    }

    /// What a new refund may still claim: paid minus settled and in-flight
    /// refunds.
    pub fn refundable_amount(&self) -> Result<Money, DomainError> {
        let Some(paid) = &self.paid_amount else {
            return Ok(Money::zero(self.amount.currency()));
        };
        let reserved = self.reserved_refund_amount()?;
        paid.checked_sub(&reserved)
    }

    fn reserved_refund_amount(&self) -> Result<Money, DomainError> {
        self.sum_refunds(|r| r.status == RefundStatus::Success || r.status.reserves_funds())
    }

    fn sum_refunds(&self, keep: impl Fn(&RefundOrder) -> bool) -> Result<Money, DomainError> {
        let mut total = Money::zero(self.amount.currency());
        for refund in self.refunds.iter().filter(|r| keep(r)) {
            total = total.checked_add(&refund.amount)?;
        }
        Ok(total)
    }

    fn refund_mut(&mut self, refund_id: &str) -> Result<&mut RefundOrder, DomainError> {
        self.refunds
            .iter_mut()
            .find(|r| r.id.as_str() == refund_id)
            .ok_or_else(|| DomainError::RefundNotFound(refund_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cny(amount: rust_decimal::Decimal) -> Money {
        Money::new(amount, Currency::Cny).unwrap()
    }

    fn new_order() -> PaymentOrder {
        PaymentOrder::create(
            CreateOrder {
                merchant_order_id: "M-1001".to_string(),
                user_id: "u_42".to_string(),
                amount: cny(dec!(100.00)),
                method: PaymentMethod::Alipay,
                subject: "test order".to_string(),
                idempotency_key: None,
                notify_url: None,
                return_url: None,
                expire_minutes: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn success_update(paid: Money) -> CallbackUpdate {
        CallbackUpdate {
            status: OrderStatus::Success,
            gateway_order_id: Some("gw_1".to_string()),
            paid_amount: Some(paid),
            paid_at: None,
            failure_reason: None,
        }
    }

    fn status_only(status: OrderStatus) -> CallbackUpdate {
        CallbackUpdate {
            status,
            gateway_order_id: None,
            paid_amount: None,
            paid_at: None,
            failure_reason: None,
        }
    }

    fn paid_order() -> PaymentOrder {
        let mut order = new_order();
        assert!(order.apply_callback(success_update(cny(dec!(100.00))), Utc::now()));
        order
    }

    #[test]
    fn transition_table() {
        use OrderStatus::*;
        let allowed = [
            (Pending, Processing),
            (Pending, Success),
            (Pending, Failed),
            (Pending, Cancelled),
            (Processing, Success),
            (Processing, Failed),
            (Processing, Cancelled),
            (Success, PartialRefunded),
            (Success, Refunded),
            (PartialRefunded, Refunded),
        ];
        let all = [
            Pending,
            Processing,
            Success,
            Failed,
            Cancelled,
            Refunded,
            PartialRefunded,
        ];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::Success.is_terminal());
        assert!(!OrderStatus::PartialRefunded.is_terminal());
    }

    #[test]
    fn pending_jumps_straight_to_success() {
        let mut order = new_order();
        assert!(order.apply_callback(success_update(cny(dec!(100.00))), Utc::now()));
        assert_eq!(order.status(), OrderStatus::Success);
        assert_eq!(order.paid_amount().unwrap(), &cny(dec!(100.00)));
        assert!(order.paid_at().is_some());
        assert_eq!(order.gateway_order_id(), Some("gw_1"));
    }

    #[test]
    fn duplicate_success_is_a_noop() {
        let mut order = paid_order();
        let before = order.updated_at();
        assert!(!order.apply_callback(success_update(cny(dec!(100.00))), Utc::now()));
        assert_eq!(order.updated_at(), before);
    }

    #[test]
    fn late_processing_after_success_is_a_noop() {
        let mut order = paid_order();
        assert!(!order.apply_callback(status_only(OrderStatus::Processing), Utc::now()));
        assert_eq!(order.status(), OrderStatus::Success);
    }

    #[test]
    fn failed_is_sticky_against_success() {
        let mut order = new_order();
        assert!(order.apply_callback(status_only(OrderStatus::Failed), Utc::now()));
        assert!(!order.apply_callback(success_update(cny(dec!(100.00))), Utc::now()));
        assert_eq!(order.status(), OrderStatus::Failed);
        assert!(order.failure_reason().is_some());
    }

    #[test]
    fn refund_statuses_never_arrive_via_payment_callbacks() {
        let mut order = paid_order();
        assert!(!order.apply_callback(status_only(OrderStatus::Refunded), Utc::now()));
        assert!(!order.apply_callback(status_only(OrderStatus::PartialRefunded), Utc::now()));
        assert_eq!(order.status(), OrderStatus::Success);
    }

    #[test]
    fn mismatched_paid_currency_is_rejected_without_mutation() {
        let mut order = new_order();
        let update = success_update(Money::new(dec!(100.00), Currency::Usd).unwrap());
        assert!(!order.apply_callback(update, Utc::now()));
        assert_eq!(order.status(), OrderStatus::Pending);
    }

    #[test]
    fn success_without_amount_assumes_order_amount() {
        let mut order = new_order();
        let mut update = status_only(OrderStatus::Success);
        update.gateway_order_id = Some("gw_9".to_string());
        assert!(order.apply_callback(update, Utc::now()));
        assert_eq!(order.paid_amount().unwrap(), order.amount());
    }

    #[test]
    fn partial_then_full_refund_walkthrough() {
        let now = Utc::now();
        let mut order = paid_order();

        let r1 = order
            .create_refund(cny(dec!(40.00)), "damaged item", "ops_1", 90, now)
            .unwrap();
        assert_eq!(r1.status(), RefundStatus::Pending);
        assert_eq!(order.refundable_amount().unwrap(), cny(dec!(60.00)));
        // order status does not move until the refund settles
        assert_eq!(order.status(), OrderStatus::Success);

        let outcome = order
            .apply_refund_callback(
                r1.id().as_str(),
                RefundResolution {
                    success: true,
                    gateway_refund_id: Some("gwr_1".to_string()),
                    failure_reason: None,
                    refunded_at: None,
                },
                now,
            )
            .unwrap();
        match outcome {
            RefundOutcome::Applied { status_change, .. } => {
                assert_eq!(
                    status_change,
                    Some((OrderStatus::Success, OrderStatus::PartialRefunded))
                );
            }
            RefundOutcome::NoOp => panic!("expected applied"),
        }
        assert_eq!(order.status(), OrderStatus::PartialRefunded);
        assert_eq!(order.refunded_amount().unwrap(), cny(dec!(40.00)));

        let r2 = order
            .create_refund(cny(dec!(60.00)), "remainder", "ops_1", 90, now)
            .unwrap();
        let outcome = order
            .apply_refund_callback(
                r2.id().as_str(),
                RefundResolution {
                    success: true,
                    gateway_refund_id: None,
                    failure_reason: None,
                    refunded_at: None,
                },
                now,
            )
            .unwrap();
        match outcome {
            RefundOutcome::Applied { status_change, .. } => {
                assert_eq!(
                    status_change,
                    Some((OrderStatus::PartialRefunded, OrderStatus::Refunded))
                );
            }
            RefundOutcome::NoOp => panic!("expected applied"),
        }
        assert!(order.status().is_terminal());
        assert_eq!(order.refundable_amount().unwrap(), cny(dec!(0)));
    }

    #[test]
    fn refund_cannot_exceed_paid_by_a_cent() {
        let mut order = paid_order();
        let err = order
            .create_refund(cny(dec!(100.01)), "too much", "ops_1", 90, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientRefundable { .. }));
    }

    #[test]
    fn in_flight_refunds_reserve_funds() {
        let now = Utc::now();
        let mut order = paid_order();
        order
            .create_refund(cny(dec!(70.00)), "first", "ops_1", 90, now)
            .unwrap();
        // 70 is still PENDING but already reserved
        let err = order
            .create_refund(cny(dec!(40.00)), "second", "ops_1", 90, now)
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientRefundable { .. }));
        assert!(order
            .create_refund(cny(dec!(30.00)), "second", "ops_1", 90, now)
            .is_ok());
    }

    #[test]
    fn failed_refund_releases_its_reservation() {
        let now = Utc::now();
        let mut order = paid_order();
        let r1 = order
            .create_refund(cny(dec!(70.00)), "first", "ops_1", 90, now)
            .unwrap();
        order
            .apply_refund_callback(
                r1.id().as_str(),
                RefundResolution {
                    success: false,
                    gateway_refund_id: None,
                    failure_reason: Some("balance insufficient".to_string()),
                    refunded_at: None,
                },
                now,
            )
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Success);
        assert_eq!(order.refundable_amount().unwrap(), cny(dec!(100.00)));
    }

    #[test]
    fn duplicate_refund_callback_is_a_noop() {
        let now = Utc::now();
        let mut order = paid_order();
        let r1 = order
            .create_refund(cny(dec!(40.00)), "dup", "ops_1", 90, now)
            .unwrap();
        let resolution = RefundResolution {
            success: true,
            gateway_refund_id: None,
            failure_reason: None,
            refunded_at: None,
        };
        order
            .apply_refund_callback(r1.id().as_str(), resolution.clone(), now)
            .unwrap();
        let again = order
            .apply_refund_callback(r1.id().as_str(), resolution, now)
            .unwrap();
        assert!(matches!(again, RefundOutcome::NoOp));
        assert_eq!(order.refunded_amount().unwrap(), cny(dec!(40.00)));
    }

    #[test]
    fn refund_requires_paid_order() {
        let mut order = new_order();
        let err = order
            .create_refund(cny(dec!(10.00)), "early", "ops_1", 90, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidOperation { .. }));
    }

    #[test]
    fn refund_window_enforced() {
        let now = Utc::now();
        let mut order = paid_order();
        let too_late = now + Duration::days(91);
        let err = order
            .create_refund(cny(dec!(10.00)), "late", "ops_1", 90, too_late)
            .unwrap_err();
        assert!(matches!(err, DomainError::RefundWindowClosed { .. }));
    }

    #[test]
    fn unknown_refund_id_is_an_error() {
        let mut order = paid_order();
        let err = order
            .apply_refund_callback(
                "rf_nope",
                RefundResolution {
                    success: true,
                    gateway_refund_id: None,
                    failure_reason: None,
                    refunded_at: None,
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::RefundNotFound(_)));
    }

    #[test]
    fn close_is_for_unpaid_orders_only() {
        let mut pending = new_order();
        assert!(pending.close("expired", "system", Utc::now()).is_ok());
        assert_eq!(pending.status(), OrderStatus::Cancelled);

        let mut paid = paid_order();
        assert!(matches!(
            paid.close("nope", "ops_1", Utc::now()),
            Err(DomainError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn expiry_only_applies_to_pending() {
        let order = new_order();
        let past_window = order.expire_time() + Duration::minutes(1);
        assert!(order.is_expired(past_window));
        let paid = paid_order();
        assert!(!paid.is_expired(paid.expire_time() + Duration::minutes(1)));
    }

    #[test]
    fn create_validates_inputs() {
        let base = CreateOrder {
            merchant_order_id: "M-1".to_string(),
            user_id: "u".to_string(),
            amount: cny(dec!(1.00)),
            method: PaymentMethod::Alipay,
            subject: "s".to_string(),
            idempotency_key: None,
            notify_url: None,
            return_url: None,
            expire_minutes: None,
        };
        let now = Utc::now();

        let mut bad = base.clone();
        bad.amount = Money::new(dec!(0), Currency::Cny).unwrap();
        assert!(PaymentOrder::create(bad, now).is_err());

        let mut bad = base.clone();
        bad.amount = Money::new(dec!(1.00), Currency::Usd).unwrap();
        assert!(matches!(
            PaymentOrder::create(bad, now),
            Err(DomainError::UnsupportedCurrency { .. })
        ));

        let mut bad = base.clone();
        bad.idempotency_key = Some("tiny".to_string());
        assert!(PaymentOrder::create(bad, now).is_err());

        let mut bad = base.clone();
        bad.expire_minutes = Some(0);
        assert!(PaymentOrder::create(bad, now).is_err());

        assert!(PaymentOrder::create(base, now).is_ok());
    }
}
