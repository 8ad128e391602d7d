use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use crate::domain::money::{Currency, Money};
use crate::domain::order::{OrderStatus, PaymentMethod, PaymentOrder};
use crate::domain::refund::RefundOrder;
use crate::gateways::{
    sign_raw, signature_matches, CallbackAck, CallbackEnvelope, CallbackNotice, GatewayAdapter,
    GatewayError, GatewayOrder, GatewayRefund, RefundNotice, StatusMap, StatusSnapshot,
};

const MOCK_SECRET: &str = "mock-secret";
const SIGNATURE_HEADER: &str = "x-mock-signature";

/// In-process rail for tests and local runs. Behavior strings script the
/// outbound side; the inbound side does real signature verification so the
/// callback path is exercised end to end. Counters record every outbound
/// call so tests can assert how often the rail was hit.
pub struct MockAdapter {
    pub behavior: String,
    pub refund_behavior: String,
    method: PaymentMethod,
    scripted_status: Mutex<Option<StatusSnapshot>>,
    create_calls: AtomicU32,
    query_calls: AtomicU32,
    refund_calls: AtomicU32,
    close_calls: AtomicU32,
    status_map: StatusMap,
}

impl MockAdapter {
    pub fn new(method: PaymentMethod) -> Self {
        MockAdapter {
            behavior: "ACCEPT".to_string(),
            refund_behavior: "ACCEPT".to_string(),
            method,
            scripted_status: Mutex::new(None),
            create_calls: AtomicU32::new(0),
            query_calls: AtomicU32::new(0),
            refund_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            status_map: StatusMap::new([
                ("MOCK_IN_FLIGHT", OrderStatus::Processing),
                ("MOCK_PAID", OrderStatus::Success),
                ("MOCK_FAILED", OrderStatus::Failed),
                ("MOCK_CANCELLED", OrderStatus::Cancelled),
            ]),
        }
    }

    pub fn with_behavior(mut self, behavior: &str) -> Self {
        self.behavior = behavior.to_string();
        self
    }

    pub fn with_refund_behavior(mut self, behavior: &str) -> Self {
        self.refund_behavior = behavior.to_string();
        self
    }

    /// The next `query_status` returns this snapshot instead of the default
    /// in-flight one.
    pub fn script_status(&self, snapshot: StatusSnapshot) {
        *self.scripted_status.lock().unwrap() = Some(snapshot);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> u32 {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> u32 {
        self.refund_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Builds a correctly signed callback envelope, the way the mock rail
    /// itself would.
    pub fn signed_envelope(body: serde_json::Value) -> CallbackEnvelope {
        let body = body.to_string();
        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), sign_raw(&body, MOCK_SECRET));
        CallbackEnvelope { headers, body }
    }

    /// Same body, garbage signature.
    pub fn forged_envelope(body: serde_json::Value) -> CallbackEnvelope {
        let body = body.to_string();
        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), "bm90LXRoZS1zaWc=".to_string());
        CallbackEnvelope { headers, body }
    }
}

fn money_from(body: &serde_json::Value) -> Result<Option<Money>, GatewayError> {
    let Some(raw) = body["paid_amount"].as_str() else {
        return Ok(None);
    };
    let amount: Decimal = raw
        .parse()
        .map_err(|_| GatewayError::MalformedPayload(format!("bad paid_amount {raw:?}")))?;
    let currency = body["currency"].as_str().unwrap_or("CNY");
    let currency: Currency = currency
        .parse()
        .map_err(|_| GatewayError::MalformedPayload(format!("bad currency {currency:?}")))?;
    Money::new(amount, currency)
        .map(Some)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))
}

#[async_trait]
impl GatewayAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    async fn create_payment(&self, order: &PaymentOrder) -> Result<GatewayOrder, GatewayError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior.as_str() {
            "REJECT" => Err(GatewayError::Permanent("mock decline".to_string())),
            "ALWAYS_TIMEOUT" => Err(GatewayError::Transient("mock timeout".to_string())),
            "FLAKY_THEN_ACCEPT" if n < 2 => {
                Err(GatewayError::Transient("mock flake".to_string()))
            }
            _ => Ok(GatewayOrder {
                gateway_order_id: format!("mock_gw_{}", uuid::Uuid::new_v4().simple()),
                pay_url: Some(format!(
                    "https://mock.example.com/pay/{}",
                    order.merchant_order_id()
                )),
                qr_code: None,
            }),
        }
    }

    async fn query_status(&self, order: &PaymentOrder) -> Result<StatusSnapshot, GatewayError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshot) = self.scripted_status.lock().unwrap().take() {
            return Ok(snapshot);
        }
        Ok(StatusSnapshot {
            native_status: "MOCK_IN_FLIGHT".to_string(),
            gateway_order_id: order.gateway_order_id().map(str::to_string),
            paid_amount: None,
            paid_at: None,
        })
    }

    fn verify_callback(&self, envelope: &CallbackEnvelope) -> bool {
        let Some(provided) = envelope.header(SIGNATURE_HEADER) else {
            return false;
        };
        signature_matches(&sign_raw(&envelope.body, MOCK_SECRET), provided)
    }

    fn parse_callback(&self, envelope: &CallbackEnvelope) -> Result<CallbackNotice, GatewayError> {
        let body: serde_json::Value = serde_json::from_str(&envelope.body)
            .map_err(|e| GatewayError::MalformedPayload(format!("not json: {e}")))?;
        let native_status = body["status"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing status".into()))?
            .to_string();
        Ok(CallbackNotice {
            native_status,
            gateway_order_id: body["gateway_order_id"].as_str().map(str::to_string),
            merchant_order_id: body["reference"].as_str().map(str::to_string),
            paid_amount: money_from(&body)?,
            paid_at: body["paid_at"]
                .as_str()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    fn parse_refund_callback(
        &self,
        envelope: &CallbackEnvelope,
    ) -> Result<RefundNotice, GatewayError> {
        let body: serde_json::Value = serde_json::from_str(&envelope.body)
            .map_err(|e| GatewayError::MalformedPayload(format!("not json: {e}")))?;
        let refund_id = body["refund_reference"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing refund_reference".into()))?
            .to_string();
        let state = body["state"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing state".into()))?;
        let success = state == "OK";
        Ok(RefundNotice {
            refund_id,
            gateway_order_id: body["gateway_order_id"].as_str().map(str::to_string),
            merchant_order_id: body["reference"].as_str().map(str::to_string),
            gateway_refund_id: body["mock_refund_id"].as_str().map(str::to_string),
            success,
            failure_reason: (!success).then(|| format!("mock refund state {state}")),
            refunded_at: None,
        })
    }

    async fn create_refund(
        &self,
        _order: &PaymentOrder,
        _refund: &RefundOrder,
    ) -> Result<GatewayRefund, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        match self.refund_behavior.as_str() {
            "REJECT" => Err(GatewayError::Permanent("mock refund decline".to_string())),
            "ALWAYS_TIMEOUT" => Err(GatewayError::Transient("mock timeout".to_string())),
            _ => Ok(GatewayRefund {
                gateway_refund_id: format!("mock_rf_{}", uuid::Uuid::new_v4().simple()),
            }),
        }
    }

    async fn close_payment(&self, _order: &PaymentOrder) -> Result<(), GatewayError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ack_success(&self) -> CallbackAck {
        CallbackAck::json(json!({ "received": true }))
    }

    fn ack_failure(&self) -> CallbackAck {
        CallbackAck::json(json!({ "received": false })).with_status(400)
    }
}
