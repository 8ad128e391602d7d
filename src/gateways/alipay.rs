use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::money::{Currency, Money};
use crate::domain::order::{OrderStatus, PaymentMethod, PaymentOrder};
use crate::domain::refund::RefundOrder;
use crate::gateways::{
    sign_sorted_params, signature_matches, CallbackAck, CallbackEnvelope, CallbackNotice,
    GatewayAdapter, GatewayError, GatewayOrder, GatewayRefund, RefundNotice, StatusMap,
    StatusSnapshot,
};

const SIGN_FIELD: &str = "sign";
const OK_CODE: &str = "10000";

/// Alipay-style wallet rail: form-encoded requests against a single gateway
/// endpoint, signed with sorted-parameter digests, callbacks acknowledged
/// with a bare `success` body. CNY only.
pub struct AlipayAdapter {
    gateway_url: String,
    app_id: String,
    secret: String,
    notify_url: String,
    client: reqwest::Client,
    timeout: Duration,
    status_map: StatusMap,
}

impl AlipayAdapter {
    pub fn new(
        gateway_url: String,
        app_id: String,
        secret: String,
        notify_url: String,
        timeout_ms: u64,
    ) -> Self {
        AlipayAdapter {
            gateway_url,
            app_id,
            secret,
            notify_url,
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(timeout_ms),
            status_map: StatusMap::new([
                ("WAIT_BUYER_PAY", OrderStatus::Processing),
                ("TRADE_SUCCESS", OrderStatus::Success),
                ("TRADE_FINISHED", OrderStatus::Success),
                ("TRADE_CLOSED", OrderStatus::Cancelled),
                ("TRADE_FAILED", OrderStatus::Failed),
            ]),
        }
    }

    fn signed_form(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        params.push(("app_id".to_string(), self.app_id.clone()));
        let sign = sign_sorted_params(&params, SIGN_FIELD, &self.secret);
        params.push((SIGN_FIELD.to_string(), sign));
        params
    }

    async fn post_form(
        &self,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}/{}", self.gateway_url.trim_end_matches('/'), action);
        let form = self.signed_form(params);
        let r = self
            .client
            .post(&url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = r.status();
        if status.is_server_error() {
            return Err(GatewayError::Transient(format!(
                "{action} returned {status}"
            )));
        }
        if !status.is_success() {
            let body = r.text().await.unwrap_or_default();
            return Err(GatewayError::Permanent(format!(
                "{action} returned {status}: {body}"
            )));
        }
        let body: serde_json::Value = r
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(format!("{action} response not json: {e}")))?;

        let code = body["code"].as_str().unwrap_or_default();
        if code != OK_CODE {
            let msg = body["sub_msg"]
                .as_str()
                .or_else(|| body["msg"].as_str())
                .unwrap_or("unknown gateway error");
            // trade-not-exist on close/query is handled by callers
            return Err(GatewayError::Permanent(format!("{code}: {msg}")));
        }
        Ok(body)
    }
}

fn form_pairs(body: &str) -> Result<Vec<(String, String)>, GatewayError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(body)
        .map_err(|e| GatewayError::MalformedPayload(format!("not form-encoded: {e}")))
}

fn field<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn require<'a>(pairs: &'a [(String, String)], name: &str) -> Result<&'a str, GatewayError> {
    field(pairs, name)
        .ok_or_else(|| GatewayError::MalformedPayload(format!("missing field {name}")))
}

fn parse_cny(raw: &str) -> Result<Money, GatewayError> {
    let amount: Decimal = raw
        .parse()
        .map_err(|_| GatewayError::MalformedPayload(format!("bad amount {raw:?}")))?;
    Money::new(amount, Currency::Cny)
        .map_err(|e| GatewayError::MalformedPayload(format!("bad amount {raw:?}: {e}")))
}

fn parse_gmt(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

#[async_trait]
impl GatewayAdapter for AlipayAdapter {
    fn name(&self) -> &'static str {
        "alipay"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Alipay
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    async fn create_payment(&self, order: &PaymentOrder) -> Result<GatewayOrder, GatewayError> {
        let mut params = vec![
            (
                "out_trade_no".to_string(),
                order.merchant_order_id().to_string(),
            ),
            (
                "total_amount".to_string(),
                order.amount().amount().to_string(),
            ),
            ("subject".to_string(), order.subject().to_string()),
            ("notify_url".to_string(), self.notify_url.clone()),
        ];
        if let Some(return_url) = order.return_url() {
            params.push(("return_url".to_string(), return_url.to_string()));
        }

        let body = self.post_form("precreate", params).await?;
        let trade_no = body["trade_no"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("precreate response missing trade_no".into()))?
            .to_string();
        Ok(GatewayOrder {
            gateway_order_id: trade_no,
            pay_url: body["pay_url"].as_str().map(str::to_string),
            qr_code: body["qr_code"].as_str().map(str::to_string),
        })
    }

    async fn query_status(&self, order: &PaymentOrder) -> Result<StatusSnapshot, GatewayError> {
        let params = vec![(
            "out_trade_no".to_string(),
            order.merchant_order_id().to_string(),
        )];
        let body = self.post_form("query", params).await?;
        let native_status = body["trade_status"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("query response missing trade_status".into()))?
            .to_string();
        let paid_amount = match body["total_amount"].as_str() {
            Some(raw) => Some(parse_cny(raw)?),
            None => None,
        };
        Ok(StatusSnapshot {
            native_status,
            gateway_order_id: body["trade_no"].as_str().map(str::to_string),
            paid_amount,
            paid_at: body["send_pay_date"].as_str().and_then(parse_gmt),
        })
    }

    fn verify_callback(&self, envelope: &CallbackEnvelope) -> bool {
        let Ok(pairs) = form_pairs(&envelope.body) else {
            return false;
        };
        let Some(provided) = field(&pairs, SIGN_FIELD) else {
            return false;
        };
        let expected = sign_sorted_params(&pairs, SIGN_FIELD, &self.secret);
        signature_matches(&expected, provided)
    }

    fn parse_callback(&self, envelope: &CallbackEnvelope) -> Result<CallbackNotice, GatewayError> {
        let pairs = form_pairs(&envelope.body)?;
        let native_status = require(&pairs, "trade_status")?.to_string();
        let paid_amount = match field(&pairs, "total_amount") {
            Some(raw) => Some(parse_cny(raw)?),
            None => None,
        };
        Ok(CallbackNotice {
            native_status,
            gateway_order_id: field(&pairs, "trade_no").map(str::to_string),
            merchant_order_id: field(&pairs, "out_trade_no").map(str::to_string),
            paid_amount,
            paid_at: field(&pairs, "gmt_payment").and_then(parse_gmt),
        })
    }

    fn parse_refund_callback(
        &self,
        envelope: &CallbackEnvelope,
    ) -> Result<RefundNotice, GatewayError> {
        let pairs = form_pairs(&envelope.body)?;
        let refund_id = require(&pairs, "out_request_no")?.to_string();
        let refund_status = require(&pairs, "refund_status")?;
        let success = refund_status == "REFUND_SUCCESS";
        Ok(RefundNotice {
            refund_id,
            gateway_order_id: field(&pairs, "trade_no").map(str::to_string),
            merchant_order_id: field(&pairs, "out_trade_no").map(str::to_string),
            gateway_refund_id: None,
            success,
            failure_reason: (!success).then(|| format!("refund_status={refund_status}")),
            refunded_at: field(&pairs, "gmt_refund").and_then(parse_gmt),
        })
    }

    async fn create_refund(
        &self,
        order: &PaymentOrder,
        refund: &RefundOrder,
    ) -> Result<GatewayRefund, GatewayError> {
        let params = vec![
            (
                "out_trade_no".to_string(),
                order.merchant_order_id().to_string(),
            ),
            ("out_request_no".to_string(), refund.id().to_string()),
            (
                "refund_amount".to_string(),
                refund.amount().amount().to_string(),
            ),
            ("refund_reason".to_string(), refund.reason().to_string()),
        ];
        let body = self.post_form("refund", params).await?;
        let gateway_refund_id = body["trade_no"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| refund.id().to_string());
        Ok(GatewayRefund { gateway_refund_id })
    }

    async fn close_payment(&self, order: &PaymentOrder) -> Result<(), GatewayError> {
        let params = vec![(
            "out_trade_no".to_string(),
            order.merchant_order_id().to_string(),
        )];
        match self.post_form("close", params).await {
            Ok(_) => Ok(()),
            // the buyer never opened the checkout; nothing to close
            Err(GatewayError::Permanent(msg)) if msg.contains("TRADE_NOT_EXIST") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ack_success(&self) -> CallbackAck {
        CallbackAck::text("success")
    }

    fn ack_failure(&self) -> CallbackAck {
        CallbackAck::text("failure")
    }
}
