use std::str::FromStr;
use std::time::Duration;

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

const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Stablecoin charge rail: bearer-auth REST, deposit-address checkout,
/// webhooks fire as on-chain confirmations accumulate. Serves USDT.
///
/// The rail also reports `UNRESOLVED` for over/underpaid charges; that state
/// is intentionally absent from the status map, so it lands on the
/// fail-closed FAILED path and gets operator attention instead of a guessed
/// outcome.
pub struct CryptoGatewayAdapter {
    base_url: String,
    api_key: String,
    webhook_secret: String,
    confirmations_required: u32,
    client: reqwest::Client,
    timeout: Duration,
    status_map: StatusMap,
}

impl CryptoGatewayAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        webhook_secret: String,
        confirmations_required: u32,
        timeout_ms: u64,
    ) -> Self {
        CryptoGatewayAdapter {
            base_url,
            api_key,
            webhook_secret,
            confirmations_required,
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(timeout_ms),
            status_map: StatusMap::new([
                ("NEW", OrderStatus::Processing),
                ("PENDING", OrderStatus::Processing),
                ("CONFIRMING", OrderStatus::Processing),
                ("COMPLETED", OrderStatus::Success),
                ("EXPIRED", OrderStatus::Cancelled),
                ("FAILED", OrderStatus::Failed),
            ]),
        }
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let r = req.send().await?;

        let status = r.status();
        if status.is_server_error() {
            return Err(GatewayError::Transient(format!("{path} returned {status}")));
        }
        if !status.is_success() {
            let body = r.text().await.unwrap_or_default();
            return Err(GatewayError::Permanent(format!(
                "{path} returned {status}: {body}"
            )));
        }
        r.json()
            .await
            .map_err(|e| GatewayError::Permanent(format!("{path} response not json: {e}")))
    }
}

fn parse_asset_amount(body: &serde_json::Value) -> Result<Option<Money>, GatewayError> {
    let Some(raw) = body["paid_amount"].as_str() else {
        return Ok(None);
    };
    let amount = Decimal::from_str(raw)
        .map_err(|_| GatewayError::MalformedPayload(format!("bad paid_amount {raw:?}")))?;
    let asset = body["asset"]
        .as_str()
        .ok_or_else(|| GatewayError::MalformedPayload("paid_amount without asset".into()))?;
    let currency = Currency::from_str(asset)
        .map_err(|_| GatewayError::MalformedPayload(format!("unknown asset {asset:?}")))?;
    let money =
        Money::new(amount, currency).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    Ok(Some(money))
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn json_body(envelope: &CallbackEnvelope) -> Result<serde_json::Value, GatewayError> {
    serde_json::from_str(&envelope.body)
        .map_err(|e| GatewayError::MalformedPayload(format!("not json: {e}")))
}

#[async_trait]
impl GatewayAdapter for CryptoGatewayAdapter {
    fn name(&self) -> &'static str {
        "crypto"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Usdt
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    async fn create_payment(&self, order: &PaymentOrder) -> Result<GatewayOrder, GatewayError> {
        let body = json!({
            "order_reference": order.merchant_order_id(),
            "amount": order.amount().amount().to_string(),
            "asset": order.amount().currency().code(),
            "confirmations_required": self.confirmations_required,
            "description": order.subject(),
        });
        let resp = self
            .send_json(reqwest::Method::POST, "/api/charges", Some(body))
            .await?;
        let charge_id = resp["charge_id"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("charge response missing charge_id".into()))?
            .to_string();
        Ok(GatewayOrder {
            gateway_order_id: charge_id,
            pay_url: resp["hosted_url"].as_str().map(str::to_string),
            qr_code: resp["payment_uri"].as_str().map(str::to_string),
        })
    }

    async fn query_status(&self, order: &PaymentOrder) -> Result<StatusSnapshot, GatewayError> {
        let Some(charge_id) = order.gateway_order_id() else {
            return Err(GatewayError::Permanent(
                "order has no gateway order id to query".into(),
            ));
        };
        let resp = self
            .send_json(reqwest::Method::GET, &format!("/api/charges/{charge_id}"), None)
            .await?;
        let native_status = resp["state"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("charge response missing state".into()))?
            .to_string();
        Ok(StatusSnapshot {
            native_status,
            gateway_order_id: resp["charge_id"].as_str().map(str::to_string),
            paid_amount: parse_asset_amount(&resp)?,
            paid_at: resp["confirmed_at"].as_str().and_then(parse_rfc3339),
        })
    }

    fn verify_callback(&self, envelope: &CallbackEnvelope) -> bool {
        let Some(provided) = envelope.header(SIGNATURE_HEADER) else {
            return false;
        };
        let expected = sign_raw(&envelope.body, &self.webhook_secret);
        signature_matches(&expected, provided)
    }

    fn parse_callback(&self, envelope: &CallbackEnvelope) -> Result<CallbackNotice, GatewayError> {
        let body = json_body(envelope)?;
        let native_status = body["state"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing state".into()))?
            .to_string();
        Ok(CallbackNotice {
            native_status,
            gateway_order_id: body["charge_id"].as_str().map(str::to_string),
            merchant_order_id: body["order_reference"].as_str().map(str::to_string),
            paid_amount: parse_asset_amount(&body)?,
            paid_at: body["confirmed_at"].as_str().and_then(parse_rfc3339),
        })
    }

    fn parse_refund_callback(
        &self,
        envelope: &CallbackEnvelope,
    ) -> Result<RefundNotice, GatewayError> {
        let body = json_body(envelope)?;
        let refund_id = body["refund_reference"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing refund_reference".into()))?
            .to_string();
        let state = body["state"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing state".into()))?;
        let success = state == "COMPLETED";
        Ok(RefundNotice {
            refund_id,
            gateway_order_id: body["charge_id"].as_str().map(str::to_string),
            merchant_order_id: body["order_reference"].as_str().map(str::to_string),
            gateway_refund_id: body["tx_hash"].as_str().map(str::to_string),
            success,
            failure_reason: (!success).then(|| format!("refund state {state}")),
            refunded_at: body["completed_at"].as_str().and_then(parse_rfc3339),
        })
    }

    async fn create_refund(
        &self,
        order: &PaymentOrder,
        refund: &RefundOrder,
    ) -> Result<GatewayRefund, GatewayError> {
        let Some(charge_id) = order.gateway_order_id() else {
            return Err(GatewayError::Permanent(
                "order has no gateway order id to refund".into(),
            ));
        };
        let body = json!({
            "reference": refund.id().as_str(),
            "amount": refund.amount().amount().to_string(),
            "asset": refund.amount().currency().code(),
        });
        let resp = self
            .send_json(
                reqwest::Method::POST,
                &format!("/api/charges/{charge_id}/refunds"),
                Some(body),
            )
            .await?;
        let gateway_refund_id = resp["refund_id"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("refund response missing refund_id".into()))?
            .to_string();
        Ok(GatewayRefund { gateway_refund_id })
    }

    async fn close_payment(&self, order: &PaymentOrder) -> Result<(), GatewayError> {
        let Some(charge_id) = order.gateway_order_id() else {
            return Ok(());
        };
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/charges/{charge_id}/cancel"),
            None,
        )
        .await?;
        Ok(())
    }

    fn ack_success(&self) -> CallbackAck {
        CallbackAck::json(json!({ "ok": true }))
    }

    fn ack_failure(&self) -> CallbackAck {
        CallbackAck::json(json!({ "ok": false })).with_status(400)
    }
}
