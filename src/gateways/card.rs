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

const SIGNATURE_HEADER: &str = "x-signature";

/// Card PSP rail: JSON payment intents over basic-auth REST, webhooks signed
/// into an `X-Signature` header, JSON acks. Serves CNY, USD and EUR cards.
pub struct CardGatewayAdapter {
    base_url: String,
    api_key: String,
    api_secret: String,
    webhook_secret: String,
    client: reqwest::Client,
    timeout: Duration,
    status_map: StatusMap,
}

impl CardGatewayAdapter {
    pub fn new(
        base_url: String,
        api_key: String,
        api_secret: String,
        webhook_secret: String,
        timeout_ms: u64,
    ) -> Self {
        CardGatewayAdapter {
            base_url,
            api_key,
            api_secret,
            webhook_secret,
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(timeout_ms),
            status_map: StatusMap::new([
                ("created", OrderStatus::Processing),
                ("authorized", OrderStatus::Processing),
                ("captured", OrderStatus::Success),
                ("failed", OrderStatus::Failed),
                ("voided", OrderStatus::Cancelled),
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
            .basic_auth(&self.api_key, Some(&self.api_secret))
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

    fn money_from(&self, body: &serde_json::Value) -> Result<Option<Money>, GatewayError> {
        let Some(raw) = body["amount"].as_str() else {
            return Ok(None);
        };
        let amount = Decimal::from_str(raw)
            .map_err(|_| GatewayError::MalformedPayload(format!("bad amount {raw:?}")))?;
        let currency = body["currency"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("amount without currency".into()))?;
        let currency = Currency::from_str(currency)
            .map_err(|_| GatewayError::MalformedPayload(format!("bad currency {currency:?}")))?;
        let money = Money::new(amount, currency)
            .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        Ok(Some(money))
    }
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
impl GatewayAdapter for CardGatewayAdapter {
    fn name(&self) -> &'static str {
        "card"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    async fn create_payment(&self, order: &PaymentOrder) -> Result<GatewayOrder, GatewayError> {
        let body = json!({
            "reference": order.merchant_order_id(),
            "amount": order.amount().amount().to_string(),
            "currency": order.amount().currency().code(),
            "description": order.subject(),
        });
        let resp = self
            .send_json(reqwest::Method::POST, "/v1/intents", Some(body))
            .await?;
        let id = resp["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("intent response missing id".into()))?
            .to_string();
        Ok(GatewayOrder {
            gateway_order_id: id,
            pay_url: resp["checkout_url"].as_str().map(str::to_string),
            qr_code: None,
        })
    }

    async fn query_status(&self, order: &PaymentOrder) -> Result<StatusSnapshot, GatewayError> {
        let Some(intent_id) = order.gateway_order_id() else {
            return Err(GatewayError::Permanent(
                "order has no gateway order id to query".into(),
            ));
        };
        let resp = self
            .send_json(reqwest::Method::GET, &format!("/v1/intents/{intent_id}"), None)
            .await?;
        let native_status = resp["status"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("intent response missing status".into()))?
            .to_string();
        Ok(StatusSnapshot {
            native_status,
            gateway_order_id: resp["id"].as_str().map(str::to_string),
            paid_amount: self.money_from(&resp)?,
            paid_at: resp["captured_at"].as_str().and_then(parse_rfc3339),
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
        let native_status = body["status"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing status".into()))?
            .to_string();
        Ok(CallbackNotice {
            native_status,
            gateway_order_id: body["id"].as_str().map(str::to_string),
            merchant_order_id: body["reference"].as_str().map(str::to_string),
            paid_amount: self.money_from(&body)?,
            paid_at: body["captured_at"].as_str().and_then(parse_rfc3339),
        })
    }

    fn parse_refund_callback(
        &self,
        envelope: &CallbackEnvelope,
    ) -> Result<RefundNotice, GatewayError> {
        let body = json_body(envelope)?;
        let refund_id = body["reference"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing refund reference".into()))?
            .to_string();
        let status = body["status"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("missing refund status".into()))?;
        let success = status == "succeeded";
        Ok(RefundNotice {
            refund_id,
            gateway_order_id: body["intent_id"].as_str().map(str::to_string),
            merchant_order_id: body["order_reference"].as_str().map(str::to_string),
            gateway_refund_id: body["id"].as_str().map(str::to_string),
            success,
            failure_reason: body["failure_message"]
                .as_str()
                .map(str::to_string)
                .or_else(|| (!success).then(|| format!("refund status {status}"))),
            refunded_at: body["settled_at"].as_str().and_then(parse_rfc3339),
        })
    }

    async fn create_refund(
        &self,
        order: &PaymentOrder,
        refund: &RefundOrder,
    ) -> Result<GatewayRefund, GatewayError> {
        let Some(intent_id) = order.gateway_order_id() else {
            return Err(GatewayError::Permanent(
                "order has no gateway order id to refund".into(),
            ));
        };
        let body = json!({
            "reference": refund.id().as_str(),
            "amount": refund.amount().amount().to_string(),
            "currency": refund.amount().currency().code(),
            "reason": refund.reason(),
        });
        let resp = self
            .send_json(
                reqwest::Method::POST,
                &format!("/v1/intents/{intent_id}/refunds"),
                Some(body),
            )
            .await?;
        let gateway_refund_id = resp["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Permanent("refund response missing id".into()))?
            .to_string();
        Ok(GatewayRefund { gateway_refund_id })
    }

    async fn close_payment(&self, order: &PaymentOrder) -> Result<(), GatewayError> {
        let Some(intent_id) = order.gateway_order_id() else {
            // never reached the rail; nothing to void
            return Ok(());
        };
        self.send_json(
            reqwest::Method::POST,
            &format!("/v1/intents/{intent_id}/void"),
            None,
        )
        .await?;
        Ok(())
    }

    fn ack_success(&self) -> CallbackAck {
        CallbackAck::json(json!({ "received": true }))
    }

    fn ack_failure(&self) -> CallbackAck {
        // Non-2xx makes the PSP redeliver.
        CallbackAck::json(json!({ "received": false })).with_status(400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn adapter() -> CardGatewayAdapter {
        CardGatewayAdapter::new(
            "https://psp.example.com".to_string(),
            "key_live_1".to_string(),
            "secret_live_1".to_string(),
            "whsec_42".to_string(),
            3000,
        )
    }

    fn signed(body: &str, secret: &str) -> CallbackEnvelope {
        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), sign_raw(body, secret));
        CallbackEnvelope {
            headers,
            body: body.to_string(),
        }
    }

    #[test]
    fn verifies_header_signature() {
        let a = adapter();
        let body = r#"{"id":"pi_1","reference":"M-2","status":"captured","amount":"25.00","currency":"USD"}"#;
        assert!(a.verify_callback(&signed(body, "whsec_42")));
        assert!(!a.verify_callback(&signed(body, "whsec_other")));
        let unsigned = CallbackEnvelope {
            headers: HashMap::new(),
            body: body.to_string(),
        };
        assert!(!a.verify_callback(&unsigned));
    }

    #[test]
    fn parses_capture_callback() {
        let a = adapter();
        let body = r#"{
            "id": "pi_1",
            "reference": "M-2",
            "status": "captured",
            "amount": "25.00",
            "currency": "USD",
            "captured_at": "2026-08-23T14:02:11Z"
        }"#;
        let notice = a.parse_callback(&signed(body, "whsec_42")).unwrap();
        assert_eq!(notice.native_status, "captured");
        assert_eq!(notice.gateway_order_id.as_deref(), Some("pi_1"));
        assert_eq!(notice.merchant_order_id.as_deref(), Some("M-2"));
        let paid = notice.paid_amount.unwrap();
        assert_eq!(paid.currency(), Currency::Usd);
        assert_eq!(paid.amount().to_string(), "25.00");
        assert!(notice.paid_at.is_some());
    }

    #[test]
    fn bad_currency_is_malformed() {
        let a = adapter();
        let body = r#"{"id":"pi_1","status":"captured","amount":"25.00","currency":"XXX"}"#;
        assert!(matches!(
            a.parse_callback(&signed(body, "whsec_42")),
            Err(GatewayError::MalformedPayload(_))
        ));
    }

    #[test]
    fn parses_refund_callback_outcomes() {
        let a = adapter();
        let ok = r#"{"id":"re_9","reference":"rf_20260823140500_ab12cd34","intent_id":"pi_1","status":"succeeded","settled_at":"2026-08-23T15:00:00Z"}"#;
        let notice = a.parse_refund_callback(&signed(ok, "whsec_42")).unwrap();
        assert!(notice.success);
        assert_eq!(notice.gateway_refund_id.as_deref(), Some("re_9"));

        let failed = r#"{"id":"re_9","reference":"rf_20260823140500_ab12cd34","status":"failed","failure_message":"card network declined"}"#;
        let notice = a.parse_refund_callback(&signed(failed, "whsec_42")).unwrap();
        assert!(!notice.success);
        assert_eq!(
            notice.failure_reason.as_deref(),
            Some("card network declined")
        );
    }

    #[test]
    fn unknown_native_status_resolves_to_failed() {
        let a = adapter();
        assert_eq!(a.status_map().resolve("disputed"), OrderStatus::Failed);
    }

    #[test]
    fn status_map_passes_registration_rules() {
        assert!(adapter().status_map().validate("card").is_ok());
    }
}
