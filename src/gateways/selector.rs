use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::domain::order::PaymentMethod;
use crate::gateways::alipay::AlipayAdapter;
use crate::gateways::card::CardGatewayAdapter;
use crate::gateways::crypto::CryptoGatewayAdapter;
use crate::gateways::mock::MockAdapter;
use crate::gateways::GatewayAdapter;

/// Registry of payment rails, one adapter per method. Routing is a plain
/// lookup: the method on the order decides the rail, callbacks address the
/// rail by name in the URL path.
///
/// Registration is where misconfiguration dies: every adapter's status map
/// is validated here, so a rail that cannot express success and failure in
/// the engine's vocabulary never makes it into a running process.
pub struct GatewaySelector {
    by_method: HashMap<PaymentMethod, Arc<dyn GatewayAdapter>>,
    by_name: HashMap<&'static str, Arc<dyn GatewayAdapter>>,
}

impl fmt::Debug for GatewaySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySelector")
            .field("adapters", &self.names())
            .finish()
    }
}

impl GatewaySelector {
    pub fn new(adapters: Vec<Arc<dyn GatewayAdapter>>) -> Result<Self> {
        if adapters.is_empty() {
            bail!("no gateway adapters registered");
        }
        let mut by_method: HashMap<PaymentMethod, Arc<dyn GatewayAdapter>> = HashMap::new();
        let mut by_name: HashMap<&'static str, Arc<dyn GatewayAdapter>> = HashMap::new();
        for adapter in adapters {
            adapter
                .status_map()
                .validate(adapter.name())
                .context("status map validation failed")?;
            if by_method
                .insert(adapter.method(), adapter.clone())
                .is_some()
            {
                bail!(
                    "duplicate adapter for method {}",
                    adapter.method().as_str()
                );
            }
            if by_name.insert(adapter.name(), adapter.clone()).is_some() {
                bail!("duplicate adapter name {}", adapter.name());
            }
        }
        Ok(GatewaySelector { by_method, by_name })
    }

    pub fn for_method(&self, method: PaymentMethod) -> Option<&Arc<dyn GatewayAdapter>> {
        self.by_method.get(&method)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn GatewayAdapter>> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Builds the selector from environment credentials. A rail is
    /// registered when its variables are all present; missing rails are
    /// logged and skipped so a deployment can run a subset.
    pub fn from_env(public_base_url: &str, timeout_ms: u64) -> Result<Self> {
        let mut adapters: Vec<Arc<dyn GatewayAdapter>> = Vec::new();

        let alipay_url = std::env::var("ALIPAY_GATEWAY_URL").unwrap_or_default();
        let alipay_app_id = std::env::var("ALIPAY_APP_ID").unwrap_or_default();
        let alipay_secret = std::env::var("ALIPAY_SECRET").unwrap_or_default();
        if !alipay_url.is_empty() && !alipay_app_id.is_empty() && !alipay_secret.is_empty() {
            adapters.push(Arc::new(AlipayAdapter::new(
                alipay_url,
                alipay_app_id,
                alipay_secret,
                format!("{public_base_url}/callbacks/alipay"),
                timeout_ms,
            )));
        } else {
            tracing::warn!("alipay rail not configured, skipping");
        }

        let card_url = std::env::var("CARD_API_BASE_URL").unwrap_or_default();
        let card_key = std::env::var("CARD_API_KEY").unwrap_or_default();
        let card_secret = std::env::var("CARD_API_SECRET").unwrap_or_default();
        let card_webhook = std::env::var("CARD_WEBHOOK_SECRET").unwrap_or_default();
        if !card_url.is_empty() && !card_key.is_empty() && !card_secret.is_empty() {
            adapters.push(Arc::new(CardGatewayAdapter::new(
                card_url,
                card_key,
                card_secret,
                card_webhook,
                timeout_ms,
            )));
        } else {
            tracing::warn!("card rail not configured, skipping");
        }

        let crypto_url = std::env::var("CRYPTO_API_BASE_URL").unwrap_or_default();
        let crypto_key = std::env::var("CRYPTO_API_KEY").unwrap_or_default();
        let crypto_webhook = std::env::var("CRYPTO_WEBHOOK_SECRET").unwrap_or_default();
        if !crypto_url.is_empty() && !crypto_key.is_empty() {
            let confirmations = std::env::var("CRYPTO_CONFIRMATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12);
            adapters.push(Arc::new(CryptoGatewayAdapter::new(
                crypto_url,
                crypto_key,
                crypto_webhook,
                confirmations,
                timeout_ms,
            )));
        } else {
            tracing::warn!("crypto rail not configured, skipping");
        }

        if std::env::var("MOCK_GATEWAY_ENABLED").unwrap_or_default() == "true" {
            let behavior =
                std::env::var("MOCK_GATEWAY_BEHAVIOR").unwrap_or_else(|_| "ACCEPT".to_string());
            adapters.push(Arc::new(
                MockAdapter::new(crate::domain::order::PaymentMethod::Mock)
                    .with_behavior(&behavior),
            ));
        }

        GatewaySelector::new(adapters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderStatus, PaymentOrder};
    use crate::domain::refund::RefundOrder;
    use crate::gateways::{
        CallbackAck, CallbackEnvelope, CallbackNotice, GatewayError, GatewayOrder, GatewayRefund,
        RefundNotice, StatusMap, StatusSnapshot,
    };
    use async_trait::async_trait;

    struct BadMapAdapter {
        status_map: StatusMap,
    }

    impl BadMapAdapter {
        fn new() -> Self {
            // no FAILED mapping: must be rejected at registration
            BadMapAdapter {
                status_map: StatusMap::new([("PAID", OrderStatus::Success)]),
            }
        }
    }

    #[async_trait]
    impl GatewayAdapter for BadMapAdapter {
        fn name(&self) -> &'static str {
            "badmap"
        }

        fn method(&self) -> PaymentMethod {
            PaymentMethod::Card
        }

        fn status_map(&self) -> &StatusMap {
            &self.status_map
        }

        async fn create_payment(
            &self,
            _order: &PaymentOrder,
        ) -> Result<GatewayOrder, GatewayError> {
            unimplemented!()
        }

        async fn query_status(
            &self,
            _order: &PaymentOrder,
        ) -> Result<StatusSnapshot, GatewayError> {
            unimplemented!()
        }

        fn verify_callback(&self, _envelope: &CallbackEnvelope) -> bool {
            false
        }

        fn parse_callback(
            &self,
            _envelope: &CallbackEnvelope,
        ) -> Result<CallbackNotice, GatewayError> {
            unimplemented!()
        }

        fn parse_refund_callback(
            &self,
            _envelope: &CallbackEnvelope,
        ) -> Result<RefundNotice, GatewayError> {
            unimplemented!()
        }

        async fn create_refund(
            &self,
            _order: &PaymentOrder,
            _refund: &RefundOrder,
        ) -> Result<GatewayRefund, GatewayError> {
            unimplemented!()
        }

        async fn close_payment(&self, _order: &PaymentOrder) -> Result<(), GatewayError> {
            unimplemented!()
        }

        fn ack_success(&self) -> CallbackAck {
            CallbackAck::text("ok")
        }

        fn ack_failure(&self) -> CallbackAck {
            CallbackAck::text("no")
        }
    }

    #[test]
    fn registration_rejects_unusable_status_maps() {
        let err = GatewaySelector::new(vec![Arc::new(BadMapAdapter::new())]).unwrap_err();
        assert!(err.to_string().contains("status map"));
    }

    #[test]
    fn registration_rejects_duplicate_methods() {
        let a = Arc::new(MockAdapter::new(PaymentMethod::Alipay));
        let b = Arc::new(MockAdapter::new(PaymentMethod::Alipay));
        let err = GatewaySelector::new(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("duplicate adapter"));
    }

    #[test]
    fn registration_rejects_empty_registry() {
        assert!(GatewaySelector::new(Vec::new()).is_err());
    }

    #[test]
    fn lookup_by_method_and_name() {
        let selector =
            GatewaySelector::new(vec![Arc::new(MockAdapter::new(PaymentMethod::Alipay))]).unwrap();
        assert!(selector.for_method(PaymentMethod::Alipay).is_some());
        assert!(selector.for_method(PaymentMethod::Card).is_none());
        assert!(selector.by_name("mock").is_some());
        assert!(selector.by_name("alipay").is_none());
        assert_eq!(selector.names(), vec!["mock"]);
    }
}
