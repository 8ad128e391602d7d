use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::money::Currency;
use crate::domain::order::CreateOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
}

/// Request metadata the HTTP layer captures for scoring.
#[derive(Debug, Clone, Default)]
pub struct RiskContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Pre-creation risk assessment. The engine only consumes the level:
/// `High` rejects the order before any gateway call, `Elevated` is allowed
/// through with a warning. Deployments plug their own scorer in here.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn assess(&self, order: &CreateOrder, ctx: &RiskContext) -> anyhow::Result<RiskLevel>;
}

/// Built-in scorer: per-currency amount caps plus a couple of
/// user-agent heuristics. Deliberately simple; it exists so the gate has
/// teeth in the default deployment.
pub struct HeuristicRiskScorer;

const BLOCKED_AGENT_MARKERS: &[&str] = &["curl/", "python-requests", "bot"];

impl HeuristicRiskScorer {
    fn amount_cap(currency: Currency) -> Decimal {
        match currency {
            Currency::Cny => Decimal::from(50_000),
            Currency::Usd | Currency::Eur | Currency::Usdt => Decimal::from(7_000),
            Currency::Btc => Decimal::ONE,
            Currency::Eth => Decimal::from(10),
        }
    }
}

#[async_trait]
impl RiskScorer for HeuristicRiskScorer {
    async fn assess(&self, order: &CreateOrder, ctx: &RiskContext) -> anyhow::Result<RiskLevel> {
        let cap = Self::amount_cap(order.amount.currency());
        let amount = order.amount.amount();

        let mut level = RiskLevel::Low;
        if amount > cap {
            return Ok(RiskLevel::High);
        }
        if amount + amount > cap {
            level = RiskLevel::Elevated;
        }

        match ctx.user_agent.as_deref() {
            None => level = level.max(RiskLevel::Elevated),
            Some(agent) => {
                let agent = agent.to_ascii_lowercase();
                if BLOCKED_AGENT_MARKERS.iter().any(|m| agent.contains(m)) {
                    return Ok(RiskLevel::High);
                }
            }
        }

        Ok(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::order::PaymentMethod;
    use rust_decimal_macros::dec;

    fn order_for(amount: Decimal, currency: Currency) -> CreateOrder {
        CreateOrder {
            merchant_order_id: "M-RISK-1".to_string(),
            user_id: "u_1".to_string(),
            amount: Money::new(amount, currency).unwrap(),
            method: PaymentMethod::Mock,
            subject: "risk probe".to_string(),
            idempotency_key: None,
            notify_url: None,
            return_url: None,
            expire_minutes: None,
        }
    }

    fn browser_ctx() -> RiskContext {
        RiskContext {
            client_ip: Some("203.0.113.9".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    #[tokio::test]
    async fn small_order_from_a_browser_is_low() {
        let level = HeuristicRiskScorer
            .assess(&order_for(dec!(120.00), Currency::Cny), &browser_ctx())
            .await
            .unwrap();
        assert_eq!(level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn amount_over_cap_is_high() {
        let level = HeuristicRiskScorer
            .assess(&order_for(dec!(50001), Currency::Cny), &browser_ctx())
            .await
            .unwrap();
        assert_eq!(level, RiskLevel::High);
    }

    #[tokio::test]
    async fn amount_near_cap_is_elevated() {
        let level = HeuristicRiskScorer
            .assess(&order_for(dec!(30000), Currency::Cny), &browser_ctx())
            .await
            .unwrap();
        assert_eq!(level, RiskLevel::Elevated);
    }

    #[tokio::test]
    async fn scripted_user_agent_is_high() {
        let ctx = RiskContext {
            client_ip: None,
            user_agent: Some("curl/8.5.0".to_string()),
        };
        let level = HeuristicRiskScorer
            .assess(&order_for(dec!(10.00), Currency::Cny), &ctx)
            .await
            .unwrap();
        assert_eq!(level, RiskLevel::High);
    }

    #[tokio::test]
    async fn missing_user_agent_is_elevated() {
        let ctx = RiskContext::default();
        let level = HeuristicRiskScorer
            .assess(&order_for(dec!(10.00), Currency::Cny), &ctx)
            .await
            .unwrap();
        assert_eq!(level, RiskLevel::Elevated);
    }
}
