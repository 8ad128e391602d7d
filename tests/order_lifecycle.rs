use std::sync::Arc;

use payment_lifecycle::domain::order::{OrderStatus, PaymentMethod};
use payment_lifecycle::domain::refund::RefundStatus;
use payment_lifecycle::gateways::mock::MockAdapter;
use payment_lifecycle::gateways::selector::GatewaySelector;
use payment_lifecycle::gateways::{GatewayAdapter, RetryPolicy};
use payment_lifecycle::http::api::{
    CloseOrderRequest, CreateOrderRequest, ListOrdersQuery, RefundRequest, StatsQuery,
};
use payment_lifecycle::repo::memory::MemoryOrderStore;
use payment_lifecycle::service::order_service::OrderService;
use payment_lifecycle::service::reconciler::Reconciler;
use payment_lifecycle::service::risk::{HeuristicRiskScorer, RiskContext};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

struct Harness {
    store: Arc<MemoryOrderStore>,
    mock: Arc<MockAdapter>,
    rail: Arc<dyn GatewayAdapter>,
    service: OrderService,
    reconciler: Reconciler,
}

fn harness(mock: MockAdapter) -> Harness {
    harness_with_window(mock, 90)
}

fn harness_with_window(mock: MockAdapter, refund_window_days: i64) -> Harness {
    let store = Arc::new(MemoryOrderStore::new());
    let mock = Arc::new(mock);
    let rail: Arc<dyn GatewayAdapter> = mock.clone();
    let selector = Arc::new(GatewaySelector::new(vec![rail.clone()]).unwrap());
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(4),
    };
    let service = OrderService {
        store: store.clone(),
        selector: selector.clone(),
        risk: Arc::new(HeuristicRiskScorer),
        retry: retry.clone(),
        refund_window_days,
    };
    let reconciler = Reconciler {
        store: store.clone(),
        selector,
        retry,
    };
    Harness {
        store,
        mock,
        rail,
        service,
        reconciler,
    }
}

fn create_req(merchant_order_id: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        merchant_order_id: merchant_order_id.to_string(),
        user_id: "u_1001".to_string(),
        amount: dec!(100.00),
        currency: "CNY".to_string(),
        method: PaymentMethod::Mock,
        subject: Some("Pro plan, annual".to_string()),
        idempotency_key: None,
        notify_url: None,
        return_url: None,
        expire_minutes: None,
    }
}

fn browser() -> RiskContext {
    RiskContext {
        client_ip: Some("198.51.100.7".to_string()),
        user_agent: Some("Mozilla/5.0".to_string()),
    }
}

/// Drives an order to SUCCESS the way the rail would, through a signed
/// payment callback.
async fn pay(h: &Harness, merchant_order_id: &str, amount: &str) {
    let ack = h
        .reconciler
        .handle_payment_callback(
            &h.rail,
            &MockAdapter::signed_envelope(json!({
                "status": "MOCK_PAID",
                "reference": merchant_order_id,
                "paid_amount": amount,
                "currency": "CNY",
            })),
        )
        .await;
    assert_eq!(ack.status, 200);
}

async fn settle_refund(h: &Harness, merchant_order_id: &str, refund_id: &str, state: &str) {
    let ack = h
        .reconciler
        .handle_refund_callback(
            &h.rail,
            &MockAdapter::signed_envelope(json!({
                "refund_reference": refund_id,
                "reference": merchant_order_id,
                "state": state,
                "mock_refund_id": "mock_rf_settled",
            })),
        )
        .await;
    assert_eq!(ack.status, 200);
}

#[tokio::test]
async fn create_issues_pending_order_with_payment_link() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));

    let resp = h
        .service
        .create_order(create_req("M-1001"), browser())
        .await
        .unwrap();

    assert_eq!(resp.status, OrderStatus::Pending);
    assert!(resp.pay_url.is_some());
    assert_eq!(h.mock.create_calls(), 1);

    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    assert_eq!(detail.subject, "Pro plan, annual");
    assert!(detail.gateway_order_id.is_some());
    assert_eq!(
        h.store.event_types_for(&resp.payment_order_id),
        vec!["payment.created".to_string()]
    );
}

#[tokio::test]
async fn idempotent_replay_returns_the_original_order() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let mut req = create_req("M-1002");
    req.idempotency_key = Some("idem-abc-123".to_string());

    let first = h.service.create_order(req.clone(), browser()).await.unwrap();
    let second = h.service.create_order(req, browser()).await.unwrap();

    assert_eq!(first.payment_order_id, second.payment_order_id);
    // The replay never reached the rail.
    assert_eq!(h.mock.create_calls(), 1);
}

#[tokio::test]
async fn rail_decline_is_persisted_as_failed() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock).with_behavior("REJECT"));

    let resp = h
        .service
        .create_order(create_req("M-1003"), browser())
        .await
        .unwrap();

    assert_eq!(resp.status, OrderStatus::Failed);
    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    assert!(detail.failure_reason.unwrap().contains("mock decline"));
    let events = h.store.event_types_for(&resp.payment_order_id);
    assert!(events.contains(&"payment.created".to_string()));
    assert!(events.contains(&"payment.failed".to_string()));
}

#[tokio::test]
async fn transient_rail_failures_are_retried() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock).with_behavior("FLAKY_THEN_ACCEPT"));

    let resp = h
        .service
        .create_order(create_req("M-1004"), browser())
        .await
        .unwrap();

    assert_eq!(resp.status, OrderStatus::Pending);
    assert_eq!(h.mock.create_calls(), 3);
}

#[tokio::test]
async fn scripted_client_is_rejected_before_the_rail() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let ctx = RiskContext {
        client_ip: Some("198.51.100.7".to_string()),
        user_agent: Some("curl/8.5.0".to_string()),
    };

    let (status, body) = h
        .service
        .create_order(create_req("M-1005"), ctx)
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 403);
    assert_eq!(body.error.code, "RISK_REJECTED");
    assert_eq!(h.mock.create_calls(), 0);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn currency_the_method_cannot_settle_is_rejected() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let mut req = create_req("M-1006");
    req.method = PaymentMethod::Alipay;
    req.currency = "USD".to_string();

    let (status, body) = h.service.create_order(req, browser()).await.unwrap_err();

    assert_eq!(status.as_u16(), 400);
    assert_eq!(body.error.code, "VALIDATION_ERROR");
    assert_eq!(h.mock.create_calls(), 0);
}

#[tokio::test]
async fn duplicate_merchant_order_id_is_a_conflict() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));

    h.service
        .create_order(create_req("M-1007"), browser())
        .await
        .unwrap();
    let (status, body) = h
        .service
        .create_order(create_req("M-1007"), browser())
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 409);
    assert_eq!(body.error.code, "INVALID_OPERATION");
}

#[tokio::test]
async fn close_cancels_a_pending_order() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1008"), browser())
        .await
        .unwrap();

    let detail = h
        .service
        .close_order(
            &resp.payment_order_id,
            CloseOrderRequest {
                reason: "user abandoned".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(detail.status, OrderStatus::Cancelled);
    assert!(detail.failure_reason.unwrap().contains("ops_7"));
    assert_eq!(h.mock.close_calls(), 1);
}

#[tokio::test]
async fn paid_orders_cannot_be_closed() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1009"), browser())
        .await
        .unwrap();
    pay(&h, "M-1009", "100.00").await;

    let (status, body) = h
        .service
        .close_order(
            &resp.payment_order_id,
            CloseOrderRequest {
                reason: "late".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 409);
    assert_eq!(body.error.code, "INVALID_OPERATION");
}

#[tokio::test]
async fn partial_refund_reserves_funds_and_dispatches() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1010"), browser())
        .await
        .unwrap();
    pay(&h, "M-1010", "100.00").await;

    let refund = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(30.00),
                currency: "CNY".to_string(),
                reason: "damaged item".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(refund.status, RefundStatus::Processing);
    assert!(refund.gateway_refund_id.is_some());
    assert_eq!(h.mock.refund_calls(), 1);

    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    // Still SUCCESS until the rail confirms; the amount is reserved though.
    assert_eq!(detail.status, OrderStatus::Success);
    assert_eq!(detail.refunded_amount, Decimal::ZERO);
    assert_eq!(detail.refundable_amount, dec!(70.00));
    assert!(h
        .store
        .event_types_for(&resp.payment_order_id)
        .contains(&"refund.created".to_string()));
}

#[tokio::test]
async fn refunds_cannot_oversubscribe_the_paid_amount() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1011"), browser())
        .await
        .unwrap();
    pay(&h, "M-1011", "100.00").await;

    h.service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(60.00),
                currency: "CNY".to_string(),
                reason: "first claim".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();

    let (status, body) = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(50.00),
                currency: "CNY".to_string(),
                reason: "second claim".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 409);
    assert_eq!(body.error.code, "INSUFFICIENT_REFUNDABLE");
}

#[tokio::test]
async fn failed_dispatch_releases_the_reservation() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock).with_refund_behavior("REJECT"));
    let resp = h
        .service
        .create_order(create_req("M-1012"), browser())
        .await
        .unwrap();
    pay(&h, "M-1012", "100.00").await;

    let refund = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(100.00),
                currency: "CNY".to_string(),
                reason: "full return".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(refund.status, RefundStatus::Failed);
    assert!(refund.failure_reason.unwrap().contains("mock refund decline"));

    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    assert_eq!(detail.status, OrderStatus::Success);
    assert_eq!(detail.refundable_amount, dec!(100.00));
    assert!(h
        .store
        .event_types_for(&resp.payment_order_id)
        .contains(&"refund.failed".to_string()));
}

#[tokio::test]
async fn refunds_only_open_from_a_paid_order() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1013"), browser())
        .await
        .unwrap();

    let (status, body) = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(10.00),
                currency: "CNY".to_string(),
                reason: "too early".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 409);
    assert_eq!(body.error.code, "INVALID_OPERATION");
    assert_eq!(h.mock.refund_calls(), 0);
}

#[tokio::test]
async fn refund_window_is_enforced() {
    let h = harness_with_window(MockAdapter::new(PaymentMethod::Mock), 0);
    let resp = h
        .service
        .create_order(create_req("M-1014"), browser())
        .await
        .unwrap();
    pay(&h, "M-1014", "100.00").await;

    let (status, body) = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(10.00),
                currency: "CNY".to_string(),
                reason: "too late".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 409);
    assert_eq!(body.error.code, "INVALID_OPERATION");
}

#[tokio::test]
async fn settled_refunds_move_the_order_through_partial_to_refunded() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let resp = h
        .service
        .create_order(create_req("M-1015"), browser())
        .await
        .unwrap();
    pay(&h, "M-1015", "100.00").await;

    let first = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(40.00),
                currency: "CNY".to_string(),
                reason: "partial return".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();
    settle_refund(&h, "M-1015", &first.refund_id, "OK").await;

    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    assert_eq!(detail.status, OrderStatus::PartialRefunded);
    assert_eq!(detail.refunded_amount, dec!(40.00));
    assert_eq!(detail.refundable_amount, dec!(60.00));

    let second = h
        .service
        .request_refund(
            &resp.payment_order_id,
            RefundRequest {
                amount: dec!(60.00),
                currency: "CNY".to_string(),
                reason: "remainder".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();
    settle_refund(&h, "M-1015", &second.refund_id, "OK").await;

    let detail = h.service.get_order(&resp.payment_order_id).await.unwrap();
    assert_eq!(detail.status, OrderStatus::Refunded);
    assert_eq!(detail.refunded_amount, dec!(100.00));
    assert_eq!(detail.refundable_amount, Decimal::ZERO);

    let events = h.store.event_types_for(&resp.payment_order_id);
    assert_eq!(
        events
            .iter()
            .filter(|t| t.as_str() == "refund.succeeded")
            .count(),
        2
    );
}

#[tokio::test]
async fn user_listing_pages_through_orders() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    for n in 0..3 {
        h.service
            .create_order(create_req(&format!("M-1016-{n}")), browser())
            .await
            .unwrap();
    }

    let page1 = h
        .service
        .list_user_orders(
            "u_1001",
            ListOrdersQuery {
                page: Some(1),
                page_size: Some(2),
            },
        )
        .await
        .unwrap();
    let page2 = h
        .service
        .list_user_orders(
            "u_1001",
            ListOrdersQuery {
                page: Some(2),
                page_size: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(page1.total, 3);
    assert_eq!(page1.orders.len(), 2);
    assert_eq!(page2.orders.len(), 1);

    let mut seen: Vec<String> = page1
        .orders
        .iter()
        .chain(page2.orders.iter())
        .map(|o| o.merchant_order_id.clone())
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["M-1016-0", "M-1016-1", "M-1016-2"]);
}

#[tokio::test]
async fn statistics_count_outcomes_in_the_window() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));

    let paid = h
        .service
        .create_order(create_req("M-1017-paid"), browser())
        .await
        .unwrap();
    pay(&h, "M-1017-paid", "100.00").await;

    let refunded = h
        .service
        .create_order(create_req("M-1017-refunded"), browser())
        .await
        .unwrap();
    pay(&h, "M-1017-refunded", "100.00").await;
    let view = h
        .service
        .request_refund(
            &refunded.payment_order_id,
            RefundRequest {
                amount: dec!(100.00),
                currency: "CNY".to_string(),
                reason: "buyer remorse".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();
    settle_refund(&h, "M-1017-refunded", &view.refund_id, "OK").await;

    let closed = h
        .service
        .create_order(create_req("M-1017-closed"), browser())
        .await
        .unwrap();
    h.service
        .close_order(
            &closed.payment_order_id,
            CloseOrderRequest {
                reason: "abandoned".to_string(),
                operator_id: "ops_7".to_string(),
            },
        )
        .await
        .unwrap();

    let stats = h
        .service
        .statistics(StatsQuery {
            from: None,
            to: None,
        })
        .await
        .unwrap();

    assert_eq!(stats.total_orders, 3);
    assert_eq!(stats.succeeded_orders, 2);
    assert_eq!(stats.cancelled_orders, 1);
    assert_eq!(stats.refunded_orders, 1);
    assert_eq!(stats.totals.len(), 1);
    let cny = &stats.totals[0];
    assert_eq!(cny.currency, "CNY");
    assert_eq!(cny.paid_amount, dec!(200.00));
    assert_eq!(cny.refunded_amount, dec!(100.00));

    let detail = h.service.get_order(&paid.payment_order_id).await.unwrap();
    assert_eq!(detail.status, OrderStatus::Success);
}

#[tokio::test]
async fn inverted_statistics_window_is_rejected() {
    let h = harness(MockAdapter::new(PaymentMethod::Mock));
    let now = chrono::Utc::now();

    let (status, body) = h
        .service
        .statistics(StatsQuery {
            from: Some(now),
            to: Some(now - chrono::Duration::hours(1)),
        })
        .await
        .unwrap_err();

    assert_eq!(status.as_u16(), 400);
    assert_eq!(body.error.code, "VALIDATION_ERROR");
}
