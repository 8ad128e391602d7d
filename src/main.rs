use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use payment_lifecycle::config::AppConfig;
use payment_lifecycle::gateways::selector::GatewaySelector;
use payment_lifecycle::gateways::RetryPolicy;
use payment_lifecycle::repo::outbox_repo::OutboxRepo;
use payment_lifecycle::repo::pg::PgOrderStore;
use payment_lifecycle::service::order_service::OrderService;
use payment_lifecycle::service::outbox_relay::OutboxRelay;
use payment_lifecycle::service::reconciler::Reconciler;
use payment_lifecycle::service::risk::HeuristicRiskScorer;
use payment_lifecycle::AppState;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let redis_client = redis::Client::open(cfg.redis_url.clone())?;

    let store = Arc::new(PgOrderStore { pool: pool.clone() });
    let selector = Arc::new(GatewaySelector::from_env(
        &cfg.public_base_url,
        cfg.gateway_timeout_ms,
    )?);
    tracing::info!(rails = ?selector.names(), "gateway rails registered");

    let order_service = OrderService {
        store: store.clone(),
        selector: selector.clone(),
        risk: Arc::new(HeuristicRiskScorer),
        retry: RetryPolicy::default(),
        refund_window_days: cfg.refund_window_days,
    };
    let reconciler = Reconciler {
        store: store.clone(),
        selector: selector.clone(),
        retry: RetryPolicy::default(),
    };

    let relay = OutboxRelay {
        outbox_repo: OutboxRepo { pool: pool.clone() },
        redis_client,
        stream_key: cfg.stream_key.clone(),
    };
    tokio::spawn(relay.run());

    let state = AppState {
        order_service,
        reconciler,
        selector,
    };

    let admin_key = cfg.internal_api_key.clone();
    let admin_routes = Router::new()
        .route(
            "/stats",
            get(payment_lifecycle::http::handlers::stats::statistics),
        )
        .route(
            "/orders/:order_id/sync",
            post(payment_lifecycle::http::handlers::orders::sync_order),
        )
        .layer(from_fn_with_state(
            admin_key,
            payment_lifecycle::http::middleware::admin_auth::require_internal_api_key,
        ));

    let app = Router::new()
        .route(
            "/health",
            get(payment_lifecycle::http::handlers::orders::health),
        )
        .route(
            "/orders",
            post(payment_lifecycle::http::handlers::orders::create_order),
        )
        .route(
            "/orders/:order_id",
            get(payment_lifecycle::http::handlers::orders::get_order),
        )
        .route(
            "/orders/:order_id/close",
            post(payment_lifecycle::http::handlers::orders::close_order),
        )
        .route(
            "/orders/:order_id/refunds",
            post(payment_lifecycle::http::handlers::orders::request_refund),
        )
        .route(
            "/users/:user_id/orders",
            get(payment_lifecycle::http::handlers::orders::list_user_orders),
        )
        .route(
            "/callbacks/:gateway",
            post(payment_lifecycle::http::handlers::callbacks::payment_callback),
        )
        .route(
            "/callbacks/:gateway/refund",
            post(payment_lifecycle::http::handlers::callbacks::refund_callback),
        )
        .merge(admin_routes)
        .layer(from_fn_with_state(
            payment_lifecycle::http::middleware::rate_limit::RateLimitState {
                redis_client: redis::Client::open(cfg.redis_url.clone())?,
                max_per_minute: cfg.rate_limit_per_minute,
            },
            payment_lifecycle::http::middleware::rate_limit::enforce,
        ))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("listening on {}", cfg.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
