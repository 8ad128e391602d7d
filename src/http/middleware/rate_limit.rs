use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use redis::AsyncCommands;

use crate::service::order_service::err;

#[derive(Clone)]
pub struct RateLimitState {
    pub redis_client: redis::Client,
    pub max_per_minute: i64,
}

/// Fixed per-minute window keyed by caller ip. Fails open when redis is
/// unreachable; order creation must not hinge on the limiter.
pub async fn enforce(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .split(',')
        .next()
        .unwrap_or("unknown")
        .trim()
        .to_string();

    let window = chrono::Utc::now().format("%Y%m%d%H%M");
    let key = format!("ratelimit:{ip}:{window}");

    match state.redis_client.get_multiplexed_async_connection().await {
        Ok(mut conn) => {
            let count: i64 = conn.incr(&key, 1).await.unwrap_or(1);
            let _: bool = conn.expire(&key, 120).await.unwrap_or(false);
            if count > state.max_per_minute {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(err("RATE_LIMITED", "too many requests, slow down")),
                )
                    .into_response();
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "rate limiter skipped, redis unavailable");
        }
    }

    next.run(request).await
}
