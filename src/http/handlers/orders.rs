use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::http::api::{
    CloseOrderRequest, CreateOrderRequest, ListOrdersQuery, RefundRequest, SyncResponse,
};
use crate::service::order_service::{err, internal};
use crate::service::risk::RiskContext;
use crate::AppState;

pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    let ctx = risk_context(&headers);
    match state.order_service.create_order(req, ctx).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match state.order_service.get_order(&order_id).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn list_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListOrdersQuery>,
) -> impl IntoResponse {
    match state.order_service.list_user_orders(&user_id, query).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn close_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<CloseOrderRequest>,
) -> impl IntoResponse {
    match state.order_service.close_order(&order_id, req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn request_refund(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<RefundRequest>,
) -> impl IntoResponse {
    match state.order_service.request_refund(&order_id, req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

/// Admin-triggered reconcile of one order against its rail.
pub async fn sync_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match state.reconciler.sync_by_id(&order_id).await {
        Ok(Some(outcome)) => (
            StatusCode::OK,
            Json(SyncResponse {
                payment_order_id: order_id,
                status: outcome.status,
                changed: outcome.changed,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(err("ORDER_NOT_FOUND", &format!("order {order_id} not found"))),
        )
            .into_response(),
        Err(e) => {
            let (status, body) = internal(e);
            (status, Json(body)).into_response()
        }
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn risk_context(headers: &HeaderMap) -> RiskContext {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    RiskContext {
        client_ip,
        user_agent,
    }
}
