use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::gateways::{CallbackAck, CallbackEnvelope};
use crate::service::order_service::err;
use crate::AppState;

/// Inbound payment notification from a rail. The body is taken raw because
/// signature schemes cover the exact bytes, not a re-serialized form.
pub async fn payment_callback(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let Some(adapter) = state.selector.by_name(&gateway) else {
        return unknown_gateway(&gateway);
    };
    let envelope = envelope_from(&headers, body);
    let ack = state
        .reconciler
        .handle_payment_callback(adapter, &envelope)
        .await;
    ack_response(ack)
}

pub async fn refund_callback(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let Some(adapter) = state.selector.by_name(&gateway) else {
        return unknown_gateway(&gateway);
    };
    let envelope = envelope_from(&headers, body);
    let ack = state
        .reconciler
        .handle_refund_callback(adapter, &envelope)
        .await;
    ack_response(ack)
}

fn unknown_gateway(name: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(err("UNKNOWN_GATEWAY", &format!("no gateway named {name}"))),
    )
        .into_response()
}

fn envelope_from(headers: &HeaderMap, body: String) -> CallbackEnvelope {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    CallbackEnvelope { headers, body }
}

/// Each rail dictates its own acknowledgement shape, so the reply is built
/// from the adapter's ack rather than a shared JSON envelope.
fn ack_response(ack: CallbackAck) -> axum::response::Response {
    let status = StatusCode::from_u16(ack.status).unwrap_or(StatusCode::OK);
    (
        status,
        [(header::CONTENT_TYPE, ack.content_type)],
        ack.body,
    )
        .into_response()
}
