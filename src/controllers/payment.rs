use axum::{
    extract::{Path, RawQuery, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::BookingResult;
use crate::models::Caller;
use crate::services::{ReturnOutcome, VnPayParams};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/invoices/{id}/payment", post(initiate_payment))
        .route("/payment/vnpay-return", get(vnpay_return))
        .route("/payment/vnpay-ipn", get(vnpay_ipn))
}

/* ---------- helpers ---------- */

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Missing or unparsable query strings are treated as absent.
fn gateway_params(raw: Option<String>) -> Option<VnPayParams> {
    let raw = raw.filter(|q| !q.is_empty())?;
    match serde_urlencoded::from_str::<VnPayParams>(&raw) {
        Ok(params) => Some(params),
        Err(e) => {
            tracing::warn!("unparsable gateway query: {}", e);
            None
        }
    }
}

fn result_location(base: &str, outcome: &ReturnOutcome) -> String {
    let pairs: Vec<(&str, &str)> = match outcome {
        ReturnOutcome::Success { invoice_id } => vec![("status", "success"), ("invoice_id", invoice_id.as_str())],
        ReturnOutcome::Failed { invoice_id, reason } => {
            let mut pairs = vec![("status", "failed"), ("reason", reason.as_str())];
            if let Some(id) = invoice_id {
                pairs.push(("invoice_id", id.as_str()));
            }
            pairs
        }
    };
    let query = serde_urlencoded::to_string(pairs).unwrap_or_default();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, query)
}

/* ---------- VNPAY ---------- */

// POST /api/invoices/{id}/payment
async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(invoice_id): Path<String>,
) -> BookingResult<impl IntoResponse> {
    let url = state
        .payments
        .initiate_payment(&invoice_id, &caller, &client_ip(&headers))
        .await?;
    Ok(Json(json!({ "payment_url": url })))
}

// GET /api/payment/vnpay-return
async fn vnpay_return(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> impl IntoResponse {
    let params = gateway_params(raw);
    let outcome = state.payments.handle_return(params.as_ref()).await;
    Redirect::to(&result_location(&state.booking_config.frontend_result_url, &outcome))
}

// GET /api/payment/vnpay-ipn
async fn vnpay_ipn(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> impl IntoResponse {
    let params = gateway_params(raw);
    Json(state.payments.handle_ipn(params.as_ref()).await)
}
