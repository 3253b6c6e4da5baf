use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::error::BookingResult;
use crate::models::Caller;
use crate::services::{CancelOutcome, Checkout};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/invoices", get(my_invoices).post(create_invoice))
        .route("/invoices/{id}", get(invoice))
        .route("/invoices/{id}/cancel", post(cancel_invoice))
        .route("/admin/invoices/{id}/cancel", post(admin_cancel_invoice))
        .route("/admin/shows/{id}/refund", post(refund_show))
}

fn cancel_response(outcome: CancelOutcome) -> impl IntoResponse {
    let status = if outcome.success { StatusCode::OK } else { StatusCode::CONFLICT };
    (status, Json(outcome))
}

/* ---------- INVOICES ---------- */

// POST /api/invoices
async fn create_invoice(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(checkout): Json<Checkout>,
) -> BookingResult<impl IntoResponse> {
    let invoice = state.booking.create_invoice(&caller, checkout).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

// GET /api/invoices
async fn my_invoices(State(state): State<Arc<AppState>>, caller: Caller) -> BookingResult<impl IntoResponse> {
    Ok(Json(state.booking.invoices_for_account(&caller.account_id).await?))
}

// GET /api/invoices/{id}
async fn invoice(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(invoice_id): Path<String>,
) -> BookingResult<impl IntoResponse> {
    Ok(Json(state.booking.invoice(&invoice_id, &caller).await?))
}

/* ---------- CANCELLATION ---------- */

// POST /api/invoices/{id}/cancel
async fn cancel_invoice(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(invoice_id): Path<String>,
) -> BookingResult<impl IntoResponse> {
    let outcome = state.cancellations.cancel(&invoice_id, &caller).await?;
    Ok(cancel_response(outcome))
}

// POST /api/admin/invoices/{id}/cancel
async fn admin_cancel_invoice(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(invoice_id): Path<String>,
) -> BookingResult<impl IntoResponse> {
    let outcome = state.cancellations.cancel_by_admin(&invoice_id, &caller).await?;
    Ok(cancel_response(outcome))
}

// POST /api/admin/shows/{id}/refund
async fn refund_show(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(show_id): Path<i64>,
) -> BookingResult<impl IntoResponse> {
    let report = state.cancellations.refund_by_movie_show(show_id, &caller).await?;
    if let Some(cache) = &state.cache {
        let show = state.schedule.show(show_id).await?;
        cache.invalidate_showtimes(show.show_date).await;
    }
    Ok(Json(report))
}
