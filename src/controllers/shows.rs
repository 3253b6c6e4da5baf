use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use super::{require_admin, validated};
use crate::error::{BookingError, BookingResult};
use crate::models::{Caller, NewShow};
use crate::services::schedule::parse_show_date;
use crate::services::HoldResult;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/showtimes", get(showtimes))
        .route("/shows", post(create_show))
        .route("/shows/find", get(find_show))
        .route("/shows/{id}/seats", get(seat_map))
        .route("/shows/{id}/holds", post(hold_seats).delete(release_seats))
}

/* ---------- SCHEDULE ---------- */

// GET /api/showtimes?date=2025-06-10
#[derive(Debug, Deserialize)]
struct ShowtimesQuery {
    date: String,
}

async fn showtimes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ShowtimesQuery>,
) -> BookingResult<Response> {
    let date = parse_show_date(&params.date)
        .ok_or_else(|| BookingError::validation(format!("Invalid date '{}'", params.date)))?;

    if let Some(cache) = &state.cache {
        if let Some(listing) = cache.get_showtimes(date).await {
            return Ok(([("X-Cache", "HIT")], Json(listing)).into_response());
        }
    }

    let listing = state.schedule.list_shows_for_date(date).await?;
    if let Some(cache) = &state.cache {
        cache.store_showtimes(date, &listing).await;
    }
    Ok(([("X-Cache", "MISS")], Json(listing)).into_response())
}

// GET /api/shows/find?movie_id=M1&date=10/06/2025&time=19:00&version_id=1
#[derive(Debug, Deserialize)]
struct FindShowQuery {
    movie_id: String,
    date: String,
    time: String,
    version_id: i64,
}

async fn find_show(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FindShowQuery>,
) -> BookingResult<impl IntoResponse> {
    let show = state
        .schedule
        .find_show(&params.movie_id, &params.date, &params.time, params.version_id)
        .await?;
    Ok(Json(show))
}

// POST /api/shows
async fn create_show(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<NewShow>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    let show = state.schedule.create_show(req).await?;
    if let Some(cache) = &state.cache {
        cache.invalidate_showtimes(show.show_date).await;
    }
    Ok((StatusCode::CREATED, Json(show)))
}

/* ---------- SEAT HOLDS ---------- */

// GET /api/shows/{id}/seats
async fn seat_map(State(state): State<Arc<AppState>>, Path(show_id): Path<i64>) -> BookingResult<impl IntoResponse> {
    Ok(Json(state.schedule.seat_map(show_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
struct SeatSelection {
    #[validate(length(min = 1))]
    seat_ids: Vec<i64>,
}

// POST /api/shows/{id}/holds
async fn hold_seats(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(show_id): Path<i64>,
    Json(req): Json<SeatSelection>,
) -> BookingResult<impl IntoResponse> {
    let req = validated(req)?;
    let result = state
        .schedule
        .hold_seats(show_id, &req.seat_ids, &caller.account_id)
        .await?;
    let status = match result {
        HoldResult::Held { .. } => StatusCode::OK,
        HoldResult::Unavailable { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(result)))
}

// DELETE /api/shows/{id}/holds
async fn release_seats(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(show_id): Path<i64>,
    Json(req): Json<SeatSelection>,
) -> BookingResult<impl IntoResponse> {
    let released = state
        .schedule
        .release_seats(show_id, &req.seat_ids, &caller.account_id)
        .await?;
    Ok(Json(json!({ "released": released })))
}
