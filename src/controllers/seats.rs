use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use super::{require_admin, validated};
use crate::error::BookingResult;
use crate::models::{Caller, SeatTypeUpdate};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rooms/{id}/seats", get(room_seats))
        .route("/seats/types", put(assign_seat_types))
        .route("/seats/{id}/type", put(assign_seat_type))
        .route("/couple-seats", post(create_couple_seat).delete(delete_couple_seat))
        .route("/couple-seats/batch", post(create_couple_seats_batch))
}

/* ---------- SEATS ---------- */

// GET /api/rooms/{id}/seats
async fn room_seats(State(state): State<Arc<AppState>>, Path(room_id): Path<i64>) -> BookingResult<impl IntoResponse> {
    let seats = state.inventory.get_seats_by_room(room_id).await?;
    Ok(Json(seats))
}

// PUT /api/seats/{id}/type
#[derive(Debug, Deserialize, Validate)]
struct SeatTypeRequest {
    #[validate(range(min = 1))]
    seat_type_id: i64,
}

async fn assign_seat_type(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(seat_id): Path<i64>,
    Json(req): Json<SeatTypeRequest>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    let req = validated(req)?;
    state.inventory.assign_seat_type(seat_id, req.seat_type_id).await?;
    Ok(Json(json!({ "success": true })))
}

// PUT /api/seats/types
async fn assign_seat_types(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(updates): Json<Vec<SeatTypeUpdate>>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    let updated = state.inventory.assign_seat_types(&updates).await?;
    Ok(Json(json!({ "success": true, "updated": updated })))
}

/* ---------- COUPLE SEATS ---------- */

#[derive(Debug, Serialize, Deserialize, Validate)]
struct CouplePairRequest {
    #[validate(range(min = 1))]
    first_seat_id: i64,
    #[validate(range(min = 1))]
    second_seat_id: i64,
}

// POST /api/couple-seats
async fn create_couple_seat(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<CouplePairRequest>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    let req = validated(req)?;
    let couple = state
        .inventory
        .create_couple_seat(req.first_seat_id, req.second_seat_id)
        .await?;
    Ok((StatusCode::CREATED, Json(couple)))
}

// POST /api/couple-seats/batch
#[derive(Debug, Deserialize, Validate)]
struct CoupleBatchRequest {
    #[validate(length(min = 1), nested)]
    pairs: Vec<CouplePairRequest>,
}

async fn create_couple_seats_batch(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<CoupleBatchRequest>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    let req = validated(req)?;
    let pairs: Vec<(i64, i64)> = req
        .pairs
        .iter()
        .map(|p| (p.first_seat_id, p.second_seat_id))
        .collect();
    let couples = state.inventory.create_couple_seats_batch(&pairs).await?;
    Ok((StatusCode::CREATED, Json(couples)))
}

// DELETE /api/couple-seats
#[derive(Debug, Deserialize)]
struct DeleteCoupleRequest {
    seat_ids: Vec<i64>,
}

async fn delete_couple_seat(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<DeleteCoupleRequest>,
) -> BookingResult<impl IntoResponse> {
    require_admin(&caller)?;
    state.inventory.delete_couple_seat(&req.seat_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}
