pub mod invoices;
pub mod payment;
pub mod seats;
pub mod shows;

use axum::Router;
use std::sync::Arc;
use validator::Validate;

use crate::error::{BookingError, BookingResult};
use crate::models::Caller;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(seats::routes())
        .merge(shows::routes())
        .merge(invoices::routes())
        .merge(payment::routes())
}

/* ---------- helpers ---------- */

fn validated<T: Validate>(request: T) -> BookingResult<T> {
    request
        .validate()
        .map_err(|e| BookingError::validation(e.to_string()))?;
    Ok(request)
}

fn require_admin(caller: &Caller) -> BookingResult<()> {
    if caller.role.can_manage_schedule() {
        Ok(())
    } else {
        Err(BookingError::unauthorized("Administrator role required"))
    }
}
