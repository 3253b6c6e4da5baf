//! Persistence seam for the reservation engine.
//!
//! Every method that changes shared state (couple pairing, seat holds,
//! invoice transitions) is a single atomic unit inside the backend: the
//! conditional part ("only if the seat is still free", "only if the invoice
//! is still incomplete") is evaluated and applied together, so concurrent
//! callers observe exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::models::{
    Account, CinemaRoom, CoupleSeat, Invoice, InvoiceStatus, Movie, MovieShow, NewShow,
    RefundRecord, ScheduleSeat, Seat, SeatType, SeatTypeUpdate, ShowRecord, Version, Voucher,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CoupleInsert {
    Created(Vec<CoupleSeat>),
    /// Nothing was written; the seat is already part of a pairing.
    AlreadyCoupled(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShowInsert {
    Created(MovieShow),
    Overlaps(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome {
    Held(Vec<ScheduleSeat>),
    /// Seats that were held or booked by someone else; nothing was written.
    Unavailable(Vec<i64>),
    /// Seats that do not exist for the show; nothing was written.
    Unknown(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceInsert {
    Created,
    /// Seats not (or no longer) held by the invoice owner.
    SeatsNotHeld(Vec<i64>),
}

/// Result of a conditional invoice status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Invoice),
    /// Invoice was already in the target state; nothing changed.
    Unchanged(Invoice),
    /// Invoice is in a state the transition does not start from.
    Rejected(InvoiceStatus),
    /// The voucher or score the invoice was priced with has been spent
    /// elsewhere since checkout; nothing was written.
    Unfunded(String),
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub invoice_id: String,
    pub account_id: String,
    pub voucher_id: Option<String>,
    pub earned_score: i64,
    pub used_score: i64,
    pub payment_ref: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cancellation {
    pub invoice_id: String,
    /// Status the invoice must still have for the cancellation to apply.
    pub expected: InvoiceStatus,
    pub account_id: String,
    pub restore_voucher: Option<String>,
    /// Added to the account score (used score returned minus earned score removed).
    pub score_delta: i64,
    pub refund_amount: Option<i64>,
    pub actor: String,
    pub cancelled_at: DateTime<Utc>,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /* ---------- rooms & seats ---------- */

    /// `None` for an unknown room.
    async fn room(&self, room_id: i64) -> StoreResult<Option<CinemaRoom>>;

    /// Ordered by seat id.
    async fn seats_in_room(&self, room_id: i64) -> StoreResult<Vec<Seat>>;

    /// Unknown ids are silently absent from the result.
    async fn seats_by_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>>;

    async fn seat_types(&self) -> StoreResult<Vec<SeatType>>;

    /// Applies all updates for known seats in one write; unknown seats are skipped.
    async fn save_seat_types(&self, updates: &[SeatTypeUpdate]) -> StoreResult<usize>;

    /// The subset of `seat_ids` that already belongs to a couple seat.
    async fn coupled_seat_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<i64>>;

    /// Inserts all pairs or none of them.
    async fn insert_couple_seats(&self, pairs: &[(i64, i64)]) -> StoreResult<CoupleInsert>;

    /// Removes the pairing made of exactly these two seats, in either order.
    async fn delete_couple_seat(&self, first: i64, second: i64) -> StoreResult<bool>;

    /* ---------- schedule ---------- */

    async fn movie(&self, movie_id: &str) -> StoreResult<Option<Movie>>;

    async fn version(&self, version_id: i64) -> StoreResult<Option<Version>>;

    /// Bare show row; use `shows_on` for the listing join.
    async fn show(&self, show_id: i64) -> StoreResult<Option<MovieShow>>;

    /// Exact match on movie, date, start time and version.
    async fn find_show(
        &self,
        movie_id: &str,
        date: NaiveDate,
        time: NaiveTime,
        version_id: i64,
    ) -> StoreResult<Option<MovieShow>>;

    /// Every show on `date` joined with its movie, version and room.
    async fn shows_on(&self, date: NaiveDate) -> StoreResult<Vec<ShowRecord>>;

    /// Creates the show and its schedule seats unless the room is busy during the window.
    async fn insert_show(&self, show: &NewShow, duration_minutes: i32) -> StoreResult<ShowInsert>;

    /* ---------- seat holds ---------- */

    /// Raw per-show seat rows. Lapsed holds keep their held status here until swept.
    async fn schedule_seats(&self, show_id: i64) -> StoreResult<Vec<ScheduleSeat>>;

    /// Compare-and-set of every seat from free to held, all or nothing.
    async fn hold_seats(
        &self,
        show_id: i64,
        seat_ids: &[i64],
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome>;

    /// Frees seats still held by `holder` that no invoice has claimed yet.
    async fn release_holds(&self, show_id: i64, seat_ids: &[i64], holder: &str) -> StoreResult<usize>;

    /// Frees every uninvoiced hold whose deadline is at or before `now`.
    async fn release_expired_holds(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /* ---------- accounts & vouchers ---------- */

    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>>;

    async fn voucher(&self, voucher_id: &str) -> StoreResult<Option<Voucher>>;

    /* ---------- invoices ---------- */

    /// Stores a new incomplete invoice and attaches the caller's held seats to it.
    async fn insert_invoice(&self, invoice: &Invoice, now: DateTime<Utc>) -> StoreResult<InvoiceInsert>;

    async fn invoice(&self, invoice_id: &str) -> StoreResult<Option<Invoice>>;

    /// Newest first.
    async fn invoices_for_account(&self, account_id: &str) -> StoreResult<Vec<Invoice>>;

    /// Oldest first, every status included.
    async fn invoices_for_show(&self, show_id: i64) -> StoreResult<Vec<Invoice>>;

    /// Ids of incomplete invoices booked before `created_before`.
    async fn stale_incomplete_invoices(&self, created_before: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Incomplete → Completed together with voucher, score, food orders and seats.
    async fn complete_invoice(&self, completion: &Completion) -> StoreResult<Transition>;

    /// `expected` → Cancelled together with seat release, voucher, score and refund record.
    async fn cancel_invoice(&self, cancellation: &Cancellation) -> StoreResult<Transition>;

    /// Audit rows written by paid cancellations.
    async fn refunds_for_invoice(&self, invoice_id: &str) -> StoreResult<Vec<RefundRecord>>;
}
