use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    BookingStore, Cancellation, Completion, CoupleInsert, HoldOutcome, InvoiceInsert, ShowInsert,
    StoreError, StoreResult, Transition,
};
use crate::models::{
    Account, CinemaRoom, CoupleSeat, FoodLine, Invoice, InvoiceStatus, Movie, MovieShow, NewShow,
    RefundRecord, ScheduleSeat, ScheduleSeatStatus, Seat, SeatStatus, SeatType, SeatTypeUpdate,
    ShowRecord, Version, Voucher,
};

#[derive(Default)]
struct Inner {
    rooms: BTreeMap<i64, CinemaRoom>,
    seats: BTreeMap<i64, Seat>,
    seat_types: BTreeMap<i64, SeatType>,
    seat_type_saves: usize,
    couples: Vec<CoupleSeat>,
    next_couple_id: i64,
    movies: HashMap<String, Movie>,
    versions: BTreeMap<i64, Version>,
    shows: BTreeMap<i64, MovieShow>,
    next_show_id: i64,
    schedule: BTreeMap<(i64, i64), ScheduleSeat>,
    accounts: HashMap<String, Account>,
    vouchers: HashMap<String, Voucher>,
    invoices: BTreeMap<String, Invoice>,
    food_orders: Vec<(String, FoodLine)>,
    refunds: Vec<RefundRecord>,
}

impl Inner {
    fn create_schedule_seats(&mut self, show_id: i64, room_id: i64) {
        let seat_ids: Vec<i64> = self
            .seats
            .values()
            .filter(|s| s.room_id == room_id && s.status != SeatStatus::Disabled)
            .map(|s| s.id)
            .collect();
        for seat_id in seat_ids {
            self.schedule
                .insert((show_id, seat_id), ScheduleSeat::available(show_id, seat_id));
        }
    }

    fn show_window(&self, show: &MovieShow) -> Option<(chrono::NaiveDateTime, chrono::NaiveDateTime)> {
        let start = show.starts_at()?;
        let minutes = show
            .movie_id
            .as_ref()
            .and_then(|id| self.movies.get(id))
            .map_or(0, |m| m.duration_minutes);
        Some((start, start + chrono::Duration::minutes(minutes.into())))
    }
}

/// In-process backend: one mutex guards every table, so each trait call is
/// a single critical section. Used for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn seed(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Seeding ---

    pub fn add_room(&self, room: CinemaRoom) {
        self.seed().rooms.insert(room.id, room);
    }

    pub fn add_seat_type(&self, seat_type: SeatType) {
        self.seed().seat_types.insert(seat_type.id, seat_type);
    }

    pub fn add_seat(&self, seat: Seat) {
        self.seed().seats.insert(seat.id, seat);
    }

    pub fn add_movie(&self, movie: Movie) {
        self.seed().movies.insert(movie.id.clone(), movie);
    }

    pub fn add_version(&self, version: Version) {
        self.seed().versions.insert(version.id, version);
    }

    /// Inserts a show as-is (no overlap check) and lays out its schedule seats.
    pub fn add_show(&self, show: MovieShow) {
        let mut inner = self.seed();
        inner.next_show_id = inner.next_show_id.max(show.id);
        inner.create_schedule_seats(show.id, show.room_id);
        inner.shows.insert(show.id, show);
    }

    pub fn add_account(&self, account: Account) {
        self.seed().accounts.insert(account.id.clone(), account);
    }

    pub fn add_voucher(&self, voucher: Voucher) {
        self.seed().vouchers.insert(voucher.id.clone(), voucher);
    }

    // --- Inspection ---

    /// Number of seat-type batch writes performed.
    pub fn seat_type_saves(&self) -> usize {
        self.seed().seat_type_saves
    }

    pub fn couples(&self) -> Vec<CoupleSeat> {
        self.seed().couples.clone()
    }

    pub fn food_orders(&self, invoice_id: &str) -> Vec<FoodLine> {
        self.seed()
            .food_orders
            .iter()
            .filter(|(id, _)| id == invoice_id)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn room(&self, room_id: i64) -> StoreResult<Option<CinemaRoom>> {
        Ok(self.lock()?.rooms.get(&room_id).cloned())
    }

    async fn seats_in_room(&self, room_id: i64) -> StoreResult<Vec<Seat>> {
        Ok(self
            .lock()?
            .seats
            .values()
            .filter(|s| s.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn seats_by_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>> {
        let inner = self.lock()?;
        Ok(seat_ids.iter().filter_map(|id| inner.seats.get(id).cloned()).collect())
    }

    async fn seat_types(&self) -> StoreResult<Vec<SeatType>> {
        Ok(self.lock()?.seat_types.values().cloned().collect())
    }

    async fn save_seat_types(&self, updates: &[SeatTypeUpdate]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut updated = 0;
        for update in updates {
            if let Some(seat) = inner.seats.get_mut(&update.seat_id) {
                seat.seat_type_id = update.seat_type_id;
                updated += 1;
            }
        }
        inner.seat_type_saves += 1;
        Ok(updated)
    }

    async fn coupled_seat_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let inner = self.lock()?;
        let mut coupled: Vec<i64> = seat_ids
            .iter()
            .copied()
            .filter(|id| inner.couples.iter().any(|c| c.contains(*id)))
            .collect();
        coupled.sort_unstable();
        coupled.dedup();
        Ok(coupled)
    }

    async fn insert_couple_seats(&self, pairs: &[(i64, i64)]) -> StoreResult<CoupleInsert> {
        let mut inner = self.lock()?;
        let mut taken: HashSet<i64> = inner
            .couples
            .iter()
            .flat_map(|c| [c.first_seat_id, c.second_seat_id])
            .collect();
        for &(first, second) in pairs {
            for seat_id in [first, second] {
                if !taken.insert(seat_id) {
                    return Ok(CoupleInsert::AlreadyCoupled(seat_id));
                }
            }
        }

        let mut created = Vec::with_capacity(pairs.len());
        for &(first, second) in pairs {
            inner.next_couple_id += 1;
            let couple = CoupleSeat {
                id: inner.next_couple_id,
                first_seat_id: first,
                second_seat_id: second,
            };
            inner.couples.push(couple.clone());
            created.push(couple);
        }
        Ok(CoupleInsert::Created(created))
    }

    async fn delete_couple_seat(&self, first: i64, second: i64) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let before = inner.couples.len();
        inner.couples.retain(|c| !c.matches(first, second));
        Ok(inner.couples.len() != before)
    }

    async fn movie(&self, movie_id: &str) -> StoreResult<Option<Movie>> {
        Ok(self.lock()?.movies.get(movie_id).cloned())
    }

    async fn version(&self, version_id: i64) -> StoreResult<Option<Version>> {
        Ok(self.lock()?.versions.get(&version_id).cloned())
    }

    async fn show(&self, show_id: i64) -> StoreResult<Option<MovieShow>> {
        Ok(self.lock()?.shows.get(&show_id).cloned())
    }

    async fn find_show(
        &self,
        movie_id: &str,
        date: NaiveDate,
        time: NaiveTime,
        version_id: i64,
    ) -> StoreResult<Option<MovieShow>> {
        Ok(self
            .lock()?
            .shows
            .values()
            .find(|s| {
                s.movie_id.as_deref() == Some(movie_id)
                    && s.show_date == date
                    && s.show_time == Some(time)
                    && s.version_id == version_id
            })
            .cloned())
    }

    async fn shows_on(&self, date: NaiveDate) -> StoreResult<Vec<ShowRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .shows
            .values()
            .filter(|s| s.show_date == date)
            .map(|show| ShowRecord {
                movie: show.movie_id.as_ref().and_then(|id| inner.movies.get(id).cloned()),
                room: inner.rooms.get(&show.room_id).cloned(),
                version: inner.versions.get(&show.version_id).cloned(),
                show: show.clone(),
            })
            .collect())
    }

    async fn insert_show(&self, show: &NewShow, duration_minutes: i32) -> StoreResult<ShowInsert> {
        let mut inner = self.lock()?;
        let (start, end) = show.window(duration_minutes);
        let clash = inner
            .shows
            .values()
            .filter(|s| s.room_id == show.room_id)
            .find(|s| {
                inner
                    .show_window(s)
                    .is_some_and(|(s_start, s_end)| start < s_end && s_start < end)
            })
            .map(|s| s.id);
        if let Some(existing) = clash {
            return Ok(ShowInsert::Overlaps(existing));
        }

        inner.next_show_id += 1;
        let created = MovieShow {
            id: inner.next_show_id,
            movie_id: Some(show.movie_id.clone()),
            room_id: show.room_id,
            show_date: show.show_date,
            show_time: Some(show.show_time),
            version_id: show.version_id,
        };
        inner.create_schedule_seats(created.id, created.room_id);
        inner.shows.insert(created.id, created.clone());
        Ok(ShowInsert::Created(created))
    }

    async fn schedule_seats(&self, show_id: i64) -> StoreResult<Vec<ScheduleSeat>> {
        Ok(self
            .lock()?
            .schedule
            .range((show_id, i64::MIN)..=(show_id, i64::MAX))
            .map(|(_, seat)| seat.clone())
            .collect())
    }

    async fn hold_seats(
        &self,
        show_id: i64,
        seat_ids: &[i64],
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome> {
        let mut inner = self.lock()?;
        let mut unknown = Vec::new();
        let mut taken = Vec::new();
        for seat_id in seat_ids {
            match inner.schedule.get(&(show_id, *seat_id)) {
                None => unknown.push(*seat_id),
                Some(seat) if !seat.is_free(now) && !seat.is_held_by(holder, now) => taken.push(*seat_id),
                Some(_) => {}
            }
        }
        if !unknown.is_empty() {
            return Ok(HoldOutcome::Unknown(unknown));
        }
        if !taken.is_empty() {
            return Ok(HoldOutcome::Unavailable(taken));
        }

        let mut held = Vec::with_capacity(seat_ids.len());
        for seat_id in seat_ids {
            if let Some(seat) = inner.schedule.get_mut(&(show_id, *seat_id)) {
                seat.status = ScheduleSeatStatus::Held;
                seat.held_by = Some(holder.to_string());
                seat.held_until = Some(until);
                seat.invoice_id = None;
                seat.version += 1;
                held.push(seat.clone());
            }
        }
        Ok(HoldOutcome::Held(held))
    }

    async fn release_holds(&self, show_id: i64, seat_ids: &[i64], holder: &str) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut released = 0;
        for seat_id in seat_ids {
            if let Some(seat) = inner.schedule.get_mut(&(show_id, *seat_id)) {
                if seat.status == ScheduleSeatStatus::Held
                    && seat.invoice_id.is_none()
                    && seat.held_by.as_deref() == Some(holder)
                {
                    seat.reset();
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut released = 0;
        for seat in inner.schedule.values_mut() {
            if seat.hold_expired(now) {
                seat.reset();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
        Ok(self.lock()?.accounts.get(account_id).cloned())
    }

    async fn voucher(&self, voucher_id: &str) -> StoreResult<Option<Voucher>> {
        Ok(self.lock()?.vouchers.get(voucher_id).cloned())
    }

    async fn insert_invoice(&self, invoice: &Invoice, now: DateTime<Utc>) -> StoreResult<InvoiceInsert> {
        let mut inner = self.lock()?;
        let not_held: Vec<i64> = invoice
            .seat_ids
            .iter()
            .copied()
            .filter(|seat_id| {
                !inner
                    .schedule
                    .get(&(invoice.movie_show_id, *seat_id))
                    .is_some_and(|s| s.is_held_by(&invoice.account_id, now))
            })
            .collect();
        if !not_held.is_empty() {
            return Ok(InvoiceInsert::SeatsNotHeld(not_held));
        }

        for seat_id in &invoice.seat_ids {
            if let Some(seat) = inner.schedule.get_mut(&(invoice.movie_show_id, *seat_id)) {
                seat.invoice_id = Some(invoice.id.clone());
                seat.version += 1;
            }
        }
        inner.invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(InvoiceInsert::Created)
    }

    async fn invoice(&self, invoice_id: &str) -> StoreResult<Option<Invoice>> {
        Ok(self.lock()?.invoices.get(invoice_id).cloned())
    }

    async fn invoices_for_account(&self, account_id: &str) -> StoreResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .lock()?
            .invoices
            .values()
            .filter(|i| i.account_id == account_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.booking_date.cmp(&a.booking_date));
        Ok(invoices)
    }

    async fn invoices_for_show(&self, show_id: i64) -> StoreResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .lock()?
            .invoices
            .values()
            .filter(|i| i.movie_show_id == show_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.booking_date.cmp(&b.booking_date));
        Ok(invoices)
    }

    async fn stale_incomplete_invoices(&self, created_before: DateTime<Utc>) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Incomplete && i.booking_date < created_before)
            .map(|i| i.id.clone())
            .collect())
    }

    async fn complete_invoice(&self, completion: &Completion) -> StoreResult<Transition> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(invoice) = inner.invoices.get_mut(&completion.invoice_id) else {
            return Ok(Transition::Missing);
        };
        match invoice.status {
            InvoiceStatus::Completed => return Ok(Transition::Unchanged(invoice.clone())),
            InvoiceStatus::Cancelled => return Ok(Transition::Rejected(InvoiceStatus::Cancelled)),
            InvoiceStatus::Incomplete => {}
        }

        if let Some(voucher_id) = &completion.voucher_id {
            if inner.vouchers.get(voucher_id).map_or(true, |v| v.is_used) {
                return Ok(Transition::Unfunded(format!("Voucher {} is no longer available", voucher_id)));
            }
        }
        let balance = inner.accounts.get(&completion.account_id).map(|a| a.score);
        if completion.used_score > 0 && balance.map_or(true, |score| score < completion.used_score) {
            return Ok(Transition::Unfunded(format!(
                "Score balance no longer covers {} points",
                completion.used_score
            )));
        }

        invoice.status = InvoiceStatus::Completed;
        invoice.completed_at = Some(completion.completed_at);
        invoice.payment_ref = completion.payment_ref.clone();
        invoice.earned_score = completion.earned_score;
        let invoice = invoice.clone();

        if let Some(voucher) = completion
            .voucher_id
            .as_ref()
            .and_then(|id| inner.vouchers.get_mut(id))
        {
            voucher.is_used = true;
        }
        if let Some(account) = inner.accounts.get_mut(&completion.account_id) {
            account.score += completion.earned_score - completion.used_score;
        }
        for line in &invoice.food_lines {
            inner.food_orders.push((invoice.id.clone(), line.clone()));
        }
        for seat in inner.schedule.values_mut() {
            if seat.invoice_id.as_deref() == Some(invoice.id.as_str()) {
                seat.status = ScheduleSeatStatus::Booked;
                seat.held_until = None;
                seat.version += 1;
            }
        }
        Ok(Transition::Applied(invoice))
    }

    async fn cancel_invoice(&self, cancellation: &Cancellation) -> StoreResult<Transition> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(invoice) = inner.invoices.get_mut(&cancellation.invoice_id) else {
            return Ok(Transition::Missing);
        };
        if invoice.status == InvoiceStatus::Cancelled {
            return Ok(Transition::Unchanged(invoice.clone()));
        }
        if invoice.status != cancellation.expected {
            return Ok(Transition::Rejected(invoice.status));
        }

        invoice.status = InvoiceStatus::Cancelled;
        invoice.cancel = true;
        invoice.cancelled_at = Some(cancellation.cancelled_at);
        let invoice = invoice.clone();

        for seat in inner.schedule.values_mut() {
            if seat.invoice_id.as_deref() == Some(invoice.id.as_str()) {
                seat.reset();
            }
        }
        let voucher_restored = match cancellation
            .restore_voucher
            .as_ref()
            .and_then(|id| inner.vouchers.get_mut(id))
        {
            Some(voucher) => {
                voucher.is_used = false;
                true
            }
            None => false,
        };
        if let Some(account) = inner.accounts.get_mut(&cancellation.account_id) {
            account.score = (account.score + cancellation.score_delta).max(0);
        }
        if let Some(amount) = cancellation.refund_amount {
            inner.refunds.push(RefundRecord {
                invoice_id: invoice.id.clone(),
                amount,
                voucher_restored,
                actor: cancellation.actor.clone(),
                created_at: cancellation.cancelled_at,
            });
        }
        Ok(Transition::Applied(invoice))
    }

    async fn refunds_for_invoice(&self, invoice_id: &str) -> StoreResult<Vec<RefundRecord>> {
        Ok(self
            .lock()?
            .refunds
            .iter()
            .filter(|r| r.invoice_id == invoice_id)
            .cloned()
            .collect())
    }
}
