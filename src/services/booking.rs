use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::notifier::{BookingEvent, Notifier};
use crate::clock::Clock;
use crate::error::{BookingError, BookingResult};
use crate::models::{Caller, FoodLine, Invoice, InvoiceStatus};
use crate::store::{BookingStore, Cancellation, Completion, InvoiceInsert, Transition};

/// Everything the member picked before paying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkout {
    pub show_id: i64,
    pub seat_ids: Vec<i64>,
    #[serde(default)]
    pub food_lines: Vec<FoodLine>,
    pub voucher_id: Option<String>,
    #[serde(default)]
    pub use_score: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResult {
    Completed(Invoice),
    /// A repeated confirmation; nothing was changed.
    AlreadyCompleted(Invoice),
    InvalidState(InvoiceStatus),
    /// The voucher or score used at checkout was spent by another invoice
    /// first; the invoice stays incomplete.
    Unfunded(String),
}

/// Invoice lifecycle: Incomplete → Completed → Cancelled, Incomplete → Cancelled.
#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl BookingService {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, clock, notifier }
    }

    /// Prices the checkout and stores an incomplete invoice holding the caller's seats.
    pub async fn create_invoice(&self, caller: &Caller, checkout: Checkout) -> BookingResult<Invoice> {
        let mut seat_ids: Vec<i64> = Vec::with_capacity(checkout.seat_ids.len());
        for id in &checkout.seat_ids {
            if !seat_ids.contains(id) {
                seat_ids.push(*id);
            }
        }
        if seat_ids.is_empty() {
            return Err(BookingError::validation("Select at least one seat"));
        }
        if checkout.use_score < 0 {
            return Err(BookingError::validation("Score to use cannot be negative"));
        }
        if !checkout.food_lines.iter().all(FoodLine::is_orderable) {
            return Err(BookingError::validation(format!(
                "Food lines need a quantity of 1 to {} and a price of 1 to {}",
                FoodLine::MAX_QUANTITY,
                FoodLine::MAX_PRICE
            )));
        }
        if self.store.show(checkout.show_id).await?.is_none() {
            return Err(BookingError::not_found(format!("Show {} not found", checkout.show_id)));
        }

        let account = self
            .store
            .account(&caller.account_id)
            .await?
            .ok_or_else(|| BookingError::not_found("Account not found"))?;
        if checkout.use_score > account.score {
            return Err(BookingError::validation("Not enough score"));
        }

        let voucher_value = match &checkout.voucher_id {
            Some(voucher_id) => {
                let voucher = self
                    .store
                    .voucher(voucher_id)
                    .await?
                    .ok_or_else(|| BookingError::validation("Voucher not found"))?;
                if voucher.account_id != caller.account_id {
                    return Err(BookingError::validation("Voucher does not belong to you"));
                }
                if voucher.is_used {
                    return Err(BookingError::validation("Voucher has already been used"));
                }
                voucher.value
            }
            None => 0,
        };

        let prices: HashMap<i64, i64> = self
            .store
            .seat_types()
            .await?
            .into_iter()
            .map(|t| (t.id, t.price))
            .collect();
        let seats = self.store.seats_by_ids(&seat_ids).await?;
        if seats.len() != seat_ids.len() {
            return Err(BookingError::not_found("One or more seats do not exist"));
        }
        let mut seat_total: i64 = 0;
        let mut labels = Vec::with_capacity(seats.len());
        for id in &seat_ids {
            let Some(seat) = seats.iter().find(|s| s.id == *id) else {
                continue;
            };
            let price = prices.get(&seat.seat_type_id).copied().ok_or_else(|| {
                BookingError::validation(format!("Seat {} has no priced seat type", seat.label))
            })?;
            seat_total = seat_total.checked_add(price).ok_or_else(too_large)?;
            labels.push(seat.label.clone());
        }
        let mut food_total: i64 = 0;
        for line in &checkout.food_lines {
            let subtotal = line.subtotal().ok_or_else(too_large)?;
            food_total = food_total.checked_add(subtotal).ok_or_else(too_large)?;
        }
        let gross = seat_total.checked_add(food_total).ok_or_else(too_large)?;
        let total_price = gross.saturating_sub(voucher_value).saturating_sub(checkout.use_score).max(0);

        let now = self.clock.now();
        let invoice = Invoice {
            id: format!("INV{}", Uuid::new_v4().simple()).to_uppercase(),
            account_id: caller.account_id.clone(),
            movie_show_id: checkout.show_id,
            seat_ids: seat_ids.clone(),
            seat_labels: labels.join(", "),
            total_price,
            status: InvoiceStatus::Incomplete,
            cancel: false,
            voucher_id: checkout.voucher_id,
            used_score: checkout.use_score,
            earned_score: 0,
            food_lines: checkout.food_lines,
            booking_date: now,
            completed_at: None,
            cancelled_at: None,
            payment_ref: None,
        };

        match self.store.insert_invoice(&invoice, now).await? {
            InvoiceInsert::Created => {
                info!(invoice_id = %invoice.id, account_id = %invoice.account_id, total_price, "invoice created");
                Ok(invoice)
            }
            InvoiceInsert::SeatsNotHeld(ids) => Err(BookingError::conflict(format!(
                "Seats {:?} are not held for you, select them again",
                ids
            ))),
        }
    }

    /// Confirms payment. Safe to call repeatedly for the same invoice.
    pub async fn complete_payment(
        &self,
        invoice_id: &str,
        payment_ref: Option<String>,
    ) -> BookingResult<CompletionResult> {
        let invoice = self.require_invoice(invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Completed => return Ok(CompletionResult::AlreadyCompleted(invoice)),
            InvoiceStatus::Cancelled => return Ok(CompletionResult::InvalidState(invoice.status)),
            InvoiceStatus::Incomplete => {}
        }

        let rank_percent = match self.store.account(&invoice.account_id).await? {
            Some(account) => account.rank_percent,
            None => {
                warn!(account_id = %invoice.account_id, "invoice owner missing, no score earned");
                0
            }
        };
        let completion = Completion {
            invoice_id: invoice.id.clone(),
            account_id: invoice.account_id.clone(),
            voucher_id: invoice.voucher_id.clone(),
            earned_score: invoice.total_price * i64::from(rank_percent) / 100,
            used_score: invoice.used_score,
            payment_ref,
            completed_at: self.clock.now(),
        };

        match self.store.complete_invoice(&completion).await? {
            Transition::Applied(done) => {
                info!(invoice_id = %done.id, earned_score = done.earned_score, "payment completed");
                self.notifier.publish(BookingEvent::BookingConfirmed {
                    invoice_id: done.id.clone(),
                    account_id: done.account_id.clone(),
                    movie_show_id: done.movie_show_id,
                    seat_ids: done.seat_ids.clone(),
                    total_price: done.total_price,
                });
                Ok(CompletionResult::Completed(done))
            }
            Transition::Unchanged(done) => Ok(CompletionResult::AlreadyCompleted(done)),
            Transition::Rejected(status) => Ok(CompletionResult::InvalidState(status)),
            Transition::Unfunded(reason) => {
                warn!(invoice_id, %reason, "payment cannot complete, discount already spent");
                Ok(CompletionResult::Unfunded(reason))
            }
            Transition::Missing => Err(BookingError::not_found(format!("Invoice {} not found", invoice_id))),
        }
    }

    /// Cancels an unpaid invoice and frees its seats. Returns false when the
    /// invoice was no longer incomplete.
    pub async fn abandon_invoice(&self, invoice_id: &str, actor: &str) -> BookingResult<bool> {
        let invoice = self.require_invoice(invoice_id).await?;
        let cancellation = Cancellation {
            invoice_id: invoice.id.clone(),
            expected: InvoiceStatus::Incomplete,
            account_id: invoice.account_id.clone(),
            restore_voucher: None,
            score_delta: 0,
            refund_amount: None,
            actor: actor.to_string(),
            cancelled_at: self.clock.now(),
        };
        match self.store.cancel_invoice(&cancellation).await? {
            Transition::Applied(cancelled) => {
                info!(invoice_id = %cancelled.id, actor, "unpaid invoice abandoned");
                self.notifier.publish(BookingEvent::BookingCancelled {
                    invoice_id: cancelled.id.clone(),
                    account_id: cancelled.account_id.clone(),
                    movie_show_id: cancelled.movie_show_id,
                    seat_ids: cancelled.seat_ids.clone(),
                    refund_amount: None,
                    actor: actor.to_string(),
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Owners and staff may read an invoice.
    pub async fn invoice(&self, invoice_id: &str, caller: &Caller) -> BookingResult<Invoice> {
        let invoice = self.require_invoice(invoice_id).await?;
        if invoice.account_id != caller.account_id && !caller.role.can_cancel_any() {
            return Err(BookingError::unauthorized("You do not own this invoice"));
        }
        Ok(invoice)
    }

    /// Newest first.
    pub async fn invoices_for_account(&self, account_id: &str) -> BookingResult<Vec<Invoice>> {
        Ok(self.store.invoices_for_account(account_id).await?)
    }

    async fn require_invoice(&self, invoice_id: &str) -> BookingResult<Invoice> {
        self.store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| BookingError::not_found(format!("Invoice {} not found", invoice_id)))
    }
}

fn too_large() -> BookingError {
    BookingError::validation("Order total is too large")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScheduleSeatStatus, Voucher};
    use crate::services::fixtures::{seeded, Fixture, SHOW_ID, STANDARD_PRICE, VIP_PRICE};
    use crate::services::schedule::ShowSchedule;
    use chrono::Duration;

    fn services(fx: &Fixture) -> (ShowSchedule, BookingService) {
        (
            ShowSchedule::new(fx.store.clone(), fx.clock.clone(), Duration::minutes(10)),
            BookingService::new(fx.store.clone(), fx.clock.clone(), fx.notifier.clone()),
        )
    }

    fn checkout(seat_ids: Vec<i64>) -> Checkout {
        Checkout {
            show_id: SHOW_ID,
            seat_ids,
            ..Checkout::default()
        }
    }

    #[tokio::test]
    async fn prices_seats_food_voucher_and_score() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1, 5], "alice").await.unwrap();

        let invoice = booking
            .create_invoice(
                &alice,
                Checkout {
                    food_lines: vec![FoodLine { food_id: 9, quantity: 2, price: 30_000 }],
                    voucher_id: Some("V1".to_string()),
                    use_score: 5_000,
                    ..checkout(vec![1, 5])
                },
            )
            .await
            .unwrap();

        assert_eq!(invoice.status, InvoiceStatus::Incomplete);
        assert_eq!(invoice.total_price, STANDARD_PRICE + VIP_PRICE + 60_000 - 20_000 - 5_000);
        assert_eq!(invoice.seat_labels, "A1, B1");
        assert!(fx.store.food_orders(&invoice.id).is_empty());
    }

    #[tokio::test]
    async fn total_is_floored_at_zero() {
        let fx = seeded();
        fx.store.add_voucher(Voucher {
            id: "V9".to_string(),
            account_id: "alice".to_string(),
            value: 70_000,
            is_used: false,
        });
        let (schedule, booking) = services(&fx);
        schedule.hold_seats(SHOW_ID, &[1], "alice").await.unwrap();
        // 80_000 - 70_000 - 50_000
        let invoice = booking
            .create_invoice(
                &Caller::member("alice"),
                Checkout { use_score: 50_000, voucher_id: Some("V9".to_string()), ..checkout(vec![1]) },
            )
            .await
            .unwrap();
        assert_eq!(invoice.total_price, 0);
    }

    #[tokio::test]
    async fn voucher_is_spent_by_the_first_completion_only() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1, 2], "alice").await.unwrap();
        let with_voucher = |seat| Checkout { voucher_id: Some("V1".to_string()), ..checkout(vec![seat]) };
        let first = booking.create_invoice(&alice, with_voucher(1)).await.unwrap();
        let second = booking.create_invoice(&alice, with_voucher(2)).await.unwrap();

        let done = booking.complete_payment(&first.id, None).await.unwrap();
        assert!(matches!(done, CompletionResult::Completed(_)));
        let score_after_first = fx.store.account("alice").await.unwrap().unwrap().score;

        let refused = booking.complete_payment(&second.id, None).await.unwrap();
        assert!(matches!(refused, CompletionResult::Unfunded(_)));
        let stored = fx.store.invoice(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Incomplete);
        assert_eq!(fx.store.account("alice").await.unwrap().unwrap().score, score_after_first);
        assert!(fx.store.food_orders(&second.id).is_empty());
        assert_eq!(fx.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn score_cannot_be_spent_twice() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1, 2], "alice").await.unwrap();
        let with_score = |seat| Checkout { use_score: 40_000, ..checkout(vec![seat]) };
        let first = booking.create_invoice(&alice, with_score(1)).await.unwrap();
        let second = booking.create_invoice(&alice, with_score(2)).await.unwrap();

        booking.complete_payment(&first.id, None).await.unwrap();
        // 50_000 - 40_000 + 10% of 40_000
        assert_eq!(fx.store.account("alice").await.unwrap().unwrap().score, 14_000);

        let refused = booking.complete_payment(&second.id, None).await.unwrap();
        assert!(matches!(refused, CompletionResult::Unfunded(_)));
        assert_eq!(fx.store.account("alice").await.unwrap().unwrap().score, 14_000);
        let seats = fx.store.schedule_seats(SHOW_ID).await.unwrap();
        let seat_two = seats.iter().find(|s| s.seat_id == 2).unwrap();
        assert_ne!(seat_two.status, ScheduleSeatStatus::Booked);
    }

    #[tokio::test]
    async fn food_lines_are_bounded() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1], "alice").await.unwrap();
        let with_food = |quantity, price| Checkout {
            food_lines: vec![FoodLine { food_id: 3, quantity, price }],
            ..checkout(vec![1])
        };

        for (quantity, price) in [(2, i64::MAX / 2 + 1), (1, 0), (1, -5_000), (0, 40_000), (21, 40_000)] {
            let err = booking.create_invoice(&alice, with_food(quantity, price)).await.unwrap_err();
            assert!(matches!(err, BookingError::Validation(_)), "{quantity} x {price}: {err:?}");
        }
        assert!(fx.store.invoices_for_account("alice").await.unwrap().is_empty());

        let invoice = booking.create_invoice(&alice, with_food(20, 50_000)).await.unwrap();
        assert_eq!(invoice.total_price, STANDARD_PRICE + 1_000_000);
    }

    #[tokio::test]
    async fn rejects_foreign_voucher_and_excess_score() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1], "alice").await.unwrap();

        let foreign = Checkout { voucher_id: Some("V2".to_string()), ..checkout(vec![1]) };
        assert!(matches!(booking.create_invoice(&alice, foreign).await, Err(BookingError::Validation(_))));

        let greedy = Checkout { use_score: 50_001, ..checkout(vec![1]) };
        assert!(matches!(booking.create_invoice(&alice, greedy).await, Err(BookingError::Validation(_))));
    }

    #[tokio::test]
    async fn seats_must_be_held_by_caller() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        schedule.hold_seats(SHOW_ID, &[1], "bob").await.unwrap();
        let err = booking
            .create_invoice(&Caller::member("alice"), checkout(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Conflict(_)));
    }

    #[tokio::test]
    async fn completion_applies_side_effects_once() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        let alice = Caller::member("alice");
        schedule.hold_seats(SHOW_ID, &[1, 2], "alice").await.unwrap();
        let invoice = booking
            .create_invoice(
                &alice,
                Checkout {
                    food_lines: vec![FoodLine { food_id: 3, quantity: 1, price: 40_000 }],
                    voucher_id: Some("V1".to_string()),
                    use_score: 10_000,
                    ..checkout(vec![1, 2])
                },
            )
            .await
            .unwrap();
        // 160_000 + 40_000 - 20_000 - 10_000
        assert_eq!(invoice.total_price, 170_000);

        let first = booking.complete_payment(&invoice.id, Some("TXN1".to_string())).await.unwrap();
        let CompletionResult::Completed(done) = first else {
            panic!("expected completion, got {:?}", first);
        };
        assert_eq!(done.earned_score, 17_000);

        let account = fx.store.account("alice").await.unwrap().unwrap();
        assert_eq!(account.score, 50_000 + 17_000 - 10_000);
        assert!(fx.store.voucher("V1").await.unwrap().unwrap().is_used);
        assert_eq!(fx.store.food_orders(&invoice.id).len(), 1);
        let seats = fx.store.schedule_seats(SHOW_ID).await.unwrap();
        assert!(seats.iter().filter(|s| s.seat_id <= 2).all(|s| s.status == ScheduleSeatStatus::Booked));

        let again = booking.complete_payment(&invoice.id, Some("TXN1".to_string())).await.unwrap();
        assert!(matches!(again, CompletionResult::AlreadyCompleted(_)));
        assert_eq!(fx.store.account("alice").await.unwrap().unwrap().score, 57_000);
        assert_eq!(fx.store.food_orders(&invoice.id).len(), 1);
        assert_eq!(fx.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn invoiced_seats_survive_hold_expiry() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        schedule.hold_seats(SHOW_ID, &[3], "alice").await.unwrap();
        let invoice = booking.create_invoice(&Caller::member("alice"), checkout(vec![3])).await.unwrap();

        fx.clock.advance(Duration::minutes(30));
        assert_eq!(schedule.sweep_expired_holds().await.unwrap(), 0);
        let lost = schedule.hold_seats(SHOW_ID, &[3], "bob").await.unwrap();
        assert!(matches!(lost, crate::services::schedule::HoldResult::Unavailable { .. }));

        assert!(booking.abandon_invoice(&invoice.id, "system").await.unwrap());
        assert!(!booking.abandon_invoice(&invoice.id, "system").await.unwrap());
        let completed = booking.complete_payment(&invoice.id, None).await.unwrap();
        assert_eq!(completed, CompletionResult::InvalidState(InvoiceStatus::Cancelled));
    }

    #[tokio::test]
    async fn invoice_visible_to_owner_and_staff_only() {
        let fx = seeded();
        let (schedule, booking) = services(&fx);
        schedule.hold_seats(SHOW_ID, &[4], "alice").await.unwrap();
        let invoice = booking.create_invoice(&Caller::member("alice"), checkout(vec![4])).await.unwrap();

        assert!(booking.invoice(&invoice.id, &Caller::member("alice")).await.is_ok());
        assert!(booking.invoice(&invoice.id, &Caller::admin("admin")).await.is_ok());
        assert!(matches!(
            booking.invoice(&invoice.id, &Caller::member("bob")).await,
            Err(BookingError::Unauthorized(_))
        ));
        assert!(matches!(booking.complete_payment("nope", None).await, Err(BookingError::NotFound(_))));
    }
}
