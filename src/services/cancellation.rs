use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::notifier::{BookingEvent, Notifier};
use crate::clock::Clock;
use crate::error::{BookingError, BookingResult};
use crate::models::{Caller, Invoice, InvoiceStatus};
use crate::store::{BookingStore, Cancellation, Transition};

/// Result of a cancellation attempt. Business refusals are reported here
/// with `success == false`; only infrastructure or permission problems are errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub messages: Vec<String>,
}

impl CancelOutcome {
    fn ok(messages: Vec<String>) -> Self {
        Self { success: true, messages }
    }

    fn refused(message: impl Into<String>) -> Self {
        Self { success: false, messages: vec![message.into()] }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefundFailure {
    pub invoice_id: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefundReport {
    pub show_id: i64,
    pub cancelled: Vec<String>,
    pub failed: Vec<RefundFailure>,
    pub refunded_amount: i64,
}

#[derive(Clone)]
pub struct CancellationService {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    cutoff: Option<Duration>,
}

impl CancellationService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        cutoff: Option<Duration>,
    ) -> Self {
        Self { store, clock, notifier, cutoff }
    }

    /// Member cancellation of their own ticket, subject to the cut-off policy.
    pub async fn cancel(&self, invoice_id: &str, caller: &Caller) -> BookingResult<CancelOutcome> {
        let Some(invoice) = self.store.invoice(invoice_id).await? else {
            return Ok(CancelOutcome::refused("Ticket not found"));
        };
        if invoice.account_id != caller.account_id {
            warn!(invoice_id, account_id = %caller.account_id, "cancellation attempted on foreign ticket");
            return Err(BookingError::unauthorized("You can only cancel your own tickets"));
        }
        self.cancel_invoice(invoice, &caller.account_id, true).await
    }

    /// Staff cancellation; ignores ownership and the cut-off.
    pub async fn cancel_by_admin(&self, invoice_id: &str, caller: &Caller) -> BookingResult<CancelOutcome> {
        if !caller.role.can_cancel_any() {
            return Err(BookingError::unauthorized("Only staff may cancel other members' tickets"));
        }
        let Some(invoice) = self.store.invoice(invoice_id).await? else {
            return Ok(CancelOutcome::refused("Ticket not found"));
        };
        self.cancel_invoice(invoice, &caller.account_id, false).await
    }

    /// Cancels every live invoice of a show. One invoice failing never stops the others.
    pub async fn refund_by_movie_show(&self, show_id: i64, caller: &Caller) -> BookingResult<RefundReport> {
        if !caller.role.can_manage_schedule() {
            return Err(BookingError::unauthorized("Only administrators may refund a whole show"));
        }
        if self.store.show(show_id).await?.is_none() {
            return Err(BookingError::not_found(format!("Show {} not found", show_id)));
        }

        let mut report = RefundReport { show_id, ..RefundReport::default() };
        for invoice in self.store.invoices_for_show(show_id).await? {
            if invoice.status == InvoiceStatus::Cancelled {
                continue;
            }
            let invoice_id = invoice.id.clone();
            let refund = if invoice.status == InvoiceStatus::Completed { invoice.total_price } else { 0 };
            match self.cancel_invoice(invoice, &caller.account_id, false).await {
                Ok(outcome) if outcome.success => {
                    report.refunded_amount += refund;
                    report.cancelled.push(invoice_id);
                }
                Ok(outcome) => report.failed.push(RefundFailure { invoice_id, messages: outcome.messages }),
                Err(e) => {
                    error!(%invoice_id, show_id, "show refund failed for invoice: {:?}", e);
                    report.failed.push(RefundFailure {
                        invoice_id,
                        messages: vec!["Cancellation failed, please retry".to_string()],
                    });
                }
            }
        }

        info!(
            show_id,
            cancelled = report.cancelled.len(),
            failed = report.failed.len(),
            refunded_amount = report.refunded_amount,
            "show refund finished"
        );
        Ok(report)
    }

    async fn cancel_invoice(&self, invoice: Invoice, actor: &str, enforce_cutoff: bool) -> BookingResult<CancelOutcome> {
        if invoice.status == InvoiceStatus::Cancelled {
            return Ok(CancelOutcome::refused("Ticket already cancelled"));
        }
        let paid = invoice.status == InvoiceStatus::Completed;
        if paid && enforce_cutoff {
            if let Some(refusal) = self.check_cutoff(&invoice).await? {
                return Ok(refusal);
            }
        }

        let cancellation = Cancellation {
            invoice_id: invoice.id.clone(),
            expected: invoice.status,
            account_id: invoice.account_id.clone(),
            restore_voucher: if paid { invoice.voucher_id.clone() } else { None },
            score_delta: if paid { invoice.used_score - invoice.earned_score } else { 0 },
            refund_amount: paid.then_some(invoice.total_price),
            actor: actor.to_string(),
            cancelled_at: self.clock.now(),
        };

        match self.store.cancel_invoice(&cancellation).await? {
            Transition::Applied(cancelled) => {
                info!(invoice_id = %cancelled.id, actor, paid, "ticket cancelled");
                self.notifier.publish(BookingEvent::BookingCancelled {
                    invoice_id: cancelled.id.clone(),
                    account_id: cancelled.account_id.clone(),
                    movie_show_id: cancelled.movie_show_id,
                    seat_ids: cancelled.seat_ids.clone(),
                    refund_amount: cancellation.refund_amount,
                    actor: actor.to_string(),
                });
                let mut messages = vec!["Ticket cancelled".to_string()];
                if let Some(amount) = cancellation.refund_amount {
                    messages.push(format!("Refund of {} VND recorded", amount));
                }
                Ok(CancelOutcome::ok(messages))
            }
            Transition::Unchanged(_) => Ok(CancelOutcome::refused("Ticket already cancelled")),
            Transition::Rejected(status) => Ok(CancelOutcome::refused(format!(
                "Ticket changed to {} meanwhile, please retry",
                status
            ))),
            Transition::Unfunded(reason) => Ok(CancelOutcome::refused(reason)),
            Transition::Missing => Ok(CancelOutcome::refused("Ticket not found")),
        }
    }

    async fn check_cutoff(&self, invoice: &Invoice) -> BookingResult<Option<CancelOutcome>> {
        let Some(cutoff) = self.cutoff else {
            return Ok(None);
        };
        let starts_at = self
            .store
            .show(invoice.movie_show_id)
            .await?
            .and_then(|show| show.starts_at());
        let Some(starts_at) = starts_at else {
            return Ok(None);
        };
        if self.clock.now().naive_utc() + cutoff > starts_at {
            return Ok(Some(CancelOutcome::refused(format!(
                "Tickets can only be cancelled up to {} minutes before the show",
                cutoff.num_minutes()
            ))));
        }
        Ok(None)
    }
}
