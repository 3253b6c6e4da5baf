use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::booking::BookingService;
use super::schedule::ShowSchedule;
use crate::clock::Clock;
use crate::error::BookingResult;
use crate::store::BookingStore;

/// Periodic housekeeping: lapsed seat holds and invoices nobody paid for.
#[derive(Clone)]
pub struct CleanupService {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    schedule: ShowSchedule,
    booking: BookingService,
    stale_after: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub released_holds: usize,
    pub abandoned_invoices: usize,
}

impl CleanupStats {
    pub fn total(&self) -> usize {
        self.released_holds + self.abandoned_invoices
    }
}

impl CleanupService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        schedule: ShowSchedule,
        booking: BookingService,
        stale_after: Duration,
    ) -> Self {
        Self { store, clock, schedule, booking, stale_after }
    }

    /// One sweep: expired holds first, then incomplete invoices older than
    /// `stale_after`. A failing invoice is logged and skipped.
    pub async fn run_once(&self) -> BookingResult<CleanupStats> {
        let released_holds = self.schedule.sweep_expired_holds().await?;

        let cutoff = self.clock.now() - self.stale_after;
        let mut abandoned_invoices = 0;
        for invoice_id in self.store.stale_incomplete_invoices(cutoff).await? {
            match self.booking.abandon_invoice(&invoice_id, "cleanup").await {
                Ok(true) => abandoned_invoices += 1,
                Ok(false) => {}
                Err(e) => error!(%invoice_id, "failed to abandon stale invoice: {:?}", e),
            }
        }

        let stats = CleanupStats { released_holds, abandoned_invoices };
        if stats.total() > 0 {
            info!(released_holds, abandoned_invoices, "cleanup pass finished");
        }
        Ok(stats)
    }

    /// Runs `run_once` every `interval` until the task is aborted.
    pub fn spawn(self, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once().await {
                    error!("cleanup pass failed: {:?}", e);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Caller, InvoiceStatus};
    use crate::services::booking::Checkout;
    use crate::services::fixtures::{seeded, SHOW_ID};

    #[tokio::test]
    async fn releases_holds_and_abandons_stale_invoices() {
        let fx = seeded();
        let schedule = ShowSchedule::new(fx.store.clone(), fx.clock.clone(), Duration::minutes(10));
        let booking = BookingService::new(fx.store.clone(), fx.clock.clone(), fx.notifier.clone());
        let cleanup = CleanupService::new(
            fx.store.clone(),
            fx.clock.clone(),
            schedule.clone(),
            booking.clone(),
            Duration::minutes(30),
        );

        schedule.hold_seats(SHOW_ID, &[1], "bob").await.unwrap();
        schedule.hold_seats(SHOW_ID, &[2], "alice").await.unwrap();
        let invoice = booking
            .create_invoice(
                &Caller::member("alice"),
                Checkout { show_id: SHOW_ID, seat_ids: vec![2], ..Checkout::default() },
            )
            .await
            .unwrap();

        assert_eq!(cleanup.run_once().await.unwrap(), CleanupStats::default());

        fx.clock.advance(Duration::minutes(15));
        let stats = cleanup.run_once().await.unwrap();
        assert_eq!(stats, CleanupStats { released_holds: 1, abandoned_invoices: 0 });

        fx.clock.advance(Duration::minutes(20));
        let stats = cleanup.run_once().await.unwrap();
        assert_eq!(stats, CleanupStats { released_holds: 0, abandoned_invoices: 1 });
        let stored = fx.store.invoice(&invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Cancelled);
    }
}
