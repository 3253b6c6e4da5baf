pub mod booking;
pub mod cancellation;
pub mod circuit_breaker;
pub mod cleanup;
pub mod inventory;
pub mod notifier;
pub mod payment;
pub mod schedule;
pub mod vnpay;

#[cfg(test)]
pub(crate) mod fixtures;

pub use booking::{BookingService, Checkout, CompletionResult};
pub use cancellation::{CancelOutcome, CancellationService, RefundReport};
pub use cleanup::{CleanupService, CleanupStats};
pub use inventory::SeatInventory;
pub use notifier::{BookingEvent, HubNotifier, NoopNotifier, Notifier, RecordingNotifier};
pub use payment::{IpnResponse, PaymentService, ReturnOutcome};
pub use schedule::{HoldResult, MovieShowtimes, SeatMapEntry, ShowSchedule};
pub use vnpay::{VnPay, VnPayParams};
