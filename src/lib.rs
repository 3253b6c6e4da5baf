pub mod cache;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;
pub mod store;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::cache::CacheService;
use crate::clock::Clock;
use crate::config::{BookingConfig, Config};
use crate::services::{
    BookingService, CancellationService, CleanupService, Notifier, PaymentService, SeatInventory, ShowSchedule,
    VnPay,
};
use crate::store::BookingStore;

// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub inventory: SeatInventory,
    pub schedule: ShowSchedule,
    pub booking: BookingService,
    pub payments: PaymentService,
    pub cancellations: CancellationService,
    pub cleanup: CleanupService,
    pub cache: Option<CacheService>,
    pub jwt_secret: String,
    pub booking_config: BookingConfig,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        cache: Option<CacheService>,
    ) -> Arc<Self> {
        let booking_config = config.booking.clone();
        let hold_ttl = chrono::Duration::seconds(booking_config.hold_ttl_seconds);
        let cutoff = booking_config.cancellation_cutoff_minutes.map(chrono::Duration::minutes);
        let stale_after = chrono::Duration::minutes(booking_config.stale_invoice_minutes);

        let inventory = SeatInventory::new(store.clone());
        let schedule = ShowSchedule::new(store.clone(), clock.clone(), hold_ttl);
        let booking = BookingService::new(store.clone(), clock.clone(), notifier.clone());
        let payments = PaymentService::new(
            store.clone(),
            booking.clone(),
            VnPay::new(config.vnpay.clone()),
            clock.clone(),
        );
        let cancellations = CancellationService::new(store.clone(), clock.clone(), notifier, cutoff);
        let cleanup = CleanupService::new(store, clock, schedule.clone(), booking.clone(), stale_after);

        Arc::new(Self {
            inventory,
            schedule,
            booking,
            payments,
            cancellations,
            cleanup,
            cache,
            jwt_secret: config.jwt.secret.clone(),
            booking_config,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Cinema booking API" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
