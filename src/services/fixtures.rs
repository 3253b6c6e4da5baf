//! Seeded in-memory world shared by the service tests.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;

use super::notifier::RecordingNotifier;
use crate::clock::FixedClock;
use crate::models::{
    Account, CinemaRoom, Movie, MovieShow, Role, RoomStatus, Seat, SeatStatus, SeatType, Version,
    Voucher,
};
use crate::store::MemoryStore;

pub const SHOW_ID: i64 = 1;
pub const STANDARD_PRICE: i64 = 80_000;
pub const VIP_PRICE: i64 = 100_000;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

pub fn show_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 10).unwrap()
}

pub fn at(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
}

fn seat(id: i64, room_id: i64, label: &str, seat_type_id: i64, status: SeatStatus) -> Seat {
    Seat {
        id,
        room_id,
        label: label.to_string(),
        seat_type_id,
        status,
    }
}

pub fn room(id: i64, status: RoomStatus) -> CinemaRoom {
    CinemaRoom {
        id,
        name: format!("Room {}", id),
        length: 10,
        width: 12,
        status,
        unavailable_until: None,
    }
}

pub fn movie(id: &str, name: Option<&str>, duration_minutes: i32) -> Movie {
    Movie {
        id: id.to_string(),
        name: name.map(str::to_string),
        large_image: None,
        small_image: None,
        duration_minutes,
    }
}

pub fn account(id: &str, role: Role, score: i64, rank_percent: i32) -> Account {
    Account {
        id: id.to_string(),
        role,
        score,
        rank_percent,
    }
}

/// Room 1 (active): A1..A4 standard, B1 VIP, B2 disabled. Room 2: A1.
/// Show 1 plays M1 (150 min, 2D) in room 1 on 2025-06-10 at 19:00.
pub fn seeded() -> Fixture {
    let store = MemoryStore::new();

    store.add_room(room(1, RoomStatus::Active));
    store.add_room(room(2, RoomStatus::Active));
    store.add_seat_type(SeatType { id: 1, name: "Standard".to_string(), price: STANDARD_PRICE });
    store.add_seat_type(SeatType { id: 2, name: "VIP".to_string(), price: VIP_PRICE });
    for (id, label) in [(1, "A1"), (2, "A2"), (3, "A3"), (4, "A4")] {
        store.add_seat(seat(id, 1, label, 1, SeatStatus::Available));
    }
    store.add_seat(seat(5, 1, "B1", 2, SeatStatus::Available));
    store.add_seat(seat(7, 1, "B2", 1, SeatStatus::Disabled));
    store.add_seat(seat(6, 2, "A1", 1, SeatStatus::Available));

    let mut dune = movie("M1", Some("Dune"), 150);
    dune.large_image = Some("/images/dune-large.jpg".to_string());
    store.add_movie(dune);
    store.add_movie(movie("M2", None, 90));
    store.add_version(Version { id: 1, name: "2D".to_string() });
    store.add_version(Version { id: 2, name: "3D".to_string() });
    store.add_show(MovieShow {
        id: SHOW_ID,
        movie_id: Some("M1".to_string()),
        room_id: 1,
        show_date: show_date(),
        show_time: Some(at(19, 0)),
        version_id: 1,
    });

    store.add_account(account("alice", Role::Member, 50_000, 10));
    store.add_account(account("bob", Role::Member, 0, 5));
    store.add_account(account("admin", Role::Admin, 0, 0));
    store.add_account(account("staff", Role::Employee, 0, 0));
    store.add_voucher(Voucher {
        id: "V1".to_string(),
        account_id: "alice".to_string(),
        value: 20_000,
        is_used: false,
    });
    store.add_voucher(Voucher {
        id: "V2".to_string(),
        account_id: "bob".to_string(),
        value: 10_000,
        is_used: false,
    });

    Fixture {
        store: Arc::new(store),
        clock: Arc::new(FixedClock::new(t0())),
        notifier: Arc::new(RecordingNotifier::new()),
    }
}
