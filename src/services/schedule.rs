use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BookingError, BookingResult};
use crate::models::{MovieShow, NewShow, ScheduleSeatStatus, ShowRecord};
use crate::store::{BookingStore, HoldOutcome, ShowInsert};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Showtime {
    pub show_id: i64,
    pub room_id: i64,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionShowtimes {
    pub version_id: i64,
    pub version_name: String,
    pub showtimes: Vec<Showtime>,
}

/// One movie's showtimes on a date, grouped per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieShowtimes {
    pub movie_id: String,
    pub movie_name: String,
    pub poster: String,
    pub versions: Vec<VersionShowtimes>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeatMapEntry {
    pub seat_id: i64,
    pub label: String,
    pub seat_type_id: i64,
    pub status: ScheduleSeatStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HoldResult {
    Held {
        seat_ids: Vec<i64>,
        held_until: DateTime<Utc>,
    },
    /// Someone else holds or booked these seats; nothing was reserved.
    Unavailable { seat_ids: Vec<i64> },
}

/// Accepts `dd/mm/yyyy` and `yyyy-mm-dd`.
pub fn parse_show_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// Accepts `HH:MM`, tolerating trailing seconds.
pub fn parse_show_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

/// Lookup index over movie shows plus the per-show seat holds.
#[derive(Clone)]
pub struct ShowSchedule {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    hold_ttl: Duration,
}

impl ShowSchedule {
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>, hold_ttl: Duration) -> Self {
        Self { store, clock, hold_ttl }
    }

    /// Looks a show up by its public slot. `date` is `DD/MM/YYYY` or
    /// `YYYY-MM-DD`; `time` is `HH:MM`.
    pub async fn find_show(
        &self,
        movie_id: &str,
        date: &str,
        time: &str,
        version_id: i64,
    ) -> BookingResult<MovieShow> {
        if self.store.movie(movie_id).await?.is_none() {
            return Err(BookingError::not_found(format!("Movie {} not found", movie_id)));
        }
        let date = parse_show_date(date)
            .ok_or_else(|| BookingError::validation(format!("Invalid show date '{}'", date)))?;
        let time = parse_show_time(time)
            .ok_or_else(|| BookingError::validation(format!("Invalid show time '{}'", time)))?;

        self.store
            .find_show(movie_id, date, time, version_id)
            .await?
            .ok_or_else(|| BookingError::not_found("No show matches the requested slot"))
    }

    /// Shows on `date` grouped per movie, skipping rooms closed that day.
    pub async fn list_shows_for_date(&self, date: NaiveDate) -> BookingResult<Vec<MovieShowtimes>> {
        let records = self.store.shows_on(date).await?;
        let total = records.len();
        let listing = group_showtimes(records, date);
        debug!(%date, total, movies = listing.len(), "showtimes listed");
        Ok(listing)
    }

    /// Schedules a show after checking the room is open that day and that the
    /// movie and version exist. A room already busy during the running window
    /// is a conflict.
    pub async fn create_show(&self, show: NewShow) -> BookingResult<MovieShow> {
        let room = self
            .store
            .room(show.room_id)
            .await?
            .ok_or_else(|| BookingError::validation(format!("Unknown room {}", show.room_id)))?;
        if !room.is_open_on(show.show_date) {
            return Err(BookingError::validation(format!(
                "Room {} is not available on {}",
                room.name, show.show_date
            )));
        }
        let movie = self
            .store
            .movie(&show.movie_id)
            .await?
            .ok_or_else(|| BookingError::validation(format!("Unknown movie {}", show.movie_id)))?;
        if self.store.version(show.version_id).await?.is_none() {
            return Err(BookingError::validation(format!("Unknown version {}", show.version_id)));
        }

        match self.store.insert_show(&show, movie.duration_minutes).await? {
            ShowInsert::Created(created) => {
                info!(show_id = created.id, room_id = created.room_id, "show scheduled");
                Ok(created)
            }
            ShowInsert::Overlaps(existing) => Err(BookingError::conflict(format!(
                "Room {} is already busy with show {} in that window",
                room.name, existing
            ))),
        }
    }

    pub async fn show(&self, show_id: i64) -> BookingResult<MovieShow> {
        self.require_show(show_id).await
    }

    /// Seat statuses for one show as members see them; lapsed holds read as available.
    pub async fn seat_map(&self, show_id: i64) -> BookingResult<Vec<SeatMapEntry>> {
        let show = self.require_show(show_id).await?;
        let now = self.clock.now();
        let statuses: BTreeMap<i64, ScheduleSeatStatus> = self
            .store
            .schedule_seats(show_id)
            .await?
            .into_iter()
            .map(|s| (s.seat_id, s.effective_status(now)))
            .collect();

        Ok(self
            .store
            .seats_in_room(show.room_id)
            .await?
            .into_iter()
            .filter_map(|seat| {
                statuses.get(&seat.id).map(|status| SeatMapEntry {
                    seat_id: seat.id,
                    label: seat.label,
                    seat_type_id: seat.seat_type_id,
                    status: *status,
                })
            })
            .collect())
    }

    /// Reserves every requested seat for `account_id` or none of them.
    pub async fn hold_seats(
        &self,
        show_id: i64,
        seat_ids: &[i64],
        account_id: &str,
    ) -> BookingResult<HoldResult> {
        let seat_ids = distinct(seat_ids);
        if seat_ids.is_empty() {
            return Err(BookingError::validation("Select at least one seat"));
        }
        self.require_show(show_id).await?;

        let now = self.clock.now();
        let until = now + self.hold_ttl;
        match self
            .store
            .hold_seats(show_id, &seat_ids, account_id, now, until)
            .await?
        {
            HoldOutcome::Held(_) => {
                info!(show_id, account_id, seats = ?seat_ids, "seats held");
                Ok(HoldResult::Held { seat_ids, held_until: until })
            }
            HoldOutcome::Unavailable(taken) => {
                debug!(show_id, account_id, seats = ?taken, "hold lost, seats taken");
                Ok(HoldResult::Unavailable { seat_ids: taken })
            }
            HoldOutcome::Unknown(unknown) => Err(BookingError::not_found(format!(
                "Seats {:?} do not belong to show {}",
                unknown, show_id
            ))),
        }
    }

    /// Gives back the caller's own uninvoiced holds. Returns how many were freed.
    pub async fn release_seats(&self, show_id: i64, seat_ids: &[i64], account_id: &str) -> BookingResult<usize> {
        let seat_ids = distinct(seat_ids);
        let released = self.store.release_holds(show_id, &seat_ids, account_id).await?;
        info!(show_id, account_id, released, "seat holds released");
        Ok(released)
    }

    /// Returns how many holds were freed.
    pub async fn sweep_expired_holds(&self) -> BookingResult<usize> {
        let released = self.store.release_expired_holds(self.clock.now()).await?;
        if released > 0 {
            info!(released, "expired seat holds released");
        }
        Ok(released)
    }

    async fn require_show(&self, show_id: i64) -> BookingResult<MovieShow> {
        self.store
            .show(show_id)
            .await?
            .ok_or_else(|| BookingError::not_found(format!("Show {} not found", show_id)))
    }
}

fn distinct(ids: &[i64]) -> Vec<i64> {
    let mut out: Vec<i64> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

/// Drops shows that cannot be sold on `date` and groups the rest
/// movie → version → time.
fn group_showtimes(records: Vec<ShowRecord>, date: NaiveDate) -> Vec<MovieShowtimes> {
    let mut movies: BTreeMap<String, (MovieShowtimes, BTreeMap<i64, Vec<(NaiveTime, Showtime)>>)> =
        BTreeMap::new();

    for record in records {
        let ShowRecord { show, movie, room, version } = record;
        let Some(room) = room else {
            warn!(show_id = show.id, room_id = show.room_id, "show references a missing room");
            continue;
        };
        if !room.is_open_on(date) {
            continue;
        }
        let (Some(movie), Some(time)) = (movie, show.show_time) else {
            continue;
        };

        let entry = movies.entry(movie.id.clone()).or_insert_with(|| {
            (
                MovieShowtimes {
                    movie_id: movie.id.clone(),
                    movie_name: movie.display_name().to_string(),
                    poster: movie.poster().to_string(),
                    versions: Vec::new(),
                },
                BTreeMap::new(),
            )
        });
        let version_name = version.map_or_else(|| "Unknown".to_string(), |v| v.name);
        entry.1.entry(show.version_id).or_default().push((
            time,
            Showtime {
                show_id: show.id,
                room_id: show.room_id,
                time: time.format("%H:%M").to_string(),
            },
        ));
        if !entry.0.versions.iter().any(|v| v.version_id == show.version_id) {
            entry.0.versions.push(VersionShowtimes {
                version_id: show.version_id,
                version_name,
                showtimes: Vec::new(),
            });
        }
    }

    let mut listing: Vec<MovieShowtimes> = movies
        .into_values()
        .map(|(mut movie, mut by_version)| {
            movie.versions.sort_by_key(|v| v.version_id);
            for version in &mut movie.versions {
                if let Some(mut times) = by_version.remove(&version.version_id) {
                    times.sort_by_key(|(time, showtime)| (*time, showtime.show_id));
                    version.showtimes = times.into_iter().map(|(_, s)| s).collect();
                }
            }
            movie
        })
        .collect();
    listing.sort_by(|a, b| a.movie_name.cmp(&b.movie_name).then_with(|| a.movie_id.cmp(&b.movie_id)));
    listing
}
