use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::CinemaRoom;

pub const DEFAULT_POSTER: &str = "/images/default-poster.jpg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub name: Option<String>,
    pub large_image: Option<String>,
    pub small_image: Option<String>,
    pub duration_minutes: i32,
}

impl Movie {
    /// Large image first, then small image, then the placeholder.
    pub fn poster(&self) -> &str {
        self.large_image
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.small_image.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(DEFAULT_POSTER)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieShow {
    pub id: i64,
    pub movie_id: Option<String>,
    pub room_id: i64,
    pub show_date: NaiveDate,
    pub show_time: Option<NaiveTime>,
    pub version_id: i64,
}

impl MovieShow {
    pub fn starts_at(&self) -> Option<NaiveDateTime> {
        self.show_time.map(|t| self.show_date.and_time(t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewShow {
    pub movie_id: String,
    pub room_id: i64,
    pub show_date: NaiveDate,
    pub show_time: NaiveTime,
    pub version_id: i64,
}

impl NewShow {
    pub fn window(&self, duration_minutes: i32) -> (NaiveDateTime, NaiveDateTime) {
        let start = self.show_date.and_time(self.show_time);
        (start, start + Duration::minutes(duration_minutes.into()))
    }
}

/// Joined view of a show used by date listings; every reference may be dangling.
#[derive(Debug, Clone)]
pub struct ShowRecord {
    pub show: MovieShow,
    pub movie: Option<Movie>,
    pub room: Option<CinemaRoom>,
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSeatStatus {
    Available,
    Held,
    Booked,
}

impl ScheduleSeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleSeatStatus::Available => "available",
            ScheduleSeatStatus::Held => "held",
            ScheduleSeatStatus::Booked => "booked",
        }
    }
}

impl fmt::Display for ScheduleSeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleSeatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ScheduleSeatStatus::Available),
            "held" => Ok(ScheduleSeatStatus::Held),
            "booked" => Ok(ScheduleSeatStatus::Booked),
            other => Err(format!("unknown schedule seat status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSeat {
    pub show_id: i64,
    pub seat_id: i64,
    pub status: ScheduleSeatStatus,
    pub held_by: Option<String>,
    pub held_until: Option<DateTime<Utc>>,
    pub invoice_id: Option<String>,
    pub version: i64,
}

impl ScheduleSeat {
    pub fn available(show_id: i64, seat_id: i64) -> Self {
        Self {
            show_id,
            seat_id,
            status: ScheduleSeatStatus::Available,
            held_by: None,
            held_until: None,
            invoice_id: None,
            version: 0,
        }
    }

    /// Holds that are not attached to an invoice lapse once `held_until` passes.
    pub fn hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleSeatStatus::Held
            && self.invoice_id.is_none()
            && self.held_until.map_or(true, |until| until <= now)
    }

    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleSeatStatus::Available || self.hold_expired(now)
    }

    pub fn effective_status(&self, now: DateTime<Utc>) -> ScheduleSeatStatus {
        if self.hold_expired(now) {
            ScheduleSeatStatus::Available
        } else {
            self.status
        }
    }

    pub fn is_held_by(&self, account_id: &str, now: DateTime<Utc>) -> bool {
        self.status == ScheduleSeatStatus::Held
            && self.invoice_id.is_none()
            && self.held_by.as_deref() == Some(account_id)
            && !self.hold_expired(now)
    }

    pub fn reset(&mut self) {
        self.status = ScheduleSeatStatus::Available;
        self.held_by = None;
        self.held_until = None;
        self.invoice_id = None;
        self.version += 1;
    }
}
