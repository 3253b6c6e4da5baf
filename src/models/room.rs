use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Disabled,
}

impl RoomStatus {
    pub const DISABLED_ID: i32 = 3;

    // Status ids come from the back-office; only 3 means the room is closed.
    pub fn from_status_id(id: i32) -> Self {
        if id == Self::DISABLED_ID {
            RoomStatus::Disabled
        } else {
            RoomStatus::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CinemaRoom {
    pub id: i64,
    pub name: String,
    pub length: i32,
    pub width: i32,
    pub status: RoomStatus,
    pub unavailable_until: Option<NaiveDateTime>,
}

impl CinemaRoom {
    /// A room can host shows on `date` unless it is disabled or closed
    /// by an unavailability window reaching into that day.
    pub fn is_open_on(&self, date: NaiveDate) -> bool {
        if self.status == RoomStatus::Disabled {
            return false;
        }
        match self.unavailable_until {
            Some(until) => until < date.and_time(chrono::NaiveTime::MIN),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(status: RoomStatus, unavailable_until: Option<NaiveDateTime>) -> CinemaRoom {
        CinemaRoom {
            id: 1,
            name: "Room 1".to_string(),
            length: 10,
            width: 12,
            status,
            unavailable_until,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn disabled_room_is_never_open() {
        assert!(!room(RoomStatus::Disabled, None).is_open_on(date(2024, 1, 1)));
    }

    #[test]
    fn unavailability_window_closes_covered_days() {
        let until = date(2024, 1, 10).and_hms_opt(12, 0, 0);
        let r = room(RoomStatus::Active, until);
        assert!(!r.is_open_on(date(2024, 1, 5)));
        assert!(!r.is_open_on(date(2024, 1, 10)));
        assert!(r.is_open_on(date(2024, 1, 11)));
    }

    #[test]
    fn only_status_three_disables() {
        assert_eq!(RoomStatus::from_status_id(3), RoomStatus::Disabled);
        assert_eq!(RoomStatus::from_status_id(1), RoomStatus::Active);
        assert_eq!(RoomStatus::from_status_id(2), RoomStatus::Active);
    }
}
