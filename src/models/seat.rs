use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical state of a seat in a room, independent of any show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Available,
    Held,
    Booked,
    Disabled,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Held => "held",
            SeatStatus::Booked => "booked",
            SeatStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(SeatStatus::Available),
            "held" => Ok(SeatStatus::Held),
            "booked" => Ok(SeatStatus::Booked),
            "disabled" => Ok(SeatStatus::Disabled),
            other => Err(format!("unknown seat status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    pub id: i64,
    pub room_id: i64,
    pub label: String,
    pub seat_type_id: i64,
    pub status: SeatStatus,
}

impl Seat {
    /// Splits a label such as `B12` into its row prefix and seat number.
    pub fn row_and_number(&self) -> Option<(&str, u32)> {
        let split = self.label.find(|c: char| c.is_ascii_digit())?;
        let (row, number) = self.label.split_at(split);
        if row.is_empty() || !row.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        number.parse().ok().map(|n| (row, n))
    }

    /// Two seats are adjacent when they share a room and row and their numbers differ by one.
    pub fn is_adjacent_to(&self, other: &Seat) -> bool {
        if self.room_id != other.room_id {
            return false;
        }
        match (self.row_and_number(), other.row_and_number()) {
            (Some((row_a, a)), Some((row_b, b))) => row_a == row_b && a.abs_diff(b) == 1,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatType {
    pub id: i64,
    pub name: String,
    pub price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatTypeUpdate {
    pub seat_id: i64,
    pub seat_type_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoupleSeat {
    pub id: i64,
    pub first_seat_id: i64,
    pub second_seat_id: i64,
}

impl CoupleSeat {
    pub fn contains(&self, seat_id: i64) -> bool {
        self.first_seat_id == seat_id || self.second_seat_id == seat_id
    }

    pub fn matches(&self, a: i64, b: i64) -> bool {
        (self.first_seat_id == a && self.second_seat_id == b)
            || (self.first_seat_id == b && self.second_seat_id == a)
    }
}
