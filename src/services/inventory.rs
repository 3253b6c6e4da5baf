use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{BookingError, BookingResult};
use crate::models::{CoupleSeat, Seat, SeatTypeUpdate};
use crate::store::{BookingStore, CoupleInsert};

/// Seat id the back-office sends for rows that have not been created yet.
const UNASSIGNED_SEAT_ID: i64 = 0;

/// Room seat grid: seat types and couple pairings.
#[derive(Clone)]
pub struct SeatInventory {
    store: Arc<dyn BookingStore>,
}

impl SeatInventory {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }

    /// Seats of an existing room in id order; `NotFound` for an unknown room.
    pub async fn get_seats_by_room(&self, room_id: i64) -> BookingResult<Vec<Seat>> {
        if self.store.room(room_id).await?.is_none() {
            return Err(BookingError::not_found(format!("Room {} not found", room_id)));
        }
        Ok(self.store.seats_in_room(room_id).await?)
    }

    /// Changes one seat's type. Unknown seats are `NotFound`, unknown types a validation error.
    pub async fn assign_seat_type(&self, seat_id: i64, seat_type_id: i64) -> BookingResult<()> {
        if self.store.seats_by_ids(&[seat_id]).await?.is_empty() {
            return Err(BookingError::not_found(format!("Seat {} not found", seat_id)));
        }
        self.ensure_seat_type(seat_type_id).await?;
        self.store
            .save_seat_types(&[SeatTypeUpdate { seat_id, seat_type_id }])
            .await?;
        info!(seat_id, seat_type_id, "seat type assigned");
        Ok(())
    }

    /// Applies every update that targets a known seat in one write and
    /// returns how many seats changed. Unassigned (id 0) and unknown seats are skipped.
    pub async fn assign_seat_types(&self, updates: &[SeatTypeUpdate]) -> BookingResult<usize> {
        if updates.is_empty() {
            return Err(BookingError::validation("No seat type updates supplied"));
        }

        let candidate_ids: Vec<i64> = updates
            .iter()
            .map(|u| u.seat_id)
            .filter(|id| *id != UNASSIGNED_SEAT_ID)
            .collect();
        let known: Vec<i64> = self
            .store
            .seats_by_ids(&candidate_ids)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let type_ids: Vec<i64> = self.store.seat_types().await?.into_iter().map(|t| t.id).collect();

        let valid: Vec<SeatTypeUpdate> = updates
            .iter()
            .filter(|u| known.contains(&u.seat_id) && type_ids.contains(&u.seat_type_id))
            .cloned()
            .collect();
        let skipped = updates.len() - valid.len();
        if skipped > 0 {
            warn!(skipped, "seat type updates skipped for unknown seats or types");
        }
        if valid.is_empty() {
            return Ok(0);
        }

        let updated = self.store.save_seat_types(&valid).await?;
        info!(updated, "seat types assigned");
        Ok(updated)
    }

    /// Single-pair form of [`Self::create_couple_seats_batch`].
    pub async fn create_couple_seat(&self, first: i64, second: i64) -> BookingResult<CoupleSeat> {
        let mut created = self.create_couple_seats_batch(&[(first, second)]).await?;
        created
            .pop()
            .ok_or_else(|| BookingError::validation("No couple seat created"))
    }

    /// Unpairs exactly two seats given in either order.
    pub async fn delete_couple_seat(&self, seat_ids: &[i64]) -> BookingResult<()> {
        let [first, second] = seat_ids else {
            return Err(BookingError::validation(
                "Exactly two seat ids are required to delete a couple seat",
            ));
        };
        if !self.store.delete_couple_seat(*first, *second).await? {
            return Err(BookingError::not_found(format!(
                "No couple seat for seats {} and {}",
                first, second
            )));
        }
        info!(first, second, "couple seat removed");
        Ok(())
    }

    /// Validates every pair, then persists all of them or none.
    ///
    /// A seat that is already paired fails the whole batch with a conflict,
    /// ahead of any per-pair validation error.
    pub async fn create_couple_seats_batch(&self, pairs: &[(i64, i64)]) -> BookingResult<Vec<CoupleSeat>> {
        if pairs.is_empty() {
            return Err(BookingError::validation("No couple seats supplied"));
        }

        let ids: Vec<i64> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
        if let Some(&seat_id) = self.store.coupled_seat_ids(&ids).await?.first() {
            warn!(seat_id, "couple seat rejected, seat already paired");
            return Err(already_coupled());
        }
        let seats: HashMap<i64, Seat> = self
            .store
            .seats_by_ids(&ids)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        for &(first, second) in pairs {
            validate_pair(&seats, first, second)?;
        }

        match self.store.insert_couple_seats(pairs).await? {
            CoupleInsert::Created(created) => {
                info!(count = created.len(), "couple seats created");
                Ok(created)
            }
            CoupleInsert::AlreadyCoupled(seat_id) => {
                warn!(seat_id, "couple seat rejected, seat already paired");
                Err(already_coupled())
            }
        }
    }

    async fn ensure_seat_type(&self, seat_type_id: i64) -> BookingResult<()> {
        let known = self
            .store
            .seat_types()
            .await?
            .iter()
            .any(|t| t.id == seat_type_id);
        if known {
            Ok(())
        } else {
            Err(BookingError::validation(format!("Unknown seat type {}", seat_type_id)))
        }
    }
}

fn already_coupled() -> BookingError {
    BookingError::conflict("Seats are already coupled")
}

fn validate_pair(seats: &HashMap<i64, Seat>, first: i64, second: i64) -> BookingResult<()> {
    if first == second {
        return Err(BookingError::validation("A seat cannot be coupled with itself"));
    }
    let (Some(a), Some(b)) = (seats.get(&first), seats.get(&second)) else {
        let missing = if seats.contains_key(&first) { second } else { first };
        return Err(BookingError::not_found(format!("Seat {} not found", missing)));
    };
    if a.room_id != b.room_id {
        return Err(BookingError::validation("Couple seats must be in the same room"));
    }
    if !a.is_adjacent_to(b) {
        return Err(BookingError::validation(format!(
            "Seats {} and {} are not adjacent",
            a.label, b.label
        )));
    }
    Ok(())
}
