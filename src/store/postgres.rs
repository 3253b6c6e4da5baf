use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::{postgres::PgRow, types::Json, Row};
use std::str::FromStr;

use super::{
    BookingStore, Cancellation, Completion, CoupleInsert, HoldOutcome, InvoiceInsert, ShowInsert,
    StoreError, StoreResult, Transition,
};
use crate::database::Database;
use crate::models::{
    Account, CinemaRoom, CoupleSeat, FoodLine, Invoice, InvoiceStatus, Movie, MovieShow, NewShow,
    RefundRecord, RoomStatus, ScheduleSeat, Seat, SeatType, SeatTypeUpdate, ShowRecord, Version,
    Voucher,
};

const SEAT_COLUMNS: &str = "id, room_id, label, seat_type_id, status";
const SHOW_COLUMNS: &str = "id, movie_id, room_id, show_date, show_time, version_id";
const SCHEDULE_COLUMNS: &str = "show_id, seat_id, status, held_by, held_until, invoice_id, version";
const INVOICE_COLUMNS: &str = "id, account_id, movie_show_id, seat_ids, seat_labels, total_price, \
     status, cancel, voucher_id, used_score, earned_score, food_lines, booking_date, \
     completed_at, cancelled_at, payment_ref";

/// Postgres backend. Conditional transitions lock the affected rows with
/// `SELECT ... FOR UPDATE` and bump the `version` column of schedule seats.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/* ---------- row mapping ---------- */

fn parse<T: FromStr<Err = String>>(value: String) -> StoreResult<T> {
    value.parse().map_err(StoreError::Corrupt)
}

fn seat_from_row(row: &PgRow) -> StoreResult<Seat> {
    Ok(Seat {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        label: row.try_get("label")?,
        seat_type_id: row.try_get("seat_type_id")?,
        status: parse(row.try_get("status")?)?,
    })
}

fn room_from_row(row: &PgRow) -> StoreResult<CinemaRoom> {
    Ok(CinemaRoom {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        length: row.try_get("length")?,
        width: row.try_get("width")?,
        status: RoomStatus::from_status_id(row.try_get("status_id")?),
        unavailable_until: row.try_get("unavailable_until")?,
    })
}

fn movie_from_row(row: &PgRow) -> StoreResult<Movie> {
    Ok(Movie {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        large_image: row.try_get("large_image")?,
        small_image: row.try_get("small_image")?,
        duration_minutes: row.try_get("duration_minutes")?,
    })
}

fn show_from_row(row: &PgRow) -> StoreResult<MovieShow> {
    Ok(MovieShow {
        id: row.try_get("id")?,
        movie_id: row.try_get("movie_id")?,
        room_id: row.try_get("room_id")?,
        show_date: row.try_get("show_date")?,
        show_time: row.try_get("show_time")?,
        version_id: row.try_get("version_id")?,
    })
}

fn schedule_seat_from_row(row: &PgRow) -> StoreResult<ScheduleSeat> {
    Ok(ScheduleSeat {
        show_id: row.try_get("show_id")?,
        seat_id: row.try_get("seat_id")?,
        status: parse(row.try_get("status")?)?,
        held_by: row.try_get("held_by")?,
        held_until: row.try_get("held_until")?,
        invoice_id: row.try_get("invoice_id")?,
        version: row.try_get("version")?,
    })
}

fn invoice_from_row(row: &PgRow) -> StoreResult<Invoice> {
    let food_lines: Json<Vec<FoodLine>> = row.try_get("food_lines")?;
    Ok(Invoice {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        movie_show_id: row.try_get("movie_show_id")?,
        seat_ids: row.try_get("seat_ids")?,
        seat_labels: row.try_get("seat_labels")?,
        total_price: row.try_get("total_price")?,
        status: parse(row.try_get("status")?)?,
        cancel: row.try_get("cancel")?,
        voucher_id: row.try_get("voucher_id")?,
        used_score: row.try_get("used_score")?,
        earned_score: row.try_get("earned_score")?,
        food_lines: food_lines.0,
        booking_date: row.try_get("booking_date")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        payment_ref: row.try_get("payment_ref")?,
    })
}

// LEFT JOINed columns come back prefixed and nullable.
fn show_record_from_row(row: &PgRow) -> StoreResult<ShowRecord> {
    let movie = match row.try_get::<Option<String>, _>("m_id")? {
        Some(id) => Some(Movie {
            id,
            name: row.try_get("m_name")?,
            large_image: row.try_get("m_large_image")?,
            small_image: row.try_get("m_small_image")?,
            duration_minutes: row.try_get::<Option<i32>, _>("m_duration")?.unwrap_or(0),
        }),
        None => None,
    };
    let room = match row.try_get::<Option<i64>, _>("r_id")? {
        Some(id) => Some(CinemaRoom {
            id,
            name: row.try_get::<Option<String>, _>("r_name")?.unwrap_or_default(),
            length: row.try_get::<Option<i32>, _>("r_length")?.unwrap_or(0),
            width: row.try_get::<Option<i32>, _>("r_width")?.unwrap_or(0),
            status: RoomStatus::from_status_id(row.try_get::<Option<i32>, _>("r_status_id")?.unwrap_or(1)),
            unavailable_until: row.try_get("r_unavailable_until")?,
        }),
        None => None,
    };
    let version = match row.try_get::<Option<i64>, _>("v_id")? {
        Some(id) => Some(Version {
            id,
            name: row.try_get::<Option<String>, _>("v_name")?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(ShowRecord {
        show: show_from_row(row)?,
        movie,
        room,
        version,
    })
}

#[async_trait]
impl BookingStore for PgStore {
    /* ---------- rooms & seats ---------- */

    async fn room(&self, room_id: i64) -> StoreResult<Option<CinemaRoom>> {
        let row = sqlx::query(
            "SELECT id, name, length, width, status_id, unavailable_until FROM cinema_rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn seats_in_room(&self, room_id: i64) -> StoreResult<Vec<Seat>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM seats WHERE room_id = $1 ORDER BY id",
            SEAT_COLUMNS
        ))
        .bind(room_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(seat_from_row).collect()
    }

    async fn seats_by_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<Seat>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM seats WHERE id = ANY($1) ORDER BY id",
            SEAT_COLUMNS
        ))
        .bind(seat_ids)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(seat_from_row).collect()
    }

    async fn seat_types(&self) -> StoreResult<Vec<SeatType>> {
        let rows: Vec<(i64, String, i64)> =
            sqlx::query_as("SELECT id, name, price FROM seat_types ORDER BY id")
                .fetch_all(&self.db.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, price)| SeatType { id, name, price })
            .collect())
    }

    async fn save_seat_types(&self, updates: &[SeatTypeUpdate]) -> StoreResult<usize> {
        let seat_ids: Vec<i64> = updates.iter().map(|u| u.seat_id).collect();
        let type_ids: Vec<i64> = updates.iter().map(|u| u.seat_type_id).collect();
        let result = sqlx::query(
            r#"
            UPDATE seats s
            SET seat_type_id = u.type_id
            FROM UNNEST($1::bigint[], $2::bigint[]) AS u(seat_id, type_id)
            WHERE s.id = u.seat_id
            "#,
        )
        .bind(&seat_ids)
        .bind(&type_ids)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn coupled_seat_ids(&self, seat_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT seat_id FROM couple_seat_members WHERE seat_id = ANY($1) ORDER BY seat_id",
        )
        .bind(seat_ids)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_couple_seats(&self, pairs: &[(i64, i64)]) -> StoreResult<CoupleInsert> {
        let mut tx = self.db.pool.begin().await?;
        let mut created = Vec::with_capacity(pairs.len());

        for &(first, second) in pairs {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO couple_seats (first_seat_id, second_seat_id) VALUES ($1, $2) RETURNING id",
            )
            .bind(first)
            .bind(second)
            .fetch_one(&mut *tx)
            .await?;

            // couple_seat_members.seat_id is the primary key, so a second pairing loses here
            for seat_id in [first, second] {
                let inserted = sqlx::query(
                    "INSERT INTO couple_seat_members (seat_id, couple_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(seat_id)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if inserted == 0 {
                    tx.rollback().await?;
                    return Ok(CoupleInsert::AlreadyCoupled(seat_id));
                }
            }

            created.push(CoupleSeat {
                id,
                first_seat_id: first,
                second_seat_id: second,
            });
        }

        tx.commit().await?;
        Ok(CoupleInsert::Created(created))
    }

    async fn delete_couple_seat(&self, first: i64, second: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM couple_seats
            WHERE (first_seat_id = $1 AND second_seat_id = $2)
               OR (first_seat_id = $2 AND second_seat_id = $1)
            "#,
        )
        .bind(first)
        .bind(second)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /* ---------- schedule ---------- */

    async fn movie(&self, movie_id: &str) -> StoreResult<Option<Movie>> {
        let row = sqlx::query(
            "SELECT id, name, large_image, small_image, duration_minutes FROM movies WHERE id = $1",
        )
        .bind(movie_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(movie_from_row).transpose()
    }

    async fn version(&self, version_id: i64) -> StoreResult<Option<Version>> {
        let row: Option<(i64, String)> = sqlx::query_as("SELECT id, name FROM versions WHERE id = $1")
            .bind(version_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.map(|(id, name)| Version { id, name }))
    }

    async fn show(&self, show_id: i64) -> StoreResult<Option<MovieShow>> {
        let row = sqlx::query(&format!("SELECT {} FROM movie_shows WHERE id = $1", SHOW_COLUMNS))
            .bind(show_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(show_from_row).transpose()
    }

    async fn find_show(
        &self,
        movie_id: &str,
        date: NaiveDate,
        time: NaiveTime,
        version_id: i64,
    ) -> StoreResult<Option<MovieShow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM movie_shows
             WHERE movie_id = $1 AND show_date = $2 AND show_time = $3 AND version_id = $4
             ORDER BY id LIMIT 1",
            SHOW_COLUMNS
        ))
        .bind(movie_id)
        .bind(date)
        .bind(time)
        .bind(version_id)
        .fetch_optional(&self.db.pool)
        .await?;
        row.as_ref().map(show_from_row).transpose()
    }

    async fn shows_on(&self, date: NaiveDate) -> StoreResult<Vec<ShowRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT ms.id, ms.movie_id, ms.room_id, ms.show_date, ms.show_time, ms.version_id,
                   m.id AS m_id, m.name AS m_name, m.large_image AS m_large_image,
                   m.small_image AS m_small_image, m.duration_minutes AS m_duration,
                   r.id AS r_id, r.name AS r_name, r.length AS r_length, r.width AS r_width,
                   r.status_id AS r_status_id, r.unavailable_until AS r_unavailable_until,
                   v.id AS v_id, v.name AS v_name
            FROM movie_shows ms
            LEFT JOIN movies m ON m.id = ms.movie_id
            LEFT JOIN cinema_rooms r ON r.id = ms.room_id
            LEFT JOIN versions v ON v.id = ms.version_id
            WHERE ms.show_date = $1
            ORDER BY ms.id
            "#,
        )
        .bind(date)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(show_record_from_row).collect()
    }

    async fn insert_show(&self, show: &NewShow, duration_minutes: i32) -> StoreResult<ShowInsert> {
        let mut tx = self.db.pool.begin().await?;

        // Serialises show creation per room.
        sqlx::query("SELECT id FROM cinema_rooms WHERE id = $1 FOR UPDATE")
            .bind(show.room_id)
            .execute(&mut *tx)
            .await?;

        let from = show.show_date.pred_opt().unwrap_or(show.show_date);
        let to = show.show_date.succ_opt().unwrap_or(show.show_date);
        let neighbours: Vec<(i64, NaiveDate, NaiveTime, i32)> = sqlx::query_as(
            r#"
            SELECT ms.id, ms.show_date, ms.show_time, COALESCE(m.duration_minutes, 0)
            FROM movie_shows ms
            LEFT JOIN movies m ON m.id = ms.movie_id
            WHERE ms.room_id = $1 AND ms.show_time IS NOT NULL
              AND ms.show_date BETWEEN $2 AND $3
            "#,
        )
        .bind(show.room_id)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await?;

        let (start, end) = show.window(duration_minutes);
        let clash = neighbours.into_iter().find(|(_, date, time, minutes)| {
            let other_start: NaiveDateTime = date.and_time(*time);
            let other_end = other_start + chrono::Duration::minutes((*minutes).into());
            start < other_end && other_start < end
        });
        if let Some((existing, ..)) = clash {
            tx.rollback().await?;
            return Ok(ShowInsert::Overlaps(existing));
        }

        let row = sqlx::query(&format!(
            "INSERT INTO movie_shows (movie_id, room_id, show_date, show_time, version_id)
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            SHOW_COLUMNS
        ))
        .bind(&show.movie_id)
        .bind(show.room_id)
        .bind(show.show_date)
        .bind(show.show_time)
        .bind(show.version_id)
        .fetch_one(&mut *tx)
        .await?;
        let created = show_from_row(&row)?;

        sqlx::query(
            "INSERT INTO schedule_seats (show_id, seat_id)
             SELECT $1, id FROM seats WHERE room_id = $2 AND status <> 'disabled'",
        )
        .bind(created.id)
        .bind(created.room_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ShowInsert::Created(created))
    }

    /* ---------- seat holds ---------- */

    async fn schedule_seats(&self, show_id: i64) -> StoreResult<Vec<ScheduleSeat>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedule_seats WHERE show_id = $1 ORDER BY seat_id",
            SCHEDULE_COLUMNS
        ))
        .bind(show_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(schedule_seat_from_row).collect()
    }

    async fn hold_seats(
        &self,
        show_id: i64,
        seat_ids: &[i64],
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome> {
        let mut tx = self.db.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedule_seats WHERE show_id = $1 AND seat_id = ANY($2) FOR UPDATE",
            SCHEDULE_COLUMNS
        ))
        .bind(show_id)
        .bind(seat_ids)
        .fetch_all(&mut *tx)
        .await?;
        let current: Vec<ScheduleSeat> = rows.iter().map(schedule_seat_from_row).collect::<StoreResult<_>>()?;

        let unknown: Vec<i64> = seat_ids
            .iter()
            .copied()
            .filter(|id| !current.iter().any(|s| s.seat_id == *id))
            .collect();
        if !unknown.is_empty() {
            tx.rollback().await?;
            return Ok(HoldOutcome::Unknown(unknown));
        }
        let taken: Vec<i64> = current
            .iter()
            .filter(|s| !s.is_free(now) && !s.is_held_by(holder, now))
            .map(|s| s.seat_id)
            .collect();
        if !taken.is_empty() {
            tx.rollback().await?;
            return Ok(HoldOutcome::Unavailable(taken));
        }

        let rows = sqlx::query(&format!(
            "UPDATE schedule_seats
             SET status = 'held', held_by = $3, held_until = $4, invoice_id = NULL, version = version + 1
             WHERE show_id = $1 AND seat_id = ANY($2)
             RETURNING {}",
            SCHEDULE_COLUMNS
        ))
        .bind(show_id)
        .bind(seat_ids)
        .bind(holder)
        .bind(until)
        .fetch_all(&mut *tx)
        .await?;
        let held = rows.iter().map(schedule_seat_from_row).collect::<StoreResult<_>>()?;

        tx.commit().await?;
        Ok(HoldOutcome::Held(held))
    }

    async fn release_holds(&self, show_id: i64, seat_ids: &[i64], holder: &str) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_seats
            SET status = 'available', held_by = NULL, held_until = NULL, version = version + 1
            WHERE show_id = $1 AND seat_id = ANY($2)
              AND status = 'held' AND invoice_id IS NULL AND held_by = $3
            "#,
        )
        .bind(show_id)
        .bind(seat_ids)
        .bind(holder)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_seats
            SET status = 'available', held_by = NULL, held_until = NULL, version = version + 1
            WHERE status = 'held' AND invoice_id IS NULL
              AND (held_until IS NULL OR held_until <= $1)
            "#,
        )
        .bind(now)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    /* ---------- accounts & vouchers ---------- */

    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
        let row: Option<(String, String, i64, i32)> =
            sqlx::query_as("SELECT id, role, score, rank_percent FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.db.pool)
                .await?;
        row.map(|(id, role, score, rank_percent)| {
            Ok(Account {
                id,
                role: parse(role)?,
                score,
                rank_percent,
            })
        })
        .transpose()
    }

    async fn voucher(&self, voucher_id: &str) -> StoreResult<Option<Voucher>> {
        let row: Option<(String, String, i64, bool)> =
            sqlx::query_as("SELECT id, account_id, value, is_used FROM vouchers WHERE id = $1")
                .bind(voucher_id)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.map(|(id, account_id, value, is_used)| Voucher {
            id,
            account_id,
            value,
            is_used,
        }))
    }

    /* ---------- invoices ---------- */

    async fn insert_invoice(&self, invoice: &Invoice, now: DateTime<Utc>) -> StoreResult<InvoiceInsert> {
        let mut tx = self.db.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedule_seats WHERE show_id = $1 AND seat_id = ANY($2) FOR UPDATE",
            SCHEDULE_COLUMNS
        ))
        .bind(invoice.movie_show_id)
        .bind(&invoice.seat_ids)
        .fetch_all(&mut *tx)
        .await?;
        let current: Vec<ScheduleSeat> = rows.iter().map(schedule_seat_from_row).collect::<StoreResult<_>>()?;

        let not_held: Vec<i64> = invoice
            .seat_ids
            .iter()
            .copied()
            .filter(|id| {
                !current
                    .iter()
                    .any(|s| s.seat_id == *id && s.is_held_by(&invoice.account_id, now))
            })
            .collect();
        if !not_held.is_empty() {
            tx.rollback().await?;
            return Ok(InvoiceInsert::SeatsNotHeld(not_held));
        }

        sqlx::query(
            r#"
            INSERT INTO invoices (id, account_id, movie_show_id, seat_ids, seat_labels, total_price,
                                  status, cancel, voucher_id, used_score, earned_score, food_lines,
                                  booking_date, completed_at, cancelled_at, payment_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&invoice.id)
        .bind(&invoice.account_id)
        .bind(invoice.movie_show_id)
        .bind(&invoice.seat_ids)
        .bind(&invoice.seat_labels)
        .bind(invoice.total_price)
        .bind(invoice.status.as_str())
        .bind(invoice.cancel)
        .bind(&invoice.voucher_id)
        .bind(invoice.used_score)
        .bind(invoice.earned_score)
        .bind(Json(&invoice.food_lines))
        .bind(invoice.booking_date)
        .bind(invoice.completed_at)
        .bind(invoice.cancelled_at)
        .bind(&invoice.payment_ref)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE schedule_seats SET invoice_id = $1, version = version + 1
             WHERE show_id = $2 AND seat_id = ANY($3)",
        )
        .bind(&invoice.id)
        .bind(invoice.movie_show_id)
        .bind(&invoice.seat_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InvoiceInsert::Created)
    }

    async fn invoice(&self, invoice_id: &str) -> StoreResult<Option<Invoice>> {
        let row = sqlx::query(&format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS))
            .bind(invoice_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn invoices_for_account(&self, account_id: &str) -> StoreResult<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE account_id = $1 ORDER BY booking_date DESC",
            INVOICE_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(invoice_from_row).collect()
    }

    async fn invoices_for_show(&self, show_id: i64) -> StoreResult<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE movie_show_id = $1 ORDER BY booking_date",
            INVOICE_COLUMNS
        ))
        .bind(show_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter().map(invoice_from_row).collect()
    }

    async fn stale_incomplete_invoices(&self, created_before: DateTime<Utc>) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM invoices WHERE status = 'incomplete' AND booking_date < $1 ORDER BY booking_date",
        )
        .bind(created_before)
        .fetch_all(&self.db.pool)
        .await?)
    }

    async fn complete_invoice(&self, completion: &Completion) -> StoreResult<Transition> {
        let mut tx = self.db.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(&completion.invoice_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = match row.as_ref().map(invoice_from_row).transpose()? {
            Some(invoice) => invoice,
            None => {
                tx.rollback().await?;
                return Ok(Transition::Missing);
            }
        };
        match current.status {
            InvoiceStatus::Completed => {
                tx.rollback().await?;
                return Ok(Transition::Unchanged(current));
            }
            InvoiceStatus::Cancelled => {
                tx.rollback().await?;
                return Ok(Transition::Rejected(InvoiceStatus::Cancelled));
            }
            InvoiceStatus::Incomplete => {}
        }

        if let Some(voucher_id) = &completion.voucher_id {
            let claimed = sqlx::query("UPDATE vouchers SET is_used = TRUE WHERE id = $1 AND is_used = FALSE")
                .bind(voucher_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if claimed == 0 {
                tx.rollback().await?;
                return Ok(Transition::Unfunded(format!("Voucher {} is no longer available", voucher_id)));
            }
        }

        let score: Option<i64> = sqlx::query_scalar("SELECT score FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(&completion.account_id)
            .fetch_optional(&mut *tx)
            .await?;
        if completion.used_score > 0 && score.map_or(true, |balance| balance < completion.used_score) {
            tx.rollback().await?;
            return Ok(Transition::Unfunded(format!(
                "Score balance no longer covers {} points",
                completion.used_score
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE invoices
             SET status = 'completed', completed_at = $2, payment_ref = $3, earned_score = $4
             WHERE id = $1 AND status = 'incomplete'
             RETURNING {}",
            INVOICE_COLUMNS
        ))
        .bind(&completion.invoice_id)
        .bind(completion.completed_at)
        .bind(&completion.payment_ref)
        .bind(completion.earned_score)
        .fetch_one(&mut *tx)
        .await?;
        let completed = invoice_from_row(&row)?;

        sqlx::query("UPDATE accounts SET score = score + $2 WHERE id = $1")
            .bind(&completion.account_id)
            .bind(completion.earned_score - completion.used_score)
            .execute(&mut *tx)
            .await?;

        for line in &completed.food_lines {
            sqlx::query(
                "INSERT INTO food_orders (invoice_id, food_id, quantity, price) VALUES ($1, $2, $3, $4)",
            )
            .bind(&completed.id)
            .bind(line.food_id)
            .bind(line.quantity)
            .bind(line.price)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE schedule_seats SET status = 'booked', held_until = NULL, version = version + 1
             WHERE invoice_id = $1",
        )
        .bind(&completed.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Transition::Applied(completed))
    }

    async fn cancel_invoice(&self, cancellation: &Cancellation) -> StoreResult<Transition> {
        let mut tx = self.db.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(&cancellation.invoice_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = match row.as_ref().map(invoice_from_row).transpose()? {
            Some(invoice) => invoice,
            None => {
                tx.rollback().await?;
                return Ok(Transition::Missing);
            }
        };
        if current.status == InvoiceStatus::Cancelled {
            tx.rollback().await?;
            return Ok(Transition::Unchanged(current));
        }
        if current.status != cancellation.expected {
            tx.rollback().await?;
            return Ok(Transition::Rejected(current.status));
        }

        let row = sqlx::query(&format!(
            "UPDATE invoices SET status = 'cancelled', cancel = TRUE, cancelled_at = $2
             WHERE id = $1
             RETURNING {}",
            INVOICE_COLUMNS
        ))
        .bind(&cancellation.invoice_id)
        .bind(cancellation.cancelled_at)
        .fetch_one(&mut *tx)
        .await?;
        let cancelled = invoice_from_row(&row)?;

        sqlx::query(
            r#"
            UPDATE schedule_seats
            SET status = 'available', held_by = NULL, held_until = NULL, invoice_id = NULL,
                version = version + 1
            WHERE invoice_id = $1
            "#,
        )
        .bind(&cancelled.id)
        .execute(&mut *tx)
        .await?;

        let mut voucher_restored = false;
        if let Some(voucher_id) = &cancellation.restore_voucher {
            voucher_restored = sqlx::query("UPDATE vouchers SET is_used = FALSE WHERE id = $1")
                .bind(voucher_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;
        }

        if cancellation.score_delta != 0 {
            sqlx::query("UPDATE accounts SET score = GREATEST(score + $2, 0) WHERE id = $1")
                .bind(&cancellation.account_id)
                .bind(cancellation.score_delta)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(amount) = cancellation.refund_amount {
            sqlx::query(
                "INSERT INTO refunds (invoice_id, amount, voucher_restored, actor, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&cancelled.id)
            .bind(amount)
            .bind(voucher_restored)
            .bind(&cancellation.actor)
            .bind(cancellation.cancelled_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Transition::Applied(cancelled))
    }

    async fn refunds_for_invoice(&self, invoice_id: &str) -> StoreResult<Vec<RefundRecord>> {
        let rows: Vec<(String, i64, bool, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT invoice_id, amount, voucher_restored, actor, created_at
             FROM refunds WHERE invoice_id = $1 ORDER BY created_at",
        )
        .bind(invoice_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(invoice_id, amount, voucher_restored, actor, created_at)| RefundRecord {
                invoice_id,
                amount,
                voucher_restored,
                actor,
                created_at,
            })
            .collect())
    }
}
