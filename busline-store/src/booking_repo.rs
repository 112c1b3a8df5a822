use async_trait::async_trait;
use busline_core::booking::{Booking, BookingStatus, StatusPatch};
use busline_core::payment::TransactionStatus;
use busline_core::repository::BookingRepository;
use busline_core::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::storage_error;

const REFERENCE_CONSTRAINT: &str = "bookings_booking_reference_key";

const BOOKING_COLUMNS: &str = r#"
    b.id, b.user_id, b.trip_id, b.booking_reference, b.status, b.payment_status,
    b.payment_order_id, b.created_at, b.updated_at, b.payment_deadline,
    b.retry_deadline, b.confirmed_at, b.cancel_reason, b.reminder_sent_at,
    COALESCE(
        (SELECT array_agg(s.seat_id ORDER BY s.position) FROM booking_seats s WHERE s.booking_id = b.id),
        '{}'
    )::TEXT[] AS seats
"#;

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, predicate: &str, order: &str, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let sql = format!(
            "SELECT {} FROM bookings b WHERE {} ORDER BY {} LIMIT $2",
            BOOKING_COLUMNS, predicate, order
        );
        let rows = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.into_iter().map(Booking::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: Uuid,
    trip_id: Uuid,
    booking_reference: String,
    status: String,
    payment_status: String,
    payment_order_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payment_deadline: DateTime<Utc>,
    retry_deadline: Option<DateTime<Utc>>,
    confirmed_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    reminder_sent_at: Option<DateTime<Utc>>,
    seats: Vec<String>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = CoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |err: CoreError| CoreError::Storage(format!("booking {} has bad status: {}", id, err));
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            trip_id: row.trip_id,
            booking_reference: row.booking_reference,
            status: row.status.parse::<BookingStatus>().map_err(corrupt)?,
            payment_status: row.payment_status.parse::<TransactionStatus>().map_err(corrupt)?,
            payment_order_id: row.payment_order_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            payment_deadline: row.payment_deadline,
            retry_deadline: row.retry_deadline,
            confirmed_at: row.confirmed_at,
            cancel_reason: row.cancel_reason,
            reminder_sent_at: row.reminder_sent_at,
            seats: row.seats,
        })
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn insert(&self, booking: &Booking) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bookings (id, user_id, trip_id, booking_reference, status, payment_status,
                                  payment_order_id, created_at, updated_at, payment_deadline)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(booking.id)
        .bind(booking.user_id)
        .bind(booking.trip_id)
        .bind(&booking.booking_reference)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(&booking.payment_order_id)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .bind(booking.payment_deadline)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if let sqlx::Error::Database(db_err) = &err {
                if db_err.is_unique_violation() && db_err.constraint() == Some(REFERENCE_CONSTRAINT) {
                    return Err(CoreError::DuplicateReference(booking.booking_reference.clone()));
                }
            }
            return Err(storage_error(err));
        }

        let rows = booking.seat_rows();
        let seat_ids: Vec<String> = rows.iter().map(|row| row.seat_id.clone()).collect();
        let positions: Vec<i32> = rows.iter().map(|row| row.position).collect();
        sqlx::query(
            r#"
            INSERT INTO booking_seats (booking_id, seat_id, position)
            SELECT $1, seat_id, position FROM UNNEST($2::TEXT[], $3::INT4[]) AS t(seat_id, position)
            "#,
        )
        .bind(booking.id)
        .bind(&seat_ids)
        .bind(&positions)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        let sql = format!("SELECT {} FROM bookings b WHERE b.id = $1", BOOKING_COLUMNS);
        sqlx::query_as::<_, BookingRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn list_for_user(&self, user_id: Uuid) -> CoreResult<Vec<Booking>> {
        let sql = format!(
            "SELECT {} FROM bookings b WHERE b.user_id = $1 ORDER BY b.created_at DESC",
            BOOKING_COLUMNS
        );
        let rows = sqlx::query_as::<_, BookingRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.into_iter().map(Booking::try_from).collect()
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
        patch: StatusPatch,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let sql = format!(
            r#"
            WITH b AS (
                UPDATE bookings
                SET status = $3,
                    updated_at = $4,
                    retry_deadline = COALESCE($5, retry_deadline),
                    confirmed_at = COALESCE($6, confirmed_at),
                    cancel_reason = COALESCE($7, cancel_reason)
                WHERE id = $1 AND status = $2
                RETURNING *
            )
            SELECT {} FROM b
            "#,
            BOOKING_COLUMNS
        );
        sqlx::query_as::<_, BookingRow>(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .bind(patch.retry_deadline)
            .bind(patch.confirmed_at)
            .bind(patch.cancel_reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        payment_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let sql = format!(
            r#"
            WITH b AS (
                UPDATE bookings
                SET payment_status = $2,
                    payment_order_id = COALESCE($3, payment_order_id),
                    updated_at = $4
                WHERE id = $1
                RETURNING *
            )
            SELECT {} FROM b
            "#,
            BOOKING_COLUMNS
        );
        sqlx::query_as::<_, BookingRow>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(payment_order_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn mark_reminder_sent(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query("UPDATE bookings SET reminder_sent_at = $2 WHERE id = $1 AND reminder_sent_at IS NULL")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_overdue_pending(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        self.fetch_where(
            "b.status = 'PENDING_PAYMENT' AND b.payment_deadline < $1",
            "b.payment_deadline",
            now,
            limit,
        )
        .await
    }

    async fn find_lapsed_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        self.fetch_where("b.status = 'EXPIRED' AND b.retry_deadline < $1", "b.retry_deadline", now, limit)
            .await
    }
}
