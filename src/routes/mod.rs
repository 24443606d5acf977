use diesel::{OptionalExtension, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{core::app_error::AppError, domain::status::Transition, schema};

pub mod approvals;
pub mod bookings;
pub mod payments;
pub mod refunds;
pub mod webhooks;

/// Builds the error for a conditional update that matched no rows. Either the
/// booking vanished, or its current status is not an allowed prior for the
/// transition; the conflict message names both sides.
pub(crate) async fn transition_conflict(
    conn: &mut AsyncPgConnection,
    booking_id: i32,
    transition: Transition,
) -> AppError {
    match schema::bookings::table
        .find(booking_id)
        .select(schema::bookings::status)
        .first::<String>(conn)
        .await
        .optional()
    {
        Ok(Some(current)) => AppError::Conflict(format!(
            "cannot {} while booking is {current}",
            transition.describe()
        )),
        Ok(None) => AppError::NotFound,
        Err(err) => err.into(),
    }
}
