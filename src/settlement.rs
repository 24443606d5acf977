//! Payment settlement.
//!
//! Both the manual confirmation endpoint and the gateway webhook funnel into
//! [`apply_settlement`], so there is exactly one convergence rule: a booking
//! that is already settled absorbs any further outcome for the same intent as
//! a successful no-op. The confirmed transition itself is a conditional
//! update; when two deliveries race, one wins and the loser converges.

use anyhow::Context;
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::json;

use crate::{
    api::capacity,
    core::{app_error::AppError, app_state::AppState, outbox},
    domain::status::{BookingStatus, Transition, prior_strs},
    events::BookingConfirmedEvent,
    models::{BookingEntity, PaymentEntity},
    notify,
    schema::{bookings, credit_balances, payments},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementSource {
    Manual,
    Webhook,
}

impl SettlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementSource::Manual => "manual",
            SettlementSource::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Succeeded,
    Failed { reason: String },
}

/// What a settlement signal means for a booking in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementAction {
    Confirm,
    MarkFailed,
    AlreadySettled,
}

pub struct SettlementReport {
    pub booking: BookingEntity,
    /// True when the outcome had already been applied by another delivery.
    pub converged: bool,
}

/// Credit slice a failed attempt hands back to the customer's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditRelease {
    pub credit_cents: i64,
    /// What the attempt is worth after the release, its card portion only.
    pub amount_cents: i64,
}

/// Failure-side bookkeeping for a split payment: the credit portion goes back
/// to the balance and the attempt becomes card-only, so a retried success on
/// the same intent is accounted purely against the card charge. Card-only
/// attempts release nothing.
pub fn release_credit_portion(payment: &PaymentEntity) -> Option<CreditRelease> {
    if payment.credit_cents <= 0 {
        return None;
    }
    Some(CreditRelease {
        credit_cents: payment.credit_cents,
        amount_cents: payment.amount_cents - payment.credit_cents,
    })
}

/// The convergence rule. Settled bookings absorb everything; only a booking
/// awaiting payment can move; any other state is a genuine conflict.
pub fn settlement_action(
    status: BookingStatus,
    outcome: &SettlementOutcome,
) -> Result<SettlementAction, AppError> {
    if status.is_settled() {
        return Ok(SettlementAction::AlreadySettled);
    }
    match (status, outcome) {
        (BookingStatus::PaymentPending, SettlementOutcome::Succeeded) => {
            Ok(SettlementAction::Confirm)
        }
        (BookingStatus::PaymentPending, SettlementOutcome::Failed { .. }) => {
            Ok(SettlementAction::MarkFailed)
        }
        (other, _) => Err(AppError::Conflict(format!(
            "cannot settle payment while booking is {}",
            other.as_str()
        ))),
    }
}

/// Resolve the booking a gateway intent belongs to.
///
/// Primary path: the intent recorded on the booking itself. Fallback: the
/// payment row carrying the intent as its provider reference. Both paths must
/// name the same booking for any given intent.
pub async fn resolve_booking(
    conn: &mut AsyncPgConnection,
    intent_id: &str,
) -> Result<BookingEntity, AppError> {
    let by_intent: Option<BookingEntity> = bookings::table
        .filter(bookings::payment_intent_id.eq(intent_id))
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to resolve booking by intent")?;
    if let Some(booking) = by_intent {
        return Ok(booking);
    }

    let payment: Option<PaymentEntity> = payments::table
        .filter(payments::provider_ref.eq(intent_id))
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to resolve payment by provider ref")?;
    match payment {
        Some(payment) => bookings::table
            .find(payment.booking_id)
            .select(BookingEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to load booking for payment")?
            .ok_or(AppError::NotFound),
        None => Err(AppError::NotFound),
    }
}

/// Apply a settlement outcome to whichever booking owns the intent.
pub async fn apply_settlement(
    state: &AppState,
    source: SettlementSource,
    intent_id: &str,
    outcome: SettlementOutcome,
) -> Result<SettlementReport, AppError> {
    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let booking = resolve_booking(conn, intent_id).await?;
    let status = BookingStatus::parse(&booking.status).ok_or_else(|| {
        anyhow::anyhow!("booking {} has unknown status {}", booking.id, booking.status)
    })?;

    match settlement_action(status, &outcome)? {
        SettlementAction::AlreadySettled => {
            tracing::info!(
                booking_id = booking.id,
                intent_id,
                source = source.as_str(),
                "settlement already applied; converging as no-op"
            );
            Ok(SettlementReport {
                booking,
                converged: true,
            })
        }
        SettlementAction::MarkFailed => {
            let reason = match &outcome {
                SettlementOutcome::Failed { reason } => reason.clone(),
                SettlementOutcome::Succeeded => unreachable!(),
            };
            let updated = mark_failed(conn, &booking, intent_id, &reason).await?;
            tracing::warn!(
                booking_id = booking.id,
                intent_id,
                source = source.as_str(),
                reason,
                "payment settlement failed; booking stays retryable"
            );
            Ok(SettlementReport {
                booking: updated,
                converged: false,
            })
        }
        SettlementAction::Confirm => {
            let won = confirm(state, conn, &booking, intent_id).await?;
            match won {
                Some(updated) => {
                    tracing::info!(
                        booking_id = updated.id,
                        intent_id,
                        source = source.as_str(),
                        "booking confirmed"
                    );
                    Ok(SettlementReport {
                        booking: updated,
                        converged: false,
                    })
                }
                None => {
                    // Lost the race: another delivery confirmed first.
                    let booking = bookings::table
                        .find(booking.id)
                        .select(BookingEntity::as_select())
                        .first(conn)
                        .await
                        .context("Failed to re-read booking after settlement race")?;
                    tracing::info!(
                        booking_id = booking.id,
                        intent_id,
                        source = source.as_str(),
                        "lost settlement race; converging as no-op"
                    );
                    Ok(SettlementReport {
                        booking,
                        converged: true,
                    })
                }
            }
        }
    }
}

/// Winner-takes-all confirmation. Returns `None` when another caller already
/// moved the booking out of `PAYMENT_PENDING`. The capacity reservation is
/// made inside the same unit of work as the status flip, so the two cannot
/// diverge: if the Capacity Ledger call fails, the transition rolls back and
/// the gateway's redelivery retries the whole step.
async fn confirm(
    state: &AppState,
    conn: &mut AsyncPgConnection,
    booking: &BookingEntity,
    intent_id: &str,
) -> Result<Option<BookingEntity>, AppError> {
    let booking_id = booking.id;
    let total_cents = booking.total_cents;
    let intent = intent_id.to_string();
    let http_client = state.http_client.clone();
    let capacity_url = state.config.capacity.base_url.clone();

    conn.transaction(move |conn| {
        Box::pin(async move {
            confirm_within(
                conn,
                booking_id,
                total_cents,
                &http_client,
                &capacity_url,
                Some(&intent),
            )
            .await
        })
    })
    .await
}

/// The confirmation step itself, to be run inside an open transaction: the
/// settle CAS, payment-row bookkeeping, capacity reservation and downstream
/// events. Also used by the synchronous credit-balance payment path.
pub(crate) async fn confirm_within(
    conn: &mut AsyncPgConnection,
    booking_id: i32,
    total_cents: i64,
    http_client: &reqwest::Client,
    capacity_url: &str,
    intent_id: Option<&str>,
) -> Result<Option<BookingEntity>, AppError> {
    let updated: Option<BookingEntity> = diesel::update(
        bookings::table
            .find(booking_id)
            .filter(bookings::status.eq_any(prior_strs(Transition::Settle))),
    )
    .set((
        bookings::status.eq(BookingStatus::Confirmed.as_str()),
        bookings::payment_status.eq("COMPLETED"),
        bookings::paid_cents.eq(total_cents),
        bookings::due_cents.eq(0),
        bookings::paid_at.eq(Utc::now()),
        bookings::payment_error.eq(None::<String>),
    ))
    .returning(BookingEntity::as_returning())
    .get_result(conn)
    .await
    .optional()?;

    let Some(updated) = updated else {
        return Ok(None);
    };

    if let Some(intent_id) = intent_id {
        // FAILED rows flip too: an intent the customer retried after a
        // declined charge still succeeds under the same provider reference,
        // and a row stuck in FAILED would block refunds on it.
        diesel::update(
            payments::table
                .filter(payments::provider_ref.eq(intent_id))
                .filter(payments::status.eq_any(["PENDING", "FAILED"])),
        )
        .set((
            payments::status.eq("SUCCEEDED"),
            payments::failure_reason.eq(None::<String>),
        ))
        .execute(conn)
        .await?;
    }

    capacity::reserve(
        http_client,
        capacity_url,
        updated.warehouse_id,
        updated.id,
        &updated.booking_type,
    )
    .await?;

    outbox::publish(
        conn,
        "bookings.confirmed".to_string(),
        BookingConfirmedEvent {
            booking_id: updated.id,
            warehouse_id: updated.warehouse_id,
            booking_type: updated.booking_type.clone(),
        },
    )
    .await?;

    if let Some(customer_id) = updated.customer_id {
        notify::send(
            conn,
            customer_id,
            "booking_confirmed",
            "Booking confirmed",
            "Your warehouse booking is confirmed.",
            json!({ "booking_id": updated.id }),
        )
        .await;
    }

    Ok(Some(updated))
}

async fn mark_failed(
    conn: &mut AsyncPgConnection,
    booking: &BookingEntity,
    intent_id: &str,
    reason: &str,
) -> Result<BookingEntity, AppError> {
    let booking_id = booking.id;
    let customer_id = booking.customer_id;
    let intent = intent_id.to_string();
    let reason = reason.to_string();

    conn.transaction(move |conn| {
        Box::pin(async move {
            let updated: Option<BookingEntity> = diesel::update(
                bookings::table
                    .find(booking_id)
                    .filter(bookings::status.eq(BookingStatus::PaymentPending.as_str())),
            )
            .set((
                bookings::payment_status.eq("FAILED"),
                bookings::payment_error.eq(&reason),
            ))
            .returning(BookingEntity::as_returning())
            .get_result(conn)
            .await
            .optional()?;

            // The PENDING filter also guards the credit restoration below
            // against duplicate failure deliveries: the row flips once.
            let attempt: Option<PaymentEntity> = diesel::update(
                payments::table
                    .filter(payments::provider_ref.eq(&intent))
                    .filter(payments::status.eq("PENDING")),
            )
            .set((
                payments::status.eq("FAILED"),
                payments::failure_reason.eq(&reason),
            ))
            .returning(PaymentEntity::as_returning())
            .get_result(conn)
            .await
            .optional()?;

            if let Some(attempt) = &attempt
                && let Some(release) = release_credit_portion(attempt)
                && let Some(customer_id) = customer_id
            {
                diesel::insert_into(credit_balances::table)
                    .values((
                        credit_balances::customer_id.eq(customer_id),
                        credit_balances::balance_cents.eq(release.credit_cents),
                    ))
                    .on_conflict(credit_balances::customer_id)
                    .do_update()
                    .set(
                        credit_balances::balance_cents
                            .eq(credit_balances::balance_cents + release.credit_cents),
                    )
                    .execute(conn)
                    .await?;

                diesel::update(payments::table.find(attempt.id))
                    .set((
                        payments::amount_cents.eq(release.amount_cents),
                        payments::card_cents.eq(release.amount_cents),
                        payments::credit_cents.eq(0_i64),
                    ))
                    .execute(conn)
                    .await?;

                tracing::info!(
                    booking_id,
                    customer_id,
                    credit_cents = release.credit_cents,
                    "released credit portion of failed split payment"
                );
            }

            match updated {
                Some(updated) => Ok::<BookingEntity, AppError>(updated),
                // Confirmed in the meantime; the failure signal is stale.
                None => {
                    let booking = bookings::table
                        .find(booking_id)
                        .select(BookingEntity::as_select())
                        .first(conn)
                        .await?;
                    Ok(booking)
                }
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::split_invoice;
    use chrono::Utc;
    use uuid::Uuid;

    fn failed(reason: &str) -> SettlementOutcome {
        SettlementOutcome::Failed {
            reason: reason.to_string(),
        }
    }

    fn payment(amount: i64, card: i64, credit: i64) -> PaymentEntity {
        PaymentEntity {
            id: Uuid::nil(),
            booking_id: 1,
            amount_cents: amount,
            kind: "BALANCE".to_string(),
            method: if credit > 0 { "BOTH" } else { "CARD" }.to_string(),
            card_cents: card,
            credit_cents: credit,
            status: "PENDING".to_string(),
            provider_ref: Some("pi_1".to_string()),
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn success_confirms_a_payment_pending_booking() {
        assert_eq!(
            settlement_action(BookingStatus::PaymentPending, &SettlementOutcome::Succeeded)
                .unwrap(),
            SettlementAction::Confirm
        );
    }

    #[test]
    fn failure_keeps_the_booking_retryable() {
        assert_eq!(
            settlement_action(BookingStatus::PaymentPending, &failed("card declined")).unwrap(),
            SettlementAction::MarkFailed
        );
    }

    #[test]
    fn settled_bookings_absorb_any_outcome() {
        // Duplicate webhook delivery, webhook after manual confirm, and even a
        // stale failure must all converge as no-ops.
        for status in [
            BookingStatus::Confirmed,
            BookingStatus::Active,
            BookingStatus::Completed,
        ] {
            assert_eq!(
                settlement_action(status, &SettlementOutcome::Succeeded).unwrap(),
                SettlementAction::AlreadySettled
            );
            assert_eq!(
                settlement_action(status, &failed("late failure")).unwrap(),
                SettlementAction::AlreadySettled
            );
        }
    }

    #[test]
    fn unsettleable_states_are_conflicts() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::PreOrder,
            BookingStatus::AwaitingTimeSlot,
            BookingStatus::Cancelled,
            BookingStatus::Rejected,
        ] {
            let err = settlement_action(status, &SettlementOutcome::Succeeded).unwrap_err();
            assert!(matches!(err, AppError::Conflict(_)), "{status:?}");
        }
    }

    #[test]
    fn failed_split_attempt_releases_exactly_its_credit_slice() {
        let release = release_credit_portion(&payment(90_000, 65_000, 25_000)).unwrap();
        assert_eq!(release.credit_cents, 25_000);
        assert_eq!(release.amount_cents, 65_000);
        // The attempt keeps accounting only for what the card was charged.
        assert_eq!(release.credit_cents + release.amount_cents, 90_000);
    }

    #[test]
    fn card_only_attempts_release_nothing() {
        assert_eq!(release_credit_portion(&payment(90_000, 90_000, 0)), None);
    }

    #[test]
    fn failed_split_restores_the_pre_call_balance() {
        // Customer with 25_000 credit splits a 90_000 invoice; the card
        // charge later fails. The release must put the balance back exactly
        // where it started.
        let balance_before = 25_000;
        let split = split_invoice(90_000, balance_before).unwrap();
        let balance_after_debit = balance_before - split.credit_cents;

        let attempt = payment(90_000, split.card_cents, split.credit_cents);
        let release = release_credit_portion(&attempt).unwrap();
        assert_eq!(balance_after_debit + release.credit_cents, balance_before);
    }

    #[test]
    fn applying_success_twice_is_one_confirm_then_a_no_op() {
        // First delivery while payment is pending confirms; any redelivery
        // observes the settled state and converges.
        let first =
            settlement_action(BookingStatus::PaymentPending, &SettlementOutcome::Succeeded)
                .unwrap();
        assert_eq!(first, SettlementAction::Confirm);
        let second =
            settlement_action(BookingStatus::Confirmed, &SettlementOutcome::Succeeded).unwrap();
        assert_eq!(second, SettlementAction::AlreadySettled);
    }
}
