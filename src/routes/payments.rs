use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    core::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Actor, Relationship, authorize},
    },
    domain::{
        customer::CustomerRef,
        money::{deposit_cents, split_invoice},
        status::BookingStatus,
    },
    models::{BookingEntity, CreatePaymentEntity, PaymentEntity},
    schema::{bookings, credit_balances, payments},
    settlement::{self, SettlementOutcome, SettlementSource},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new()
        .nest(
            "/bookings",
            OpenApiRouter::new()
                .routes(utoipa_axum::routes!(create_deposit_intent))
                .routes(utoipa_axum::routes!(process_invoice_payment))
                .route_layer(axum::middleware::from_fn(middleware::actor_identity)),
        )
        .nest(
            "/payments",
            OpenApiRouter::new()
                .routes(utoipa_axum::routes!(confirm_payment))
                .route_layer(axum::middleware::from_fn(middleware::actor_identity)),
        )
}

/// The customer drives their own payments; staff of the booking's warehouse
/// take payment at the desk, which is the only way guest bookings get paid.
fn payment_operator(actor: &Actor, booking: &BookingEntity) -> Result<(), AppError> {
    if authorize(actor, Relationship::BookingCustomer(booking)).is_ok()
        || authorize(actor, Relationship::WarehouseStaff(booking.warehouse_id)).is_ok()
    {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "caller may not operate payments for this booking".to_string(),
        ))
    }
}

#[derive(Serialize, ToSchema)]
struct DepositIntentRes {
    booking: BookingEntity,
    payment: PaymentEntity,
    client_secret: String,
    deposit_cents: i64,
}

/// Create the deposit payment intent (10% of the booking total).
#[utoipa::path(
    post,
    path = "/{id}/deposit-intent",
    tags = ["Payments"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    responses(
        (status = 200, description = "Created deposit intent successfully", body = StdResponse<DepositIntentRes, String>)
    )
)]
async fn create_deposit_intent(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<StdResponse<DepositIntentRes, &'static str>, AppError> {
    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let booking: BookingEntity = bookings::table
        .find(id)
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get booking")?
        .ok_or(AppError::NotFound)?;

    payment_operator(&actor, &booking)?;

    // A previously created intent survives a crashed flow; hand the same one
    // back instead of charging twice.
    if let Some(existing) = deposit_guard(&booking)?.map(str::to_string) {
        return reuse_existing_intent(&state, conn, booking, &existing).await;
    }

    let deposit = deposit_cents(booking.total_cents);
    let contact = CustomerRef::of(&booking).contact().clone();
    let customer_ref = state
        .gateway
        .create_or_get_customer(&contact.email, &contact.name)
        .await?;
    let intent = state
        .gateway
        .create_payment_intent(deposit, &customer_ref, booking.id)
        .await?;

    // Persist the intent before returning the secret: a crash here is
    // recoverable by re-querying the gateway, an unrecorded charge is not.
    // Conditional on no intent being recorded yet, so two concurrent calls
    // cannot both hand out live secrets for different intents.
    let intent_id = intent.id.clone();
    let recorded = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let booking: Option<BookingEntity> = diesel::update(
                    bookings::table
                        .find(id)
                        .filter(bookings::payment_intent_id.is_null()),
                )
                .set((
                    bookings::deposit_cents.eq(deposit),
                    bookings::payment_intent_id.eq(&intent_id),
                    bookings::payment_status.eq("PENDING"),
                ))
                .returning(BookingEntity::as_returning())
                .get_result(conn)
                .await
                .optional()
                .context("Failed to record deposit intent on booking")?;

                let Some(booking) = booking else {
                    return Ok::<Option<(BookingEntity, PaymentEntity)>, AppError>(None);
                };

                let payment: PaymentEntity = diesel::insert_into(payments::table)
                    .values(CreatePaymentEntity {
                        booking_id: id,
                        amount_cents: deposit,
                        kind: "DEPOSIT".to_string(),
                        method: "CARD".to_string(),
                        card_cents: deposit,
                        credit_cents: 0,
                        status: "PENDING".to_string(),
                        provider_ref: Some(intent_id),
                    })
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create payment record")?;

                Ok(Some((booking, payment)))
            })
        })
        .await?;

    let Some((booking, payment)) = recorded else {
        // Lost the race: a concurrent call recorded its intent first. The
        // fresh intent is abandoned unfunded and the recorded one wins.
        tracing::warn!(
            booking_id = id,
            "concurrent deposit intent creation; reusing the recorded intent"
        );
        let booking: BookingEntity = bookings::table
            .find(id)
            .select(BookingEntity::as_select())
            .first(conn)
            .await
            .context("Failed to re-read booking after deposit intent race")?;
        let existing = booking
            .payment_intent_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("booking {id} lost intent race but has no intent"))?;
        return reuse_existing_intent(&state, conn, booking, &existing).await;
    };

    Ok(StdResponse {
        data: Some(DepositIntentRes {
            booking,
            payment,
            client_secret: intent.client_secret,
            deposit_cents: deposit,
        }),
        message: Some("Created deposit intent successfully"),
    })
}

/// Guard for a deposit request; returns the recorded intent when one exists.
fn deposit_guard(booking: &BookingEntity) -> Result<Option<&str>, AppError> {
    let status = BookingStatus::parse(&booking.status).ok_or_else(|| {
        anyhow::anyhow!(
            "booking {} has unknown status {}",
            booking.id,
            booking.status
        )
    })?;
    if status != BookingStatus::PaymentPending {
        return Err(AppError::Conflict(format!(
            "cannot create a deposit intent while booking is {}",
            booking.status
        )));
    }
    if booking.total_cents <= 0 {
        return Err(AppError::InvalidState(
            "booking has no chargeable total".to_string(),
        ));
    }
    Ok(booking.payment_intent_id.as_deref())
}

async fn reuse_existing_intent(
    state: &AppState,
    conn: &mut diesel_async::AsyncPgConnection,
    booking: BookingEntity,
    existing: &str,
) -> Result<StdResponse<DepositIntentRes, &'static str>, AppError> {
    let intent = state.gateway.retrieve_payment_intent(existing).await?;
    if intent.status == "succeeded" {
        return Err(AppError::InvalidState(
            "deposit already paid; confirm the payment instead".to_string(),
        ));
    }
    let payment: PaymentEntity = payments::table
        .filter(payments::provider_ref.eq(existing))
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .context("Failed to get payment for existing intent")?;
    let deposit = booking.deposit_cents.unwrap_or(payment.amount_cents);
    Ok(StdResponse {
        data: Some(DepositIntentRes {
            booking,
            payment,
            client_secret: intent.client_secret,
            deposit_cents: deposit,
        }),
        message: Some("Deposit intent already exists"),
    })
}

#[derive(Serialize, ToSchema)]
struct ConfirmPaymentRes {
    booking: BookingEntity,
    /// True when the outcome had already been applied through another channel.
    converged: bool,
}

/// Client-triggered settlement. Verifies the intent with the gateway and
/// converges with any webhook delivery for the same intent.
#[utoipa::path(
    post,
    path = "/{intent_id}/confirm",
    tags = ["Payments"],
    params(
        ("intent_id" = String, Path, description = "Gateway payment intent ID")
    ),
    responses(
        (status = 200, description = "Settlement applied", body = StdResponse<ConfirmPaymentRes, String>)
    )
)]
async fn confirm_payment(
    Path(intent_id): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    {
        let mut pooled = state
            .db_pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;
        let booking = settlement::resolve_booking(&mut pooled, &intent_id).await?;
        payment_operator(&actor, &booking)?;
    }

    // Never trust the client's word for the outcome; ask the gateway.
    let intent = state.gateway.retrieve_payment_intent(&intent_id).await?;
    let outcome = match intent.status.as_str() {
        "succeeded" => SettlementOutcome::Succeeded,
        "requires_payment_method" | "canceled" => SettlementOutcome::Failed {
            reason: intent
                .last_error
                .unwrap_or_else(|| "payment was not completed".to_string()),
        },
        other => {
            return Err(AppError::InvalidState(format!(
                "payment intent is {other} at the gateway"
            )));
        }
    };

    let report =
        settlement::apply_settlement(&state, SettlementSource::Manual, &intent_id, outcome).await?;

    Ok(StdResponse {
        data: Some(ConfirmPaymentRes {
            booking: report.booking,
            converged: report.converged,
        }),
        message: Some("Settlement applied"),
    })
}

#[derive(Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum InvoiceMethod {
    Card,
    CreditBalance,
    Both,
}

#[derive(Deserialize, ToSchema)]
struct InvoicePaymentReq {
    method: InvoiceMethod,
}

#[derive(Serialize, ToSchema)]
struct InvoicePaymentRes {
    booking: BookingEntity,
    payment: PaymentEntity,
    /// Present when a card intent still needs client-side completion.
    client_secret: Option<String>,
}

/// Pay the outstanding invoice amount with card, credit balance, or both.
#[utoipa::path(
    post,
    path = "/{id}/invoice-payment",
    tags = ["Payments"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    request_body = InvoicePaymentReq,
    responses(
        (status = 200, description = "Invoice payment processed", body = StdResponse<InvoicePaymentRes, String>)
    )
)]
async fn process_invoice_payment(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<InvoicePaymentReq>,
) -> Result<impl IntoResponse, AppError> {
    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let booking: BookingEntity = bookings::table
        .find(id)
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get booking")?
        .ok_or(AppError::NotFound)?;

    payment_operator(&actor, &booking)?;

    let status = BookingStatus::parse(&booking.status)
        .ok_or_else(|| anyhow::anyhow!("booking {} has unknown status {}", id, booking.status))?;
    if status != BookingStatus::PaymentPending {
        return Err(AppError::Conflict(format!(
            "cannot pay the invoice while booking is {}",
            booking.status
        )));
    }
    let due = booking.due_cents;
    if due <= 0 {
        return Err(AppError::InvalidState(
            "nothing is due on this booking".to_string(),
        ));
    }

    match body.method {
        InvoiceMethod::Card => pay_with_card(&state, conn, booking, due).await,
        InvoiceMethod::CreditBalance => pay_with_credit(&state, conn, booking, due).await,
        InvoiceMethod::Both => pay_with_split(&state, conn, booking, due).await,
    }
}

async fn pay_with_card(
    state: &AppState,
    conn: &mut diesel_async::AsyncPgConnection,
    booking: BookingEntity,
    due: i64,
) -> Result<StdResponse<InvoicePaymentRes, &'static str>, AppError> {
    let contact = CustomerRef::of(&booking).contact().clone();
    let customer_ref = state
        .gateway
        .create_or_get_customer(&contact.email, &contact.name)
        .await?;
    let intent = state
        .gateway
        .create_payment_intent(due, &customer_ref, booking.id)
        .await?;

    let booking_id = booking.id;
    let intent_id = intent.id.clone();
    let (booking, payment) = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let booking: BookingEntity = diesel::update(bookings::table.find(booking_id))
                    .set((
                        bookings::payment_intent_id.eq(&intent_id),
                        bookings::payment_status.eq("PENDING"),
                    ))
                    .returning(BookingEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to record card intent on booking")?;

                let payment: PaymentEntity = diesel::insert_into(payments::table)
                    .values(CreatePaymentEntity {
                        booking_id,
                        amount_cents: due,
                        kind: "BALANCE".to_string(),
                        method: "CARD".to_string(),
                        card_cents: due,
                        credit_cents: 0,
                        status: "PENDING".to_string(),
                        provider_ref: Some(intent_id),
                    })
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create payment record")?;

                Ok::<(BookingEntity, PaymentEntity), AppError>((booking, payment))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(InvoicePaymentRes {
            booking,
            payment,
            client_secret: Some(intent.client_secret),
        }),
        message: Some("Card payment initiated"),
    })
}

/// Pure credit-balance payment: debited, recorded and confirmed in one
/// transaction, no gateway round-trip.
async fn pay_with_credit(
    state: &AppState,
    conn: &mut diesel_async::AsyncPgConnection,
    booking: BookingEntity,
    due: i64,
) -> Result<StdResponse<InvoicePaymentRes, &'static str>, AppError> {
    let Some(customer_id) = booking.customer_id else {
        return Err(AppError::InvalidState(
            "guest bookings cannot pay with credit balance".to_string(),
        ));
    };

    let booking_id = booking.id;
    let total_cents = booking.total_cents;
    let http_client = state.http_client.clone();
    let capacity_url = state.config.capacity.base_url.clone();

    let (booking, payment) = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let debited = diesel::update(
                    credit_balances::table
                        .find(customer_id)
                        .filter(credit_balances::balance_cents.ge(due)),
                )
                .set(credit_balances::balance_cents.eq(credit_balances::balance_cents - due))
                .execute(conn)
                .await?;
                if debited == 0 {
                    return Err(AppError::InvalidState(
                        "insufficient credit balance".to_string(),
                    ));
                }

                let payment: PaymentEntity = diesel::insert_into(payments::table)
                    .values(CreatePaymentEntity {
                        booking_id,
                        amount_cents: due,
                        kind: "BALANCE".to_string(),
                        method: "CREDIT_BALANCE".to_string(),
                        card_cents: 0,
                        credit_cents: due,
                        status: "SUCCEEDED".to_string(),
                        provider_ref: None,
                    })
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create payment record")?;

                let confirmed = settlement::confirm_within(
                    conn,
                    booking_id,
                    total_cents,
                    &http_client,
                    &capacity_url,
                    None,
                )
                .await?;
                let Some(booking) = confirmed else {
                    // Raced with another settlement; the rollback restores
                    // the debit.
                    return Err(AppError::Conflict(
                        "booking is no longer awaiting payment".to_string(),
                    ));
                };

                Ok::<(BookingEntity, PaymentEntity), AppError>((booking, payment))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(InvoicePaymentRes {
            booking,
            payment,
            client_secret: None,
        }),
        message: Some("Invoice paid from credit balance"),
    })
}

/// Split payment: the whole available credit balance plus a card intent for
/// the remainder. The debit and the payment row commit first; if intent
/// creation then fails the debit is compensated, restoring the pre-call
/// balance.
async fn pay_with_split(
    state: &AppState,
    conn: &mut diesel_async::AsyncPgConnection,
    booking: BookingEntity,
    due: i64,
) -> Result<StdResponse<InvoicePaymentRes, &'static str>, AppError> {
    let Some(customer_id) = booking.customer_id else {
        return Err(AppError::InvalidState(
            "guest bookings cannot pay with credit balance".to_string(),
        ));
    };

    let balance: i64 = credit_balances::table
        .find(customer_id)
        .select(credit_balances::balance_cents)
        .first(conn)
        .await
        .optional()
        .context("Failed to read credit balance")?
        .unwrap_or(0);

    let Some(split) = split_invoice(due, balance) else {
        return Err(if balance <= 0 {
            AppError::InvalidState("no credit balance available".to_string())
        } else {
            AppError::InvalidState(
                "credit balance covers the invoice; pay with CREDIT_BALANCE instead".to_string(),
            )
        });
    };

    let booking_id = booking.id;
    let credit_part = split.credit_cents;
    let card_part = split.card_cents;
    let payment = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let debited = diesel::update(
                    credit_balances::table
                        .find(customer_id)
                        .filter(credit_balances::balance_cents.ge(credit_part)),
                )
                .set(
                    credit_balances::balance_cents.eq(credit_balances::balance_cents - credit_part),
                )
                .execute(conn)
                .await?;
                if debited == 0 {
                    return Err(AppError::InvalidState(
                        "insufficient credit balance".to_string(),
                    ));
                }

                let payment: PaymentEntity = diesel::insert_into(payments::table)
                    .values(CreatePaymentEntity {
                        booking_id,
                        amount_cents: due,
                        kind: "BALANCE".to_string(),
                        method: "BOTH".to_string(),
                        card_cents: card_part,
                        credit_cents: credit_part,
                        status: "PENDING".to_string(),
                        provider_ref: None,
                    })
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create payment record")?;

                Ok::<PaymentEntity, AppError>(payment)
            })
        })
        .await?;

    let contact = CustomerRef::of(&booking).contact().clone();
    let intent =
        match create_card_intent(state, &contact.email, &contact.name, card_part, booking_id).await
        {
            Ok(intent) => intent,
            Err(err) => {
                // Restore the credit debit and fail the payment row, leaving
                // the balance exactly as it was before the call.
                compensate_split(conn, customer_id, credit_part, payment.id).await?;
                return Err(err);
            }
        };

    let intent_id = intent.id.clone();
    let payment_id = payment.id;
    let (booking, payment) = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let payment: PaymentEntity = diesel::update(payments::table.find(payment_id))
                    .set(payments::provider_ref.eq(&intent_id))
                    .returning(PaymentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to record intent on payment")?;

                let booking: BookingEntity = diesel::update(bookings::table.find(booking_id))
                    .set((
                        bookings::payment_intent_id.eq(&intent_id),
                        bookings::payment_status.eq("PENDING"),
                    ))
                    .returning(BookingEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to record card intent on booking")?;

                Ok::<(BookingEntity, PaymentEntity), AppError>((booking, payment))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(InvoicePaymentRes {
            booking,
            payment,
            client_secret: Some(intent.client_secret),
        }),
        message: Some("Split payment initiated"),
    })
}

async fn create_card_intent(
    state: &AppState,
    email: &str,
    name: &str,
    amount_cents: i64,
    booking_id: i32,
) -> Result<crate::gateway::PaymentIntent, AppError> {
    let customer_ref = state.gateway.create_or_get_customer(email, name).await?;
    state
        .gateway
        .create_payment_intent(amount_cents, &customer_ref, booking_id)
        .await
}

async fn compensate_split(
    conn: &mut diesel_async::AsyncPgConnection,
    customer_id: i32,
    credit_part: i64,
    payment_id: uuid::Uuid,
) -> Result<(), AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            diesel::update(credit_balances::table.find(customer_id))
                .set(
                    credit_balances::balance_cents.eq(credit_balances::balance_cents + credit_part),
                )
                .execute(conn)
                .await?;

            diesel::update(payments::table.find(payment_id))
                .set((
                    payments::status.eq("FAILED"),
                    payments::failure_reason.eq("gateway intent creation failed"),
                ))
                .execute(conn)
                .await?;

            Ok::<(), AppError>(())
        })
    })
    .await
    .context("Failed to restore credit balance after gateway failure")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::middleware::Role;
    use chrono::Utc;

    fn booking(customer_id: Option<i32>, status: &str, intent: Option<&str>) -> BookingEntity {
        BookingEntity {
            id: 1,
            warehouse_id: 7,
            customer_id,
            created_by: None,
            approval_id: None,
            contact_name: "Ada".to_string(),
            contact_email: "ada@example.com".to_string(),
            contact_phone: None,
            booking_type: "PALLET".to_string(),
            status: status.to_string(),
            payment_status: "UNPAID".to_string(),
            requested_start: Utc::now(),
            proposed_start: None,
            proposal_note: None,
            scheduled_at: None,
            total_cents: 100_000,
            deposit_cents: None,
            paid_cents: 0,
            due_cents: 100_000,
            payment_intent_id: intent.map(str::to_string),
            payment_error: None,
            paid_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn actor(user_id: i32, role: Role, warehouse_ids: Vec<i32>) -> Actor {
        Actor {
            user_id,
            role,
            warehouse_ids,
        }
    }

    #[test]
    fn deposit_guard_only_runs_while_payment_is_pending() {
        let err = deposit_guard(&booking(Some(42), "PENDING", None)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let err = deposit_guard(&booking(Some(42), "CONFIRMED", None)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(
            deposit_guard(&booking(Some(42), "PAYMENT_PENDING", None)).unwrap(),
            None
        );
    }

    #[test]
    fn deposit_guard_rejects_unchargeable_totals() {
        let mut zero = booking(Some(42), "PAYMENT_PENDING", None);
        zero.total_cents = 0;
        assert!(matches!(
            deposit_guard(&zero).unwrap_err(),
            AppError::InvalidState(_)
        ));
    }

    #[test]
    fn repeated_deposit_requests_reuse_the_recorded_intent() {
        // Whether the caller comes back after a crash or loses the creation
        // race, a recorded intent always wins over minting a second one.
        assert_eq!(
            deposit_guard(&booking(Some(42), "PAYMENT_PENDING", Some("pi_1"))).unwrap(),
            Some("pi_1")
        );
    }

    #[test]
    fn staff_take_payments_for_guest_bookings() {
        let guest = booking(None, "PAYMENT_PENDING", None);
        assert!(payment_operator(&actor(5, Role::Staff, vec![7]), &guest).is_ok());
        assert!(payment_operator(&actor(5, Role::Staff, vec![8]), &guest).is_err());
        assert!(payment_operator(&actor(42, Role::Customer, vec![]), &guest).is_err());
    }

    #[test]
    fn customers_operate_only_their_own_payments() {
        let owned = booking(Some(42), "PAYMENT_PENDING", None);
        assert!(payment_operator(&actor(42, Role::Customer, vec![]), &owned).is_ok());
        assert!(payment_operator(&actor(7, Role::Customer, vec![]), &owned).is_err());
        assert!(payment_operator(&actor(5, Role::Staff, vec![7]), &owned).is_ok());
    }
}

