use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use uuid::Uuid;

use crate::{
    core::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Actor, Relationship, authorize},
    },
    domain::money::remaining_refundable,
    models::{BookingEntity, CreateRefundEntity, PaymentEntity, RefundEntity},
    notify,
    schema::{bookings, credit_balances, payments, refunds},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/payments",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(process_refund))
            .route_layer(axum::middleware::from_fn(middleware::actor_identity)),
    )
}

#[derive(Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RefundDestination {
    Gateway,
    CreditBalance,
}

#[derive(Deserialize, ToSchema)]
struct ProcessRefundReq {
    /// Cents to refund; defaults to everything still refundable.
    amount_cents: Option<i64>,
    reason: String,
    destination: RefundDestination,
}

#[derive(Serialize, ToSchema)]
struct ProcessRefundRes {
    refund: RefundEntity,
    remaining_refundable_cents: i64,
}

/// Refund part or all of a settled payment. Gateway refunds complete
/// asynchronously over the webhook channel; credit refunds land on the
/// customer's balance immediately.
#[utoipa::path(
    post,
    path = "/{payment_id}/refund",
    tags = ["Refunds"],
    params(
        ("payment_id" = Uuid, Path, description = "Payment to refund")
    ),
    request_body = ProcessRefundReq,
    responses(
        (status = 200, description = "Refund processed", body = StdResponse<ProcessRefundRes, String>)
    )
)]
async fn process_refund(
    Path(payment_id): Path<Uuid>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ProcessRefundReq>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&actor, Relationship::Admin)?;

    if body.reason.trim().is_empty() {
        return Err(AppError::BadRequest("a refund reason is required".to_string()));
    }

    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let payment: PaymentEntity = payments::table
        .find(payment_id)
        .select(PaymentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get payment")?
        .ok_or(AppError::NotFound)?;

    if payment.status != "SUCCEEDED" {
        return Err(AppError::InvalidState(format!(
            "cannot refund a payment that is {}",
            payment.status
        )));
    }

    let booking: BookingEntity = bookings::table
        .find(payment.booking_id)
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .context("Failed to get booking for payment")?;

    // Failed refunds release their slice; pending ones still hold it, so a
    // concurrent double refund cannot exceed the payment.
    let refunded: i64 = refunds::table
        .filter(refunds::payment_id.eq(payment_id))
        .filter(refunds::status.ne("FAILED"))
        .select(refunds::amount_cents)
        .load::<i64>(conn)
        .await
        .context("Failed to load prior refunds")?
        .into_iter()
        .sum();

    let remaining = remaining_refundable(payment.amount_cents, refunded);
    let amount = body.amount_cents.unwrap_or(remaining);
    if amount <= 0 {
        return Err(AppError::BadRequest(
            "refund amount must be positive".to_string(),
        ));
    }
    if amount > remaining {
        return Err(AppError::BadRequest(format!(
            "only {remaining} cents remain refundable on this payment"
        )));
    }

    let refund = match body.destination {
        RefundDestination::Gateway => {
            refund_to_gateway(&state, conn, &payment, amount, &body.reason).await?
        }
        RefundDestination::CreditBalance => {
            refund_to_credit(conn, &payment, &booking, amount, &body.reason).await?
        }
    };

    if let Some(customer_id) = booking.customer_id {
        notify::send(
            conn,
            customer_id,
            "refund_processed",
            "Refund processed",
            &format!("A refund of {amount} cents was issued for your booking."),
            json!({ "booking_id": booking.id, "refund_id": refund.id }),
        )
        .await;
    }

    tracing::info!(
        payment_id = %payment_id,
        refund_id = %refund.id,
        amount,
        destination = refund.destination,
        "refund processed"
    );

    Ok(StdResponse {
        data: Some(ProcessRefundRes {
            remaining_refundable_cents: remaining - amount,
            refund,
        }),
        message: Some("Refund processed"),
    })
}

/// Gateway refunds need a provider reference to push money back to; a payment
/// settled purely from credit balance has none.
async fn refund_to_gateway(
    state: &AppState,
    conn: &mut diesel_async::AsyncPgConnection,
    payment: &PaymentEntity,
    amount: i64,
    reason: &str,
) -> Result<RefundEntity, AppError> {
    let Some(provider_ref) = &payment.provider_ref else {
        return Err(AppError::BadRequest(
            "payment has no gateway charge to refund; use CREDIT_BALANCE".to_string(),
        ));
    };

    let refund_ref = state.gateway.refund(provider_ref, amount).await?;

    diesel::insert_into(refunds::table)
        .values(CreateRefundEntity {
            payment_id: payment.id,
            amount_cents: amount,
            reason: reason.to_string(),
            destination: "GATEWAY".to_string(),
            status: "PENDING".to_string(),
            provider_ref: Some(refund_ref),
        })
        .returning(RefundEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create refund record")
        .map_err(Into::into)
}

async fn refund_to_credit(
    conn: &mut diesel_async::AsyncPgConnection,
    payment: &PaymentEntity,
    booking: &BookingEntity,
    amount: i64,
    reason: &str,
) -> Result<RefundEntity, AppError> {
    let Some(customer_id) = booking.customer_id else {
        return Err(AppError::BadRequest(
            "guest bookings have no credit balance to refund to".to_string(),
        ));
    };

    let payment_id = payment.id;
    let reason = reason.to_string();
    conn.transaction(move |conn| {
        Box::pin(async move {
            diesel::insert_into(credit_balances::table)
                .values((
                    credit_balances::customer_id.eq(customer_id),
                    credit_balances::balance_cents.eq(amount),
                ))
                .on_conflict(credit_balances::customer_id)
                .do_update()
                .set(credit_balances::balance_cents.eq(credit_balances::balance_cents + amount))
                .execute(conn)
                .await
                .context("Failed to credit customer balance")?;

            let refund: RefundEntity = diesel::insert_into(refunds::table)
                .values(CreateRefundEntity {
                    payment_id,
                    amount_cents: amount,
                    reason,
                    destination: "CREDIT_BALANCE".to_string(),
                    status: "COMPLETED".to_string(),
                    provider_ref: None,
                })
                .returning(RefundEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to create refund record")?;

            Ok::<RefundEntity, AppError>(refund)
        })
    })
    .await
}
