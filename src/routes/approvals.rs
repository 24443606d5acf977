use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    core::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Actor, Relationship, authorize},
    },
    domain::status::{Transition, prior_strs, target},
    models::{ApprovalEntity, BookingEntity},
    notify,
    schema::{booking_approvals, bookings},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/approvals",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(approve_on_behalf))
            .routes(utoipa_axum::routes!(reject_on_behalf))
            .route_layer(axum::middleware::from_fn(middleware::actor_identity)),
    )
}

#[derive(Serialize, ToSchema)]
struct ResolveApprovalRes {
    approval: ApprovalEntity,
    booking: BookingEntity,
}

/// Accept a booking created on your behalf.
#[utoipa::path(
    patch,
    path = "/{booking_id}/approve",
    tags = ["Approvals"],
    params(
        ("booking_id" = i32, Path, description = "Booking awaiting approval")
    ),
    responses(
        (status = 200, description = "Approved booking successfully", body = StdResponse<ResolveApprovalRes, String>)
    )
)]
async fn approve_on_behalf(
    Path(booking_id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let approval = load_approval(conn, booking_id).await?;
    authorize(&actor, Relationship::ApprovalMember(&approval))?;

    let resolved = resolve_once(conn, approval.id, "APPROVED").await?;

    let booking: BookingEntity = bookings::table
        .find(booking_id)
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .context("Failed to get booking")?;

    tracing::info!(booking_id, approval_id = resolved.id, "on-behalf booking approved");

    Ok(StdResponse {
        data: Some(ResolveApprovalRes {
            approval: resolved,
            booking,
        }),
        message: Some("Approved booking successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
struct RejectApprovalReq {
    message: Option<String>,
}

/// Decline a booking created on your behalf; the booking is rejected.
#[utoipa::path(
    patch,
    path = "/{booking_id}/reject",
    tags = ["Approvals"],
    params(
        ("booking_id" = i32, Path, description = "Booking awaiting approval")
    ),
    request_body = RejectApprovalReq,
    responses(
        (status = 200, description = "Rejected booking successfully", body = StdResponse<ResolveApprovalRes, String>)
    )
)]
async fn reject_on_behalf(
    Path(booking_id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<RejectApprovalReq>,
) -> Result<impl IntoResponse, AppError> {
    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let approval = load_approval(conn, booking_id).await?;
    authorize(&actor, Relationship::ApprovalMember(&approval))?;

    let requested_by = approval.requested_by;
    let approval_id = approval.id;
    let message = body.message.clone();
    let (resolved, booking) = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let resolved = resolve_once(conn, approval_id, "REJECTED").await?;
                if let Some(message) = &message {
                    diesel::update(booking_approvals::table.find(approval_id))
                        .set(booking_approvals::message.eq(message))
                        .execute(conn)
                        .await?;
                }

                // The booking follows the rejection; if it was already
                // cancelled the resolution alone stands.
                let rejected: Option<BookingEntity> = diesel::update(
                    bookings::table
                        .find(booking_id)
                        .filter(bookings::status.eq_any(prior_strs(Transition::RejectOnBehalf))),
                )
                .set(bookings::status.eq(target(Transition::RejectOnBehalf).as_str()))
                .returning(BookingEntity::as_returning())
                .get_result(conn)
                .await
                .optional()?;

                let booking = match rejected {
                    Some(booking) => booking,
                    None => {
                        tracing::warn!(
                            booking_id,
                            "approval rejected but booking was no longer rejectable"
                        );
                        bookings::table
                            .find(booking_id)
                            .select(BookingEntity::as_select())
                            .first(conn)
                            .await?
                    }
                };

                notify::send(
                    conn,
                    requested_by,
                    "booking_rejected",
                    "Booking declined",
                    &message.unwrap_or_else(|| {
                        "The member declined the booking made on their behalf.".to_string()
                    }),
                    json!({ "booking_id": booking_id }),
                )
                .await;

                Ok::<(ApprovalEntity, BookingEntity), AppError>((resolved, booking))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(ResolveApprovalRes {
            approval: resolved,
            booking,
        }),
        message: Some("Rejected booking successfully"),
    })
}

async fn load_approval(
    conn: &mut diesel_async::AsyncPgConnection,
    booking_id: i32,
) -> Result<ApprovalEntity, AppError> {
    booking_approvals::table
        .filter(booking_approvals::booking_id.eq(booking_id))
        .select(ApprovalEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get booking approval")?
        .ok_or(AppError::NotFound)
}

/// One-shot resolution. A second attempt is a conflict even with the same
/// outcome; approvals are human decisions, not idempotent settlements.
async fn resolve_once(
    conn: &mut diesel_async::AsyncPgConnection,
    approval_id: i32,
    outcome: &str,
) -> Result<ApprovalEntity, AppError> {
    let resolved: Option<ApprovalEntity> = diesel::update(
        booking_approvals::table
            .find(approval_id)
            .filter(booking_approvals::status.eq("PENDING")),
    )
    .set((
        booking_approvals::status.eq(outcome),
        booking_approvals::resolved_at.eq(Utc::now()),
    ))
    .returning(ApprovalEntity::as_returning())
    .get_result(conn)
    .await
    .optional()?;

    resolved.ok_or_else(|| AppError::Conflict("approval has already been resolved".to_string()))
}
