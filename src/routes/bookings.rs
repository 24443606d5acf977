use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Duration, Utc};
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
    domain::{
        money::PRE_ORDER_LEAD_DAYS,
        status::{BookingStatus, BookingType, Transition, prior_strs, target},
    },
    models::{ApprovalEntity, BookingEntity, CreateApprovalEntity, CreateBookingEntity},
    notify,
    routes::transition_conflict,
    schema::{booking_approvals, bookings},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/bookings",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(create_booking))
            .routes(utoipa_axum::routes!(get_my_bookings))
            .routes(utoipa_axum::routes!(get_booking))
            .routes(utoipa_axum::routes!(cancel_booking))
            .routes(utoipa_axum::routes!(set_awaiting_time_slot))
            .routes(utoipa_axum::routes!(propose_date_change))
            .routes(utoipa_axum::routes!(confirm_time_slot))
            .routes(utoipa_axum::routes!(activate_booking))
            .routes(utoipa_axum::routes!(complete_booking))
            .route_layer(axum::middleware::from_fn(middleware::actor_identity)),
    )
}

#[derive(Deserialize, ToSchema)]
struct CreateBookingReq {
    warehouse_id: i32,
    booking_type: BookingType,
    requested_start: DateTime<Utc>,
    total_cents: i64,
    /// Account the booking is for. `None` creates a guest booking (staff
    /// only); an id other than the caller's creates an on-behalf booking
    /// requiring that member's approval.
    customer_id: Option<i32>,
    contact_name: String,
    contact_email: String,
    contact_phone: Option<String>,
}

#[derive(Serialize, ToSchema)]
struct CreateBookingRes {
    booking: BookingEntity,
    approval: Option<ApprovalEntity>,
}

/// Create a new booking, optionally on behalf of another member.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Bookings"],
    request_body = CreateBookingReq,
    responses(
        (status = 200, description = "Created booking successfully", body = StdResponse<CreateBookingRes, String>)
    )
)]
async fn create_booking(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreateBookingReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.total_cents <= 0 {
        return Err(AppError::BadRequest(
            "total_cents must be positive".to_string(),
        ));
    }
    if !body.contact_email.contains('@') {
        return Err(AppError::BadRequest(
            "contact_email is not a valid email address".to_string(),
        ));
    }

    let on_behalf_member = match body.customer_id {
        Some(id) if id != actor.user_id => Some(id),
        _ => None,
    };
    if on_behalf_member.is_some() {
        // Booking for another member requires the team-admin capability.
        authorize(&actor, Relationship::Admin)?;
    }
    if body.customer_id.is_none() {
        // Guest bookings are taken at the desk by warehouse staff.
        authorize(&actor, Relationship::WarehouseStaff(body.warehouse_id)).map_err(|_| {
            AppError::Forbidden(
                "guest bookings can only be created by warehouse staff".to_string(),
            )
        })?;
    }

    let status = if body.requested_start > Utc::now() + Duration::days(PRE_ORDER_LEAD_DAYS) {
        BookingStatus::PreOrder
    } else {
        BookingStatus::Pending
    };

    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let requested_by = actor.user_id;
    let (booking, approval) = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let booking: BookingEntity = diesel::insert_into(bookings::table)
                    .values(CreateBookingEntity {
                        warehouse_id: body.warehouse_id,
                        customer_id: body.customer_id,
                        created_by: Some(requested_by),
                        contact_name: body.contact_name,
                        contact_email: body.contact_email,
                        contact_phone: body.contact_phone,
                        booking_type: body.booking_type.as_str().to_string(),
                        status: status.as_str().to_string(),
                        payment_status: "UNPAID".to_string(),
                        requested_start: body.requested_start,
                        total_cents: body.total_cents,
                        due_cents: body.total_cents,
                    })
                    .returning(BookingEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create booking")?;

                let Some(member_id) = on_behalf_member else {
                    return Ok::<(BookingEntity, Option<ApprovalEntity>), AppError>((
                        booking, None,
                    ));
                };

                let approval: ApprovalEntity = diesel::insert_into(booking_approvals::table)
                    .values(CreateApprovalEntity {
                        booking_id: booking.id,
                        requested_by,
                        member_id,
                        status: "PENDING".to_string(),
                    })
                    .returning(ApprovalEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create booking approval")?;

                let booking: BookingEntity = diesel::update(bookings::table.find(booking.id))
                    .set(bookings::approval_id.eq(approval.id))
                    .returning(BookingEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to link approval to booking")?;

                notify::send(
                    conn,
                    member_id,
                    "booking_approval_requested",
                    "Booking approval requested",
                    "A warehouse booking was created on your behalf and awaits your approval.",
                    json!({ "booking_id": booking.id, "approval_id": approval.id }),
                )
                .await;

                Ok((booking, Some(approval)))
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(CreateBookingRes { booking, approval }),
        message: Some("Created booking successfully"),
    })
}

/// Fetch all bookings belonging to the authenticated customer.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Bookings"],
    responses(
        (status = 200, description = "List my bookings", body = StdResponse<Vec<BookingEntity>, String>)
    )
)]
async fn get_my_bookings(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let my_bookings: Vec<BookingEntity> = bookings::table
        .filter(bookings::customer_id.eq(actor.user_id))
        .order_by(bookings::updated_at.desc())
        .select(BookingEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get my bookings")?;

    Ok(StdResponse {
        data: Some(my_bookings),
        message: Some("Get my bookings successfully"),
    })
}

/// Fetch a specific booking.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Bookings"],
    params(
        ("id" = i32, Path, description = "Booking ID to fetch")
    ),
    responses(
        (status = 200, description = "Get booking successfully", body = StdResponse<BookingEntity, String>)
    )
)]
async fn get_booking(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let booking: BookingEntity = bookings::table
        .find(id)
        .select(BookingEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get booking")?
        .ok_or(AppError::NotFound)?;

    let viewable = authorize(&actor, Relationship::BookingCustomer(&booking)).is_ok()
        || authorize(&actor, Relationship::WarehouseStaff(booking.warehouse_id)).is_ok();
    if !viewable {
        return Err(AppError::Forbidden(
            "caller has no relationship to this booking".to_string(),
        ));
    }

    Ok(StdResponse {
        data: Some(booking),
        message: Some("Get booking successfully"),
    })
}

/// Cancel a booking that has not been paid for yet.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Bookings"],
    params(
        ("id" = i32, Path, description = "Booking ID to cancel")
    ),
    responses(
        (status = 200, description = "Cancelled booking successfully", body = StdResponse<BookingEntity, String>)
    )
)]
async fn cancel_booking(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
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

    let allowed = authorize(&actor, Relationship::BookingCustomer(&booking)).is_ok()
        || authorize(&actor, Relationship::WarehouseStaff(booking.warehouse_id)).is_ok();
    if !allowed {
        return Err(AppError::Forbidden(
            "caller has no relationship to this booking".to_string(),
        ));
    }

    let customer_id = booking.customer_id;
    let cancelled_by_customer = customer_id == Some(actor.user_id);
    let cancelled = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cancelled: Option<BookingEntity> = diesel::update(
                    bookings::table
                        .find(id)
                        .filter(bookings::status.eq_any(prior_strs(Transition::Cancel))),
                )
                .set(bookings::status.eq(target(Transition::Cancel).as_str()))
                .returning(BookingEntity::as_returning())
                .get_result(conn)
                .await
                .optional()?;

                let Some(cancelled) = cancelled else {
                    return Ok::<Option<BookingEntity>, AppError>(None);
                };

                if let Some(customer_id) = customer_id
                    && !cancelled_by_customer
                {
                    notify::send(
                        conn,
                        customer_id,
                        "booking_cancelled",
                        "Booking cancelled",
                        "Your warehouse booking has been cancelled.",
                        json!({ "booking_id": cancelled.id }),
                    )
                    .await;
                }

                Ok(Some(cancelled))
            })
        })
        .await?;

    let Some(cancelled) = cancelled else {
        return Err(transition_conflict(conn, id, Transition::Cancel).await);
    };

    Ok(StdResponse {
        data: Some(cancelled),
        message: Some("Cancelled booking successfully"),
    })
}

/// Move a booking into scheduling negotiation.
#[utoipa::path(
    patch,
    path = "/{id}/awaiting-time-slot",
    tags = ["Scheduling"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    responses(
        (status = 200, description = "Booking now awaits a time slot", body = StdResponse<BookingEntity, String>)
    )
)]
async fn set_awaiting_time_slot(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
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

    authorize(&actor, Relationship::WarehouseStaff(booking.warehouse_id))?;

    // On-behalf bookings hold here until the member accepts.
    if let Some(approval_id) = booking.approval_id {
        let approval: ApprovalEntity = booking_approvals::table
            .find(approval_id)
            .select(ApprovalEntity::as_select())
            .first(conn)
            .await
            .context("Failed to get booking approval")?;
        if approval.status == "PENDING" {
            return Err(AppError::Conflict(
                "booking is awaiting member approval".to_string(),
            ));
        }
    }

    let updated: Option<BookingEntity> = diesel::update(
        bookings::table
            .find(id)
            .filter(bookings::status.eq_any(prior_strs(Transition::SetAwaitingTimeSlot))),
    )
    .set(bookings::status.eq(target(Transition::SetAwaitingTimeSlot).as_str()))
    .returning(BookingEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to update booking")?;

    let Some(updated) = updated else {
        return Err(transition_conflict(conn, id, Transition::SetAwaitingTimeSlot).await);
    };

    Ok(StdResponse {
        data: Some(updated),
        message: Some("Booking now awaits a time slot"),
    })
}

#[derive(Deserialize, ToSchema)]
struct ProposeDateChangeReq {
    proposed_start: DateTime<Utc>,
    note: Option<String>,
}

/// Propose a different start date/time to the customer.
#[utoipa::path(
    patch,
    path = "/{id}/propose-date",
    tags = ["Scheduling"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    request_body = ProposeDateChangeReq,
    responses(
        (status = 200, description = "Proposed date change successfully", body = StdResponse<BookingEntity, String>)
    )
)]
async fn propose_date_change(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<ProposeDateChangeReq>,
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

    authorize(&actor, Relationship::WarehouseStaff(booking.warehouse_id))?;

    let customer_id = booking.customer_id;
    let updated = conn
        .transaction(move |conn| {
            Box::pin(async move {
                // Negotiation is only valid before money changes hands.
                let updated: Option<BookingEntity> = diesel::update(
                    bookings::table
                        .find(id)
                        .filter(bookings::status.eq(BookingStatus::AwaitingTimeSlot.as_str())),
                )
                .set((
                    bookings::proposed_start.eq(body.proposed_start),
                    bookings::proposal_note.eq(body.note.clone()),
                ))
                .returning(BookingEntity::as_returning())
                .get_result(conn)
                .await
                .optional()?;

                let Some(updated) = updated else {
                    return Ok::<Option<BookingEntity>, AppError>(None);
                };

                if let Some(customer_id) = customer_id {
                    notify::send(
                        conn,
                        customer_id,
                        "date_change_proposed",
                        "New time slot proposed",
                        "Warehouse staff proposed a different start time for your booking.",
                        json!({
                            "booking_id": updated.id,
                            "proposed_start": body.proposed_start,
                            "note": body.note,
                        }),
                    )
                    .await;
                }

                Ok(Some(updated))
            })
        })
        .await?;

    let Some(updated) = updated else {
        let current: Option<String> = bookings::table
            .find(id)
            .select(bookings::status)
            .first(conn)
            .await
            .optional()
            .context("Failed to read booking status")?;
        return Err(match current {
            Some(current) => AppError::Conflict(format!(
                "cannot propose a date change while booking is {current}"
            )),
            None => AppError::NotFound,
        });
    };

    Ok(StdResponse {
        data: Some(updated),
        message: Some("Proposed date change successfully"),
    })
}

/// Accept the proposed (or originally requested) time slot.
#[utoipa::path(
    patch,
    path = "/{id}/confirm-time-slot",
    tags = ["Scheduling"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    responses(
        (status = 200, description = "Time slot confirmed; booking awaits payment", body = StdResponse<BookingEntity, String>)
    )
)]
async fn confirm_time_slot(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
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

    authorize(&actor, Relationship::BookingCustomer(&booking))?;

    let scheduled_at = booking.proposed_start.unwrap_or(booking.requested_start);
    let updated: Option<BookingEntity> = diesel::update(
        bookings::table
            .find(id)
            .filter(bookings::status.eq_any(prior_strs(Transition::ConfirmTimeSlot))),
    )
    .set((
        bookings::status.eq(target(Transition::ConfirmTimeSlot).as_str()),
        bookings::scheduled_at.eq(scheduled_at),
    ))
    .returning(BookingEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to update booking")?;

    let Some(updated) = updated else {
        return Err(transition_conflict(conn, id, Transition::ConfirmTimeSlot).await);
    };

    Ok(StdResponse {
        data: Some(updated),
        message: Some("Time slot confirmed"),
    })
}

/// Mark a confirmed booking as physically active (goods moved in).
#[utoipa::path(
    patch,
    path = "/{id}/activate",
    tags = ["Bookings"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    responses(
        (status = 200, description = "Booking activated", body = StdResponse<BookingEntity, String>)
    )
)]
async fn activate_booking(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    run_operations_transition(&state, id, &actor, Transition::Activate, "Booking activated").await
}

/// Close out an active booking.
#[utoipa::path(
    patch,
    path = "/{id}/complete",
    tags = ["Bookings"],
    params(
        ("id" = i32, Path, description = "Booking ID")
    ),
    responses(
        (status = 200, description = "Booking completed", body = StdResponse<BookingEntity, String>)
    )
)]
async fn complete_booking(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    run_operations_transition(&state, id, &actor, Transition::Complete, "Booking completed").await
}

/// Staff-driven post-payment transitions share one conditional-update shape.
async fn run_operations_transition(
    state: &AppState,
    id: i32,
    actor: &Actor,
    transition: Transition,
    message: &'static str,
) -> Result<StdResponse<BookingEntity, &'static str>, AppError> {
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

    authorize(actor, Relationship::WarehouseStaff(booking.warehouse_id))?;

    let updated: Option<BookingEntity> = diesel::update(
        bookings::table
            .find(id)
            .filter(bookings::status.eq_any(prior_strs(transition))),
    )
    .set(bookings::status.eq(target(transition).as_str()))
    .returning(BookingEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to update booking")?;

    let Some(updated) = updated else {
        return Err(transition_conflict(conn, id, transition).await);
    };

    Ok(StdResponse {
        data: Some(updated),
        message: Some(message),
    })
}
