//! Caller identity and the capability check used by every transition guard.
//!
//! Authentication itself is external: the API gateway verifies the session
//! and injects identity headers. This middleware only materializes them into
//! an [`Actor`] extension.

use axum::{extract::Request, middleware::Next, response::Response};

use crate::{
    core::app_error::AppError,
    domain::customer::CustomerRef,
    models::{ApprovalEntity, BookingEntity},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Role::Customer),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: i32,
    pub role: Role,
    /// Warehouses this actor holds a staff capability for.
    pub warehouse_ids: Vec<i32>,
}

/// The relationship a caller must hold to the entity it is acting on.
#[derive(Debug)]
pub enum Relationship<'a> {
    BookingCustomer(&'a BookingEntity),
    WarehouseStaff(i32),
    ApprovalMember(&'a ApprovalEntity),
    Admin,
}

/// Single capability check consumed by all transition guards; avoids
/// re-implementing role comparisons per endpoint.
pub fn authorize(actor: &Actor, relationship: Relationship<'_>) -> Result<(), AppError> {
    if actor.role == Role::Admin {
        return Ok(());
    }
    match relationship {
        Relationship::BookingCustomer(booking) => match CustomerRef::of(booking) {
            CustomerRef::Registered { id, .. } if id == actor.user_id => Ok(()),
            CustomerRef::Registered { .. } => Err(AppError::Forbidden(
                "caller is not the booking's customer".to_string(),
            )),
            CustomerRef::Guest { .. } => Err(AppError::Forbidden(
                "guest bookings cannot be operated through an account".to_string(),
            )),
        },
        Relationship::WarehouseStaff(warehouse_id) => {
            if actor.role == Role::Staff && actor.warehouse_ids.contains(&warehouse_id) {
                Ok(())
            } else {
                Err(AppError::Forbidden(format!(
                    "caller is not staff of warehouse {warehouse_id}"
                )))
            }
        }
        Relationship::ApprovalMember(approval) => {
            if actor.user_id == approval.member_id {
                Ok(())
            } else {
                Err(AppError::Forbidden(
                    "only the member the booking was made for may resolve it".to_string(),
                ))
            }
        }
        Relationship::Admin => Err(AppError::Forbidden(
            "administrator capability required".to_string(),
        )),
    }
}

/// Extracts the gateway-injected identity headers into an [`Actor`].
pub async fn actor_identity(mut req: Request, next: Next) -> Result<Response, AppError> {
    let headers = req.headers();

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| AppError::Forbidden("missing or invalid identity".to_string()))?;

    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .and_then(Role::parse)
        .unwrap_or(Role::Customer);

    let warehouse_ids = headers
        .get("x-staff-warehouses")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse::<i32>().ok())
                .collect()
        })
        .unwrap_or_default();

    req.extensions_mut().insert(Actor {
        user_id,
        role,
        warehouse_ids,
    });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn booking(customer_id: Option<i32>) -> BookingEntity {
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
            status: "PENDING".to_string(),
            payment_status: "UNPAID".to_string(),
            requested_start: Utc::now(),
            proposed_start: None,
            proposal_note: None,
            scheduled_at: None,
            total_cents: 100_000,
            deposit_cents: None,
            paid_cents: 0,
            due_cents: 100_000,
            payment_intent_id: None,
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
    fn customer_guard_rejects_other_users_and_guests() {
        let owned = booking(Some(42));
        assert!(
            authorize(
                &actor(42, Role::Customer, vec![]),
                Relationship::BookingCustomer(&owned)
            )
            .is_ok()
        );
        assert!(matches!(
            authorize(
                &actor(7, Role::Customer, vec![]),
                Relationship::BookingCustomer(&owned)
            ),
            Err(AppError::Forbidden(_))
        ));

        let guest = booking(None);
        assert!(matches!(
            authorize(
                &actor(42, Role::Customer, vec![]),
                Relationship::BookingCustomer(&guest)
            ),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn staff_capability_is_scoped_to_the_warehouse() {
        let staff = actor(5, Role::Staff, vec![7, 9]);
        assert!(authorize(&staff, Relationship::WarehouseStaff(7)).is_ok());
        assert!(matches!(
            authorize(&staff, Relationship::WarehouseStaff(8)),
            Err(AppError::Forbidden(_))
        ));
        // Customers never hold the staff capability.
        assert!(
            authorize(
                &actor(5, Role::Customer, vec![7]),
                Relationship::WarehouseStaff(7)
            )
            .is_err()
        );
    }

    #[test]
    fn admin_passes_every_check() {
        let admin = actor(1, Role::Admin, vec![]);
        let owned = booking(Some(42));
        assert!(authorize(&admin, Relationship::BookingCustomer(&owned)).is_ok());
        assert!(authorize(&admin, Relationship::WarehouseStaff(7)).is_ok());
        assert!(authorize(&admin, Relationship::Admin).is_ok());
    }
}
