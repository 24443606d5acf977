use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{Identifiable, Insertable, Queryable},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

// Bookings

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BookingEntity {
    pub id: i32,
    pub warehouse_id: i32,
    pub customer_id: Option<i32>,
    pub created_by: Option<i32>,
    pub approval_id: Option<i32>,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: Option<String>,
    pub booking_type: String,
    pub status: String,
    pub payment_status: String,
    pub requested_start: DateTime<Utc>,
    pub proposed_start: Option<DateTime<Utc>>,
    pub proposal_note: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total_cents: i64,
    pub deposit_cents: Option<i64>,
    pub paid_cents: i64,
    pub due_cents: i64,
    pub payment_intent_id: Option<String>,
    pub payment_error: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateBookingEntity {
    pub warehouse_id: i32,
    pub customer_id: Option<i32>,
    pub created_by: Option<i32>,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: Option<String>,
    pub booking_type: String,
    pub status: String,
    pub payment_status: String,
    pub requested_start: DateTime<Utc>,
    pub total_cents: i64,
    pub due_cents: i64,
}

// Approvals

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::booking_approvals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ApprovalEntity {
    pub id: i32,
    pub booking_id: i32,
    pub requested_by: i32,
    pub member_id: i32,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::booking_approvals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateApprovalEntity {
    pub booking_id: i32,
    pub requested_by: i32,
    pub member_id: i32,
    pub status: String,
}

// Payments

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PaymentEntity {
    pub id: Uuid,
    pub booking_id: i32,
    pub amount_cents: i64,
    pub kind: String,
    pub method: String,
    pub card_cents: i64,
    pub credit_cents: i64,
    pub status: String,
    pub provider_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Serialize, Deserialize, Debug)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreatePaymentEntity {
    pub booking_id: i32,
    pub amount_cents: i64,
    pub kind: String,
    pub method: String,
    pub card_cents: i64,
    pub credit_cents: i64,
    pub status: String,
    pub provider_ref: Option<String>,
}

// Refunds

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::refunds)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RefundEntity {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub reason: String,
    pub destination: String,
    pub status: String,
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::refunds)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateRefundEntity {
    pub payment_id: Uuid,
    pub amount_cents: i64,
    pub reason: String,
    pub destination: String,
    pub status: String,
    pub provider_ref: Option<String>,
}

// Credit balances

#[derive(Queryable, Selectable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::credit_balances)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreditBalanceEntity {
    pub customer_id: i32,
    pub balance_cents: i64,
    pub updated_at: DateTime<Utc>,
}
