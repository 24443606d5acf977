//! Events published through the outbox for downstream services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fire-and-forget user-facing message, consumed by the notification service.
#[derive(Serialize, Deserialize, Debug)]
pub struct NotificationEvent {
    pub user_id: i32,
    pub kind: String,
    pub channels: Vec<String>,
    pub title: String,
    pub message: String,
    pub metadata: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BookingConfirmedEvent {
    pub booking_id: i32,
    pub warehouse_id: i32,
    pub booking_type: String,
}
