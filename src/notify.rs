//! Notification intents.
//!
//! Delivery is a collaborator concern; this module only enqueues the intent
//! on the outbox. Enqueue failures are logged and swallowed so a notification
//! problem can never fail or roll back a state transition.

use diesel_async::AsyncPgConnection;
use serde_json::Value;

use crate::{core::outbox, events::NotificationEvent};

pub async fn send(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    kind: &str,
    title: &str,
    message: &str,
    metadata: Value,
) {
    let event = NotificationEvent {
        user_id,
        kind: kind.to_string(),
        channels: vec!["push".to_string(), "email".to_string()],
        title: title.to_string(),
        message: message.to_string(),
        metadata,
    };
    if let Err(err) = outbox::publish(conn, "notifications.send".to_string(), event).await {
        tracing::warn!(user_id, kind, %err, "failed to enqueue notification");
    }
}
