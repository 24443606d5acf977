//! Transactional outbox.
//!
//! Domain transactions insert events here; the relay task drains pending rows
//! to the message broker, so a broker outage never fails a state transition.

use anyhow::{Context, Result};
use diesel::{ExpressionMethods, Insertable, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use lapin::{BasicProperties, ExchangeKind, options::*, types::FieldTable};
use serde::Serialize;
use tracing::{info, warn};

use crate::{core::app_state::AppState, schema::outbox};

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::outbox)]
struct CreateOutboxEntity {
    event_type: String,
    payload: String,
}

/// Insert an event into the outbox inside the caller's transaction.
pub async fn publish<T: Serialize>(
    conn: &mut AsyncPgConnection,
    event_type: String,
    event: T,
) -> Result<()> {
    let payload = serde_json::to_string(&event).context("Failed to serialize outbox event")?;
    diesel::insert_into(outbox::table)
        .values(CreateOutboxEntity {
            event_type,
            payload,
        })
        .execute(conn)
        .await
        .context("Failed to insert outbox event")?;
    Ok(())
}

/// Background task: forwards pending outbox rows to the broker.
pub async fn relay(state: AppState) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if let Err(err) = drain(&state).await {
            warn!(%err, "outbox relay pass failed; will retry");
        }
    }
}

async fn drain(state: &AppState) -> Result<()> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let pending: Vec<(i32, String, String)> = outbox::table
        .filter(outbox::status.eq("PENDING"))
        .order_by(outbox::created_at.asc())
        .limit(50)
        .select((outbox::id, outbox::event_type, outbox::payload))
        .get_results(conn)
        .await
        .context("Failed to read pending outbox rows")?;

    if pending.is_empty() {
        return Ok(());
    }

    let amqp = lapin::Connection::connect(
        &state.config.amqp.url,
        lapin::ConnectionProperties::default(),
    )
    .await
    .context("Failed to connect to AMQP broker")?;
    let channel = amqp.create_channel().await?;
    channel
        .exchange_declare(
            state.config.amqp.exchange.as_str().into(),
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    for (id, event_type, payload) in pending {
        channel
            .basic_publish(
                state.config.amqp.exchange.as_str().into(),
                event_type.as_str().into(),
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default(),
            )
            .await?
            .await?;

        diesel::update(outbox::table.find(id))
            .set(outbox::status.eq("SENT"))
            .execute(conn)
            .await?;

        info!(outbox_id = id, event_type, "outbox event published");
    }

    Ok(())
}
