use anyhow::Context;
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    core::{app_error::AppError, app_state::AppState},
    gateway::{
        self, EVENT_REFUND_FAILED, EVENT_REFUND_SUCCEEDED, EVENT_SETTLEMENT_FAILED,
        EVENT_SETTLEMENT_SUCCEEDED, WebhookEvent,
    },
    schema::refunds,
    settlement::{self, SettlementOutcome, SettlementSource},
};

pub const SIGNATURE_HEADER: &str = "gateway-signature";

// No identity layer here: the gateway authenticates with the signature
// header, not the internal actor headers.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/webhooks",
        OpenApiRouter::new().routes(utoipa_axum::routes!(handle_gateway_webhook)),
    )
}

/// Signed event push from the payment gateway.
///
/// Status codes drive the gateway's retry policy: 2xx acknowledges the event,
/// anything else gets redelivered. Events we cannot act on (unknown intent,
/// booking in the wrong state) are acknowledged so they stop retrying; only
/// infrastructure failures return 5xx.
#[utoipa::path(
    post,
    path = "/gateway",
    tags = ["Webhooks"],
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Event acknowledged"),
        (status = 400, description = "Invalid signature or payload")
    )
)]
async fn handle_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Err(reason) = gateway::verify_webhook_signature(
        &body,
        signature,
        &state.config.gateway.webhook_secret,
    ) {
        tracing::warn!(reason, "rejected gateway webhook");
        return StatusCode::BAD_REQUEST;
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(%err, "gateway webhook payload did not parse");
            return StatusCode::BAD_REQUEST;
        }
    };

    ack_status(dispatch(&state, &event).await, &event.id)
}

/// Maps a processing result to the acknowledgement code that drives the
/// gateway's retry policy.
fn ack_status(result: Result<(), AppError>, event_id: &str) -> StatusCode {
    match result {
        Ok(()) => StatusCode::OK,
        // Acknowledged but not applied: retrying would not change anything.
        Err(AppError::NotFound) => {
            tracing::warn!(event_id, "webhook event references nothing we know");
            StatusCode::OK
        }
        Err(AppError::Conflict(msg)) => {
            tracing::info!(event_id, msg, "webhook event absorbed as no-op");
            StatusCode::OK
        }
        // Permanently malformed; redelivery cannot fix it.
        Err(AppError::BadRequest(msg)) => {
            tracing::warn!(event_id, msg, "malformed webhook event");
            StatusCode::BAD_REQUEST
        }
        Err(err) => {
            tracing::error!(event_id, %err, "failed to process webhook event");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn dispatch(state: &AppState, event: &WebhookEvent) -> Result<(), AppError> {
    match event.event_type.as_str() {
        EVENT_SETTLEMENT_SUCCEEDED => {
            let intent_id = require_intent(event)?;
            settlement::apply_settlement(
                state,
                SettlementSource::Webhook,
                intent_id,
                SettlementOutcome::Succeeded,
            )
            .await?;
            Ok(())
        }
        EVENT_SETTLEMENT_FAILED => {
            let intent_id = require_intent(event)?;
            let reason = event
                .data
                .error
                .clone()
                .unwrap_or_else(|| "payment failed".to_string());
            settlement::apply_settlement(
                state,
                SettlementSource::Webhook,
                intent_id,
                SettlementOutcome::Failed { reason },
            )
            .await?;
            Ok(())
        }
        EVENT_REFUND_SUCCEEDED => complete_refund(state, event, "COMPLETED", None).await,
        EVENT_REFUND_FAILED => {
            let reason = event
                .data
                .error
                .clone()
                .unwrap_or_else(|| "refund failed".to_string());
            complete_refund(state, event, "FAILED", Some(reason)).await
        }
        other => {
            tracing::debug!(event_id = event.id, event_type = other, "ignoring webhook event");
            Ok(())
        }
    }
}

fn require_intent(event: &WebhookEvent) -> Result<&str, AppError> {
    event
        .data
        .intent_id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("webhook event carries no intent id".to_string()))
}

/// Terminal refund transition keyed on the gateway's refund reference. Only
/// a pending refund moves; redeliveries match no rows and acknowledge.
async fn complete_refund(
    state: &AppState,
    event: &WebhookEvent,
    status: &str,
    reason: Option<String>,
) -> Result<(), AppError> {
    let Some(refund_ref) = event.data.refund_ref.as_deref() else {
        return Err(AppError::BadRequest(
            "webhook event carries no refund reference".to_string(),
        ));
    };

    let mut pooled = state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;
    let conn = &mut *pooled;

    let moved = diesel::update(
        refunds::table
            .filter(refunds::provider_ref.eq(refund_ref))
            .filter(refunds::status.eq("PENDING")),
    )
    .set(refunds::status.eq(status))
    .execute(conn)
    .await
    .context("Failed to update refund status")?;

    if moved == 0 {
        tracing::info!(refund_ref, status, "refund already settled or unknown; acknowledging");
    } else {
        tracing::info!(refund_ref, status, reason, "refund settled");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, data: &str) -> WebhookEvent {
        serde_json::from_str(&format!(
            r#"{{"id":"evt_1","type":"{event_type}","data":{data}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn events_without_their_reference_are_bad_requests() {
        let err = require_intent(&event("settlement_succeeded", "{}")).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(
            require_intent(&event("settlement_succeeded", r#"{"intent_id":"pi_1"}"#)).unwrap(),
            "pi_1"
        );
    }

    #[test]
    fn acknowledgement_codes_drive_gateway_retries() {
        // Applied, unknown reference and state no-ops all acknowledge so the
        // gateway stops retrying.
        assert_eq!(ack_status(Ok(()), "evt"), StatusCode::OK);
        assert_eq!(ack_status(Err(AppError::NotFound), "evt"), StatusCode::OK);
        assert_eq!(
            ack_status(Err(AppError::Conflict("settled".into())), "evt"),
            StatusCode::OK
        );
        // A structurally bad event can never be fixed by redelivery.
        assert_eq!(
            ack_status(Err(AppError::BadRequest("no intent id".into())), "evt"),
            StatusCode::BAD_REQUEST
        );
        // Infrastructure failures want the gateway's redelivery.
        assert_eq!(
            ack_status(Err(AppError::Other(anyhow::anyhow!("pool down"))), "evt"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
