//! Payment gateway integration via REST API (no SDK dependency).
//!
//! The gateway also pushes settlement outcomes over a signed webhook channel;
//! signature verification is HMAC-SHA256 over `"{timestamp}.{payload}"` with
//! a replay window.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::core::{app_error::AppError, config::GatewayConfig};

pub const EVENT_SETTLEMENT_SUCCEEDED: &str = "settlement_succeeded";
pub const EVENT_SETTLEMENT_FAILED: &str = "settlement_failed";
pub const EVENT_REFUND_SUCCEEDED: &str = "refund_succeeded";
pub const EVENT_REFUND_FAILED: &str = "refund_failed";

#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    secret_key: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub status: String,
    pub last_error: Option<String>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value, AppError> {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|_| AppError::ServiceUnreachable("payment gateway".to_string()))?
            .json()
            .await
            .map_err(|err| AppError::Upstream(format!("gateway returned malformed JSON: {err}")))
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, AppError> {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|_| AppError::ServiceUnreachable("payment gateway".to_string()))?
            .json()
            .await
            .map_err(|err| AppError::Upstream(format!("gateway returned malformed JSON: {err}")))
    }

    /// Fetch the gateway customer keyed by email, creating it on first use.
    pub async fn create_or_get_customer(
        &self,
        email: &str,
        name: &str,
    ) -> Result<String, AppError> {
        let existing = self
            .get_json(&format!("/v1/customers?email={email}&limit=1"))
            .await?;
        if let Some(id) = existing["data"][0]["id"].as_str() {
            return Ok(id.to_string());
        }

        let resp = self
            .post_form("/v1/customers", &[("email", email), ("name", name)])
            .await?;
        resp["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AppError::Upstream(format!("gateway create_customer failed: {resp}")))
    }

    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        booking_id: i32,
    ) -> Result<PaymentIntent, AppError> {
        let amount = amount_cents.to_string();
        let booking = booking_id.to_string();
        let resp = self
            .post_form(
                "/v1/payment_intents",
                &[
                    ("amount", amount.as_str()),
                    ("currency", "usd"),
                    ("customer", customer_ref),
                    ("metadata[booking_id]", booking.as_str()),
                ],
            )
            .await?;
        parse_intent(&resp)
            .ok_or_else(|| AppError::Upstream(format!("gateway create_intent failed: {resp}")))
    }

    pub async fn retrieve_payment_intent(
        &self,
        intent_id: &str,
    ) -> Result<PaymentIntent, AppError> {
        let resp = self
            .get_json(&format!("/v1/payment_intents/{intent_id}"))
            .await?;
        parse_intent(&resp)
            .ok_or_else(|| AppError::Upstream(format!("gateway retrieve_intent failed: {resp}")))
    }

    /// Request a refund against a settled intent; returns the gateway's
    /// refund reference. Completion is reported over the webhook channel.
    pub async fn refund(
        &self,
        provider_ref: &str,
        amount_cents: i64,
    ) -> Result<String, AppError> {
        let amount = amount_cents.to_string();
        let resp = self
            .post_form(
                "/v1/refunds",
                &[
                    ("payment_intent", provider_ref),
                    ("amount", amount.as_str()),
                ],
            )
            .await?;
        resp["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AppError::Upstream(format!("gateway refund failed: {resp}")))
    }
}

fn parse_intent(resp: &serde_json::Value) -> Option<PaymentIntent> {
    Some(PaymentIntent {
        id: resp["id"].as_str()?.to_string(),
        client_secret: resp["client_secret"].as_str().unwrap_or("").to_string(),
        status: resp["status"].as_str().unwrap_or("unknown").to_string(),
        last_error: resp["last_payment_error"]["message"]
            .as_str()
            .map(String::from),
    })
}

/// Webhook event envelope pushed by the gateway.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub intent_id: Option<String>,
    #[serde(default)]
    pub refund_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Verify the webhook signature header (`t=<unix>,v1=<hex hmac>`).
pub fn verify_webhook_signature(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
) -> Result<(), &'static str> {
    let mut timestamp = "";
    let mut signature = "";
    for part in sig_header.split(',') {
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signature = v;
        }
    }

    if timestamp.is_empty() || signature.is_empty() {
        return Err("Invalid signature header");
    }

    let signed_payload = format!("{timestamp}.{}", std::str::from_utf8(payload).unwrap_or(""));
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| "HMAC key error")?;
    mac.update(signed_payload.as_bytes());

    let sig_bytes = hex::decode(signature).map_err(|_| "Invalid signature hex")?;
    mac.verify_slice(&sig_bytes)
        .map_err(|_| "Webhook signature mismatch")?;

    // Reject events older than 5 minutes to prevent replay attacks
    let ts: i64 = timestamp.parse().map_err(|_| "Invalid timestamp")?;
    let now = chrono::Utc::now().timestamp();
    if (now - ts).abs() > 300 {
        return Err("Webhook timestamp too old");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let signed_payload = format!(
            "{timestamp}.{}",
            std::str::from_utf8(payload).unwrap_or("")
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn accepts_a_valid_signature() {
        let payload = br#"{"id":"evt_1","type":"settlement_succeeded"}"#;
        let header = sign(payload, "whsec_test", chrono::Utc::now().timestamp());
        assert!(verify_webhook_signature(payload, &header, "whsec_test").is_ok());
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test", chrono::Utc::now().timestamp());
        assert!(verify_webhook_signature(br#"{"id":"evt_2"}"#, &header, "whsec_test").is_err());
    }

    #[test]
    fn rejects_the_wrong_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test", chrono::Utc::now().timestamp());
        assert!(verify_webhook_signature(payload, &header, "whsec_other").is_err());
    }

    #[test]
    fn rejects_stale_timestamps() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test", chrono::Utc::now().timestamp() - 3600);
        assert_eq!(
            verify_webhook_signature(payload, &header, "whsec_test"),
            Err("Webhook timestamp too old")
        );
    }

    #[test]
    fn rejects_a_malformed_header() {
        assert!(verify_webhook_signature(b"{}", "v1=abcd", "whsec_test").is_err());
        assert!(verify_webhook_signature(b"{}", "t=123", "whsec_test").is_err());
        assert!(verify_webhook_signature(b"{}", "t=123,v1=zz", "whsec_test").is_err());
    }

    #[test]
    fn webhook_event_parses() {
        let event: WebhookEvent = serde_json::from_slice(
            br#"{"id":"evt_9","type":"settlement_failed","data":{"intent_id":"pi_1","error":"card declined"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, EVENT_SETTLEMENT_FAILED);
        assert_eq!(event.data.intent_id.as_deref(), Some("pi_1"));
        assert_eq!(event.data.error.as_deref(), Some("card declined"));
    }
}
