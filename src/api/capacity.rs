//! Capacity Ledger client.
//!
//! Warehouse occupancy bookkeeping lives in an external service that reserves
//! capacity atomically. The settlement path calls it exactly when a booking
//! wins the `PAYMENT_PENDING -> CONFIRMED` race, so the reservation fires at
//! most effectively-once per confirmation.

use reqwest::Client;
use serde::Serialize;

use crate::core::app_error::AppError;

#[derive(Serialize)]
struct ReserveCapacityReq<'a> {
    warehouse_id: i32,
    booking_id: i32,
    booking_type: &'a str,
}

pub async fn reserve(
    client: &Client,
    base_url: &str,
    warehouse_id: i32,
    booking_id: i32,
    booking_type: &str,
) -> Result<(), AppError> {
    let resp = client
        .post(format!("{base_url}/reservations"))
        .json(&ReserveCapacityReq {
            warehouse_id,
            booking_id,
            booking_type,
        })
        .send()
        .await
        .map_err(|_| AppError::ServiceUnreachable("CapacityLedger".to_string()))?;

    if !resp.status().is_success() {
        return Err(AppError::Upstream(format!(
            "capacity reservation failed with status {}",
            resp.status()
        )));
    }
    Ok(())
}
