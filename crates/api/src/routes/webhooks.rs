//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::{json, Value};

use tenantdesk_billing::BillingError;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Verify, claim and process one Stripe event.
///
/// Processing errors are recorded on the event row and answered with 200:
/// Stripe would only redeliver an event the claim already holds, and failed
/// events are replayed by the worker or an admin. Database errors return 500
/// so that Stripe retries when the claim itself could not be written.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let billing = state.billing()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Rejected Stripe webhook");
        ApiError::from(e)
    })?;

    let event_id = event.id.to_string();
    let event_type = event.type_.to_string();

    match billing.webhooks.handle_event(event).await {
        Ok(()) => Ok((StatusCode::OK, Json(json!({ "received": true })))),
        Err(BillingError::Database(msg)) => {
            tracing::error!(event_id = %event_id, error = %msg, "Webhook claim failed");
            Err(ApiError::Internal)
        }
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook processing failed, recorded for replay"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "received": true, "processed": false })),
            ))
        }
    }
}
