//! Upstream change notification.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: &'static str,
}

/// POST /gh-update?key= - Schedule a resync of the mirror.
///
/// Rejected unless a webhook key is configured and the request carries it.
#[tracing::instrument(skip_all)]
pub async fn trigger_update(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
) -> ApiResult<Json<WebhookResponse>> {
    let Some(expected) = state.config.mirror.effective_webhook_key() else {
        return Err(ApiError::Unauthorized("webhook is not configured".into()));
    };
    let provided = query.key.as_deref().filter(|key| !key.is_empty());
    if provided != Some(expected) {
        tracing::warn!("Rejected webhook with missing or wrong key");
        return Err(ApiError::Unauthorized("invalid webhook key".into()));
    }

    let scheduled = state.resync.trigger();
    tracing::info!(scheduled, "Mirror update requested");

    Ok(Json(WebhookResponse {
        message: "Update triggered.",
    }))
}
