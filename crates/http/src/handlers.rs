//! Request handlers for the subscription API.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use herald_coordinator::{Error, ErrorKind, SubscriptionManagement, SubscriptionOutcome};
use serde_json::{Value, json};
use tracing::{error, warn};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "userid";

/// A coordinator error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BrokerBindingFailed | ErrorKind::PublishFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialFailure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);

        if status.is_server_error() {
            error!(kind = kind.as_str(), error = %self.0, "request failed");
        } else {
            warn!(kind = kind.as_str(), error = %self.0, "request rejected");
        }

        let body = json!({
            "error": kind.as_str(),
            "message": self.0.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| Error::InvalidArgument(format!("missing {USER_ID_HEADER} header")))?;

    value.to_str().map_err(|_| {
        ApiError(Error::InvalidArgument(format!(
            "{USER_ID_HEADER} header is not valid ASCII"
        )))
    })
}

fn outcome_body(outcome: SubscriptionOutcome, user_id: &str, topic: &str) -> Json<Value> {
    let message = match outcome {
        SubscriptionOutcome::Added => format!("{user_id} subscribed to {topic}"),
        SubscriptionOutcome::AlreadyPresent => {
            format!("{user_id} already subscribed to {topic}")
        }
        SubscriptionOutcome::Removed => format!("{user_id} unsubscribed from {topic}"),
        SubscriptionOutcome::NotPresent => format!("{user_id} was not subscribed to {topic}"),
    };

    Json(json!({
        "outcome": outcome.as_str(),
        "message": message,
    }))
}

/// Handler for `POST /subscription/{topic}`.
pub async fn subscribe_handler<SM>(
    State(subscriptions): State<SM>,
    Path(topic): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError>
where
    SM: SubscriptionManagement,
{
    let user_id = user_id(&headers)?;
    let outcome = subscriptions.subscribe(user_id, &topic).await?;

    Ok(outcome_body(outcome, user_id, &topic))
}

/// Handler for `DELETE /subscription/{topic}`.
pub async fn unsubscribe_handler<SM>(
    State(subscriptions): State<SM>,
    Path(topic): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError>
where
    SM: SubscriptionManagement,
{
    let user_id = user_id(&headers)?;
    let outcome = subscriptions.unsubscribe(user_id, &topic).await?;

    Ok(outcome_body(outcome, user_id, &topic))
}

/// Handler for `GET /subscription`. Responds with the user's topics as a
/// sorted JSON array.
pub async fn list_handler<SM>(
    State(subscriptions): State<SM>,
    headers: HeaderMap,
) -> Result<Json<BTreeSet<String>>, ApiError>
where
    SM: SubscriptionManagement,
{
    let user_id = user_id(&headers)?;

    Ok(Json(subscriptions.subscriptions(user_id).await?))
}

/// Handler for `POST /publish/{topic}`.
pub async fn publish_handler<SM>(
    State(subscriptions): State<SM>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError>
where
    SM: SubscriptionManagement,
{
    let size = body.len();
    subscriptions.publish(&topic, body).await?;

    Ok(Json(json!({
        "message": format!("published {size} bytes to {topic}"),
    })))
}

/// Handler for `POST /broadcast`.
pub async fn broadcast_handler<SM>(
    State(subscriptions): State<SM>,
    body: Bytes,
) -> Result<Json<Value>, ApiError>
where
    SM: SubscriptionManagement,
{
    let size = body.len();
    subscriptions.broadcast(body).await?;

    Ok(Json(json!({
        "message": format!("broadcast {size} bytes to all subscribers"),
    })))
}

/// Handler for `GET /health`.
pub async fn health_handler() -> &'static str {
    "ok"
}
