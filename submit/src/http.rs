//! HTTP collaborator posting JSON payloads to the portal backend.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use portal_async_utils::{CancelErr, CancelReason, CancelSignal, OrCancelExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::coordinator::Submitter;
use crate::error::{Result, SubmitError};

/// Posts `T` as JSON to a fixed endpoint and decodes the body as `R`.
pub struct HttpSubmitter<T, R> {
    client: Client,
    url: String,
    token: Option<String>,
    _marker: PhantomData<fn(&T) -> R>,
}

impl<T, R> fmt::Debug for HttpSubmitter<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSubmitter")
            .field("url", &self.url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl<T, R> HttpSubmitter<T, R> {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    /// Share a connection pool across submitters.
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: None,
            _marker: PhantomData,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<T, R> Submitter for HttpSubmitter<T, R>
where
    T: Serialize + Send + Sync + 'static,
    R: DeserializeOwned + Send + 'static,
{
    type Payload = T;
    type Output = R;

    async fn submit(&self, payload: &T, signal: CancelSignal) -> Result<R> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .or_cancel(&signal)
            .await
            .map_err(cancelled)??;

        let status = response.status();
        if !status.is_success() {
            let err = error_from_response(response)
                .or_cancel(&signal)
                .await
                .map_err(cancelled)?;
            tracing::debug!(url = %self.url, status = status.as_u16(), error = %err, "request refused");
            return Err(err);
        }

        tracing::debug!(url = %self.url, status = status.as_u16(), "request accepted");
        Ok(response.json::<R>().or_cancel(&signal).await.map_err(cancelled)??)
    }
}

fn cancelled(err: CancelErr) -> SubmitError {
    match err.reason() {
        CancelReason::User => SubmitError::UserCancelled,
        CancelReason::Timeout => {
            SubmitError::Network("request aborted at attempt deadline".to_string())
        }
    }
}

/// Classify a non-success response, preferring the backend's `detail`
/// message over the raw body.
async fn error_from_response(response: Response) -> SubmitError {
    let status = response.status();
    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let message = error_message(status, &body);

    match SubmitError::from_status(status.as_u16(), message) {
        SubmitError::Server {
            status, message, ..
        } => SubmitError::Server {
            status,
            message,
            retry_after,
        },
        other => other,
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("detail").cloned());
    if let Some(detail) = detail {
        return match detail.as_str() {
            Some(text) => text.to_string(),
            None => detail.to_string(),
        };
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detail_field_wins_over_body() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"detail":"Fecha inválida"}"#),
            "Fecha inválida"
        );
        assert_eq!(
            error_message(
                StatusCode::UNPROCESSABLE_ENTITY,
                r#"{"detail":[{"loc":["date"]}]}"#
            ),
            r#"[{"loc":["date"]}]"#
        );
    }

    #[test]
    fn falls_back_to_body_then_reason() {
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "upstream down\n"),
            "upstream down"
        );
        assert_eq!(
            error_message(StatusCode::SERVICE_UNAVAILABLE, ""),
            "Service Unavailable"
        );
    }
}
