//! The single chokepoint every API call flows through.
//!
//! The transport attaches the current credential, retries rate-limited
//! responses, and on a credential rejection asks the session manager to renew
//! and replays the call once.

use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, ApiRequest};
use crate::auth::SessionManager;
use crate::cache::QueryParams;

/// Current-user profile endpoint
const PROFILE_PATH: &str = "/auth/me/";

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Check if response is successful, returning a typed error with the body if not.
pub(crate) async fn check_response(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ApiError::RateLimited {
            retry_after: retry_after(&response),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status, &body))
}

/// Seconds from a numeric `Retry-After` header
fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// HTTP transport for the dashboard API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    session: SessionManager,
}

impl Transport {
    pub fn new(client: Client, base_url: impl Into<String>, session: SessionManager) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send once with the current credential, backing off on 429.
    ///
    /// Returns the response together with the token that was attached.
    async fn dispatch(&self, request: &ApiRequest) -> Result<(Response, Option<String>), ApiError> {
        let url = self.url(&request.path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut builder = self.client.request(request.method.clone(), &url);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }
            let (builder, token) = self.session.attach_credential(builder);

            debug!(method = %request.method, url = %url, replay = request.is_replay(), "Sending request");
            let response = builder.send().await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok((response, token));
            }

            let retry_after = retry_after(&response);
            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited { retry_after });
            }
            let wait = retry_after
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_millis(backoff_ms));
            warn!(url = %url, retry = retries, wait_ms = wait.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(wait).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Send a request, renewing the credential and replaying once on a 401.
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let mut request = request;
        loop {
            let (response, token) = self.dispatch(&request).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return check_response(response).await;
            }
            debug!(path = %request.path, "Credential rejected");
            request = self.session.on_auth_rejected(request, token.as_deref()).await?;
        }
    }

    /// Send a request and parse the JSON response body.
    pub async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = self.send(request).await?;
        response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &QueryParams,
    ) -> Result<T, ApiError> {
        self.execute(ApiRequest::get(path).with_params(params)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(ApiRequest::post(path).with_json(body)?).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(ApiRequest::patch(path).with_json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Fetch the signed-in user's profile
    pub async fn fetch_profile(&self) -> Result<Value, ApiError> {
        self.get_json(PROFILE_PATH, &QueryParams::new()).await
    }
}
