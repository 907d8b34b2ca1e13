use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::claims::Claims;
use super::session::{CredentialStore, EndReason, Session};
use crate::api::transport::check_response;
use crate::api::{ApiError, ApiRequest};

/// Login endpoint (email + password for a token pair)
const TOKEN_PATH: &str = "/auth/token/";

/// Renewal endpoint (refresh token for a new pair)
const REFRESH_PATH: &str = "/auth/token/refresh/";

/// One attempt plus one retry on a transient failure.
const RENEWAL_ATTEMPTS: u32 = 2;

/// Bounds for the passive renewal period; tokio intervals reject zero.
const MIN_PASSIVE_INTERVAL: Duration = Duration::from_millis(10);
const MAX_PASSIVE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: String,
    /// Absent when the server does not rotate refresh tokens
    #[serde(default)]
    refresh: Option<String>,
}

type RenewalFuture = Shared<BoxFuture<'static, Result<Session, ApiError>>>;

struct ManagerInner {
    store: CredentialStore,
    client: Client,
    base_url: String,
    retry_backoff: Duration,
    /// The renewal every concurrent caller awaits
    renewal: Mutex<Option<RenewalFuture>>,
}

/// Decides when credentials are attached, renewed, or discarded.
///
/// Clone is cheap and clones share the in-flight renewal.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        store: CredentialStore,
        client: Client,
        base_url: impl Into<String>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                retry_backoff,
                renewal: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// Exchange email and password for a token pair and install the session
    pub async fn login(&self, email: &str, password: &str) -> Result<Claims, ApiError> {
        let url = format!("{}{}", self.inner.base_url, TOKEN_PATH);
        let response = self
            .inner
            .client
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()
            .await?;
        let response = check_response(response).await?;
        let tokens: TokenResponse = response.json().await?;

        let refresh = tokens
            .refresh
            .ok_or_else(|| ApiError::InvalidResponse("login response has no refresh token".into()))?;
        let session = Session::from_tokens(tokens.access, refresh)?;
        let claims = session.claims.clone();

        info!(subject = %claims.subject_id, role = claims.role.display_name(), "Signed in");
        self.inner.store.sign_in(session);
        Ok(claims)
    }

    pub fn logout(&self) {
        info!("Signing out");
        self.inner.store.clear(EndReason::Logout);
    }

    /// Add the current access token to the request, if there is a session.
    ///
    /// Returns the attached token so a rejection can be matched to it.
    pub fn attach_credential(&self, builder: RequestBuilder) -> (RequestBuilder, Option<String>) {
        match self.inner.store.access_token() {
            Some(token) => (builder.bearer_auth(&token), Some(token)),
            None => (builder, None),
        }
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// Single-flight: while a renewal is outstanding, every caller awaits that
    /// same renewal and observes the same session or the same failure. On
    /// failure the session is cleared and observers are told it ended.
    ///
    /// The exchange runs on its own task, so it completes and installs its
    /// result even if every caller awaiting it is dropped.
    pub async fn renew(&self) -> Result<Session, ApiError> {
        let renewal = {
            let mut slot = self.inner.renewal.lock().unwrap_or_else(|p| p.into_inner());
            match slot.as_ref() {
                Some(inflight) => {
                    debug!("Joining in-flight renewal");
                    inflight.clone()
                }
                None => {
                    let this = self.clone();
                    let task = tokio::spawn(async move {
                        let result = this.renew_uncoordinated().await;
                        // Callers arriving after this point start a fresh renewal
                        *this.inner.renewal.lock().unwrap_or_else(|p| p.into_inner()) = None;
                        result
                    });
                    let renewal = async move {
                        task.await.unwrap_or_else(|e| {
                            warn!(error = %e, "Renewal task did not complete");
                            Err(ApiError::NetworkError(format!("renewal interrupted: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    /// Handle a credential rejection for `original`.
    ///
    /// Returns the request to replay, at most once per request. A rejection of
    /// a replay, or a failed renewal, surfaces as `Unauthorized`.
    pub async fn on_auth_rejected(
        &self,
        original: ApiRequest,
        rejected_token: Option<&str>,
    ) -> Result<ApiRequest, ApiError> {
        if original.is_replay() {
            warn!(path = %original.path, "Credential rejected on replay, giving up");
            return Err(ApiError::Unauthorized);
        }

        // Another caller may already have renewed since this request was sent
        let current = self.inner.store.access_token();
        if current.is_some() && current.as_deref() != rejected_token {
            debug!(path = %original.path, "Credential already renewed, replaying");
            return Ok(original.into_replay());
        }

        match self.renew().await {
            Ok(_) => {
                debug!(path = %original.path, "Replaying request with renewed credential");
                Ok(original.into_replay())
            }
            Err(e) => {
                debug!(path = %original.path, error = %e, "Renewal failed, surfacing rejection");
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Renew on a fixed interval while a session exists.
    ///
    /// The task stops when the returned guard is dropped.
    pub fn spawn_passive_renewal(&self, every: Duration) -> PassiveRenewal {
        let clamped = every.clamp(MIN_PASSIVE_INTERVAL, MAX_PASSIVE_INTERVAL);
        if clamped != every {
            warn!(every_ms = every.as_millis() as u64, "Passive renewal interval out of range, clamping");
        }
        let every = clamped;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !this.inner.store.has_session() {
                    continue;
                }
                match this.renew().await {
                    Ok(session) => debug!(
                        expires_in_minutes = session.claims.minutes_until_expiry(),
                        "Passive renewal complete"
                    ),
                    Err(e) => warn!(error = %e, "Passive renewal failed"),
                }
            }
        });
        PassiveRenewal {
            handle,
            followers: Vec::new(),
        }
    }

    async fn renew_uncoordinated(&self) -> Result<Session, ApiError> {
        let Some(refresh) = self.inner.store.refresh_token() else {
            debug!("No refresh token, nothing to renew");
            return Err(ApiError::SessionEnded);
        };

        self.inner.store.mark_renewing();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_renewal(&refresh).await {
                Ok(session) => {
                    // Signed out, or someone else signed in, while the exchange was outstanding
                    if !self.inner.store.renewed(&refresh, session.clone()) {
                        debug!("Session changed during renewal, discarding renewed pair");
                        return Err(ApiError::SessionEnded);
                    }
                    info!(subject = %session.claims.subject_id, "Session renewed");
                    return Ok(session);
                }
                Err(e) if e.is_retryable() && attempt < RENEWAL_ATTEMPTS => {
                    warn!(error = %e, attempt = attempt, "Renewal failed, retrying");
                    tokio::time::sleep(self.inner.retry_backoff).await;
                }
                Err(e) => {
                    if self.inner.store.renewal_failed(&refresh) {
                        warn!(error = %e, "Renewal failed, ending session");
                    } else {
                        debug!(error = %e, "Renewal failed for a session that is already gone");
                    }
                    return Err(ApiError::SessionEnded);
                }
            }
        }
    }

    async fn request_renewal(&self, refresh: &str) -> Result<Session, ApiError> {
        let url = format!("{}{}", self.inner.base_url, REFRESH_PATH);
        let response = self
            .inner
            .client
            .post(&url)
            .json(&RefreshRequest { refresh })
            .send()
            .await?;
        let response = check_response(response).await?;
        let tokens: TokenResponse = response.json().await?;

        Session::from_tokens(tokens.access, tokens.refresh.unwrap_or_else(|| refresh.to_string()))
    }
}

/// Owns the passive renewal task; dropping it stops the task.
pub struct PassiveRenewal {
    handle: JoinHandle<()>,
    followers: Vec<JoinHandle<()>>,
}

impl PassiveRenewal {
    /// Tie another background task to this guard's lifetime
    pub fn attach(&mut self, follower: JoinHandle<()>) {
        self.followers.push(follower);
    }

    pub fn stop(self) {}
}

impl Drop for PassiveRenewal {
    fn drop(&mut self) {
        self.handle.abort();
        for follower in &self.followers {
            follower.abort();
        }
    }
}
