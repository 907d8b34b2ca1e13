use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{ApiError, DomainService, Transport};
use crate::auth::{
    Claims, CredentialStorage, CredentialStore, FileStorage, KeyringStorage, PassiveRenewal,
    SessionEvent, SessionManager,
};
use crate::cache::CacheDomain;
use crate::config::{ClientConfig, CredentialBackend};
use crate::fetch::{FetchController, FetchOptions};

/// Entry point for the dashboard: one transport, one session, many domains.
pub struct DashboardClient {
    config: ClientConfig,
    transport: Transport,
    /// Last `/auth/me/` response for the signed-in user
    profile: Arc<RwLock<Option<Value>>>,
}

impl DashboardClient {
    /// Build a client using the credential backend named in `config`
    pub fn new(config: ClientConfig) -> Result<Self> {
        let storage: Arc<dyn CredentialStorage> = match config.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringStorage::new()),
            CredentialBackend::File => Arc::new(FileStorage::new(config.cache_dir()?)),
        };
        Self::with_storage(config, storage)
    }

    /// Build a client over an explicit storage backend.
    ///
    /// A session persisted by a previous run is restored here; an unreadable
    /// store just means starting signed out.
    pub fn with_storage(config: ClientConfig, storage: Arc<dyn CredentialStorage>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let store = CredentialStore::new(storage);
        if store.load_from_storage() {
            debug!("Restored persisted session");
        }

        let session = SessionManager::new(
            store,
            client.clone(),
            config.base_url(),
            config.retry.backoff(),
        );
        let transport = Transport::new(client, config.base_url(), session);
        info!(base_url = config.base_url(), "Client ready");

        Ok(Self {
            config,
            transport,
            profile: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn session(&self) -> &SessionManager {
        self.transport.session()
    }

    /// Sign in, then load the user's profile.
    ///
    /// A profile that fails to load is logged and left empty; the session stands.
    pub async fn login(&self, email: &str, password: &str) -> Result<Claims, ApiError> {
        let claims = self.session().login(email, password).await?;
        if let Err(e) = self.refresh_profile().await {
            warn!(error = %e, "Signed in but could not load profile");
        }
        Ok(claims)
    }

    pub fn logout(&self) {
        self.session().logout();
        store_profile(&self.profile, None);
    }

    /// Fetch `/auth/me/` and keep the result
    pub async fn refresh_profile(&self) -> Result<Value, ApiError> {
        load_profile(&self.transport, &self.profile).await
    }

    pub fn profile(&self) -> Option<Value> {
        self.profile.read().ok().and_then(|p| p.clone())
    }

    pub fn claims(&self) -> Option<Claims> {
        self.session().store().claims()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session().store().subscribe()
    }

    /// A cached service for `domain`, with the configured TTL
    pub fn domain<T>(&self, domain: CacheDomain) -> DomainService<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        DomainService::new(domain, self.transport.clone(), self.config.cache_ttl(domain))
    }

    /// A fetch controller using the configured retry policy
    pub fn controller<P, T, F, Fut>(&self, operation: F) -> FetchController<P, T>
    where
        P: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        FetchController::new(operation, FetchOptions::from_retry(&self.config.retry))
    }

    /// Keep the session alive while the returned guard is held.
    ///
    /// Each renewal is followed by a profile reload, so role or name changes
    /// made server-side show up without signing in again.
    pub fn spawn_passive_renewal(&self) -> PassiveRenewal {
        let mut guard = self
            .session()
            .spawn_passive_renewal(self.config.passive_renewal_interval());

        let mut events = self.subscribe();
        let transport = self.transport.clone();
        let profile = Arc::clone(&self.profile);
        guard.attach(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Renewed(_)) => {
                        if let Err(e) = load_profile(&transport, &profile).await {
                            warn!(error = %e, "Profile reload after renewal failed");
                        }
                    }
                    Ok(SessionEvent::Ended(_)) => store_profile(&profile, None),
                    Ok(SessionEvent::LoggedIn(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped = skipped, "Profile follower lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        guard
    }
}

async fn load_profile(
    transport: &Transport,
    slot: &RwLock<Option<Value>>,
) -> Result<Value, ApiError> {
    let profile = transport.fetch_profile().await?;
    store_profile(slot, Some(profile.clone()));
    Ok(profile)
}

fn store_profile(slot: &RwLock<Option<Value>>, profile: Option<Value>) {
    match slot.write() {
        Ok(mut p) => *p = profile,
        Err(poisoned) => *poisoned.into_inner() = profile,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::claims::test_token;
    use crate::auth::{AuthState, MemoryStorage, TokenPair};
    use crate::cache::QueryParams;
    use crate::config::RetryConfig;

    fn config_for(server: &MockServer) -> ClientConfig {
        ClientConfig {
            api_base_url: server.uri(),
            retry: RetryConfig {
                max_retries: 1,
                backoff_ms: 10,
            },
            ..ClientConfig::default()
        }
    }

    fn token(user: &str, exp: i64) -> String {
        test_token(&json!({ "user_id": 7, "username": user, "role": "teacher", "exp": exp }))
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 1800
    }

    #[tokio::test]
    async fn test_restores_persisted_session() {
        let server = MockServer::start().await;
        let storage = Arc::new(MemoryStorage::with_pair(TokenPair {
            access: token("ms.okafor", future_exp()),
            refresh: "r-1".into(),
        }));

        let client = DashboardClient::with_storage(config_for(&server), storage).unwrap();
        assert_eq!(client.config().base_url(), server.uri());
        assert!(client.transport().session().store().has_session());
        assert_eq!(client.session().store().state(), AuthState::Authenticated);
        assert_eq!(client.claims().unwrap().display_name, "ms.okafor");
    }

    #[tokio::test]
    async fn test_login_then_cached_domain_read() {
        let server = MockServer::start().await;
        let access = token("ms.okafor", future_exp());
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .and(body_json(json!({ "email": "okafor@school.test", "password": "pw" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access": access, "refresh": "r-1" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/grades/statistics/"))
            .and(query_param("class", "10A"))
            .and(header("authorization", format!("Bearer {}", access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "mean": 71.5 })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            DashboardClient::with_storage(config_for(&server), Arc::new(MemoryStorage::new())).unwrap();
        let mut events = client.subscribe();
        client.login("okafor@school.test", "pw").await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::LoggedIn(_)));

        let grades: DomainService<Value> = client.domain(CacheDomain::Grades);
        assert_eq!(grades.cache().ttl(), Duration::from_secs(300));
        let params = QueryParams::new().with("class", "10A");
        let first = grades.read("statistics", "/grades/statistics/", &params).await.unwrap();
        let second = grades.read("statistics", "/grades/statistics/", &params).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_controller_over_domain_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/messaging/threads/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/messaging/threads/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::with_pair(TokenPair {
            access: token("ms.okafor", future_exp()),
            refresh: "r-1".into(),
        }));
        let client = DashboardClient::with_storage(config_for(&server), storage).unwrap();
        let messaging = Arc::new(client.domain::<Value>(CacheDomain::Messaging));

        let controller = client.controller(move |params: QueryParams| {
            let messaging = Arc::clone(&messaging);
            async move { messaging.read("threads", "/messaging/threads/", &params).await }
        });
        controller.execute(QueryParams::new()).await.unwrap();

        let state = controller.state();
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert_eq!(state.data.unwrap(), json!([{ "id": 1 }]));
    }

    #[tokio::test]
    async fn test_login_loads_profile() {
        let server = MockServer::start().await;
        let access = token("ms.okafor", future_exp());
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access": access, "refresh": "r-1" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .and(header("authorization", format!("Bearer {}", access).as_str()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "first_name": "Ada" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client =
            DashboardClient::with_storage(config_for(&server), Arc::new(MemoryStorage::new())).unwrap();
        assert!(client.profile().is_none());
        client.login("okafor@school.test", "pw").await.unwrap();
        assert_eq!(client.profile().unwrap()["first_name"], "Ada");

        client.logout();
        assert!(client.profile().is_none());
    }

    #[tokio::test]
    async fn test_login_survives_profile_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/token/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": token("ms.okafor", future_exp()),
                "refresh": "r-1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client =
            DashboardClient::with_storage(config_for(&server), Arc::new(MemoryStorage::new())).unwrap();
        let claims = client.login("okafor@school.test", "pw").await.unwrap();
        assert_eq!(claims.display_name, "ms.okafor");
        assert!(client.profile().is_none());
        assert!(client.session().store().has_session());
    }

    #[tokio::test]
    async fn test_profile_reloaded_after_renewal() {
        let server = MockServer::start().await;
        let renewed = token("ms.okafor", future_exp() + 60);
        Mock::given(method("POST"))
            .and(path("/auth/token/refresh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": renewed })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "role": "admin" })))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::with_pair(TokenPair {
            access: token("ms.okafor", future_exp()),
            refresh: "r-1".into(),
        }));
        let client = DashboardClient::with_storage(config_for(&server), storage).unwrap();
        let _guard = client.spawn_passive_renewal();

        client.session().renew().await.unwrap();
        for _ in 0..50 {
            if client.profile().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(client.profile().unwrap()["role"], "admin");
    }

    #[tokio::test]
    async fn test_logout_emits_ended() {
        let server = MockServer::start().await;
        let storage = Arc::new(MemoryStorage::with_pair(TokenPair {
            access: token("ms.okafor", future_exp()),
            refresh: "r-1".into(),
        }));
        let client = DashboardClient::with_storage(config_for(&server), storage.clone()).unwrap();
        let mut events = client.subscribe();

        client.logout();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Ended(_)));
        assert!(client.claims().is_none());
        assert!(storage.load().unwrap().is_none());
    }
}
