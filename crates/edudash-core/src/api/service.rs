use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ApiError, ApiRequest, Transport};
use crate::cache::{CacheDomain, QueryParams, TtlCache};

/// Reads and writes for one data domain, with reads memoized in the domain's cache.
pub struct DomainService<T> {
    domain: CacheDomain,
    transport: Transport,
    cache: TtlCache<T>,
}

impl<T> DomainService<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(domain: CacheDomain, transport: Transport, ttl: Duration) -> Self {
        Self {
            domain,
            transport,
            cache: TtlCache::for_domain(domain, ttl),
        }
    }

    pub fn domain(&self) -> CacheDomain {
        self.domain
    }

    pub fn cache(&self) -> &TtlCache<T> {
        &self.cache
    }

    /// Serve from cache if fresh, otherwise fetch `path` and populate.
    ///
    /// `operation` names the logical read; together with `params` it forms the key.
    pub async fn read(&self, operation: &str, path: &str, params: &QueryParams) -> Result<T, ApiError> {
        let key = params.cache_key(operation);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        self.fetch_and_store(key, path, params).await
    }

    /// Bypass the cache for this read; the result still refreshes the entry.
    pub async fn read_fresh(
        &self,
        operation: &str,
        path: &str,
        params: &QueryParams,
    ) -> Result<T, ApiError> {
        self.fetch_and_store(params.cache_key(operation), path, params)
            .await
    }

    /// Perform a mutation, then invalidate the whole domain.
    ///
    /// Invalidation happens even when the write fails, since a failed write
    /// may still have been applied server-side.
    pub async fn write<R: DeserializeOwned>(&self, request: ApiRequest) -> Result<R, ApiError> {
        let result = self.transport.execute(request).await;
        self.cache.invalidate_all();
        result
    }

    /// Like `write` for endpoints that return no body
    pub async fn write_empty(&self, request: ApiRequest) -> Result<(), ApiError> {
        let result = self.transport.send(request).await.map(|_| ());
        self.cache.invalidate_all();
        result
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    async fn fetch_and_store(&self, key: String, path: &str, params: &QueryParams) -> Result<T, ApiError> {
        let generation = self.cache.generation();
        let value: T = self.transport.get_json(path, params).await?;
        if self.cache.put_if_current(generation, key.clone(), value.clone()) {
            debug!(domain = self.domain.name(), key = %key, "Cached fresh result");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::{CredentialStore, MemoryStorage, SessionManager};
    use reqwest::Client;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer, ttl: Duration) -> DomainService<Value> {
        let store = CredentialStore::new(Arc::new(MemoryStorage::new()));
        let client = Client::new();
        let session = SessionManager::new(store, client.clone(), server.uri(), Duration::from_millis(10));
        let transport = Transport::new(client, server.uri(), session);
        DomainService::new(CacheDomain::Attendance, transport, ttl)
    }

    #[tokio::test]
    async fn test_read_hits_network_once_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attendance/summary/"))
            .and(query_param("class", "10A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "present": 27 })))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_secs(120));
        let a = QueryParams::new().with("class", "10A").with("date", "");
        let b: QueryParams = [("date", ""), ("class", "10A")].into_iter().collect();

        let first = svc.read("summary", "/attendance/summary/", &a).await.unwrap();
        let second = svc.read("summary", "/attendance/summary/", &b).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(svc.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_read_refetches_after_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attendance/statistics/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rate": 0.93 })))
            .expect(2)
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_millis(50));
        let params = QueryParams::new();
        svc.read("statistics", "/attendance/statistics/", &params).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        svc.read("statistics", "/attendance/statistics/", &params).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_invalidates_domain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attendance/records/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/attendance/records/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }, { "id": 2 }])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/attendance/records/"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 2 })))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_secs(120));
        let params = QueryParams::new();
        let before = svc.read("records", "/attendance/records/", &params).await.unwrap();
        assert_eq!(before.as_array().unwrap().len(), 1);

        let created: Value = svc
            .write(ApiRequest::post("/attendance/records/").with_json(&json!({ "student": 4 })).unwrap())
            .await
            .unwrap();
        assert_eq!(created["id"], 2);
        assert!(svc.cache().is_empty());

        let after = svc.read("records", "/attendance/records/", &params).await.unwrap();
        assert_eq!(after.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_still_invalidates() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/attendance/records/9/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_secs(120));
        svc.cache().put("records", json!([]));

        let result = svc.write_empty(ApiRequest::delete("/attendance/records/9/")).await;
        assert!(matches!(result, Err(ApiError::ServerError(_))));
        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn test_read_fresh_bypasses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attendance/rankings/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "top": "10A" })))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_secs(120));
        let params = QueryParams::new();
        svc.cache().put(params.cache_key("rankings"), json!({ "top": "9B" }));

        let fresh = svc.read_fresh("rankings", "/attendance/rankings/", &params).await.unwrap();
        assert_eq!(fresh["top"], "10A");
        let cached = svc.read("rankings", "/attendance/rankings/", &params).await.unwrap();
        assert_eq!(cached["top"], "10A");
    }

    #[tokio::test]
    async fn test_failed_read_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attendance/summary/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let svc = service(&server, Duration::from_secs(120));
        let params = QueryParams::new();
        assert!(svc.read("summary", "/attendance/summary/", &params).await.is_err());
        assert!(svc.read("summary", "/attendance/summary/", &params).await.is_err());
        assert!(svc.cache().is_empty());
    }
}
