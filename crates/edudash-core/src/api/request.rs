use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use super::ApiError;
use crate::cache::QueryParams;

/// A replayable description of one API call.
///
/// Requests are built as data rather than as `reqwest::RequestBuilder`s so the
/// transport can send the same call again after a credential renewal.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    replayed: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            replayed: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_params(mut self, params: &QueryParams) -> Self {
        self.query = params.pairs();
        self
    }

    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::BadRequest(format!("request body is not serializable: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Whether this request is already the one permitted replay.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    pub(crate) fn into_replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}
