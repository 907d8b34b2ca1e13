//! REST API access for the dashboard backend.
//!
//! This module provides the `Transport` through which every request flows,
//! the `ApiRequest` description it sends, the typed `ApiError` surfaced to UI
//! logic, and `DomainService`, a per-domain cached read/write wrapper.
//!
//! The API uses JWT bearer authentication; a rejected credential is renewed
//! through the session manager and the request replayed once.

pub mod error;
pub mod request;
pub mod service;
pub mod transport;

pub use error::{ApiError, ErrorKind};
pub use request::ApiRequest;
pub use service::DomainService;
pub use transport::Transport;
