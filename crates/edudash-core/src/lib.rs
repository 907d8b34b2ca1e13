//! Client runtime for the edudash API.
//!
//! Every network interaction of the dashboard flows through this crate:
//! - `auth`: the credential pair, its local claims, and transparent renewal
//! - `api`: the single HTTP chokepoint and per-domain cached services
//! - `cache`: keyed TTL caches, one instance per data domain
//! - `fetch`: cancellable, retrying fetch controllers used by UI logic

pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod fetch;

pub use api::{ApiError, ApiRequest, DomainService, Transport};
pub use auth::{AuthState, Claims, CredentialStore, Role, Session, SessionEvent, SessionManager};
pub use cache::{CacheDomain, QueryParams, TtlCache};
pub use client::DashboardClient;
pub use config::ClientConfig;
pub use fetch::{FetchController, FetchOptions, FetchState};
