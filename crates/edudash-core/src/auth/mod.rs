//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `Claims`: identity attributes decoded locally from the access token
//! - `CredentialStorage`: durable backends for the token pair (keychain, file, memory)
//! - `CredentialStore`: the process-wide session slot with change notifications
//! - `SessionManager`: login, logout, attachment, and single-flight renewal
//!
//! Access tokens are renewed reactively on a 401 and proactively every 25 minutes.

pub mod claims;
pub mod credentials;
pub mod manager;
pub mod session;

pub use claims::{Claims, Role};
pub use credentials::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage, TokenPair};
pub use manager::{PassiveRenewal, SessionManager};
pub use session::{AuthState, CredentialStore, EndReason, Session, SessionEvent};
