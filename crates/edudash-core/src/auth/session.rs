use std::sync::{Arc, RwLock, RwLockWriteGuard};

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::claims::Claims;
use super::credentials::{CredentialStorage, TokenPair};
use crate::api::ApiError;

/// Capacity of the session event channel; slow observers skip old events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// The live credential pair and its decoded claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub claims: Claims,
}

impl Session {
    /// Build a session, decoding claims from the access token.
    pub fn from_tokens(access_token: String, refresh_token: String) -> Result<Self, ApiError> {
        let claims = Claims::decode(&access_token)?;
        Ok(Self {
            access_token,
            refresh_token,
            claims,
        })
    }

    fn to_pair(&self) -> TokenPair {
        TokenPair {
            access: self.access_token.clone(),
            refresh: self.refresh_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NoSession,
    Authenticated,
    Renewing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Logout,
    RenewalFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(Claims),
    Renewed(Claims),
    /// The UI must redirect to re-authentication.
    Ended(EndReason),
}

struct StoreInner {
    slot: RwLock<Option<Session>>,
    storage: Arc<dyn CredentialStorage>,
    state: watch::Sender<AuthState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Process-wide slot holding at most one live session.
///
/// Clone is cheap; all clones share the same slot.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        let (state, _) = watch::channel(AuthState::NoSession);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                slot: RwLock::new(None),
                storage,
                state,
                events,
            }),
        }
    }

    /// Initialize the slot from durable storage.
    ///
    /// Storage and decode failures are logged and treated as no session.
    /// An expired access token is still loaded; the first rejected request renews it.
    pub fn load_from_storage(&self) -> bool {
        let pair = match self.inner.storage.load() {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!("No stored credentials");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load stored credentials, starting without a session");
                return false;
            }
        };

        match Session::from_tokens(pair.access, pair.refresh) {
            Ok(session) => {
                debug!(subject = %session.claims.subject_id, expired = session.claims.is_expired(), "Session restored");
                self.replace(Some(session));
                self.inner.state.send_replace(AuthState::Authenticated);
                true
            }
            Err(e) => {
                warn!(error = %e, "Stored access token is unreadable, starting without a session");
                false
            }
        }
    }

    /// Snapshot of the current session
    pub fn current(&self) -> Option<Session> {
        self.inner.slot.read().ok().and_then(|slot| slot.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .slot
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.access_token.clone()))
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner
            .slot
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.refresh_token.clone()))
    }

    pub fn claims(&self) -> Option<Claims> {
        self.inner
            .slot
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.claims.clone()))
    }

    pub fn has_session(&self) -> bool {
        self.inner.slot.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn state(&self) -> AuthState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Install a session after login.
    pub fn sign_in(&self, session: Session) {
        let claims = session.claims.clone();
        self.persist(&session);
        self.replace(Some(session));
        self.inner.state.send_replace(AuthState::Authenticated);
        self.emit(SessionEvent::LoggedIn(claims));
    }

    /// Install a renewed session derived from `exchanged_refresh`.
    ///
    /// Returns false, leaving the slot alone, when the current session no
    /// longer carries that refresh token (signed out or replaced meanwhile).
    pub fn renewed(&self, exchanged_refresh: &str, session: Session) -> bool {
        let claims = session.claims.clone();
        {
            let mut slot = self.write_slot();
            if !carries_refresh(&slot, exchanged_refresh) {
                return false;
            }
            self.persist(&session);
            *slot = Some(session);
        }
        self.inner.state.send_replace(AuthState::Authenticated);
        self.emit(SessionEvent::Renewed(claims));
        true
    }

    /// End the session a failed renewal was for, if it is still current.
    pub fn renewal_failed(&self, exchanged_refresh: &str) -> bool {
        let ended = {
            let mut slot = self.write_slot();
            if !carries_refresh(&slot, exchanged_refresh) {
                return false;
            }
            slot.take()
        };
        self.finish_clear(EndReason::RenewalFailed, ended.is_some());
        true
    }

    pub fn mark_renewing(&self) {
        if self.has_session() {
            self.inner.state.send_replace(AuthState::Renewing);
        }
    }

    /// Drop the session from memory and storage and notify observers.
    pub fn clear(&self, reason: EndReason) {
        let had_session = self.replace(None).is_some();
        self.finish_clear(reason, had_session);
    }

    fn finish_clear(&self, reason: EndReason, had_session: bool) {
        if let Err(e) = self.inner.storage.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        self.inner.state.send_replace(AuthState::NoSession);
        if had_session {
            self.emit(SessionEvent::Ended(reason));
        }
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.inner
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace(&self, session: Option<Session>) -> Option<Session> {
        std::mem::replace(&mut *self.write_slot(), session)
    }

    fn persist(&self, session: &Session) {
        // The in-memory session stays authoritative even if persisting fails
        if let Err(e) = self.inner.storage.save(&session.to_pair()) {
            warn!(error = %e, "Failed to persist credentials");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

fn carries_refresh(slot: &Option<Session>, refresh: &str) -> bool {
    slot.as_ref().map(|s| s.refresh_token.as_str()) == Some(refresh)
}
