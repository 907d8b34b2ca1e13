use std::convert::Infallible;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiError;

/// Dashboard role carried in the access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
    Staff,
    #[serde(untagged)]
    Other(String),
}

impl FromStr for Role {
    type Err = Infallible;

    /// Case-insensitive; unknown names are kept as `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "teacher" => Role::Teacher,
            "student" => Role::Student,
            "parent" => Role::Parent,
            "staff" => Role::Staff,
            _ => Role::Other(s.to_string()),
        })
    }
}

impl Role {
    /// Like `str::parse`, without the `Result` that can never be an error
    pub fn parse(s: &str) -> Self {
        match s.parse() {
            Ok(role) => role,
            Err(never) => match never {},
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Role::Admin => "Admin",
            Role::Teacher => "Teacher",
            Role::Student => "Student",
            Role::Parent => "Parent",
            Role::Staff => "Staff",
            Role::Other(s) => s.as_str(),
        }
    }
}

/// Identity attributes derived from an access token without a network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject_id: String,
    pub display_name: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

/// Payload fields as the backend issues them.
#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    exp: i64,
}

impl Claims {
    /// Decode the claims segment of a JWT access token.
    ///
    /// The signature is not verified; the server remains the authority and
    /// these claims are only used for display and expiry bookkeeping.
    pub fn decode(access_token: &str) -> Result<Self, ApiError> {
        let mut segments = access_token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) => payload,
            _ => return Err(ApiError::InvalidToken("expected three segments".into())),
        };

        // Some issuers keep the padding even though JWT forbids it
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ApiError::InvalidToken(format!("payload is not base64url: {}", e)))?;
        let raw: RawClaims = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::InvalidToken(format!("payload is not valid claims: {}", e)))?;

        let subject_id = raw
            .user_id
            .or(raw.sub)
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .ok_or_else(|| ApiError::InvalidToken("missing subject".into()))?;

        let expires_at = DateTime::from_timestamp(raw.exp, 0)
            .ok_or_else(|| ApiError::InvalidToken(format!("exp out of range: {}", raw.exp)))?;

        Ok(Self {
            display_name: raw.username.or(raw.email).unwrap_or_else(|| subject_id.clone()),
            subject_id,
            role: raw.role.as_deref().map(Role::parse).unwrap_or(Role::Other("user".into())),
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

/// Build an unsigned token with the given payload. Shared by tests across modules.
#[cfg(test)]
pub(crate) fn test_token(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_backend_claims() {
        let token = test_token(&json!({
            "token_type": "access",
            "exp": 1_900_000_000,
            "user_id": 42,
            "username": "mrs.okafor",
            "role": "teacher"
        }));

        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.subject_id, "42");
        assert_eq!(claims.display_name, "mrs.okafor");
        assert_eq!(claims.role, Role::Teacher);
        assert_eq!(claims.expires_at.timestamp(), 1_900_000_000);
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_decode_falls_back_to_sub_and_email() {
        let token = test_token(&json!({
            "exp": 1_000,
            "sub": "u-7",
            "email": "parent@example.org",
            "role": "guardian"
        }));

        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.subject_id, "u-7");
        assert_eq!(claims.display_name, "parent@example.org");
        assert_eq!(claims.role, Role::Other("guardian".into()));
        assert!(claims.is_expired());
        assert_eq!(claims.minutes_until_expiry(), 0);
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        assert!(matches!(Claims::decode("not-a-jwt"), Err(ApiError::InvalidToken(_))));
        assert!(matches!(Claims::decode("a.!!!.c"), Err(ApiError::InvalidToken(_))));

        // Valid base64 but no exp
        let token = test_token(&json!({ "user_id": 1 }));
        assert!(matches!(Claims::decode(&token), Err(ApiError::InvalidToken(_))));

        // No subject at all
        let token = test_token(&json!({ "exp": 1_900_000_000 }));
        assert!(matches!(Claims::decode(&token), Err(ApiError::InvalidToken(_))));
    }

    #[test]
    fn test_role_from_str_is_case_insensitive() {
        assert_eq!("ADMIN".parse::<Role>(), Ok(Role::Admin));
        assert_eq!(Role::parse("Parent"), Role::Parent);
        assert_eq!(Role::Staff.display_name(), "Staff");
    }
}
