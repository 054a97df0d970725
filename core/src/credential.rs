/// Bearer credential and its durable storage
///
/// The token is a JWT. Only the payload segment is decoded (signature
/// checking is the server's job); the client needs `exp` for lazy expiry
/// checks and `roles` for permission checks.
use crate::error::{ChatError, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Key the token is stored under
const TOKEN_KEY: &str = "auth.jwt";

#[derive(Debug, Clone, Default, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Opaque bearer token with its decoded claims
#[derive(Clone)]
pub struct Credential {
    token: String,
    claims: TokenClaims,
}

impl Credential {
    /// Decode the claims of a raw token (without "Bearer " prefix)
    pub fn parse(token: &str) -> Result<Self> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| ChatError::InvalidToken("expected three dot-separated segments".into()))?;
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ChatError::InvalidToken(format!("payload is not base64url: {}", e)))?;
        let claims: TokenClaims = serde_json::from_slice(&decoded)
            .map_err(|e| ChatError::InvalidToken(format!("payload is not JSON: {}", e)))?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }

    pub fn roles(&self) -> &[String] {
        &self.claims.roles
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims
            .exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    /// A token without an `exp` claim never expires
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.claims.exp {
            Some(exp) => now.timestamp() >= exp,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("sub", &self.claims.sub)
            .field("exp", &self.claims.exp)
            .finish()
    }
}

/// Durable persistence for a single bearer token
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Credential store backed by sled
#[derive(Clone)]
pub struct SledCredentialStore {
    db: sled::Db,
}

impl SledCredentialStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("credentials.db");
        debug!("Opening credential store at {:?}", db_path);
        let db = sled::open(&db_path)
            .map_err(|e| ChatError::Storage(format!("credentials DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl CredentialStore for SledCredentialStore {
    fn load(&self) -> Result<Option<String>> {
        match self
            .db
            .get(TOKEN_KEY)
            .map_err(|e| ChatError::Storage(format!("load token: {}", e)))?
        {
            Some(raw) => String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|e| ChatError::Storage(format!("stored token is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        self.db
            .insert(TOKEN_KEY, token.as_bytes())
            .map_err(|e| ChatError::Storage(format!("save token: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("flush token: {}", e)))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.db
            .remove(TOKEN_KEY)
            .map_err(|e| ChatError::Storage(format!("clear token: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("flush token: {}", e)))?;
        Ok(())
    }
}

/// Process-local credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .token
            .lock()
            .map_err(|_| ChatError::Storage("credential lock poisoned".into()))?
            .clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self
            .token
            .lock()
            .map_err(|_| ChatError::Storage("credential lock poisoned".into()))? = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .token
            .lock()
            .map_err(|_| ChatError::Storage("credential lock poisoned".into()))? = None;
        Ok(())
    }
}

/// Build an unsigned JWT-shaped token. Used by the in-memory backend.
pub fn encode_unsigned_token(sub: &str, exp: Option<i64>, roles: &[&str]) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let mut claims = serde_json::json!({ "sub": sub, "roles": roles });
    if let Some(exp) = exp {
        claims["exp"] = serde_json::json!(exp);
    }
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_claims() {
        let token = encode_unsigned_token("admin@localhost", Some(4_000_000_000), &["ROLE_ADMIN"]);
        let credential = Credential::parse(&token).unwrap();
        assert_eq!(credential.subject(), Some("admin@localhost"));
        assert_eq!(credential.roles(), &["ROLE_ADMIN".to_string()]);
        assert!(!credential.is_expired());
    }

    #[test]
    fn test_expiry_is_checked_against_given_time() {
        let token = encode_unsigned_token("u", Some(1_000), &[]);
        let credential = Credential::parse(&token).unwrap();
        assert!(!credential.is_expired_at(Utc.timestamp_opt(999, 0).unwrap()));
        assert!(credential.is_expired_at(Utc.timestamp_opt(1_000, 0).unwrap()));
    }

    #[test]
    fn test_token_without_exp_never_expires() {
        let token = encode_unsigned_token("u", None, &[]);
        let credential = Credential::parse(&token).unwrap();
        assert!(credential.expires_at().is_none());
        assert!(!credential.is_expired());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(Credential::parse("garbage"), Err(ChatError::InvalidToken(_))));
        assert!(matches!(Credential::parse("a.!!!.c"), Err(ChatError::InvalidToken(_))));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = encode_unsigned_token("u", None, &[]);
        let credential = Credential::parse(&token).unwrap();
        let printed = format!("{:?}", credential);
        assert!(!printed.contains(&token));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_sled_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledCredentialStore::new(temp_dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), None);

        store.save("tok").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("tok"));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
