//! Password checks and admin sessions.
//!
//! Two optional gates protect the service:
//! - the **admin password** (`CPF_ADMIN_PASSWORD`) unlocks uploads and
//!   rebuilds; a successful login issues a bearer token that expires after
//!   `auth.session_ttl_secs`;
//! - the **app password** (`CPF_APP_PASSWORD`) gates every API route when set.
//!
//! Password comparison runs in constant time: both values are HMAC-SHA256
//! tagged under a random per-call key and the tags are compared with
//! [`Mac::verify_slice`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{Result, VerifyError};

type HmacSha256 = Hmac<Sha256>;

/// Constant-time password comparison.
pub fn verify_password(entered: &str, expected: &str) -> bool {
    let key = Uuid::new_v4();
    let Ok(mut expected_mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    expected_mac.update(expected.as_bytes());
    let tag = expected_mac.finalize().into_bytes();

    let Ok(mut entered_mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    entered_mac.update(entered.as_bytes());
    entered_mac.verify_slice(&tag).is_ok()
}

/// Issued admin tokens and their expiry.
pub struct AdminSessions {
    ttl: Duration,
    tokens: Mutex<HashMap<String, Instant>>,
}

impl AdminSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(Duration::from_secs(config.session_ttl_secs))
    }

    /// Check the admin password and issue a session token.
    pub fn login(&self, config: &AuthConfig, password: &str) -> Result<String> {
        let expected = config.admin_password().ok_or(VerifyError::AdminNotConfigured)?;
        if !verify_password(password, &expected) {
            tracing::warn!("rejected admin login");
            return Err(VerifyError::Unauthorized("incorrect admin password".to_string()));
        }

        let token = Uuid::new_v4().to_string();
        let mut tokens = self.lock();
        let now = Instant::now();
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(token.clone(), now + self.ttl);
        tracing::info!(active_sessions = tokens.len(), "admin logged in");
        Ok(token)
    }

    /// Accept a live token.
    pub fn validate(&self, token: &str) -> Result<()> {
        let mut tokens = self.lock();
        match tokens.get(token) {
            Some(expires) if *expires > Instant::now() => Ok(()),
            Some(_) => {
                tokens.remove(token);
                Err(VerifyError::Unauthorized("admin session expired".to_string()))
            }
            None => Err(VerifyError::Unauthorized("admin session required".to_string())),
        }
    }

    /// Revoke a token. Returns whether it was active.
    pub fn logout(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        // A panic while holding the lock cannot leave the map inconsistent
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Check the app-wide password if one is configured.
pub fn check_app_password(config: &AuthConfig, entered: Option<&str>) -> Result<()> {
    match config.app_password() {
        None => Ok(()),
        Some(expected) => match entered {
            Some(entered) if verify_password(entered, &expected) => Ok(()),
            _ => Err(VerifyError::Unauthorized("app password required".to_string())),
        },
    }
}
