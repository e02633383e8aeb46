// ===============================
// src/auth.rs
// ===============================
//
// Single demo account + HMAC-SHA256 bearer tokens.
// Token = hex(claims json) "." hex(hmac(secret, hex payload)).
//
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::AuthCfg;

type HmacSha256 = Hmac<Sha256>;

pub const DEMO_USER_ID: &str = "demo-user-1";

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Email and password are required")]
    MissingField,
    /// Same message for unknown email and wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Access token required")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    Expired,
    #[error("User not found")]
    UnknownUser,
    #[error("signing key rejected")]
    Key,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    /// unix seconds
    pub iat: i64,
    pub exp: i64,
}

pub struct Authenticator {
    secret: String,
    ttl_secs: i64,
    user: User,
    password: String,
}

impl Authenticator {
    pub fn new(cfg: &AuthCfg) -> Self {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
        Self {
            secret: cfg.secret.clone(),
            ttl_secs: i64::try_from(cfg.expiration.as_secs()).unwrap_or(i64::MAX),
            user: User { id: DEMO_USER_ID.to_string(), email: cfg.demo_email.clone(), created_at },
            password: cfg.demo_password.clone(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| AuthError::Key)
    }

    pub fn login(&self, email: Option<&str>, password: Option<&str>) -> Result<(String, User), AuthError> {
        self.login_at(email, password, Utc::now().timestamp())
    }

    pub fn login_at(&self, email: Option<&str>, password: Option<&str>, now: i64) -> Result<(String, User), AuthError> {
        let (email, password) = match (email, password) {
            (Some(e), Some(p)) if !e.is_empty() && !p.is_empty() => (e, p),
            _ => return Err(AuthError::MissingField),
        };
        if email != self.user.email || !self.password_matches(password)? {
            return Err(AuthError::InvalidCredentials);
        }
        Ok((self.issue_at(&self.user, now)?, self.user.clone()))
    }

    // compare MACs so the check does not short-circuit on the first byte
    fn password_matches(&self, candidate: &str) -> Result<bool, AuthError> {
        let mut expected = self.mac()?;
        expected.update(self.password.as_bytes());
        let tag = expected.finalize().into_bytes();
        let mut got = self.mac()?;
        got.update(candidate.as_bytes());
        Ok(got.verify_slice(&tag).is_ok())
    }

    pub fn issue_at(&self, user: &User, now: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user.id.clone(),
            email: user.email.clone(),
            iat: now,
            exp: now.saturating_add(self.ttl_secs),
        };
        let json = serde_json::to_vec(&claims).map_err(|_| AuthError::InvalidToken)?;
        let payload = hex::encode(json);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Ok(format!("{payload}.{}", hex::encode(mac.finalize().into_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let (payload, sig) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let sig = hex::decode(sig).map_err(|_| AuthError::InvalidToken)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::InvalidToken)?;

        let raw = hex::decode(payload).map_err(|_| AuthError::InvalidToken)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| AuthError::InvalidToken)?;
        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// `Authorization: Bearer <token>` -> claims.
    pub fn authorize(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let token = header
            .and_then(|h| h.split_whitespace().nth(1))
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }

    pub fn user(&self, id: &str) -> Result<&User, AuthError> {
        if id == self.user.id { Ok(&self.user) } else { Err(AuthError::UnknownUser) }
    }
}
