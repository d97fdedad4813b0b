use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::{AppError, AuthFailure},
    models::{DeviceClass, User},
};

/// TokenKind
///
/// Access tokens authorize API calls and live for minutes; refresh tokens are only
/// accepted by the refresh endpoint and live as long as their device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims
///
/// The signed payload of both token kinds. Role references are carried for the
/// client's convenience only; the middleware always re-resolves roles from the
/// user directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: Uuid,
    pub email: String,
    pub username: String,
    pub roles: Vec<Uuid>,
    pub device_id: String,
    pub device_class: DeviceClass,
    /// Token kind, checked on verification in addition to the per-kind secret.
    pub kind: TokenKind,
    /// Unique token id; two tokens issued in the same second still differ.
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// TokenSubject
///
/// The identity a token is issued for.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub roles: Vec<Uuid>,
    pub device_id: String,
    pub device_class: DeviceClass,
}

impl TokenSubject {
    pub fn new(user: &User, device_id: impl Into<String>, device_class: DeviceClass) -> Self {
        Self {
            user_id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            roles: user.role_ids.clone(),
            device_id: device_id.into(),
            device_class,
        }
    }
}

/// TokenService
///
/// Issues and verifies HS256 tokens. Each kind has its own secret, so a refresh
/// token can never pass as an access token or vice versa.
#[derive(Clone)]
pub struct TokenService {
    access_secret: String,
    refresh_secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        access_secret: impl Into<String>,
        refresh_secret: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            config.jwt_refresh_secret.clone(),
            config.access_token_ttl,
            config.refresh_token_ttl,
        )
    }

    pub fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    fn secret(&self, kind: TokenKind) -> &str {
        match kind {
            TokenKind::Access => &self.access_secret,
            TokenKind::Refresh => &self.refresh_secret,
        }
    }

    /// Issue a token of `kind` valid for the configured lifetime from `now`.
    pub fn issue(&self, kind: TokenKind, subject: &TokenSubject, now: DateTime<Utc>) -> Result<String, AppError> {
        self.issue_until(kind, subject, now, now + self.ttl(kind))
    }

    /// Issue a token of `kind` that expires at an explicit instant. Used when a
    /// rotated refresh token must not outlive its session.
    pub fn issue_until(
        &self,
        kind: TokenKind,
        subject: &TokenSubject,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AppError> {
        let secret = self.secret(kind);
        if secret.is_empty() {
            return Err(AppError::Internal(format!("{kind:?} signing key is not configured")));
        }

        let claims = Claims {
            sub: subject.user_id,
            email: subject.email.clone(),
            username: subject.username.clone(),
            roles: subject.roles.clone(),
            device_id: subject.device_id.clone(),
            device_class: subject.device_class,
            kind,
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))
    }

    /// Verify a token of `kind`. Expiry, signature mismatch, malformed input, and a
    /// kind mismatch all yield `Unauthenticated(InvalidToken)`, never a server fault.
    pub fn verify(&self, kind: TokenKind, token: &str) -> Result<Claims, AppError> {
        let secret = self.secret(kind);
        if secret.is_empty() {
            return Err(AppError::Internal(format!("{kind:?} signing key is not configured")));
        }

        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
            Ok(data) => data,
            Err(e) => {
                match e.kind() {
                    ErrorKind::ExpiredSignature => tracing::debug!(?kind, "token expired"),
                    other => tracing::debug!(?kind, error = ?other, "token rejected"),
                }
                return Err(AppError::Unauthenticated(AuthFailure::InvalidToken));
            }
        };

        if data.claims.kind != kind {
            return Err(AppError::Unauthenticated(AuthFailure::InvalidToken));
        }
        Ok(data.claims)
    }
}

/// BearerCredential
///
/// What the Authorization header says about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerCredential {
    /// No Authorization header, or a non-Bearer scheme.
    Absent,
    /// `Bearer ` followed by nothing usable.
    Malformed,
    Present(String),
}

/// Extract the bearer token from the Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> BearerCredential {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return BearerCredential::Absent;
    };
    let Ok(value) = value.to_str() else {
        return BearerCredential::Malformed;
    };
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => BearerCredential::Present(token.trim().to_string()),
        Some(_) => BearerCredential::Malformed,
        None => BearerCredential::Absent,
    }
}
