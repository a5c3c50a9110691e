use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::extractors::extract_body_with_timeout;
use crate::middleware::request_id::current_request_id;
use crate::token::{validate_token, InvalidTokenReason};

pub const TOKEN_HEADER: &str = "x-webhook-token";
pub const SIGNATURE_HEADER: &str = "x-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";
const BEARER_PREFIX: &str = "Bearer ";

const METRIC_AUTH_FAILURES: &str = "webhook_auth_failures_total";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Hmac,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "none" | "" => Ok(AuthMode::None),
            "token" => Ok(AuthMode::Token),
            "hmac" => Ok(AuthMode::Hmac),
            _ => Err(format!("Unknown auth mode: {s}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthFailure {
    #[error("no webhook token presented")]
    MissingCredentials,
    #[error("webhook token is malformed: {0}")]
    MalformedToken(InvalidTokenReason),
    #[error("webhook token does not match")]
    InvalidToken,
    #[error("no {SIGNATURE_HEADER} header presented")]
    MissingSignature,
    #[error("signature must be sha256=<hex>")]
    MalformedSignature,
    #[error("signature does not match the request body")]
    InvalidSignature,
}

impl AuthFailure {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::MalformedToken(_) => "malformed_token",
            Self::InvalidToken => "invalid_token",
            Self::MissingSignature => "missing_signature",
            Self::MalformedSignature => "malformed_signature",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

pub enum Authenticator {
    Disabled,
    /// Only the digest of the shared token is kept around
    Token { digest: [u8; 32] },
    Hmac {
        secret: Vec<u8>,
        max_body_bytes: usize,
        chunk_timeout: Duration,
    },
}

impl Authenticator {
    pub fn token(secret: &str) -> Self {
        Self::Token {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn hmac(
        secret: impl Into<Vec<u8>>,
        max_body_bytes: usize,
        chunk_timeout: Duration,
    ) -> Self {
        Self::Hmac {
            secret: secret.into(),
            max_body_bytes,
            chunk_timeout,
        }
    }

    pub fn from_mode(
        mode: AuthMode,
        token: Option<&str>,
        hmac_secret: Option<&str>,
        max_body_bytes: usize,
        chunk_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(match mode {
            AuthMode::None => Self::Disabled,
            AuthMode::Token => {
                let token = token
                    .filter(|t| !t.is_empty())
                    .context("AUTH_TOKEN is required when AUTH_MODE=token")?;
                validate_token(token).context("AUTH_TOKEN is not a valid token")?;
                Self::token(token)
            }
            AuthMode::Hmac => {
                let secret = hmac_secret
                    .filter(|s| !s.is_empty())
                    .context("HMAC_SECRET is required when AUTH_MODE=hmac")?;
                Self::hmac(secret.as_bytes(), max_body_bytes, chunk_timeout)
            }
        })
    }
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get(TOKEN_HEADER) {
        return token.to_str().ok();
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
}

pub fn check_token(expected_digest: &[u8; 32], headers: &HeaderMap) -> Result<(), AuthFailure> {
    let token = presented_token(headers).ok_or(AuthFailure::MissingCredentials)?;
    validate_token(token).map_err(AuthFailure::MalformedToken)?;

    let presented = Sha256::digest(token.as_bytes());
    if bool::from(presented.as_slice().ct_eq(expected_digest.as_slice())) {
        Ok(())
    } else {
        Err(AuthFailure::InvalidToken)
    }
}

pub fn verify_signature(
    secret: &[u8],
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AuthFailure> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(AuthFailure::MissingSignature)?
        .to_str()
        .map_err(|_| AuthFailure::MalformedSignature)?;
    let signature = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(AuthFailure::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthFailure::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| AuthFailure::InvalidSignature)
}

fn reject(failure: AuthFailure, req: &Request) -> Response {
    metrics::counter!(METRIC_AUTH_FAILURES, "reason" => failure.as_tag()).increment(1);
    let request_id = current_request_id(req.extensions());
    warn!(request_id = %request_id, reason = failure.as_tag(), "webhook authentication failed");
    crate::api::WebhookError::Unauthorized(failure).into_response_for(&request_id)
}

pub async fn authenticate(
    State(auth): State<Arc<Authenticator>>,
    req: Request,
    next: Next,
) -> Response {
    // CORS preflights carry no credentials
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    match auth.as_ref() {
        Authenticator::Disabled => next.run(req).await,
        Authenticator::Token { digest } => match check_token(digest, req.headers()) {
            Ok(()) => next.run(req).await,
            Err(failure) => reject(failure, &req),
        },
        Authenticator::Hmac {
            secret,
            max_body_bytes,
            chunk_timeout,
        } => {
            // The signature covers the raw body, so it has to be buffered here
            let (parts, body) = req.into_parts();
            let bytes = match extract_body_with_timeout(
                body,
                *max_body_bytes,
                *chunk_timeout,
                parts.uri.path(),
            )
            .await
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    return err.into_response_for(&current_request_id(&parts.extensions));
                }
            };

            let req = Request::from_parts(parts, Body::from(bytes.clone()));
            match verify_signature(secret, req.headers(), &bytes) {
                Ok(()) => next.run(req).await,
                Err(failure) => reject(failure, &req),
            }
        }
    }
}
