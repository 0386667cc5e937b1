// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token handling for the gRPC surface.
//!
//! Signature verification belongs to a deployment-specific collaborator;
//! the daemon only needs decoded claims. Two built-in verifiers exist: a
//! static shared token for development and a claims decoder that checks
//! expiry and audience on an externally verified token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tonic::metadata::MetadataMap;

use crate::dispatch::Claims;
use crate::error::BrokerError;

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Extract the bearer token from request metadata.
pub fn bearer_token(metadata: &MetadataMap) -> Result<&str, BrokerError> {
    let header = metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BrokerError::unauthenticated("missing authorization header"))?;
    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| BrokerError::unauthenticated("authorization header is not a bearer token"))
}

/// Turns a bearer token into verified claims.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, BrokerError>;
}

/// Development verifier: one shared static token, no project scope.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Claims, BrokerError> {
        if constant_time_eq(token, &self.token) {
            Ok(Claims {
                sub: "static-token".to_owned(),
                project: None,
                aud: None,
                iat: 0,
                exp: u64::MAX,
            })
        } else {
            Err(BrokerError::unauthenticated("invalid bearer token"))
        }
    }
}

/// Decodes the claims set of a compact signed token and checks expiry and
/// audience. The signature has already been verified upstream (mutual TLS
/// plus the issuer-side check); this type never validates it.
pub struct ClaimsDecoder {
    audience: Option<String>,
}

impl ClaimsDecoder {
    pub fn new(audience: Option<String>) -> Self {
        Self { audience }
    }
}

impl TokenVerifier for ClaimsDecoder {
    fn verify(&self, token: &str) -> Result<Claims, BrokerError> {
        let claims = decode_claims(token)?;
        let now = crate::event::now_ms() / 1000;
        if claims.exp != 0 && claims.exp < now {
            return Err(BrokerError::unauthenticated("token expired"));
        }
        if let Some(ref expected) = self.audience {
            match claims.aud {
                Some(ref aud) if aud == expected => {}
                _ => return Err(BrokerError::unauthenticated("token audience mismatch")),
            }
        }
        Ok(claims)
    }
}

/// Decode the payload segment of a `header.payload.signature` token.
pub fn decode_claims(token: &str) -> Result<Claims, BrokerError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(BrokerError::unauthenticated("malformed token"));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| BrokerError::unauthenticated("malformed token payload"))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| BrokerError::unauthenticated("malformed token claims"))
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
