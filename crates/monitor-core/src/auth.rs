//! Access-token verification for the REST surface.
//!
//! Bearer tokens are HS256 JWTs with `kid`-based key selection and a
//! current/next rotation window. Claims carry the caller's roles and the
//! project (tenant) ids the token grants access to; tenant authorisation is
//! behind the [`TenantDirectory`] trait so deployments can swap in an
//! identity-provider lookup.

use crate::{Error, ErrorKind, Result};
use anyhow::Context;
use chrono::Utc;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ADMIN_ROLE: &str = "alerts-admin";

#[derive(Clone)]
pub struct AccessTokenConfig {
    pub issuer: String,
    pub audience: String,
    pub current_kid: String,
    pub current_secret: String,
    pub next_kid: Option<String>,
    pub next_secret: Option<String>,
    pub ttl: Duration,
}

impl std::fmt::Debug for AccessTokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let next_secret = self.next_secret.as_deref().map(|_| "<redacted>");
        f.debug_struct("AccessTokenConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("current_kid", &self.current_kid)
            .field("current_secret", &"<redacted>")
            .field("next_kid", &self.next_kid)
            .field("next_secret", &next_secret)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: usize,
    pub iat: usize,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Project (tenant) ids this token may act on.
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Clone)]
pub struct AccessTokenVerifier {
    issuer: String,
    audience: String,
    current_kid: String,
    next_kid: Option<String>,
    ttl: Duration,
    current_encoding_key: EncodingKey,
    current_decoding_key: DecodingKey,
    next_decoding_key: Option<DecodingKey>,
}

impl std::fmt::Debug for AccessTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenVerifier")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("current_kid", &self.current_kid)
            .field("next_kid", &self.next_kid)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl AccessTokenVerifier {
    pub fn from_hs256_config(cfg: AccessTokenConfig) -> Result<Self> {
        if cfg.next_kid.is_some() != cfg.next_secret.is_some() {
            return Err(Error::msg(
                ErrorKind::Internal,
                "next_kid and next_secret must be set together",
            ));
        }

        let secret = cfg.current_secret.as_bytes();
        Ok(Self {
            issuer: cfg.issuer,
            audience: cfg.audience,
            current_kid: cfg.current_kid,
            next_kid: cfg.next_kid,
            ttl: cfg.ttl,
            current_encoding_key: EncodingKey::from_secret(secret),
            current_decoding_key: DecodingKey::from_secret(secret),
            next_decoding_key: cfg
                .next_secret
                .as_deref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
        })
    }

    /// Issue a token with the current key. Used by the test suite and local
    /// tooling; production tokens come from the identity provider.
    pub fn issue(&self, sub: &str, roles: &[String], projects: &[String]) -> Result<String> {
        let now = Utc::now().timestamp();
        let iat: usize = now.try_into().unwrap_or(0);
        let exp: usize = (now + self.ttl.as_secs().try_into().unwrap_or(i64::MAX))
            .try_into()
            .unwrap_or(usize::MAX);

        let claims = AccessClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: sub.to_string(),
            exp,
            iat,
            roles: roles.to_vec(),
            projects: projects.to_vec(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.current_kid.clone());
        encode(&header, &claims, &self.current_encoding_key)
            .context("encode access token")
            .map_err(Error::internal)
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let header = decode_header(token)
            .context("decode jwt header")
            .map_err(|err| Error::new(ErrorKind::Unauthorized, err))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::unauthorized("missing jwt kid"))?;

        let decoding_key = if kid == self.current_kid {
            &self.current_decoding_key
        } else if self.next_kid.as_deref() == Some(kid) {
            self.next_decoding_key
                .as_ref()
                .ok_or_else(|| Error::unauthorized("next jwt key not configured"))?
        } else {
            return Err(Error::unauthorized("invalid jwt kid"));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&self.audience));

        let data = decode::<AccessClaims>(token, decoding_key, &validation)
            .context("verify jwt")
            .map_err(|err| Error::new(ErrorKind::Unauthorized, err))?;
        Ok(data.claims)
    }
}

/// Tenant allow-list lookup.
pub trait TenantDirectory: Send + Sync {
    fn is_member(&self, claims: &AccessClaims, tenant_id: &str) -> bool;
}

/// Default directory: the token itself carries the project allow-list, and
/// the admin role grants every tenant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimsTenantDirectory;

impl TenantDirectory for ClaimsTenantDirectory {
    fn is_member(&self, claims: &AccessClaims, tenant_id: &str) -> bool {
        if claims.roles.iter().any(|role| role == ADMIN_ROLE) {
            return true;
        }
        claims.projects.iter().any(|project| project == tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(next: Option<(&str, &str)>) -> AccessTokenVerifier {
        AccessTokenVerifier::from_hs256_config(AccessTokenConfig {
            issuer: "idp.example".to_string(),
            audience: "alerting-monitor".to_string(),
            current_kid: "k1".to_string(),
            current_secret: "secret-one".to_string(),
            next_kid: next.map(|(kid, _)| kid.to_string()),
            next_secret: next.map(|(_, secret)| secret.to_string()),
            ttl: Duration::from_secs(300),
        })
        .unwrap()
    }

    #[test]
    fn issue_verify_round_trip() {
        let verifier = verifier(None);
        let token = verifier
            .issue(
                "user:jane",
                &["viewer".to_string()],
                &["tenant-a".to_string()],
            )
            .unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, "user:jane");
        assert_eq!(claims.projects, vec!["tenant-a".to_string()]);
    }

    #[test]
    fn rejects_unknown_kid() {
        let issuing = verifier(None);
        let token = issuing.issue("user:jane", &[], &[]).unwrap();

        let other = AccessTokenVerifier::from_hs256_config(AccessTokenConfig {
            issuer: "idp.example".to_string(),
            audience: "alerting-monitor".to_string(),
            current_kid: "k2".to_string(),
            current_secret: "secret-two".to_string(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(300),
        })
        .unwrap();

        let err = other.verify(&token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn accepts_next_key_during_overlap() {
        let next_signer = AccessTokenVerifier::from_hs256_config(AccessTokenConfig {
            issuer: "idp.example".to_string(),
            audience: "alerting-monitor".to_string(),
            current_kid: "k2".to_string(),
            current_secret: "secret-two".to_string(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(300),
        })
        .unwrap();
        let token = next_signer.issue("user:jane", &[], &[]).unwrap();

        let overlapping = verifier(Some(("k2", "secret-two")));
        assert!(overlapping.verify(&token).is_ok());
    }

    #[test]
    fn directory_honours_projects_and_admin_role() {
        let directory = ClaimsTenantDirectory;
        let mut claims = AccessClaims {
            iss: String::new(),
            aud: String::new(),
            sub: "user:jane".to_string(),
            exp: 0,
            iat: 0,
            roles: vec![],
            projects: vec!["tenant-a".to_string()],
        };
        assert!(directory.is_member(&claims, "tenant-a"));
        assert!(!directory.is_member(&claims, "tenant-b"));

        claims.roles.push(ADMIN_ROLE.to_string());
        assert!(directory.is_member(&claims, "tenant-b"));
    }
}
