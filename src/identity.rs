//! Identity provider ID-token verification.
//!
//! Participants authenticate against an external identity provider and hand
//! us the resulting ID token. The token is a JWT signed by the provider; we
//! verify the signature against the provider's published JWKS and check
//! issuer, audience, and expiry. Verification fails closed: any violation is
//! reported as the same generic authentication error.
//!
//! Key material is fetched through an injectable [`JwksProvider`] so tests
//! can substitute a static key set. Fetched keys live in a time-boxed
//! read-through cache; an unknown `kid` triggers one refresh before the
//! token is rejected (providers rotate keys).

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::QuizError;

/// Verified subject attributes extracted from an ID token
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    /// Stable subject identifier at the provider (`sub` claim)
    pub subject: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Source of the identity provider's public keys
#[async_trait]
pub trait JwksProvider: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, QuizError>;
}

/// Fetches the JWKS document over HTTPS
pub struct HttpJwksProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpJwksProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl JwksProvider for HttpJwksProvider {
    async fn fetch(&self) -> Result<JwkSet, QuizError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| QuizError::Storage(format!("JWKS fetch failed: {}", e)))?;

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| QuizError::Storage(format!("JWKS parse failed: {}", e)))
    }
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Verifies participant ID tokens against the provider's JWKS
pub struct IdentityVerifier {
    provider: Arc<dyn JwksProvider>,
    issuer: String,
    audience: String,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedJwks>>,
}

#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
    name: Option<String>,
    picture: Option<String>,
}

impl IdentityVerifier {
    pub fn new(
        provider: Arc<dyn JwksProvider>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            issuer: issuer.into(),
            audience: audience.into(),
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Verify an ID token and return the subject's attributes.
    ///
    /// Signature, issuer, audience, and expiry are all enforced; every
    /// failure collapses to [`QuizError::Auth`].
    pub async fn verify(&self, id_token: &str) -> Result<VerifiedIdentity, QuizError> {
        let header = decode_header(id_token).map_err(|e| {
            debug!("ID token header rejected: {}", e);
            QuizError::Auth
        })?;
        let kid = header.kid.ok_or_else(|| {
            debug!("ID token missing kid");
            QuizError::Auth
        })?;

        let jwk = match self.cached_key(&kid) {
            Some(jwk) => jwk,
            None => {
                // Unknown kid or stale cache: refresh once, then give up
                self.refresh().await?;
                self.cached_key(&kid).ok_or_else(|| {
                    debug!("no JWKS entry for kid {}", kid);
                    QuizError::Auth
                })?
            }
        };

        let key = DecodingKey::from_jwk(&jwk).map_err(|e| {
            debug!("unusable JWKS entry for kid {}: {}", kid, e);
            QuizError::Auth
        })?;

        // Trust the algorithm declared by the key, not the token header
        let alg = jwk
            .common
            .key_algorithm
            .and_then(|ka| Algorithm::from_str(&ka.to_string()).ok())
            .unwrap_or(header.alg);

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<IdClaims>(id_token, &key, &validation).map_err(|e| {
            debug!("ID token rejected: {}", e);
            QuizError::Auth
        })?;

        if data.claims.sub.is_empty() {
            debug!("ID token has empty sub claim");
            return Err(QuizError::Auth);
        }

        Ok(VerifiedIdentity {
            subject: data.claims.sub,
            display_name: data.claims.name,
            avatar_url: data.claims.picture,
        })
    }

    /// Fetch the JWKS and replace the cached set
    pub async fn refresh(&self) -> Result<(), QuizError> {
        let keys = self.provider.fetch().await?;
        info!("refreshed identity provider JWKS ({} keys)", keys.keys.len());
        *self.cache.lock() = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    fn cached_key(&self, kid: &str) -> Option<Jwk> {
        let guard = self.cache.lock();
        match guard.as_ref() {
            Some(cached) if cached.fetched_at.elapsed() < self.cache_ttl => {
                cached.keys.find(kid).cloned()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const ISSUER: &str = "https://issuer.test";
    const AUDIENCE: &str = "channel-1";
    // "c2VjcmV0" is base64url for "secret"
    const SECRET: &[u8] = b"secret";

    struct StaticJwks(JwkSet);

    #[async_trait]
    impl JwksProvider for StaticJwks {
        async fn fetch(&self) -> Result<JwkSet, QuizError> {
            Ok(self.0.clone())
        }
    }

    fn test_jwks() -> JwkSet {
        serde_json::from_value(json!({
            "keys": [
                { "kty": "oct", "kid": "test-key", "alg": "HS256", "k": "c2VjcmV0" }
            ]
        }))
        .unwrap()
    }

    fn verifier() -> IdentityVerifier {
        IdentityVerifier::new(
            Arc::new(StaticJwks(test_jwks())),
            ISSUER,
            AUDIENCE,
            Duration::from_secs(3600),
        )
    }

    fn make_token(kid: &str, secret: &[u8], claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        json!({
            "sub": "U1234567890",
            "name": "Tester",
            "picture": "https://cdn.example.com/avatar.png",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 3600,
        })
    }

    #[tokio::test]
    async fn test_valid_token_verifies() {
        let token = make_token("test-key", SECRET, &valid_claims());
        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity.subject, "U1234567890");
        assert_eq!(identity.display_name.as_deref(), Some("Tester"));
        assert_eq!(
            identity.avatar_url.as_deref(),
            Some("https://cdn.example.com/avatar.png")
        );
    }

    #[tokio::test]
    async fn test_optional_attributes_may_be_absent() {
        let now = chrono::Utc::now().timestamp();
        let token = make_token(
            "test-key",
            SECRET,
            &json!({ "sub": "U99", "iss": ISSUER, "aud": AUDIENCE, "exp": now + 60 }),
        );
        let identity = verifier().verify(&token).await.unwrap();
        assert_eq!(identity.subject, "U99");
        assert!(identity.display_name.is_none());
        assert!(identity.avatar_url.is_none());
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let mut claims = valid_claims();
        claims["aud"] = json!("someone-else");
        let token = make_token("test-key", SECRET, &claims);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(QuizError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let mut claims = valid_claims();
        claims["iss"] = json!("https://evil.test");
        let token = make_token("test-key", SECRET, &claims);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(QuizError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mut claims = valid_claims();
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 3600);
        let token = make_token("test-key", SECRET, &claims);
        assert!(matches!(
            verifier().verify(&token).await,
            Err(QuizError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let token = make_token("test-key", b"not-the-secret", &valid_claims());
        assert!(matches!(
            verifier().verify(&token).await,
            Err(QuizError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_unknown_kid_rejected_after_refresh() {
        let token = make_token("rotated-away", SECRET, &valid_claims());
        assert!(matches!(
            verifier().verify(&token).await,
            Err(QuizError::Auth)
        ));
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        assert!(matches!(
            verifier().verify("not-a-jwt").await,
            Err(QuizError::Auth)
        ));
    }
}
