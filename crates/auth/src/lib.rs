use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

pub const DEFAULT_JWKS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_JWKS_REFRESH_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Well-known OpenID configuration URL of the issuing tenant. The issuer
    /// and JWKS location are taken from the document it serves, never from
    /// local config.
    pub well_known_url: String,
    pub audiences: Vec<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

#[derive(Clone)]
pub struct TokenValidator {
    issuer: String,
    audiences: Vec<String>,
    clock_skew: Duration,
    jwks_url: Option<String>,
    jwks_refresh_ttl: Duration,
    http: reqwest::Client,
    jwks: Arc<RwLock<JwksCache>>,
}

#[derive(Debug)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl TokenValidator {
    /// Resolves issuer and JWKS location from the well-known document and
    /// primes the key cache. Unreachable or malformed discovery data is a
    /// hard error.
    pub async fn discover(config: TokenConfig) -> Result<Self, AuthError> {
        if config.well_known_url.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "well-known URL must be non-empty".to_string(),
            });
        }
        if config.audiences.is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "at least one accepted audience is required".to_string(),
            });
        }

        let http = build_client(config.jwks_timeout)?;

        let discovery = http
            .get(&config.well_known_url)
            .send()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to fetch the well-known configuration".to_string(),
            })?
            .error_for_status()
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "well-known endpoint returned non-success status".to_string(),
            })?
            .json::<DiscoveryDocument>()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to parse the well-known configuration".to_string(),
            })?;

        let mut cache = JwksCache {
            jwks: None,
            fetched_at: None,
        };
        cache.refresh(&http, Some(&discovery.jwks_uri)).await?;

        Ok(Self {
            issuer: discovery.issuer,
            audiences: config.audiences,
            clock_skew: config.clock_skew,
            jwks_url: Some(discovery.jwks_uri),
            jwks_refresh_ttl: config.jwks_refresh_ttl,
            http,
            jwks: Arc::new(RwLock::new(cache)),
        })
    }

    /// Builds a validator from an already-known issuer and key set, skipping
    /// discovery. The key set is never refreshed.
    pub fn from_parts(
        issuer: impl Into<String>,
        audiences: Vec<String>,
        jwks: JwkSet,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            issuer: issuer.into(),
            audiences,
            clock_skew: DEFAULT_CLOCK_SKEW,
            jwks_url: None,
            jwks_refresh_ttl: DEFAULT_JWKS_REFRESH_TTL,
            http: build_client(DEFAULT_JWKS_TIMEOUT)?,
            jwks: Arc::new(RwLock::new(JwksCache {
                jwks: Some(jwks),
                fetched_at: Some(Instant::now()),
            })),
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Extracts the bearer token from the Authorization header and validates
    /// signature, issuer, audience and expiry against the cached JWKS.
    pub async fn validate_headers(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let token = bearer_token(headers)?;
        self.validate_token(&token).await
    }

    pub async fn validate_token(&self, token: &str) -> Result<(), AuthError> {
        let header = decode_header(token).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "invalid JWT header".to_string(),
        })?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "unsupported JWT alg (expected RS256)".to_string(),
            });
        }

        let kid = header.kid.ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT header missing kid".to_string(),
        })?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audiences);
        }
        validation.leeway = self.clock_skew.as_secs();

        decode::<Value>(token, &decoding_key, &validation).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT validation failed".to_string(),
        })?;

        Ok(())
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks.read().await;
            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError {
                    code: "ERR_AUTH_INVALID",
                    message: "failed to parse JWK decoding key".to_string(),
                });
            }
        }

        // Unknown kid: the signing key may have rotated since the last fetch.
        {
            let mut cache = self.jwks.write().await;
            let refresh_needed = cache
                .fetched_at
                .map(|t| t.elapsed() > self.jwks_refresh_ttl)
                .unwrap_or(true);
            if refresh_needed && self.jwks_url.is_some() {
                cache.refresh(&self.http, self.jwks_url.as_deref()).await?;
            }

            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError {
                    code: "ERR_AUTH_INVALID",
                    message: "failed to parse JWK decoding key".to_string(),
                });
            }
        }

        Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT kid not found in JWKS".to_string(),
        })
    }
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&jsonwebtoken::jwk::Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    async fn refresh(
        &mut self,
        http: &reqwest::Client,
        jwks_url: Option<&str>,
    ) -> Result<(), AuthError> {
        let Some(url) = jwks_url else {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "no JWKS URL available to refresh from".to_string(),
            });
        };

        let jwks = http
            .get(url)
            .send()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to fetch JWKS".to_string(),
            })?
            .error_for_status()
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "JWKS endpoint returned non-success status".to_string(),
            })?
            .json::<JwkSet>()
            .await
            .map_err(|_| AuthError {
                code: "ERR_AUTH_UNAVAILABLE",
                message: "failed to parse JWKS JSON".to_string(),
            })?;

        self.jwks = Some(jwks);
        self.fetched_at = Some(Instant::now());
        Ok(())
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|_| AuthError {
            code: "ERR_INTERNAL",
            message: "failed to initialize auth http client".to_string(),
        })
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization header".to_string(),
        })?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization must be a Bearer token".to_string(),
        })?;

    if token.trim().is_empty() {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Bearer token is empty".to_string(),
        });
    }

    Ok(token.to_string())
}
