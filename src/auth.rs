//! Short-lived access tokens derived from a pre-shared identity key.
//!
//! Workers running outside the server process authenticate their RPC
//! identity with a narrowly scoped token minted from the identity key. The
//! token is kept fresh by [`SharedToken::refresh_loop`] and attached to
//! outgoing requests by [`AuthInterceptor`].

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use uuid::Uuid;

use crate::store::BuildSpec;

/// Default lifetime of a minted token.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 600;

/// Tokens are refreshed this long before they expire.
pub const REFRESH_MARGIN_SECS: i64 = 60;

const REFRESH_RETRY: StdDuration = StdDuration::from_secs(5);
const MIN_REFRESH_WAIT: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity key is empty")]
    MissingKey,

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token scope {got} does not match {expected}")]
    ScopeMismatch { expected: String, got: String },
}

/// What a token may be used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenScope {
    /// Dequeue and update builds.
    Worker,
    /// Read (clone) a single repository hosted by the server.
    RepoRead(String),
    /// Upload results for a single build.
    Build(BuildSpec),
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenScope::Worker => f.write_str("worker:build"),
            TokenScope::RepoRead(repo) => write!(f, "repo:read:{repo}"),
            TokenScope::Build(build) => write!(f, "build:{build}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= window
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues access tokens. Token issuance itself belongs to the server; this is
/// the seam the worker consumes.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, scope: &TokenScope) -> Result<AccessToken, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub scope: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signer over a pre-shared identity key.
#[derive(Clone)]
pub struct IdentityKey {
    encoding: Arc<EncodingKey>,
    decoding: Arc<DecodingKey>,
    subject: String,
    ttl: Duration,
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("subject", &self.subject)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IdentityKey {
    pub fn new(secret: &str, subject: impl Into<String>) -> Result<Self, AuthError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuthError::MissingKey);
        }
        Ok(Self {
            encoding: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            subject: subject.into(),
            ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn mint(&self, scope: &TokenScope) -> Result<AccessToken, AuthError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: self.subject.clone(),
            scope: scope.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            self.encoding.as_ref(),
        )?;
        Ok(AccessToken { token, expires_at })
    }

    /// Verifies a token minted with this key, then checks its scope.
    pub fn verify(&self, token: &str, scope: &TokenScope) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        let data = jsonwebtoken::decode::<Claims>(token, self.decoding.as_ref(), &validation)?;
        let expected = scope.to_string();
        if data.claims.scope != expected {
            return Err(AuthError::ScopeMismatch {
                expected,
                got: data.claims.scope,
            });
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenIssuer for IdentityKey {
    async fn issue(&self, scope: &TokenScope) -> Result<AccessToken, AuthError> {
        self.mint(scope)
    }
}

/// A token for one scope, shared between the refresh loop and RPC clients.
#[derive(Clone)]
pub struct SharedToken {
    issuer: Arc<dyn TokenIssuer>,
    scope: TokenScope,
    current: Arc<RwLock<Option<AccessToken>>>,
}

impl SharedToken {
    pub fn new(issuer: Arc<dyn TokenIssuer>, scope: TokenScope) -> Self {
        Self {
            issuer,
            scope,
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub fn scope(&self) -> &TokenScope {
        &self.scope
    }

    pub fn current(&self) -> Option<AccessToken> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Mints a fresh token and makes it current.
    pub async fn refresh(&self) -> Result<AccessToken, AuthError> {
        let token = self.issuer.issue(&self.scope).await?;
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(token.clone());
        }
        tracing::debug!(
            scope = %self.scope,
            expires_at = %token.expires_at,
            "Refreshed access token"
        );
        Ok(token)
    }

    /// Re-mints the token shortly before expiry until `shutdown` fires.
    pub async fn refresh_loop(self, shutdown: CancellationToken) {
        let margin = Duration::seconds(REFRESH_MARGIN_SECS);
        loop {
            let wait = match self.current() {
                Some(token) => (token.expires_at - margin - Utc::now())
                    .to_std()
                    .unwrap_or(StdDuration::ZERO)
                    .max(MIN_REFRESH_WAIT),
                None => StdDuration::ZERO,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(
                            scope = %self.scope,
                            error = %e,
                            "Failed to refresh access token"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(REFRESH_RETRY) => {}
                        }
                    }
                }
            }
        }
    }

    pub fn interceptor(&self) -> AuthInterceptor {
        AuthInterceptor {
            token: self.clone(),
        }
    }
}

/// Adds `authorization: Bearer <token>` to outgoing requests.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: SharedToken,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let token = self
            .token
            .current()
            .ok_or_else(|| Status::unauthenticated("access token not yet issued"))?;
        let value: MetadataValue<Ascii> = format!("Bearer {}", token.token)
            .parse()
            .map_err(|_| Status::internal("access token is not valid metadata"))?;
        request.metadata_mut().insert("authorization", value);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            IdentityKey::new("  ", "w"),
            Err(AuthError::MissingKey)
        ));
    }

    #[test]
    fn minted_token_verifies_for_its_scope_only() {
        let key = IdentityKey::new("secret", "worker-1").unwrap();
        let token = key.mint(&TokenScope::Worker).unwrap();

        let claims = key.verify(&token.token, &TokenScope::Worker).unwrap();
        assert_eq!(claims.sub, "worker-1");
        assert_eq!(claims.scope, "worker:build");

        let other = TokenScope::RepoRead("r".to_string());
        assert!(matches!(
            key.verify(&token.token, &other),
            Err(AuthError::ScopeMismatch { .. })
        ));
    }

    #[test]
    fn token_from_other_key_fails_verification() {
        let a = IdentityKey::new("a", "w").unwrap();
        let b = IdentityKey::new("b", "w").unwrap();
        let token = a.mint(&TokenScope::Worker).unwrap();
        assert!(b.verify(&token.token, &TokenScope::Worker).is_err());
    }

    #[test]
    fn expiry_window() {
        let now = Utc::now();
        let token = AccessToken {
            token: String::new(),
            expires_at: now + Duration::seconds(30),
        };
        assert!(token.expires_within(Duration::seconds(60), now));
        assert!(!token.expires_within(Duration::seconds(10), now));
    }

    #[tokio::test]
    async fn interceptor_requires_then_attaches_token() {
        let key = Arc::new(IdentityKey::new("secret", "w").unwrap());
        let shared = SharedToken::new(key.clone(), TokenScope::Worker);
        let mut interceptor = shared.interceptor();

        let err = interceptor.call(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let token = shared.refresh().await.unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        let header = request.metadata().get("authorization").unwrap();
        assert_eq!(header.to_str().unwrap(), format!("Bearer {}", token.token));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_replaces_expiring_token() {
        let key = Arc::new(
            IdentityKey::new("secret", "w")
                .unwrap()
                .with_ttl(Duration::seconds(REFRESH_MARGIN_SECS)),
        );
        let shared = SharedToken::new(key, TokenScope::Worker);
        let first = shared.refresh().await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(shared.clone().refresh_loop(shutdown.clone()));

        let mut replaced = false;
        for _ in 0..200 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if shared.current().map(|t| t.token) != Some(first.token.clone()) {
                replaced = true;
                break;
            }
        }
        shutdown.cancel();
        handle.await.unwrap();
        assert!(replaced);
    }
}
