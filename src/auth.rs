//! Inbound request authentication against the hub identity endpoint.
//!
//! A credential is taken from exactly one source, in order: the `token`
//! query parameter, an `Authorization: Bearer` header, the session cookie,
//! then the legacy cookie. The first non-empty one is used and is never
//! retried against a later source.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::ServiceConfig;
use crate::error::JappsError;
use crate::server::ApiRequest;

pub const TOKEN_QUERY_PARAM: &str = "token";
pub const SESSION_COOKIE: &str = "jhub_apps_access_token";
/// Accepted for older clients; new sessions only set `SESSION_COOKIE`.
pub const LEGACY_SESSION_COOKIE: &str = "access_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    QueryParam,
    BearerHeader,
    SessionCookie,
    LegacyCookie,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub source: CredentialSource,
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("token", &token_fingerprint(&self.token))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Principal {
    pub name: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_permissions: Option<serde_json::Value>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub required_scopes: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn authorizes(&self, principal: &Principal) -> bool {
        principal
            .scopes
            .iter()
            .any(|scope| self.required_scopes.contains(scope))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSubject {
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionClaims {
    pub sub: SessionSubject,
    pub exp: i64,
}

/// Cookie value produced by a completed login.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: String,
    pub max_age: Duration,
}

impl fmt::Debug for SessionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGrant")
            .field("token", &token_fingerprint(&self.token))
            .field("max_age", &self.max_age)
            .finish()
    }
}

/// Short SHA-256 fingerprint used when a token has to appear in logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        non_empty(Some(token))
    } else {
        None
    }
}

pub fn extract_credential(request: &ApiRequest) -> Option<Credential> {
    let candidates = [
        (
            CredentialSource::QueryParam,
            non_empty(request.query_param(TOKEN_QUERY_PARAM)),
        ),
        (
            CredentialSource::BearerHeader,
            request.header("authorization").and_then(bearer_token),
        ),
        (
            CredentialSource::SessionCookie,
            non_empty(request.cookie(SESSION_COOKIE)),
        ),
        (
            CredentialSource::LegacyCookie,
            non_empty(request.cookie(LEGACY_SESSION_COOKIE)),
        ),
    ];
    candidates
        .into_iter()
        .find_map(|(source, token)| {
            token.map(|token| Credential {
                source,
                token: token.to_string(),
            })
        })
}

fn looks_like_jwt(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        })
}

pub fn issue_session_token(
    hub_token: &str,
    secret: &str,
    ttl: Duration,
) -> Result<String, JappsError> {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let claims = SessionClaims {
        sub: SessionSubject {
            access_token: hub_token.to_string(),
        },
        exp: chrono::Utc::now().timestamp().saturating_add(ttl),
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|err| JappsError::Process(format!("failed to sign session token: {err}")))
}

pub fn decode_session_token(token: &str, secret: &str) -> Result<String, JappsError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = jsonwebtoken::decode::<SessionClaims>(token, &key, &Validation::new(Algorithm::HS256))
        .map_err(|err| JappsError::Unauthenticated(format!("invalid session token: {err}")))?;
    Ok(data.claims.sub.access_token)
}

pub trait IdentityProvider: Send + Sync {
    /// Resolves the identity behind a hub token.
    fn fetch_user(&self, token: &str) -> Result<Principal, JappsError>;
    /// Exchanges an OAuth authorization code for a hub token.
    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String, JappsError>;
}

pub struct HubClient {
    client: reqwest::blocking::Client,
    user_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl HubClient {
    pub fn new(cfg: &ServiceConfig) -> Result<Self, JappsError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(cfg.hub_timeout())
            .build()?;
        Ok(Self {
            client,
            user_url: cfg.hub_endpoint("user"),
            token_url: cfg.hub_endpoint("oauth2/token"),
            client_id: cfg.hub.client_id.clone(),
            client_secret: cfg.hub.api_token.clone(),
        })
    }
}

impl IdentityProvider for HubClient {
    fn fetch_user(&self, token: &str) -> Result<Principal, JappsError> {
        // Authenticate as the user, not as the service.
        let response = self
            .client
            .get(&self.user_url)
            .bearer_auth(token)
            .send()
            .map_err(|err| {
                error!(
                    request_url = %self.user_url,
                    token_hash = %token_fingerprint(token),
                    error = %err,
                    timed_out = err.is_timeout(),
                    "hub identity request failed"
                );
                if err.is_timeout() {
                    JappsError::Unauthenticated("hub identity request timed out".to_string())
                } else {
                    JappsError::UpstreamUnavailable("hub identity endpoint unreachable".to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            error!(
                request_url = %self.user_url,
                response_code = status.as_u16(),
                token_hash = %token_fingerprint(token),
                "failed to get user info from token"
            );
            return Err(JappsError::Unauthenticated(format!(
                "hub rejected token with status {}",
                status.as_u16()
            )));
        }
        response.json::<Principal>().map_err(|err| {
            error!(request_url = %self.user_url, error = %err, "unexpected identity payload");
            JappsError::Unauthenticated("unexpected identity payload".to_string())
        })
    }

    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String, JappsError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .map_err(|err| {
                error!(request_url = %self.token_url, error = %err, "hub token exchange failed");
                JappsError::UpstreamUnavailable("hub token endpoint unreachable".to_string())
            })?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                request_url = %self.token_url,
                response_code = status.as_u16(),
                "hub refused authorization code"
            );
            return Err(JappsError::Unauthenticated(format!(
                "authorization code rejected with status {}",
                status.as_u16()
            )));
        }
        let body: TokenResponse = response
            .json()
            .map_err(|_| JappsError::Unauthenticated("unexpected token payload".to_string()))?;
        Ok(body.access_token)
    }
}

pub struct AuthGate<P: IdentityProvider> {
    provider: P,
    policy: AccessPolicy,
    session_secret: Option<String>,
    session_ttl: Duration,
}

impl<P: IdentityProvider> AuthGate<P> {
    pub fn new(provider: P, policy: AccessPolicy) -> Self {
        Self {
            provider,
            policy,
            session_secret: None,
            session_ttl: Duration::from_secs(86_400),
        }
    }

    pub fn from_config(provider: P, cfg: &ServiceConfig) -> Self {
        let mut gate = Self::new(provider, AccessPolicy::new(cfg.required_scopes()));
        gate.session_secret = cfg.session_secret().map(str::to_string);
        gate.session_ttl = Duration::from_secs(cfg.auth.session_ttl_sec);
        gate
    }

    pub fn with_session_secret(mut self, secret: impl Into<String>) -> Self {
        self.session_secret = Some(secret.into());
        self
    }

    fn hub_token(&self, credential: &Credential) -> Result<String, JappsError> {
        match &self.session_secret {
            Some(secret) if looks_like_jwt(&credential.token) => {
                decode_session_token(&credential.token, secret).map_err(|err| {
                    warn!(
                        source = ?credential.source,
                        token_hash = %token_fingerprint(&credential.token),
                        "session token verification failed"
                    );
                    err
                })
            }
            _ => Ok(credential.token.clone()),
        }
    }

    pub fn authenticate(&self, request: &ApiRequest) -> Result<Principal, JappsError> {
        let credential = extract_credential(request).ok_or_else(|| {
            JappsError::Unauthenticated(
                "must login with token parameter or Authorization bearer header".to_string(),
            )
        })?;
        let token = self.hub_token(&credential)?;
        let principal = self.provider.fetch_user(&token)?;
        if !self.policy.authorizes(&principal) {
            warn!(
                username = %principal.name,
                user_scopes = ?principal.scopes,
                required_scopes = ?self.policy.required_scopes,
                "user not authorized"
            );
            return Err(JappsError::Unauthorized {
                user: principal.name,
            });
        }
        debug!(username = %principal.name, source = ?credential.source, "request authenticated");
        Ok(principal)
    }

    /// Finishes the OAuth code flow. With a session secret configured the hub
    /// token is wrapped in a signed session token; otherwise it is returned as is.
    pub fn complete_login(&self, code: &str, redirect_uri: &str) -> Result<SessionGrant, JappsError> {
        if code.trim().is_empty() {
            return Err(JappsError::Unauthenticated(
                "missing authorization code".to_string(),
            ));
        }
        let hub_token = self.provider.exchange_code(code, redirect_uri)?;
        let token = match &self.session_secret {
            Some(secret) => issue_session_token(&hub_token, secret, self.session_ttl)?,
            None => hub_token,
        };
        Ok(SessionGrant {
            token,
            max_age: self.session_ttl,
        })
    }
}
