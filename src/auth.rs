//! Challenge-response authorization for registry requests
//!
//! The retry engine asks an [`Authorizer`] to decorate outgoing requests
//! and, when a 401 comes back, hands it the full response history so it can
//! acquire fresh credentials before the request is replayed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use http_auth::parser::ChallengeParser;
use http_auth::ChallengeRef;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{ResolveError, Result};
use crate::token_cache::{RegistryToken, TokenCache};

/// Scope requested from a registry token endpoint, rendered as
/// `repository:<name>:<actions>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenScope {
    /// Repository the token should cover
    pub repository: String,
    /// Granted actions, e.g. `pull`
    pub actions: Vec<String>,
}

impl TokenScope {
    /// Scope granting pull access to a repository
    pub fn pull(repository: impl Into<String>) -> Self {
        TokenScope {
            repository: repository.into(),
            actions: vec!["pull".to_string()],
        }
    }

    /// Scope granting pull and push access to a repository
    pub fn push(repository: impl Into<String>) -> Self {
        TokenScope {
            repository: repository.into(),
            actions: vec!["pull".to_string(), "push".to_string()],
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository:{}:{}", self.repository, self.actions.join(","))
    }
}

/// Response metadata recorded by the retry engine and handed to
/// [`Authorizer::add_responses`]. The last entry is the unauthorized
/// response; earlier entries are the redirects and retries that led to it.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// URL the response came from
    pub url: Url,
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// `Authorization` header the request was sent with, if any
    pub authorization: Option<String>,
}

/// Authorizes HTTP requests based on 401 responses
///
/// An authorizer owns whatever credential or token cache it needs; its
/// state persists across resolutions and its methods are safe to call from
/// concurrent resolutions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Sets the appropriate `Authorization` header on the given request.
    /// If no authorization is known for the request's host, the request is
    /// left unmodified.
    async fn authorize(&self, req: &mut reqwest::Request, scope: Option<&TokenScope>)
        -> Result<()>;

    /// Considers an unauthorized response history when authorizing future
    /// requests. Returns `Ok` when a retry is worthwhile,
    /// [`ResolveError::NotImplemented`] when no challenge is understood.
    async fn add_responses(
        &self,
        responses: &[ResponseInfo],
        scope: Option<&TokenScope>,
    ) -> Result<()>;
}

/// A username and secret for a registry host. An empty username with a
/// non-empty secret means the secret is a long-lived bearer token.
#[derive(Clone)]
pub struct Credentials {
    /// Account name, possibly empty
    pub username: String,
    /// Password or token
    pub secret: String,
}

/// Callback providing [`Credentials`] for a host
pub type CredentialsFn = Arc<dyn Fn(&str) -> Result<Credentials> + Send + Sync>;

// Auth scheme negotiated for a host from its WWW-Authenticate challenge.
#[derive(Clone, Debug)]
enum AuthHandler {
    Basic,
    Bearer {
        realm: Url,
        service: Option<String>,
        scopes: Vec<String>,
    },
}

/// Default [`Authorizer`] speaking Basic and Bearer token auth
///
/// Challenges are parsed from `WWW-Authenticate`; bearer tokens are fetched
/// from the challenge realm and cached per (host, scope set) until expiry.
pub struct RegistryAuthorizer {
    client: reqwest::Client,
    header: HeaderMap,
    credentials: Option<CredentialsFn>,
    handlers: RwLock<HashMap<String, AuthHandler>>,
    tokens: TokenCache,
}

impl Default for RegistryAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuthorizer {
    /// Creates an authorizer with no credentials configured; anonymous
    /// bearer tokens can still be fetched for public repositories
    pub fn new() -> Self {
        RegistryAuthorizer {
            client: reqwest::Client::new(),
            header: HeaderMap::new(),
            credentials: None,
            handlers: RwLock::new(HashMap::new()),
            tokens: TokenCache::new(DEFAULT_TOKEN_EXPIRATION_SECS),
        }
    }

    /// Uses the given client for token fetches
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Adds static headers to token fetch requests
    #[must_use]
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }

    /// Sources credentials from the given callback
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialsFn) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn credentials_for(&self, host: &str) -> Result<Option<Credentials>> {
        match &self.credentials {
            Some(f) => f(host).map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_token(
        &self,
        host: &str,
        realm: &Url,
        service: Option<&str>,
        scopes: &[String],
    ) -> Result<RegistryToken> {
        let creds = self.credentials_for(host)?;

        // An empty username with a secret means the secret is itself a
        // long-lived token.
        if let Some(creds) = &creds {
            if creds.username.is_empty() && !creds.secret.is_empty() {
                return Ok(RegistryToken::Token {
                    token: creds.secret.clone(),
                });
            }
        }

        let mut query: Vec<(&str, String)> =
            scopes.iter().map(|s| ("scope", s.clone())).collect();
        if let Some(service) = service {
            query.push(("service", service.to_string()));
        }

        debug!(realm = %realm, ?service, ?scopes, "making authentication call");
        let mut request = self
            .client
            .get(realm.clone())
            .headers(self.header.clone())
            .query(&query);
        if let Some(creds) = &creds {
            if !creds.username.is_empty() {
                request = request.basic_auth(&creds.username, Some(&creds.secret));
            }
        }

        let res = request.send().await?;
        match res.status() {
            StatusCode::OK => {
                let text = res.text().await?;
                let token: RegistryToken = serde_json::from_str(&text).map_err(|e| {
                    ResolveError::AuthenticationFailure(format!(
                        "could not decode token response: {}",
                        e
                    ))
                })?;
                Ok(token)
            }
            status => {
                let reason = res.text().await.unwrap_or_default();
                debug!(%status, %reason, "token fetch refused");
                Err(ResolveError::AuthenticationFailure(reason))
            }
        }
    }
}

#[async_trait]
impl Authorizer for RegistryAuthorizer {
    async fn authorize(
        &self,
        req: &mut reqwest::Request,
        scope: Option<&TokenScope>,
    ) -> Result<()> {
        let host = host_key(req.url());
        let handler = self.handlers.read().await.get(&host).cloned();
        match handler {
            None => Ok(()),
            Some(AuthHandler::Basic) => {
                if let Some(creds) = self.credentials_for(&host)? {
                    let encoded = BASE64_STANDARD
                        .encode(format!("{}:{}", creds.username, creds.secret));
                    let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                        .map_err(|e| ResolveError::AuthenticationFailure(e.to_string()))?;
                    req.headers_mut().insert(AUTHORIZATION, value);
                }
                Ok(())
            }
            Some(AuthHandler::Bearer {
                realm,
                service,
                scopes,
            }) => {
                let scopes = merge_scopes(&scopes, scope);
                let key = scopes.join(" ");
                let token = match self.tokens.get(&host, &key).await {
                    Some(token) => token,
                    None => {
                        let token = self
                            .fetch_token(&host, &realm, service.as_deref(), &scopes)
                            .await?;
                        self.tokens.insert(&host, &key, token.clone()).await;
                        token
                    }
                };
                let value = HeaderValue::from_str(&token.bearer_token())
                    .map_err(|e| ResolveError::AuthenticationFailure(e.to_string()))?;
                req.headers_mut().insert(AUTHORIZATION, value);
                Ok(())
            }
        }
    }

    async fn add_responses(
        &self,
        responses: &[ResponseInfo],
        scope: Option<&TokenScope>,
    ) -> Result<()> {
        let last = responses
            .last()
            .filter(|r| r.status == StatusCode::UNAUTHORIZED)
            .ok_or_else(|| {
                ResolveError::NotImplemented("unhandled response status".to_string())
            })?;
        let host = host_key(&last.url);

        // bearer challenges outrank basic ones regardless of header order
        let challenges = parse_challenges(&last.headers);
        let ordered = challenges
            .iter()
            .filter(|c| c.scheme.eq_ignore_ascii_case("bearer"))
            .chain(
                challenges
                    .iter()
                    .filter(|c| c.scheme.eq_ignore_ascii_case("basic")),
            );

        for challenge in ordered {
            if challenge.scheme.eq_ignore_ascii_case("bearer") {
                if invalid_authorization(responses) {
                    return Err(ResolveError::AuthenticationFailure(
                        "registry rejected provided credentials".to_string(),
                    ));
                }

                let mut realm = None;
                let mut service = None;
                let mut scopes = Vec::new();
                for (key, value) in &challenge.params {
                    if key.eq_ignore_ascii_case("realm") {
                        realm = Some(value.clone());
                    } else if key.eq_ignore_ascii_case("service") {
                        service = Some(value.clone());
                    } else if key.eq_ignore_ascii_case("scope") {
                        scopes.extend(value.split_whitespace().map(String::from));
                    }
                }
                let realm = match realm.as_deref().map(Url::parse) {
                    Some(Ok(url)) => url,
                    Some(Err(err)) => {
                        warn!(%host, error = %err, "bearer challenge carries invalid realm");
                        continue;
                    }
                    None => {
                        warn!(%host, "bearer challenge missing realm");
                        continue;
                    }
                };

                // Drop any token previously issued for this scope set; the
                // 401 proves it is no longer accepted.
                let merged = merge_scopes(&scopes, scope);
                self.tokens.invalidate(&host, &merged.join(" ")).await;

                debug!(%host, %realm, "configured bearer auth");
                self.handlers.write().await.insert(
                    host,
                    AuthHandler::Bearer {
                        realm,
                        service,
                        scopes,
                    },
                );
                return Ok(());
            }

            if challenge.scheme.eq_ignore_ascii_case("basic") {
                if let Some(creds) = self.credentials_for(&host)? {
                    if !creds.secret.is_empty() {
                        debug!(%host, "configured basic auth");
                        self.handlers.write().await.insert(host, AuthHandler::Basic);
                        return Ok(());
                    }
                }
            }
        }

        Err(ResolveError::NotImplemented(
            "failed to find supported auth scheme".to_string(),
        ))
    }
}

const DEFAULT_TOKEN_EXPIRATION_SECS: usize = 60;

// Two consecutive 401s carrying the same Authorization header mean the
// server rejected credentials it was already shown; fetching another token
// for the same scope would loop.
fn invalid_authorization(responses: &[ResponseInfo]) -> bool {
    let n = responses.len();
    if n < 2 {
        return false;
    }
    let (prev, last) = (&responses[n - 2], &responses[n - 1]);
    prev.status == StatusCode::UNAUTHORIZED
        && last.status == StatusCode::UNAUTHORIZED
        && last.authorization.is_some()
        && prev.authorization == last.authorization
}

fn merge_scopes(challenge_scopes: &[String], scope: Option<&TokenScope>) -> Vec<String> {
    let mut merged: Vec<String> = challenge_scopes.to_vec();
    if let Some(scope) = scope {
        let rendered = scope.to_string();
        if !merged.contains(&rendered) {
            merged.push(rendered);
        }
    }
    merged
}

fn parse_challenges(headers: &HeaderMap) -> Vec<OwnedChallenge> {
    let Some(value) = headers.get(WWW_AUTHENTICATE) else {
        return Vec::new();
    };
    let Ok(value) = value.to_str() else {
        return Vec::new();
    };
    ChallengeParser::new(value)
        .filter_map(|parsed| parsed.ok().map(OwnedChallenge::from))
        .collect()
}

// http-auth's ChallengeRef borrows the header value; the handlers outlive
// it, so the parameters are copied out.
struct OwnedChallenge {
    scheme: String,
    params: Vec<(String, String)>,
}

impl From<ChallengeRef<'_>> for OwnedChallenge {
    fn from(challenge: ChallengeRef<'_>) -> Self {
        OwnedChallenge {
            scheme: challenge.scheme.to_string(),
            params: challenge
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_unescaped()))
                .collect(),
        }
    }
}

pub(crate) fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
