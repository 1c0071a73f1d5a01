use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A token granted during the OAuth2-like workflow for OCI registries.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = String::from("<redacted>");
        match self {
            RegistryToken::Token { .. } => {
                f.debug_struct("Token").field("token", &redacted).finish()
            }
            RegistryToken::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("access_token", &redacted)
                .finish(),
        }
    }
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BearerTokenClaims {
    exp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TokenCacheKey {
    registry: String,
    scope: String,
}

struct TokenCacheValue {
    token: RegistryToken,
    expiration: u64,
}

/// Cache of bearer tokens keyed by (registry, scope set).
#[derive(Clone)]
pub(crate) struct TokenCache {
    tokens: Arc<RwLock<BTreeMap<TokenCacheKey, TokenCacheValue>>>,
    /// Default token expiration in seconds, to use when claims don't specify a value
    default_expiration_secs: usize,
}

impl TokenCache {
    pub(crate) fn new(default_expiration_secs: usize) -> Self {
        TokenCache {
            tokens: Arc::new(RwLock::new(BTreeMap::new())),
            default_expiration_secs,
        }
    }

    pub(crate) async fn insert(&self, registry: &str, scope: &str, token: RegistryToken) {
        let expiration =
            match parse_expiration_from_jwt(token.token(), self.default_expiration_secs) {
                Some(value) => value,
                None => return,
            };
        debug!(%registry, %scope, %expiration, "inserting token");
        self.tokens.write().await.insert(
            TokenCacheKey {
                registry: registry.to_string(),
                scope: scope.to_string(),
            },
            TokenCacheValue { token, expiration },
        );
    }

    pub(crate) async fn get(&self, registry: &str, scope: &str) -> Option<RegistryToken> {
        let key = TokenCacheKey {
            registry: registry.to_string(),
            scope: scope.to_string(),
        };
        match self.tokens.read().await.get(&key) {
            Some(TokenCacheValue {
                ref token,
                expiration,
            }) => {
                let now = SystemTime::now();
                let epoch = now
                    .duration_since(UNIX_EPOCH)
                    .expect("Time went backwards")
                    .as_secs();
                if epoch > *expiration {
                    debug!(%key.registry, %key.scope, %expiration, miss=false, expired=true, "fetching token");
                    None
                } else {
                    debug!(%key.registry, %key.scope, %expiration, miss=false, expired=false, "fetching token");
                    Some(token.clone())
                }
            }
            None => {
                debug!(%key.registry, %key.scope, miss = true, "fetching token");
                None
            }
        }
    }

    /// Drops a cached token, forcing the next authorize to fetch a fresh one.
    pub(crate) async fn invalidate(&self, registry: &str, scope: &str) {
        self.tokens.write().await.remove(&TokenCacheKey {
            registry: registry.to_string(),
            scope: scope.to_string(),
        });
    }
}

fn parse_expiration_from_jwt(token_str: &str, default_expiration_secs: usize) -> Option<u64> {
    match decode_jwt_claims(token_str) {
        Some(claims) => {
            let token_exp = match claims.exp {
                Some(exp) => exp,
                None => {
                    // The token doesn't have a claim that states a value
                    // for the expiration. We assume it has a 60 seconds
                    // validity as indicated here:
                    // https://docs.docker.com/reference/api/registry/auth/#token-response-fields
                    // > (Optional) The duration in seconds since the token was issued
                    // > that it will remain valid. When omitted, this defaults to 60 seconds.
                    let now = SystemTime::now();
                    let epoch = now
                        .duration_since(UNIX_EPOCH)
                        .expect("Time went backwards")
                        .as_secs();
                    let expiration = epoch + default_expiration_secs as u64;
                    debug!(
                        "Cannot extract expiration from token's claims, assuming a {} seconds validity",
                        default_expiration_secs
                    );
                    expiration
                }
            };

            Some(token_exp)
        }
        None => {
            warn!("Invalid bearer token");
            None
        }
    }
}

// The claims are read without signature verification: the registry, not the
// client, is the party that must trust the token. Only the expiry matters
// here, and a garbled token simply goes uncached.
fn decode_jwt_claims(token_str: &str) -> Option<BearerTokenClaims> {
    let mut parts = token_str.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    parts.next()?;
    let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&payload).ok()
}
