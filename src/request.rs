//! Registry request construction and the retry/auth engine
//!
//! Every request runs through a small state machine: authorize, send,
//! classify the response, and replay when the classification calls for it.
//! Authorization retries and transient retries are tracked separately: an
//! auth retry should succeed exactly once, a transient retry is bounded by
//! the overall attempt budget.

use std::sync::Arc;

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, LOCATION,
    RANGE,
};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::auth::{ResponseInfo, TokenScope};
use crate::errors::{unexpected_response, ResolveError, Result};
use crate::host::RegistryHost;
use crate::transport::HttpFallback;

// Attempt budget: one initial request plus up to five replays.
const MAX_RETRIES: usize = 5;
// Authorization is re-applied on every redirect target, since a redirected
// URL may cross security domains.
const MAX_REDIRECTS: usize = 10;

/// Body producer for retryable requests. A plain stream would be consumed
/// by the first attempt; the factory lets auth and fallback retries rebuild
/// the body without buffering it.
pub(crate) type BodyFactory = Arc<dyn Fn() -> reqwest::Body + Send + Sync>;

pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) header: HeaderMap,
    pub(crate) host: RegistryHost,
    pub(crate) client: HttpFallback,
    pub(crate) scope: Option<TokenScope>,
    pub(crate) body: Option<BodyFactory>,
    pub(crate) size: Option<u64>,
}

impl Request {
    pub(crate) fn url_string(&self) -> String {
        format!("{}://{}{}", self.host.scheme, self.host.host, self.path)
    }

    fn url(&self) -> Result<Url> {
        let raw = self.url_string();
        Url::parse(&raw).map_err(|source| ResolveError::InvalidUrl { url: raw, source })
    }

    /// Appends `ns=<namespace>` when the bound host proxies for a foreign
    /// namespace, preserving any query string already present.
    pub(crate) fn add_namespace(&mut self, namespace: &str) {
        if !self.host.is_proxy(namespace) {
            return;
        }
        let (path, existing) = match self.path.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (self.path.clone(), None),
        };
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(existing) = existing {
            for (key, value) in url::form_urlencoded::parse(existing.as_bytes()) {
                query.append_pair(&key, &value);
            }
        }
        query.append_pair("ns", namespace);
        self.path = format!("{}?{}", path, query.finish());
    }

    /// Narrows the `Accept` header to a media type, keeping `*/*` as a tail
    pub(crate) fn set_media_type(&mut self, media_type: &str) {
        let value = if media_type.is_empty() {
            "*/*".to_string()
        } else {
            format!("{}, */*", media_type)
        };
        self.header.insert(
            ACCEPT,
            HeaderValue::from_str(&value).expect("media types are valid header values"),
        );
    }

    /// Requests the body starting at `offset`
    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.header.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={}-", offset))
                .expect("range is a valid header value"),
        );
    }

    async fn authorize(&self, req: &mut reqwest::Request) -> Result<()> {
        if let Some(authorizer) = &self.host.authorizer {
            authorizer.authorize(req, self.scope.as_ref()).await?;
        }
        Ok(())
    }

    // One wire exchange, following redirects itself so the authorizer runs
    // against every target. Returns the response together with the
    // Authorization header value the final hop was sent with.
    async fn roundtrip(&self) -> Result<(reqwest::Response, Option<String>)> {
        let mut url = self.url()?;
        let mut method = self.method.clone();
        let mut with_body = self.body.is_some();

        for _ in 0..=MAX_REDIRECTS {
            let mut req = reqwest::Request::new(method.clone(), url.clone());
            *req.headers_mut() = self.header.clone();
            if with_body {
                if let Some(factory) = &self.body {
                    *req.body_mut() = Some(factory());
                    if let Some(size) = self.size {
                        req.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(size));
                    }
                }
            }
            self.authorize(&mut req).await?;
            let authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from);

            debug!(method = %method, url = %url, "do request");
            let resp = self.client.execute(req, self.body.as_ref()).await?;
            debug!(status = %resp.status(), url = %resp.url(), "fetch response received");

            if !resp.status().is_redirection() {
                return Ok((resp, authorization));
            }
            let Some(location) = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
            else {
                // a redirect without a target is handed to the caller's
                // status classification
                return Ok((resp, authorization));
            };
            let status = resp.status();
            url = resp.url().join(&location).map_err(|source| {
                ResolveError::InvalidUrl {
                    url: location,
                    source,
                }
            })?;
            // 303, and 301/302 for non-idempotent methods, demote to GET
            if status == StatusCode::SEE_OTHER
                || ((status == StatusCode::MOVED_PERMANENTLY
                    || status == StatusCode::FOUND)
                    && method != Method::GET
                    && method != Method::HEAD)
            {
                method = Method::GET;
                with_body = false;
            }
        }

        Err(ResolveError::TooManyRedirects(MAX_REDIRECTS))
    }

    /// Runs the retry/auth state machine, returning the first terminal
    /// response. `last_host` loosens the 5xx rule: a struggling registry
    /// gets one more chance when no other host remains.
    pub(crate) async fn do_with_retries(
        &mut self,
        last_host: bool,
        checks: &[Check],
    ) -> Result<reqwest::Response> {
        let mut responses: Vec<ResponseInfo> = Vec::new();
        let resp = loop {
            let (resp, authorization) = self.roundtrip().await?;
            responses.push(ResponseInfo {
                url: resp.url().clone(),
                status: resp.status(),
                headers: resp.headers().clone(),
                authorization,
            });
            if self.retry_request(&responses, last_host).await? {
                // the previous response body is closed before the replay
                drop(resp);
                continue;
            }
            break resp;
        };

        for check in checks {
            check.apply(self, &resp)?;
        }
        Ok(resp)
    }

    async fn retry_request(
        &mut self,
        responses: &[ResponseInfo],
        last_host: bool,
    ) -> Result<bool> {
        if responses.len() > MAX_RETRIES {
            return Ok(false);
        }
        let Some(last) = responses.last() else {
            return Ok(false);
        };

        match StatusClass::from(last.status) {
            StatusClass::Unauthorized => {
                debug!(
                    header = ?last.headers.get("WWW-Authenticate"),
                    "unauthorized"
                );
                if let Some(authorizer) = &self.host.authorizer {
                    match authorizer.add_responses(responses, self.scope.as_ref()).await {
                        Ok(()) => return Ok(true),
                        Err(err) if err.is_not_implemented() => return Ok(false),
                        Err(err) => return Err(err),
                    }
                }
                Ok(false)
            }
            StatusClass::MethodNotAllowed => {
                // registries which have not properly implemented HEAD for
                // the manifests endpoint
                if self.method == Method::HEAD && self.path.contains("/manifests/") {
                    self.method = Method::GET;
                    return Ok(true);
                }
                Ok(false)
            }
            StatusClass::Transient => Ok(true),
            StatusClass::ServerError => {
                // do not retry if the same error was seen in the last request
                if responses.len() > 1
                    && responses[responses.len() - 2].status == last.status
                {
                    return Ok(false);
                }
                Ok(last_host)
            }
            StatusClass::Terminal => Ok(false),
        }
    }
}

// Classification of a response status within the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Unauthorized,
    MethodNotAllowed,
    Transient,
    ServerError,
    Terminal,
}

impl From<StatusCode> for StatusClass {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => StatusClass::Unauthorized,
            StatusCode::METHOD_NOT_ALLOWED => StatusClass::MethodNotAllowed,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                StatusClass::Transient
            }
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => StatusClass::ServerError,
            _ => StatusClass::Terminal,
        }
    }
}

/// Post-checks applied to a terminal response
pub(crate) enum Check {
    /// Fail on any status above 299: 404 becomes not-found, the rest an
    /// unexpected status
    Status,
    /// Verify that a requested byte range was honored. When the server
    /// ignored the range, [`ResolveError::ContentRangeIgnored`] is returned
    /// and the caller falls back to a sequential read.
    Offset(u64),
}

impl Check {
    fn apply(&self, req: &Request, resp: &reqwest::Response) -> Result<()> {
        match self {
            Check::Status => {
                let status = resp.status();
                if status.as_u16() > 299 {
                    if status == StatusCode::NOT_FOUND {
                        return Err(ResolveError::NotFound(format!(
                            "content at {}",
                            req.url_string()
                        )));
                    }
                    return Err(unexpected_response(resp));
                }
                Ok(())
            }
            Check::Offset(offset) => {
                if *offset == 0 {
                    return Ok(());
                }
                if resp.status() == StatusCode::PARTIAL_CONTENT {
                    return Ok(());
                }
                if let Some(range) = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                {
                    if !range.starts_with(&format!("bytes {}-", offset)) {
                        return Err(ResolveError::ContentRangeMismatch(range.to_string()));
                    }
                    return Ok(());
                }
                // full content served; concurrent fetches are off the table
                Err(ResolveError::ContentRangeIgnored)
            }
        }
    }
}

/// Joins the host prefix, repository and trailing segments into a request
/// path. A trailing `/` in the final segment is preserved.
pub(crate) fn join_path(prefix: &str, repository: &str, segments: &[String]) -> String {
    let trailing = segments
        .last()
        .map(|s| s.as_str())
        .or(Some(repository))
        .is_some_and(|s| s.ends_with('/'));

    let mut parts: Vec<&str> = vec![prefix, repository];
    parts.extend(segments.iter().map(|s| s.as_str()));
    let joined = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    let mut path = format!("/{}", joined);
    if trailing && !path.ends_with('/') {
        path.push('/');
    }
    path
}
