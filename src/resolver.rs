//! Resolve orchestration
//!
//! Turns an image reference into a verified content descriptor by probing
//! an ordered chain of registry hosts. Failures along the way are ranked,
//! and the error created furthest through the pipeline is the one returned.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::auth::TokenScope;
use crate::digest::{digest_header_value, validate_digest, Digester};
use crate::errors::{
    unexpected_response, ResolveError, Result, PRIORITY_NOT_FOUND, PRIORITY_SIZE_LIMIT,
    PRIORITY_TRANSPORT, PRIORITY_UNEXPECTED_STATUS,
};
use crate::fetcher::RegistryFetcher;
use crate::host::{HostCapabilities, RegistryHost, RegistryHosts};
use crate::media_types::{
    is_schema1, IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE, SCHEMA1_SIGNED_MANIFEST_MEDIA_TYPE,
};
use crate::pusher::RegistryPusher;
use crate::reference::Reference;
use crate::request::{join_path, Request};
use crate::tracker::{MemoryTracker, StatusTracker};
use crate::transport::HttpFallback;

/// The largest manifest size accepted from a registry during resolution.
/// Larger manifests may be accepted using a resolution method other than
/// the registry.
///
/// NOTE: The max supported layers by some runtimes is 128 and individual
/// layers will not contribute more than 256 bytes, making a reasonable
/// limit for a large image manifest of 32K bytes. 4M bytes represents a
/// much larger upper bound for images which may contain large annotations
/// or be non-images. A proper manifest design puts large metadata in
/// subobjects.
pub const MAX_MANIFEST_SIZE: i64 = 4 * 1024 * 1024;

const MIME_TYPES_DISTRIBUTION_MANIFEST: &[&str] = &[
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
];

/// A content descriptor: the digest-addressed identity of a manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Content digest
    pub digest: String,
    /// Size in bytes
    pub size: i64,
}

/// Options used to configure a new [`Resolver`]
#[derive(Default)]
pub struct ResolverOptions {
    /// Registry host configurations per namespace. Defaults to a single
    /// https endpoint per namespace with localhost served over http.
    pub hosts: Option<Arc<dyn RegistryHosts>>,
    /// Request headers sent by the resolver. An `Accept` entry here
    /// replaces the default manifest media type list.
    pub headers: Option<HeaderMap>,
    /// Upload status tracker handed to pushers
    pub tracker: Option<Arc<dyn StatusTracker>>,
    /// HTTP client used when a host carries no override. Automatic
    /// redirects should be disabled on it; the resolver follows redirects
    /// itself so that the authorizer runs against every target.
    pub client: Option<reqwest::Client>,
}

/// Performance settings attached via [`Resolver::set_options`]
pub enum ResolverOption {
    /// Weighted semaphore shared by downstream blob transfers, with weight
    /// taken as a byte count
    DownloadLimiter(Arc<Semaphore>),
    /// Concurrency hint for layer downloads
    MaxConcurrentDownloads(usize),
}

#[derive(Clone, Default)]
struct PerformanceSettings {
    download_limiter: Option<Arc<Semaphore>>,
    max_concurrent_downloads: Option<usize>,
}

/// Resolves image references against configured registry hosts
///
/// A resolver is cheap to share; resolutions may run concurrently. Each
/// resolution walks its `(path, host)` pairs sequentially so that the
/// error ranking and failover order stay meaningful.
pub struct Resolver {
    hosts: Arc<dyn RegistryHosts>,
    header: HeaderMap,
    resolve_header: HeaderMap,
    tracker: Arc<dyn StatusTracker>,
    client: HttpFallback,
    performance: PerformanceSettings,
}

impl Resolver {
    /// Creates a resolver from the given options
    pub fn new(options: ResolverOptions) -> Self {
        let mut header = options.headers.unwrap_or_default();

        let mut resolve_header = HeaderMap::new();
        match header.remove(ACCEPT) {
            Some(accept) => {
                resolve_header.insert(ACCEPT, accept);
            }
            None => {
                let mut accept: Vec<&str> = MIME_TYPES_DISTRIBUTION_MANIFEST.to_vec();
                accept.push("*/*");
                resolve_header.insert(
                    ACCEPT,
                    HeaderValue::from_str(&accept.join(", "))
                        .expect("media types are valid header values"),
                );
            }
        }

        let hosts = options.hosts.unwrap_or_else(|| {
            Arc::new(crate::host::default_registry_hosts(None, true))
        });
        let tracker = options
            .tracker
            .unwrap_or_else(|| Arc::new(MemoryTracker::default()));
        let client = HttpFallback::new(options.client.unwrap_or_else(default_client));

        Resolver {
            hosts,
            header,
            resolve_header,
            tracker,
            client,
            performance: PerformanceSettings::default(),
        }
    }

    /// Attaches performance settings. Must be called before handing out
    /// fetchers or pushers that should observe them.
    pub fn set_options(&mut self, options: impl IntoIterator<Item = ResolverOption>) {
        for option in options {
            match option {
                ResolverOption::DownloadLimiter(limiter) => {
                    self.performance.download_limiter = Some(limiter);
                }
                ResolverOption::MaxConcurrentDownloads(n) => {
                    self.performance.max_concurrent_downloads = Some(n);
                }
            }
        }
    }

    /// Resolves a reference to its canonical name and content descriptor
    pub async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let base = self.base(reference)?;

        if base.refspec.object().is_empty() {
            return Err(ResolveError::ObjectRequired);
        }

        let mut paths: Vec<Vec<String>> = Vec::new();
        let digest = base.refspec.digest().map(str::to_string);
        let mut caps = HostCapabilities::PULL;

        if let Some(digest) = &digest {
            // fail here, an invalid digest can never resolve
            validate_digest(digest)?;
            paths.push(vec!["manifests".to_string(), digest.clone()]);
            // fallback to blobs on not found
            paths.push(vec!["blobs".to_string(), digest.clone()]);
        } else {
            paths.push(vec![
                "manifests".to_string(),
                base.refspec.object().to_string(),
            ]);
            caps |= HostCapabilities::RESOLVE;
        }

        let hosts = base.filter_hosts(caps);
        if hosts.is_empty() {
            return Err(ResolveError::NotFound("no resolve hosts".to_string()));
        }

        // The most relevant error seen across all attempts; replaced only
        // by an error of strictly higher priority.
        let mut first_err: Option<(u8, ResolveError)> = None;
        fn record(first_err: &mut Option<(u8, ResolveError)>, priority: u8, err: ResolveError) {
            if first_err.as_ref().map_or(0, |(p, _)| *p) < priority {
                *first_err = Some((priority, err));
            }
        }

        for segments in &paths {
            for (i, host) in hosts.iter().enumerate() {
                let last_host = i == hosts.len() - 1;
                let next_or_fail = if last_host {
                    "fetch failed"
                } else {
                    "trying next host"
                };
                let base = base.with_rewrites_from_host(host);

                let mut req = base.request(host, Method::HEAD, segments);
                req.scope = Some(TokenScope::pull(base.repository.clone()));
                req.add_namespace(base.refspec.hostname());
                for (key, value) in self.resolve_header.iter() {
                    req.header.append(key, value.clone());
                }

                debug!(host = %host.host, "resolving");
                let resp = match req.do_with_retries(last_host, &[]).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        let err = if err.is_unauthorized() {
                            ResolveError::Denied {
                                source: Box::new(err),
                            }
                        } else {
                            err
                        };
                        info!(host = %host.host, error = %err, "{}", next_or_fail);
                        record(&mut first_err, PRIORITY_TRANSPORT, err);
                        continue; // try another host
                    }
                };

                let status = resp.status();
                if status.as_u16() > 299 {
                    if status == StatusCode::NOT_FOUND {
                        info!(host = %host.host, %status, "{}", next_or_fail);
                        record(
                            &mut first_err,
                            PRIORITY_NOT_FOUND,
                            ResolveError::NotFound(reference.to_string()),
                        );
                        continue;
                    }
                    if status.as_u16() > 399 {
                        info!(host = %host.host, %status, "{}", next_or_fail);
                        record(
                            &mut first_err,
                            PRIORITY_UNEXPECTED_STATUS,
                            unexpected_response(&resp),
                        );
                        continue; // try another host
                    }
                    // unfollowed redirects do not belong at this layer
                    return Err(unexpected_response(&resp));
                }

                let size = content_length(&resp);
                let mut content_type = manifest_media_type(&resp);
                if is_schema1(&content_type) {
                    return Err(schema1_unsupported(&content_type));
                }

                // If the reference carried no digest, only a resolve-capable
                // registry was contacted; the digest header is the only
                // point at which the registry is trusted.
                let mut digest = digest.clone();
                if digest.is_none() {
                    if let Some(header_digest) = digest_header_value(resp.headers())? {
                        if size != -1 {
                            validate_digest(&header_digest)?;
                            digest = Some(header_digest);
                        }
                    }
                }

                let (digest, size) = match (digest, size) {
                    (Some(digest), size) if size != -1 => (digest, size),
                    (known, _) => {
                        debug!("no Docker-Content-Digest header, fetching manifest instead");
                        let mut req = base.request(host, Method::GET, segments);
                        req.scope = Some(TokenScope::pull(base.repository.clone()));
                        req.add_namespace(base.refspec.hostname());
                        for (key, value) in self.resolve_header.iter() {
                            req.header.append(key, value.clone());
                        }

                        let resp = req.do_with_retries(true, &[]).await?;
                        content_type = manifest_media_type(&resp);
                        if is_schema1(&content_type) {
                            return Err(schema1_unsupported(&content_type));
                        }

                        // When the digest is already known the body is only
                        // counted; otherwise it is hashed as it streams.
                        // The read is bounded: anything past the ceiling is
                        // oversized no matter what Content-Length claimed.
                        let mut digester = known.is_none().then(Digester::sha256);
                        let mut count: i64 = 0;
                        let mut stream = resp.bytes_stream();
                        while let Some(chunk) = stream.next().await {
                            let chunk = chunk.map_err(ResolveError::Transport)?;
                            count += chunk.len() as i64;
                            if count > MAX_MANIFEST_SIZE {
                                break;
                            }
                            if let Some(digester) = digester.as_mut() {
                                digester.update(&chunk);
                            }
                        }
                        let digest = match known {
                            Some(digest) => digest,
                            None => digester
                                .as_mut()
                                .map(Digester::finalize)
                                .unwrap_or_default(),
                        };
                        (digest, count)
                    }
                };

                // prevent resolving to excessively large manifests
                if size > MAX_MANIFEST_SIZE {
                    record(
                        &mut first_err,
                        PRIORITY_SIZE_LIMIT,
                        ResolveError::NotFound(format!(
                            "rejecting {} byte manifest for {}",
                            size, reference
                        )),
                    );
                    continue;
                }

                let desc = Descriptor {
                    media_type: content_type,
                    digest,
                    size,
                };
                debug!(digest = %desc.digest, "resolved");
                return Ok((reference.to_string(), desc));
            }
        }

        Err(match first_err {
            Some((_, err)) => err,
            // the loop ran dry without recording anything
            None => ResolveError::NotFound(reference.to_string()),
        })
    }

    /// Returns a fetch handle bound to the resolved base for the reference.
    /// No network I/O happens here.
    pub fn fetcher(&self, reference: &str) -> Result<RegistryFetcher> {
        Ok(RegistryFetcher::new(self.base(reference)?))
    }

    /// Returns a push handle bound to the resolved base for the reference.
    /// No network I/O happens here.
    pub fn pusher(&self, reference: &str) -> Result<RegistryPusher> {
        let base = self.base(reference)?;
        let object = base.refspec.object().to_string();
        Ok(RegistryPusher::new(base, object, self.tracker.clone()))
    }

    fn base(&self, reference: &str) -> Result<DockerBase> {
        let refspec = Reference::parse(reference)?;
        let hosts = self.hosts.hosts(refspec.hostname())?;
        Ok(DockerBase {
            repository: refspec.repository().to_string(),
            refspec,
            hosts,
            header: self.header.clone(),
            client: self.client.clone(),
            limiter: self.performance.download_limiter.clone(),
            max_concurrent_downloads: self.performance.max_concurrent_downloads,
        })
    }
}

/// Per-resolution binding of a reference to its host chain
#[derive(Clone)]
pub(crate) struct DockerBase {
    pub(crate) refspec: Reference,
    pub(crate) repository: String,
    pub(crate) hosts: Vec<RegistryHost>,
    pub(crate) header: HeaderMap,
    pub(crate) client: HttpFallback,
    pub(crate) limiter: Option<Arc<Semaphore>>,
    pub(crate) max_concurrent_downloads: Option<usize>,
}

impl DockerBase {
    pub(crate) fn filter_hosts(&self, caps: HostCapabilities) -> Vec<RegistryHost> {
        self.hosts
            .iter()
            .filter(|host| host.capabilities.contains(caps))
            .cloned()
            .collect()
    }

    /// Applies the host's repository rewrites; the first pattern that
    /// changes the repository wins. A pattern that fails to compile is
    /// logged and skipped.
    pub(crate) fn with_rewrites_from_host(&self, host: &RegistryHost) -> DockerBase {
        for (pattern, replace) in &host.rewrites {
            let exp = match regex::Regex::new(pattern) {
                Ok(exp) => exp,
                Err(err) => {
                    warn!(%pattern, host = %host.host, error = %err, "failed to compile rewrite");
                    continue;
                }
            };
            let rewritten = exp.replace_all(&self.repository, replace.as_str());
            if rewritten != self.repository {
                debug!(refspec = %self.refspec, from = %self.repository, to = %rewritten, "rewrote repository");
                let repository = rewritten.into_owned();
                return DockerBase {
                    refspec: self.refspec.with_repository(&repository),
                    repository,
                    ..self.clone()
                };
            }
        }
        self.clone()
    }

    pub(crate) fn request(
        &self,
        host: &RegistryHost,
        method: Method,
        segments: &[String],
    ) -> Request {
        // headers are cloned to avoid aliasing mutations across concurrent
        // operations
        let mut header = self.header.clone();
        for (key, value) in host.header.iter() {
            header.append(key, value.clone());
        }
        if !header.contains_key(USER_AGENT) {
            header.insert(
                USER_AGENT,
                HeaderValue::from_static(concat!("oci-resolver/", env!("CARGO_PKG_VERSION"))),
            );
        }

        Request {
            method,
            path: join_path(&host.path, &self.repository, segments),
            header,
            host: host.clone(),
            client: host.client.clone().unwrap_or_else(|| self.client.clone()),
            scope: None,
            body: None,
            size: None,
        }
    }

    /// Takes `weight` units from the shared download limiter, if one is
    /// configured. The permit releases on drop, including cancellation.
    pub(crate) async fn acquire(&self, weight: u32) -> Option<OwnedSemaphorePermit> {
        match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .acquire_many_owned(weight)
                    .await
                    .expect("download limiter is never closed"),
            ),
            None => None,
        }
    }
}

fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .unwrap_or_else(|err| {
            warn!(error = %err, "cannot build resolver HTTP client, using defaults");
            reqwest::Client::new()
        })
}

// resp.ContentLength semantics: the header value, or -1 when absent or
// unparseable.
fn content_length(resp: &reqwest::Response) -> i64 {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(-1)
}

fn manifest_media_type(resp: &reqwest::Response) -> String {
    // strip encoding data (manifests should always be ascii JSON)
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let content_type = match content_type.find(';') {
        Some(i) => &content_type[..i],
        None => content_type,
    };

    // registry.access.redhat.com did not specify a content type for its
    // schema 1 manifests, serving them as text/plain
    if content_type == "text/plain" {
        SCHEMA1_SIGNED_MANIFEST_MEDIA_TYPE.to_string()
    } else {
        content_type.to_string()
    }
}

fn schema1_unsupported(media_type: &str) -> ResolveError {
    ResolveError::NotImplemented(format!(
        "media type {:?} is no longer supported, please rebuild the image as {:?} or {:?}",
        media_type, IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE
    ))
}
