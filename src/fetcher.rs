//! Fetch capability bound to a resolved base

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{future, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_LENGTH;
use reqwest::Method;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info};

use crate::auth::TokenScope;
use crate::errors::{ResolveError, Result};
use crate::host::HostCapabilities;
use crate::media_types::is_manifest_type;
use crate::reference::Reference;
use crate::request::Check;
use crate::resolver::{Descriptor, DockerBase};

/// Stream of content bytes with the length advertised by the registry
pub struct SizedStream {
    /// Value of the `Content-Length` response header, when one was sent
    pub content_length: Option<u64>,
    /// The stream of bytes
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

/// A fetch handle for a resolved reference
///
/// Construction performs no network I/O; the handle binds the reference's
/// host chain, merged headers and the resolver's shared download limiter.
pub struct RegistryFetcher {
    base: DockerBase,
}

impl RegistryFetcher {
    pub(crate) fn new(base: DockerBase) -> Self {
        RegistryFetcher { base }
    }

    /// The reference this fetcher is bound to
    pub fn reference(&self) -> &Reference {
        &self.base.refspec
    }

    /// Takes `weight` bytes worth of the shared download budget. Returns
    /// `None` when no limiter is configured. The permit releases on drop,
    /// including on cancellation.
    pub async fn acquire(&self, weight: u32) -> Option<OwnedSemaphorePermit> {
        self.base.acquire(weight).await
    }

    /// Concurrency hint for layer downloads, when one was configured
    pub fn max_concurrent_downloads(&self) -> Option<usize> {
        self.base.max_concurrent_downloads
    }

    /// Opens a byte stream for the described content, starting at `offset`.
    ///
    /// Manifest media types are served from the `manifests/` endpoint,
    /// everything else from `blobs/`. A registry that ignores the requested
    /// range is tolerated: the missing prefix is discarded and the stream
    /// continues from `offset`.
    pub async fn open(&self, desc: &Descriptor, offset: u64) -> Result<SizedStream> {
        let hosts = self.base.filter_hosts(HostCapabilities::PULL);
        if hosts.is_empty() {
            return Err(ResolveError::NotFound("no pull hosts".to_string()));
        }

        let kind = if is_manifest_type(&desc.media_type) {
            "manifests"
        } else {
            "blobs"
        };
        let segments = vec![kind.to_string(), desc.digest.clone()];

        let mut first_err: Option<ResolveError> = None;
        for (i, host) in hosts.iter().enumerate() {
            let last_host = i == hosts.len() - 1;
            let mut req = self.base.request(host, Method::GET, &segments);
            req.scope = Some(TokenScope::pull(self.base.repository.clone()));
            req.add_namespace(self.base.refspec.hostname());
            req.set_media_type(&desc.media_type);
            if offset > 0 {
                req.set_offset(offset);
            }

            debug!(host = %host.host, digest = %desc.digest, offset, "fetching");
            match req
                .do_with_retries(last_host, &[Check::Status, Check::Offset(offset)])
                .await
            {
                Ok(resp) => return Ok(into_stream(resp, 0)),
                Err(ResolveError::ContentRangeIgnored) => {
                    // ranged reads are off the table for this content; take
                    // the full body and skip up to the offset
                    debug!(host = %host.host, "content range ignored, reading sequentially");
                    let mut req = self.base.request(host, Method::GET, &segments);
                    req.scope = Some(TokenScope::pull(self.base.repository.clone()));
                    req.add_namespace(self.base.refspec.hostname());
                    req.set_media_type(&desc.media_type);
                    let resp = req.do_with_retries(true, &[Check::Status]).await?;
                    return Ok(into_stream(resp, offset));
                }
                Err(err) => {
                    info!(host = %host.host, error = %err, "failed to fetch");
                    first_err.get_or_insert(err);
                }
            }
        }

        Err(first_err
            .unwrap_or_else(|| ResolveError::NotFound(self.base.refspec.to_string())))
    }
}

fn into_stream(resp: reqwest::Response, skip: u64) -> SizedStream {
    let content_length = resp
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let mut remaining = skip;
    let stream = resp
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        .filter_map(move |result| {
            let item = match result {
                Ok(mut bytes) => {
                    if remaining >= bytes.len() as u64 {
                        remaining -= bytes.len() as u64;
                        None
                    } else {
                        let tail = bytes.split_off(remaining as usize);
                        remaining = 0;
                        Some(Ok(tail))
                    }
                }
                Err(err) => Some(Err(err)),
            };
            future::ready(item)
        })
        .boxed();

    SizedStream {
        content_length,
        stream,
    }
}
