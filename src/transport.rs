//! HTTPS to HTTP fallback transport
//!
//! Registry endpoints configured for both http and TLS, such as defaulted
//! localhost endpoints, answer a TLS handshake with plain HTTP. The
//! fallback transport detects that, retries the identical request over
//! http, and remembers the host so later requests take the downgraded
//! scheme directly.

use std::error::Error as StdError;
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::Mutex;
use tracing::debug;

use crate::auth::host_key;
use crate::request::BodyFactory;

/// A `reqwest` client wrapper that downgrades https to http for hosts that
/// turn out to speak plain HTTP. The downgrade is sticky per host; a single
/// slot suffices since one misconfigured host dominates in practice.
#[derive(Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    fallback_host: Arc<Mutex<Option<String>>>,
}

impl HttpFallback {
    /// Wraps the given client
    pub fn new(client: reqwest::Client) -> Self {
        HttpFallback {
            client,
            fallback_host: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn remember(&self, host: &str) {
        let mut fallback = self.fallback_host.lock().await;
        if fallback.as_deref() != Some(host) {
            *fallback = Some(host.to_string());
        }
    }

    pub(crate) async fn execute(
        &self,
        mut req: reqwest::Request,
        body: Option<&BodyFactory>,
    ) -> reqwest::Result<reqwest::Response> {
        let host = host_key(req.url());
        let explicit_port = req.url().port().is_some();

        let fallback = self.fallback_host.lock().await.as_deref() == Some(host.as_str());
        if fallback {
            downgrade(req.url_mut());
            return self.client.execute(req).await;
        }

        // A request with a streaming body cannot be cloned; such requests
        // simply don't participate in the fallback retry.
        let retry = req.try_clone();
        match self.client.execute(req).await {
            Err(err) if is_tls_error(&err) || is_port_error(&err, explicit_port) => {
                let Some(mut retry) = retry else {
                    return Err(err);
                };
                debug!(%host, error = %err, "falling back to http");
                if let Some(factory) = body {
                    *retry.body_mut() = Some(factory());
                }
                downgrade(retry.url_mut());
                self.remember(&host).await;
                self.client.execute(retry).await
            }
            result => result,
        }
    }
}

fn downgrade(url: &mut Url) {
    let _ = url.set_scheme("http");
}

// A plain HTTP server answering a TLS ClientHello surfaces as a corrupt or
// mis-versioned TLS record; the record header of such a response spells
// "HTTP/". Handshake timeouts get the same treatment.
fn is_tls_error(err: &reqwest::Error) -> bool {
    chain_matches(err, |msg| {
        msg.contains("HTTP/")
            || msg.contains("corrupt message")
            || msg.contains("invalid message")
            || msg.contains("wrong version number")
            || msg.contains("handshake timeout")
    })
}

// Connection errors and timeouts only justify a scheme change when the URL
// named no port; an explicit port will not be retried on a different one.
fn is_port_error(err: &reqwest::Error, explicit_port: bool) -> bool {
    (err.is_connect() || err.is_timeout()) && !explicit_port
}

fn chain_matches(err: &(dyn StdError + 'static), pred: impl Fn(&str) -> bool) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        if pred(&err.to_string()) {
            return true;
        }
        current = err.source();
    }
    false
}
