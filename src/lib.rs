//! A resolution core for OCI and Docker image registries
//!
//! Given a human-readable image reference such as
//! `docker.io/library/alpine:latest`, the [`Resolver`] locates an
//! authoritative endpoint among a configured chain of registry hosts,
//! negotiates authentication, and returns a cryptographically identified
//! [`Descriptor`] for the referenced manifest.
//!
//! Resolution tolerates the protocol quirks real registries exhibit:
//! endpoints that reject HEAD, misreport content types, omit digest
//! headers, answer a TLS handshake with plain HTTP, or ignore byte ranges.
//! When the registry supplies no verified digest, the client computes one
//! from the response body while enforcing a size ceiling.
#![deny(missing_docs)]

pub mod auth;
pub mod digest;
pub mod errors;
mod fetcher;
mod host;
pub mod media_types;
mod pusher;
mod reference;
mod request;
mod resolver;
mod token_cache;
mod tracker;
mod transport;

#[doc(inline)]
pub use auth::{
    Authorizer, Credentials, CredentialsFn, RegistryAuthorizer, ResponseInfo, TokenScope,
};
#[doc(inline)]
pub use errors::{ResolveError, Result};
#[doc(inline)]
pub use fetcher::{RegistryFetcher, SizedStream};
#[doc(inline)]
pub use host::{
    default_registry_hosts, is_localhost, HostCapabilities, RegistryHost, RegistryHosts,
};
#[doc(inline)]
pub use pusher::RegistryPusher;
#[doc(inline)]
pub use reference::{default_host, ParseError, Reference};
#[doc(inline)]
pub use resolver::{Descriptor, Resolver, ResolverOption, ResolverOptions, MAX_MANIFEST_SIZE};
#[doc(inline)]
pub use tracker::{MemoryTracker, Status, StatusTracker};
#[doc(inline)]
pub use transport::HttpFallback;
