//! Wire-level tests for the fetch handle

use std::sync::Arc;

use futures_util::TryStreamExt;
use oci_resolver::digest::sha256_digest;
use oci_resolver::media_types::OCI_IMAGE_MEDIA_TYPE;
use oci_resolver::{Descriptor, RegistryHost, Resolver, ResolverOptions, Result, SizedStream};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BLOB: &[u8] = b"0123456789abcdef";

fn authority(server: &MockServer) -> String {
    format!("127.0.0.1:{}", server.address().port())
}

fn plain_host(authority: &str) -> RegistryHost {
    let mut host = RegistryHost::new(authority);
    host.scheme = "http".to_string();
    host
}

fn resolver_for(hosts: Vec<RegistryHost>) -> Resolver {
    Resolver::new(ResolverOptions {
        hosts: Some(Arc::new(move |_ns: &str| -> Result<Vec<RegistryHost>> {
            Ok(hosts.clone())
        })),
        ..Default::default()
    })
}

fn blob_descriptor() -> Descriptor {
    Descriptor {
        media_type: "application/octet-stream".to_string(),
        digest: sha256_digest(BLOB),
        size: BLOB.len() as i64,
    }
}

async fn collect(stream: SizedStream) -> anyhow::Result<Vec<u8>> {
    let chunks: Vec<bytes::Bytes> = stream.stream.try_collect().await?;
    Ok(chunks.concat())
}

#[tokio::test]
async fn fetches_blob_from_start() -> anyhow::Result<()> {
    let desc = blob_descriptor();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{}", desc.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BLOB))
        .mount(&server)
        .await;

    let resolver = resolver_for(vec![plain_host(&authority(&server))]);
    let fetcher = resolver.fetcher("example.com/app:v1")?;
    let stream = fetcher.open(&desc, 0).await?;
    assert_eq!(stream.content_length, Some(BLOB.len() as u64));
    assert_eq!(collect(stream).await?, BLOB);
    Ok(())
}

#[tokio::test]
async fn honored_range_is_served_as_is() -> anyhow::Result<()> {
    let desc = blob_descriptor();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{}", desc.digest)))
        .and(header("range", "bytes=10-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(&BLOB[10..])
                .insert_header("Content-Range", "bytes 10-15/16"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resolver = resolver_for(vec![plain_host(&authority(&server))]);
    let fetcher = resolver.fetcher("example.com/app:v1")?;
    let stream = fetcher.open(&desc, 10).await?;
    assert_eq!(collect(stream).await?, &BLOB[10..]);
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn ignored_range_falls_back_to_sequential_read() -> anyhow::Result<()> {
    let desc = blob_descriptor();
    let server = MockServer::start().await;
    // the server pays no attention to Range and always serves everything
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{}", desc.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BLOB))
        .expect(2)
        .mount(&server)
        .await;

    let resolver = resolver_for(vec![plain_host(&authority(&server))]);
    let fetcher = resolver.fetcher("example.com/app:v1")?;
    let stream = fetcher.open(&desc, 10).await?;
    // the prefix the caller already has must not be replayed
    assert_eq!(collect(stream).await?, &BLOB[10..]);
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn manifest_media_types_use_the_manifests_endpoint() -> anyhow::Result<()> {
    let manifest = br#"{"schemaVersion":2}"#;
    let desc = Descriptor {
        media_type: OCI_IMAGE_MEDIA_TYPE.to_string(),
        digest: sha256_digest(manifest),
        size: manifest.len() as i64,
    };
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/manifests/{}", desc.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.as_slice()))
        .mount(&server)
        .await;

    let resolver = resolver_for(vec![plain_host(&authority(&server))]);
    let fetcher = resolver.fetcher("example.com/app:v1")?;
    let stream = fetcher.open(&desc, 0).await?;
    assert_eq!(collect(stream).await?, manifest);
    Ok(())
}

#[tokio::test]
async fn fetch_fails_over_to_later_hosts() -> anyhow::Result<()> {
    let desc = blob_descriptor();
    let h1 = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h1)
        .await;
    let h2 = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/app/blobs/{}", desc.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BLOB))
        .mount(&h2)
        .await;

    let resolver = resolver_for(vec![
        plain_host(&authority(&h1)),
        plain_host(&authority(&h2)),
    ]);
    let fetcher = resolver.fetcher("example.com/app:v1")?;
    let stream = fetcher.open(&desc, 0).await?;
    assert_eq!(collect(stream).await?, BLOB);
    Ok(())
}
