//! Image reference parsing
//!
//! A reference names content in a registry as `host/repository[:tag][@digest]`.
//! Parsing splits it into a *locator* (`host/repository`) and an *object*
//! (the tag, the digest, or both as `tag@digest`).

use std::fmt;
use std::str::FromStr;

/// Errors produced when parsing an image reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The reference is not in a recognized format
    #[error("invalid reference")]
    Invalid,
    /// The reference does not begin with a hostname
    #[error("hostname required")]
    HostnameRequired,
}

/// A parsed image reference
///
/// The object is everything after the first `:` or `@` following the
/// repository; an object beginning with `@` is a digest, anything else is a
/// tag (possibly suffixed with `@digest`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    locator: String,
    object: String,
}

impl Reference {
    /// Parses a reference string into its locator and object
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() || s.starts_with('/') {
            return Err(ParseError::HostnameRequired);
        }

        let (host, rest) = match s.find('/') {
            Some(i) => (&s[..i], &s[i..]),
            None => (s, ""),
        };
        validate_host(host)?;

        let (path, object) = match rest.find([':', '@']) {
            Some(i) => {
                let object = rest[i..].strip_prefix(':').unwrap_or(&rest[i..]);
                if object.is_empty() {
                    return Err(ParseError::Invalid);
                }
                (&rest[..i], object)
            }
            None => (rest, ""),
        };
        if path.ends_with('/') {
            return Err(ParseError::Invalid);
        }

        Ok(Reference {
            locator: format!("{}{}", host, path),
            object: object.to_string(),
        })
    }

    /// The full `host/repository` portion of the reference
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// The tag and/or digest portion, empty when the reference has neither
    pub fn object(&self) -> &str {
        &self.object
    }

    /// The registry hostname (including any port)
    pub fn hostname(&self) -> &str {
        match self.locator.find('/') {
            Some(i) => &self.locator[..i],
            None => &self.locator,
        }
    }

    /// The repository path within the registry
    pub fn repository(&self) -> &str {
        match self.locator.find('/') {
            Some(i) => &self.locator[i + 1..],
            None => "",
        }
    }

    /// The digest portion of the object, if one is present
    pub fn digest(&self) -> Option<&str> {
        match self.object.find('@') {
            Some(i) if i + 1 < self.object.len() => Some(&self.object[i + 1..]),
            _ => None,
        }
    }

    /// Returns a copy of this reference with the repository replaced,
    /// keeping the hostname and object. Used by per-host rewrites.
    pub(crate) fn with_repository(&self, repository: &str) -> Reference {
        Reference {
            locator: format!("{}/{}", self.hostname(), repository),
            object: self.object.clone(),
        }
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.object.is_empty() {
            write!(f, "{}", self.locator)
        } else if self.object.starts_with('@') {
            write!(f, "{}{}", self.locator, self.object)
        } else {
            write!(f, "{}:{}", self.locator, self.object)
        }
    }
}

/// Translates well-known namespace names to their registry endpoints.
/// `docker.io` resolves through `registry-1.docker.io`.
pub fn default_host(namespace: &str) -> &str {
    if namespace == "docker.io" {
        "registry-1.docker.io"
    } else {
        namespace
    }
}

// Hostnames are letters, digits, `.` and `-`, optionally followed by a
// numeric port.
fn validate_host(host: &str) -> Result<(), ParseError> {
    let (name, port) = match host.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return Err(ParseError::Invalid);
    }
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Invalid);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3b";

    #[test]
    fn parse_tag_reference() {
        let r = Reference::parse("docker.io/library/alpine:latest").unwrap();
        assert_eq!(r.locator(), "docker.io/library/alpine");
        assert_eq!(r.object(), "latest");
        assert_eq!(r.hostname(), "docker.io");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parse_digest_reference() {
        let s = format!("example.com/app@{}", DIGEST);
        let r = Reference::parse(&s).unwrap();
        assert_eq!(r.object(), format!("@{}", DIGEST));
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn parse_tag_and_digest() {
        let s = format!("example.com/app:v1@{}", DIGEST);
        let r = Reference::parse(&s).unwrap();
        assert_eq!(r.object(), format!("v1@{}", DIGEST));
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn parse_host_with_port() {
        let r = Reference::parse("localhost:5000/app:v1").unwrap();
        assert_eq!(r.hostname(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.object(), "v1");
    }

    #[test]
    fn parse_without_object() {
        let r = Reference::parse("example.com/app").unwrap();
        assert_eq!(r.object(), "");
        assert_eq!(r.digest(), None);
        assert_eq!(r.to_string(), "example.com/app");
    }

    #[test]
    fn parse_rejects_malformed() {
        for s in [
            "",
            "/app:v1",
            "example.com/app:",
            "example.com/app/:v1",
            "host:notaport/app:v1",
            "ex ample.com/app:v1",
        ] {
            assert!(Reference::parse(s).is_err(), "expected failure for {:?}", s);
        }
    }

    #[test]
    fn display_round_trips() {
        for s in [
            "docker.io/library/alpine:latest",
            "example.com/app",
            "localhost:5000/deep/nested/repo:tag",
        ] {
            assert_eq!(Reference::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn docker_io_translates() {
        assert_eq!(default_host("docker.io"), "registry-1.docker.io");
        assert_eq!(default_host("ghcr.io"), "ghcr.io");
    }

    #[test]
    fn rewrite_keeps_hostname_and_object() {
        let r = Reference::parse("example.com/app:v1").unwrap();
        let rewritten = r.with_repository("mirror/app");
        assert_eq!(rewritten.locator(), "example.com/mirror/app");
        assert_eq!(rewritten.object(), "v1");
    }
}
