//! Digest parsing, validation and streaming computation

use http::HeaderMap;
use sha2::Digest as _;

/// Response header carrying the registry-computed manifest digest
pub const DOCKER_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Errors that can occur when parsing or validating digests
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Invalid digest header
    #[error("invalid digest header: {0}")]
    InvalidHeader(#[from] http::header::ToStrError),
    /// Invalid digest algorithm found
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Missing digest algorithm
    #[error("missing digest algorithm")]
    MissingAlgorithm,
    /// The encoded portion is not valid for the algorithm
    #[error("invalid digest encoding: {0}")]
    InvalidEncoding(String),
    /// Digest verification failed
    #[error("invalid digest, expected {expected}, got {actual}")]
    VerificationError {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },
}

/// A digest split into its algorithm and encoded portions
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Digest<'a> {
    /// Hash algorithm, e.g. `sha256`
    pub algorithm: &'a str,
    /// Lowercase hex encoding of the hash
    pub encoded: &'a str,
}

impl<'a> Digest<'a> {
    /// Splits a digest string of the form `<algorithm>:<hex>`. This isn't
    /// using `FromStr` because we can't use lifetimes properly when
    /// implementing the trait.
    pub fn new(digest: &'a str) -> Result<Self, DigestError> {
        let (algorithm, encoded) = digest
            .split_once(':')
            .ok_or(DigestError::MissingAlgorithm)?;
        Ok(Self { algorithm, encoded })
    }

    /// Checks that the algorithm is supported and the encoding matches its
    /// expected length and character set
    pub fn validate(&self) -> Result<(), DigestError> {
        let expected_len = match self.algorithm {
            "sha256" => 64,
            "sha384" => 96,
            "sha512" => 128,
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        };
        if self.encoded.len() != expected_len
            || !self
                .encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidEncoding(format!(
                "{}:{}",
                self.algorithm, self.encoded
            )));
        }
        Ok(())
    }
}

/// Parses and validates a digest string in one step
pub fn validate_digest(digest: &str) -> Result<(), DigestError> {
    Digest::new(digest)?.validate()
}

/// Helper wrapper around the digest algorithms accepted from registries.
/// This has to be an enum because the digest algorithms aren't object safe
/// so we can't box dyn them.
pub(crate) enum Digester {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Digester {
    /// The canonical algorithm used when the registry supplies no digest
    pub fn sha256() -> Self {
        Digester::Sha256(sha2::Sha256::new())
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    pub fn finalize(&mut self) -> String {
        match self {
            Self::Sha256(d) => format!("sha256:{:x}", d.finalize_reset()),
            Self::Sha384(d) => format!("sha384:{:x}", d.finalize_reset()),
            Self::Sha512(d) => format!("sha512:{:x}", d.finalize_reset()),
        }
    }
}

/// Computes the sha256 digest string of a byte slice
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}

/// Extracts the `Docker-Content-Digest` header from a manifest response.
/// Returns `None` when the registry did not send one.
pub fn digest_header_value(headers: &HeaderMap) -> Result<Option<String>, DigestError> {
    headers
        .get(DOCKER_DIGEST_HEADER)
        .map(|hv| hv.to_str().map(|s| s.to_string()))
        .transpose()
        .map_err(DigestError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str =
        "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn sha256_digest_is_stable() {
        assert_eq!(sha256_digest(b"hello world"), HELLO_SHA256);
    }

    #[test]
    fn validate_accepts_well_formed() {
        validate_digest(HELLO_SHA256).unwrap();
    }

    #[test]
    fn validate_rejects_malformed() {
        assert!(matches!(
            validate_digest("b94d27b9934d"),
            Err(DigestError::MissingAlgorithm)
        ));
        assert!(matches!(
            validate_digest("md5:d41d8cd98f00b204e9800998ecf8427e"),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
        // truncated
        assert!(matches!(
            validate_digest("sha256:b94d27b9934d"),
            Err(DigestError::InvalidEncoding(_))
        ));
        // uppercase hex is not canonical
        assert!(validate_digest(&HELLO_SHA256.to_uppercase()).is_err());
    }

    #[test]
    fn digester_matches_one_shot() {
        let mut d = Digester::sha256();
        d.update(b"hello ");
        d.update(b"world");
        assert_eq!(d.finalize(), HELLO_SHA256);
    }

    #[test]
    fn header_value_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(digest_header_value(&headers).unwrap(), None);
        headers.insert(DOCKER_DIGEST_HEADER, HELLO_SHA256.parse().unwrap());
        assert_eq!(
            digest_header_value(&headers).unwrap().as_deref(),
            Some(HELLO_SHA256)
        );
    }
}
