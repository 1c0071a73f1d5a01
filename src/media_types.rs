//! Media types negotiated during manifest resolution

/// Docker schema 2 image manifest
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema 2 manifest list (multi-arch)
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image manifest
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index (multi-arch)
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema 1 manifest, no longer supported
pub const SCHEMA1_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+json";

/// Signed Docker schema 1 manifest, no longer supported
pub const SCHEMA1_SIGNED_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Returns true for the rejected schema 1 manifest media types
pub fn is_schema1(media_type: &str) -> bool {
    media_type == SCHEMA1_MANIFEST_MEDIA_TYPE
        || media_type == SCHEMA1_SIGNED_MANIFEST_MEDIA_TYPE
}

/// Returns true for media types served from the `manifests/` endpoint
/// rather than `blobs/`
pub fn is_manifest_type(media_type: &str) -> bool {
    matches!(
        media_type,
        IMAGE_MANIFEST_MEDIA_TYPE
            | IMAGE_MANIFEST_LIST_MEDIA_TYPE
            | OCI_IMAGE_MEDIA_TYPE
            | OCI_IMAGE_INDEX_MEDIA_TYPE
            | SCHEMA1_MANIFEST_MEDIA_TYPE
            | SCHEMA1_SIGNED_MANIFEST_MEDIA_TYPE
    )
}
