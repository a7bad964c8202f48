//! Manifest admission checks.
//!
//! Each supported media type has its own [`ManifestSchema`], a typed view of
//! the document which knows which fields are required and which digests the
//! manifest references. [`validate`] picks the schema from the declared media
//! type, and [`resolve`] checks the references against the content index
//! before anything is proposed.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use base64::prelude::{BASE64_URL_SAFE_NO_PAD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::state::RegistryState;

/// Manifest media types the registry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MediaType {
    /// OCI image manifest.
    #[serde(rename = "application/vnd.oci.image.manifest.v1+json")]
    OciManifest,
    /// OCI image index.
    #[serde(rename = "application/vnd.oci.image.index.v1+json")]
    OciIndex,
    /// Docker image manifest, schema 2.
    #[serde(rename = "application/vnd.docker.distribution.manifest.v2+json")]
    DockerManifest,
    /// Docker manifest list.
    #[serde(rename = "application/vnd.docker.distribution.manifest.list.v2+json")]
    DockerManifestList,
    /// Docker schema 1 manifest, unsigned.
    #[serde(rename = "application/vnd.docker.distribution.manifest.v1+json")]
    DockerV1,
    /// Docker schema 1 manifest with a JWS signature.
    #[serde(rename = "application/vnd.docker.distribution.manifest.v1+prettyjws")]
    DockerV1Signed,
}

const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

impl MediaType {
    /// Every accepted media type.
    pub const ALL: [MediaType; 6] = [
        MediaType::OciManifest,
        MediaType::OciIndex,
        MediaType::DockerManifest,
        MediaType::DockerManifestList,
        MediaType::DockerV1,
        MediaType::DockerV1Signed,
    ];

    /// The media type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::OciManifest => "application/vnd.oci.image.manifest.v1+json",
            MediaType::OciIndex => "application/vnd.oci.image.index.v1+json",
            MediaType::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json",
            MediaType::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
            MediaType::DockerV1 => "application/vnd.docker.distribution.manifest.v1+json",
            MediaType::DockerV1Signed => "application/vnd.docker.distribution.manifest.v1+prettyjws",
        }
    }

    /// Whether documents of this type select other manifests.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciIndex | MediaType::DockerManifestList)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameters such as `; charset=utf-8` do not change the type.
        let essence = s.split(';').next().unwrap_or_default().trim();
        if let Some(media_type) = MediaType::ALL.into_iter().find(|m| m.as_str() == essence) {
            return Ok(media_type);
        }
        let reason = match essence {
            DOCKER_CONFIG | OCI_CONFIG => "image configs are not manifests",
            _ => "unsupported media type",
        };
        Err(RegistryError::SchemaViolation(format!("{essence:?}: {reason}")))
    }
}

/// What admission learned about a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescription {
    /// Digest of the manifest. For signed schema 1 manifests this covers
    /// the payload without the signatures.
    pub digest: Digest,
    /// Declared media type.
    pub media_type: MediaType,
    /// Size of the body in bytes.
    pub size: u64,
    /// Every digest the manifest references.
    pub references: BTreeSet<Digest>,
}

/// A typed manifest document of one media type.
trait ManifestSchema: DeserializeOwned {
    /// Version the `schemaVersion` field must carry.
    const SCHEMA_VERSION: u32;

    fn schema_version(&self) -> u32;

    /// The `mediaType` field, where the format has one.
    fn media_type(&self) -> Option<&str>;

    /// Whether the format requires the `mediaType` field.
    fn media_type_required(&self) -> bool {
        false
    }

    /// Checks beyond field presence and types.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }

    fn references(&self) -> BTreeSet<Digest>;

    /// The bytes the manifest digest is computed over.
    fn payload<'a>(&self, body: &'a [u8]) -> Result<Cow<'a, [u8]>, String> {
        Ok(Cow::Borrowed(body))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: Digest,
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Docker schema 2 shares the OCI image manifest layout but requires
/// `mediaType`.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct DockerManifest(ImageManifest);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct DockerManifestList(ImageIndex);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: Digest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1Manifest {
    schema_version: u32,
    name: String,
    tag: String,
    #[serde(default)]
    architecture: Option<String>,
    fs_layers: Vec<FsLayer>,
    history: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct V1Signature {
    #[allow(dead_code)]
    header: serde_json::Value,
    signature: String,
    protected: String,
}

/// JWS protected header of a schema 1 signature. The signed payload is the
/// body cut at `formatLength` followed by the decoded `formatTail`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, String> {
    BASE64_URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|err| format!("invalid base64url segment: {err}"))
}

impl V1Signature {
    fn payload(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        let header: ProtectedHeader = serde_json::from_slice(&decode_segment(&self.protected)?)
            .map_err(|err| format!("invalid protected header: {err}"))?;
        let head = body
            .get(..header.format_length)
            .ok_or_else(|| format!("formatLength {} is past the end of the body", header.format_length))?;
        let mut payload = head.to_vec();
        payload.extend(decode_segment(&header.format_tail)?);
        Ok(payload)
    }
}

#[derive(Debug, Deserialize)]
struct SignedV1Manifest {
    #[serde(flatten)]
    manifest: V1Manifest,
    signatures: Vec<V1Signature>,
}

fn image_manifest_check(manifest: &ImageManifest) -> Result<(), String> {
    if matches!(
        manifest.config.media_type.as_str(),
        "application/vnd.oci.image.manifest.v1+json"
            | "application/vnd.oci.image.index.v1+json"
            | "application/vnd.docker.distribution.manifest.v2+json"
            | "application/vnd.docker.distribution.manifest.list.v2+json"
    ) {
        return Err("config descriptor points at a manifest".into());
    }
    Ok(())
}

fn image_manifest_references(manifest: &ImageManifest) -> BTreeSet<Digest> {
    std::iter::once(&manifest.config)
        .chain(&manifest.layers)
        .map(|d| d.digest.clone())
        .collect()
}

fn index_check(index: &ImageIndex) -> Result<(), String> {
    for entry in &index.manifests {
        if entry.media_type.parse::<MediaType>().is_err() {
            return Err(format!(
                "index entry {} has non-manifest media type {:?}",
                entry.digest, entry.media_type
            ));
        }
        if entry.size == 0 {
            return Err(format!("index entry {} has zero size", entry.digest));
        }
    }
    Ok(())
}

impl ManifestSchema for ImageManifest {
    const SCHEMA_VERSION: u32 = 2;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    fn check(&self) -> Result<(), String> {
        image_manifest_check(self)
    }

    fn references(&self) -> BTreeSet<Digest> {
        image_manifest_references(self)
    }
}

impl ManifestSchema for DockerManifest {
    const SCHEMA_VERSION: u32 = 2;

    fn schema_version(&self) -> u32 {
        self.0.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        self.0.media_type.as_deref()
    }

    fn media_type_required(&self) -> bool {
        true
    }

    fn check(&self) -> Result<(), String> {
        image_manifest_check(&self.0)
    }

    fn references(&self) -> BTreeSet<Digest> {
        image_manifest_references(&self.0)
    }
}

impl ManifestSchema for ImageIndex {
    const SCHEMA_VERSION: u32 = 2;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    fn check(&self) -> Result<(), String> {
        index_check(self)
    }

    fn references(&self) -> BTreeSet<Digest> {
        self.manifests.iter().map(|d| d.digest.clone()).collect()
    }
}

impl ManifestSchema for DockerManifestList {
    const SCHEMA_VERSION: u32 = 2;

    fn schema_version(&self) -> u32 {
        self.0.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        self.0.media_type.as_deref()
    }

    fn media_type_required(&self) -> bool {
        true
    }

    fn check(&self) -> Result<(), String> {
        index_check(&self.0)
    }

    fn references(&self) -> BTreeSet<Digest> {
        self.0.references()
    }
}

fn v1_check(manifest: &V1Manifest) -> Result<(), String> {
    if manifest.name.is_empty() || manifest.tag.is_empty() {
        return Err("name and tag must not be empty".into());
    }
    if manifest.architecture.as_deref() == Some("") {
        return Err("architecture must not be empty".into());
    }
    if manifest.fs_layers.len() != manifest.history.len() {
        return Err(format!(
            "{} fsLayers but {} history entries",
            manifest.fs_layers.len(),
            manifest.history.len()
        ));
    }
    Ok(())
}

impl ManifestSchema for V1Manifest {
    const SCHEMA_VERSION: u32 = 1;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        None
    }

    fn check(&self) -> Result<(), String> {
        v1_check(self)
    }

    fn references(&self) -> BTreeSet<Digest> {
        self.fs_layers.iter().map(|l| l.blob_sum.clone()).collect()
    }
}

impl ManifestSchema for SignedV1Manifest {
    const SCHEMA_VERSION: u32 = 1;

    fn schema_version(&self) -> u32 {
        self.manifest.schema_version
    }

    fn media_type(&self) -> Option<&str> {
        None
    }

    fn check(&self) -> Result<(), String> {
        v1_check(&self.manifest)?;
        if self.signatures.is_empty() {
            return Err("signed manifest carries no signatures".into());
        }
        if self
            .signatures
            .iter()
            .any(|s| s.signature.is_empty() || s.protected.is_empty())
        {
            return Err("signature is missing its value or protected header".into());
        }
        Ok(())
    }

    fn references(&self) -> BTreeSet<Digest> {
        self.manifest.references()
    }

    fn payload<'a>(&self, body: &'a [u8]) -> Result<Cow<'a, [u8]>, String> {
        let mut payloads = self.signatures.iter().map(|s| s.payload(body));
        let payload = payloads
            .next()
            .ok_or_else(|| "signed manifest carries no signatures".to_owned())??;
        if payloads.any(|other| other.as_ref() != Ok(&payload)) {
            return Err("signatures cover different payloads".into());
        }
        Ok(Cow::Owned(payload))
    }
}

fn describe<M: ManifestSchema>(media_type: MediaType, body: &[u8]) -> RegistryResult<(BTreeSet<Digest>, Digest)> {
    let violation = |message: String| RegistryError::SchemaViolation(message);

    let manifest: M = serde_json::from_slice(body).map_err(|err| violation(err.to_string()))?;
    if manifest.schema_version() != M::SCHEMA_VERSION {
        return Err(violation(format!(
            "schemaVersion {} where {} is required",
            manifest.schema_version(),
            M::SCHEMA_VERSION
        )));
    }
    match manifest.media_type() {
        Some(declared) if declared != media_type.as_str() => {
            return Err(violation(format!(
                "body declares mediaType {declared:?} but was submitted as {media_type}"
            )));
        }
        None if manifest.media_type_required() => {
            return Err(violation("missing field `mediaType`".into()));
        }
        _ => {}
    }
    manifest.check().map_err(violation)?;
    let payload = manifest.payload(body).map_err(violation)?;
    Ok((manifest.references(), Digest::sha256_of(&payload)))
}

/// Check a manifest body against the schema for `media_type` and extract
/// what it references.
pub fn validate(media_type: &str, body: &[u8]) -> RegistryResult<ManifestDescription> {
    let media_type: MediaType = media_type.parse()?;
    let (references, digest) = match media_type {
        MediaType::OciManifest => describe::<ImageManifest>(media_type, body)?,
        MediaType::DockerManifest => describe::<DockerManifest>(media_type, body)?,
        MediaType::OciIndex => describe::<ImageIndex>(media_type, body)?,
        MediaType::DockerManifestList => describe::<DockerManifestList>(media_type, body)?,
        MediaType::DockerV1 => describe::<V1Manifest>(media_type, body)?,
        MediaType::DockerV1Signed => describe::<SignedV1Manifest>(media_type, body)?,
    };

    if references.contains(&digest) {
        return Err(RegistryError::SchemaViolation(format!(
            "manifest {digest} references itself"
        )));
    }

    Ok(ManifestDescription {
        digest,
        media_type,
        size: body.len() as u64,
        references,
    })
}

/// Check that every reference is present in the content index.
pub fn resolve(description: &ManifestDescription, state: &RegistryState) -> RegistryResult<()> {
    match description
        .references
        .iter()
        .find(|digest| state.blob(digest).is_none())
    {
        Some(missing) => Err(RegistryError::UnresolvedReference(missing.clone())),
        None => Ok(()),
    }
}
