//! Region and artifact key derivation.
//!
//! A region is the unit of locking and store namespacing: one per distinct
//! (resource, caller) pair. An artifact key names one transcoded output
//! inside a region.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::converter::TargetFormat;
use crate::store::StoreError;

/// Opaque region identifier: lowercase hex MD5 of the resource and token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(String);

impl RegionKey {
    const HEX_LEN: usize = 32;

    /// Derives the region for `resource` as seen by `access_token`.
    ///
    /// Case-insensitive in both inputs and stable across restarts.
    pub fn derive(resource: &str, access_token: &str) -> Self {
        let material = format!(
            "{}#token={}",
            resource.to_lowercase(),
            access_token.to_lowercase()
        );
        Self(hex::encode(Md5::digest(material.as_bytes())))
    }

    /// Accepts an already-derived key, such as a store directory name.
    pub fn from_digest(digest: &str) -> Option<Self> {
        let valid = digest.len() == Self::HEX_LEN
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(digest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key for one transcoded artifact within a region.
///
/// Always a single safe path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Suffix reserved for policy sidecars.
    pub const SIDECAR_SUFFIX: &'static str = ".policy";

    /// Derives the key for `source_identity` converted to `format`.
    ///
    /// Repeated requests for the same pair land on the same key. The identity
    /// is hashed as given, since paths that differ only by case can name
    /// different files. The target extension is kept so converters can infer
    /// the container from the path.
    pub fn derive(source_identity: &str, format: TargetFormat) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(source_identity.as_bytes());
        hasher.update(b"|");
        hasher.update(format.extension().as_bytes());
        Self(format!(
            "{}.{}",
            hex::encode(hasher.finalize()),
            format.extension()
        ))
    }

    /// Validates a raw key.
    ///
    /// # Errors
    /// - `StoreError::InvalidKey` - Empty, hidden, contains a path separator,
    ///   or collides with the sidecar naming scheme
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = raw.is_empty()
            || raw.starts_with('.')
            || raw.contains(['/', '\\', '\0'])
            || raw.ends_with(Self::SIDECAR_SUFFIX)
            || raw.contains(".tmp-");

        if invalid {
            return Err(StoreError::InvalidKey {
                key: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_key_matches_known_digest() {
        let region = RegionKey::derive("https://cdn.example.com/Movie.MKV", "ABC");
        assert_eq!(region.as_str(), "1aef430293c20014eea90cab392c7017");
    }

    #[test]
    fn test_region_key_with_empty_inputs() {
        assert_eq!(
            RegionKey::derive("", "").as_str(),
            "06a710a4ead9562ecd6e621fd72a8dd3"
        );
    }

    #[test]
    fn test_region_key_separates_callers_and_resources() {
        let base = RegionKey::derive("movie.mkv", "alice");

        assert_eq!(base, RegionKey::derive("MOVIE.mkv", "Alice"));
        assert_ne!(base, RegionKey::derive("movie.mkv", "bob"));
        assert_ne!(base, RegionKey::derive("other.mkv", "alice"));
    }

    #[test]
    fn test_region_key_from_digest() {
        let region = RegionKey::derive("movie.mkv", "alice");
        assert_eq!(RegionKey::from_digest(region.as_str()), Some(region));

        assert_eq!(RegionKey::from_digest(".staging"), None);
        assert_eq!(RegionKey::from_digest("1AEF430293C20014EEA90CAB392C7017"), None);
        assert_eq!(RegionKey::from_digest("abc"), None);
    }

    #[test]
    fn test_artifact_key_is_deterministic_per_format() {
        let mp4 = ArtifactKey::derive("/media/movie.mkv", TargetFormat::Mp4);

        assert_eq!(mp4, ArtifactKey::derive("/media/movie.mkv", TargetFormat::Mp4));
        assert_ne!(mp4, ArtifactKey::derive("/MEDIA/movie.mkv", TargetFormat::Mp4));
        assert_ne!(mp4, ArtifactKey::derive("/media/movie.mkv", TargetFormat::WebM));
        assert!(mp4.as_str().ends_with(".mp4"));
        assert_eq!(mp4.as_str().len(), 40 + ".mp4".len());
    }

    #[test]
    fn test_artifact_key_parse_rejects_unsafe_names() {
        assert!(ArtifactKey::parse("clip.mp4").is_ok());

        for raw in ["", ".hidden", "../escape", "a/b", "a\\b", "clip.mp4.policy", "x.tmp-1"] {
            assert!(
                matches!(ArtifactKey::parse(raw), Err(StoreError::InvalidKey { .. })),
                "{raw:?} should be rejected"
            );
        }
    }
}
