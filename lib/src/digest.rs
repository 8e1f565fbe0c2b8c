//! Compares local image state against registry-reported digests.

use std::str::FromStr;

use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use derive_more::derive::Display;

use crate::{engine::repo_digests, Engine, ImageReference};

/// A content-addressable digest in `algorithm:hex` form, as reported by a registry's
/// `Docker-Content-Digest` header or read from a local image's `RepoDigests`.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{algorithm}:{hash}")]
pub struct Digest {
    /// The hashing algorithm, e.g. `sha256`.
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// The conventional algorithm used by OCI registries.
    pub const SHA256: &'static str = "sha256";
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('"');
        let (algorithm, hash) = s
            .split_once(':')
            .ok_or_else(|| eyre!("digest missing ':' separator: {s}"))?;
        ensure!(!algorithm.is_empty(), "empty digest algorithm: {s}");
        ensure!(!hash.is_empty(), "empty digest hash: {s}");
        Ok(Digest {
            algorithm: algorithm.to_string(),
            hash: hash.to_string(),
        })
    }
}

/// Result of comparing a local image's digests to the registry's current digest.
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    /// Digests the local image is currently tagged with for this repository, if any.
    pub local_digests: Vec<Digest>,
    /// The digest the registry reports for the reference's tag.
    pub remote_digest: Option<Digest>,
    /// Whether `remote_digest` is absent from `local_digests`.
    pub needs_update: bool,
    /// Whether the registry was actually reachable; when false, callers must not
    /// treat `needs_update = false` as a guarantee and must not skip the pull.
    pub checked_via_api: bool,
}

/// Compares local engine image state against a remote digest.
pub struct DigestChecker<'e, E: Engine> {
    engine: &'e E,
}

impl<'e, E: Engine> DigestChecker<'e, E> {
    /// Creates a checker bound to the given engine.
    pub fn new(engine: &'e E) -> Self {
        Self { engine }
    }

    /// Returns every local image ID whose `RepoTags` or `RepoDigests` match the given
    /// reference's repository. Used to capture `UpdatePlan.old_ids` before a pull,
    /// since Docker reassigns tags on pull and a post-pull lookup would see the new ID.
    pub async fn image_ids_for_ref(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let images = self.engine.list_images().await?;
        let canonical = reference.to_string();
        let repo = format!("{}/{}", reference.host, reference.repository);

        let mut ids = Vec::new();
        for image in images {
            let matches_tag = image
                .repo_tags
                .iter()
                .any(|tag| tag == &canonical || tag == &format!("{}:{}", reference.repository, reference.tag));
            let matches_digest = image
                .repo_digests
                .iter()
                .any(|digest| digest.starts_with(&format!("{repo}@")));
            if matches_tag || matches_digest {
                ids.push(image.id.clone());
            }
        }
        Ok(ids)
    }

    /// Checks whether `reference`'s remote digest differs from every local digest
    /// already known for it.
    pub async fn needs_update(
        &self,
        reference: &ImageReference,
        image_id: &str,
        remote_digest: Option<Digest>,
    ) -> Result<UpdateCheck> {
        let inspect = self.engine.inspect_image(image_id).await;
        let local_digests = match inspect {
            Ok(image) => {
                let repo = format!("{}/{}", reference.host, reference.repository);
                repo_digests(&image)
                    .into_iter()
                    .filter(|(repo_key, _)| repo_key == &repo)
                    .filter_map(|(_, digest)| Digest::from_str(&digest).ok())
                    .collect()
            }
            Err(_) => Vec::new(),
        };

        let checked_via_api = remote_digest.is_some();
        let needs_update = match &remote_digest {
            Some(remote) => !local_digests.contains(remote),
            None => false,
        };

        Ok(UpdateCheck {
            local_digests,
            remote_digest,
            needs_update,
            checked_via_api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_digest() {
        let digest = Digest::from_str("sha256:deadbeef").expect("parse");
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.hash, "deadbeef");
        assert_eq!(digest.to_string(), "sha256:deadbeef");
    }

    #[test]
    fn parses_quoted_etag_digest() {
        let digest = Digest::from_str("\"sha256:deadbeef\"").expect("parse");
        assert_eq!(digest.to_string(), "sha256:deadbeef");
    }

    #[test]
    fn rejects_digest_without_separator() {
        assert!(Digest::from_str("deadbeef").is_err());
    }
}
