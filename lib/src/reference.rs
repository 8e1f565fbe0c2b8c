//! Canonicalizes user- and daemon-provided image references into a stable
//! `host/repository:tag` form, the same way Docker itself expands shorthand
//! references such as `redis` or `library/redis` before talking to a registry.

use std::str::FromStr;

use color_eyre::{
    eyre::{ensure, eyre},
    Result, Section,
};
use derive_more::derive::Display;
use serde::{Deserialize, Serialize};

use crate::{oci_base, oci_namespace};

/// Registry hosts that all refer to the same upstream: Docker Hub.
const DOCKER_IO_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// A canonicalized image reference: `host`, `repository` (namespace/name), and `tag`.
///
/// Two references that denote the same image always normalize to equal values of this
/// type, regardless of how the underlying string was written (shorthand, digest-pinned,
/// alias host, mixed case).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display("{host}/{repository}:{tag}")]
pub struct ImageReference {
    /// Registry host, e.g. `docker.io`, `ghcr.io`.
    pub host: String,
    /// Repository path, e.g. `library/redis`, `org/app`.
    pub repository: String,
    /// Tag, defaulting to `latest` when not specified.
    pub tag: String,
}

impl ImageReference {
    /// Parses and normalizes a raw reference string.
    ///
    /// This never fails: any input that isn't a plainly invalid reference (empty
    /// host/repository/tag segments) is accepted, following Docker's own permissive
    /// shorthand expansion.
    pub fn normalize(raw: &str) -> Result<Self> {
        let without_digest = raw.split('@').next().unwrap_or(raw);

        let (path, tag) = split_tag(without_digest);
        let tag = if tag.is_empty() {
            "latest".to_string()
        } else {
            tag
        };

        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        ensure!(!segments.is_empty(), "empty reference: {raw}");

        let host = if segments.len() > 1 && is_host_segment(segments[0]) {
            segments.remove(0).to_string()
        } else {
            oci_base()
        };

        let mut repository = segments.join("/");
        ensure!(!repository.is_empty(), "empty repository in reference: {raw}");

        let host = normalize_host(&host);
        if host == "docker.io" && !repository.contains('/') {
            repository = format!("{}/{repository}", oci_namespace());
        }

        Ok(ImageReference {
            host,
            repository: repository.to_lowercase(),
            tag,
        })
    }

    /// The registry API path component for this reference's repository.
    pub fn api_repository(&self) -> &str {
        &self.repository
    }
}

impl FromStr for ImageReference {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::normalize(s).with_section(|| s.to_string().header("Input:"))
    }
}

/// Splits `path[:tag]`, being careful that a colon before the last `/` is a port
/// number (`localhost:5000/app`), not a tag separator.
fn split_tag(s: &str) -> (&str, String) {
    let last_slash = s.rfind('/');
    let last_colon = s.rfind(':');
    match (last_slash, last_colon) {
        (Some(slash), Some(colon)) if colon > slash => (&s[..colon], s[colon + 1..].to_string()),
        (None, Some(colon)) => (&s[..colon], s[colon + 1..].to_string()),
        _ => (s, String::new()),
    }
}

/// A segment is a host (rather than a namespace) if it looks like a domain or
/// carries an explicit port, matching Docker's own heuristic.
fn is_host_segment(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

/// Lowercases `host` and collapses the `docker.io`/`index.docker.io`/
/// `registry-1.docker.io` aliases to `docker.io`. Shared with credential host
/// matching, which applies the same collapsing after its own scheme/slash stripping.
pub fn normalize_host(host: &str) -> String {
    let host = host.to_lowercase();
    if DOCKER_IO_ALIASES.contains(&host.as_str()) {
        "docker.io".to_string()
    } else {
        host
    }
}

/// Parses a registry `Docker-Content-Digest`/`Etag`-style digest string, validating
/// that it at least has the `algorithm:hex` shape used throughout this crate.
pub fn validate_digest(raw: &str) -> Result<String> {
    let raw = raw.trim().trim_matches('"');
    let (algorithm, hex) = raw
        .split_once(':')
        .ok_or_else(|| eyre!("digest missing ':' separator: {raw}"))?;
    ensure!(!algorithm.is_empty(), "empty digest algorithm: {raw}");
    ensure!(!hex.is_empty(), "empty digest hash: {raw}");
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("redis", "docker.io", "library/redis", "latest"; "bare name")]
    #[test_case("redis:7.0", "docker.io", "library/redis", "7.0"; "bare name with tag")]
    #[test_case("library/redis", "docker.io", "library/redis", "latest"; "library namespace")]
    #[test_case("org/app", "docker.io", "org/app", "latest"; "org namespace defaults to docker.io")]
    #[test_case("ghcr.io/org/app", "ghcr.io", "org/app", "latest"; "explicit host")]
    #[test_case("ghcr.io/org/app:v1", "ghcr.io", "org/app", "v1"; "explicit host and tag")]
    #[test_case("GHCR.IO/Org/App:V1", "ghcr.io", "org/app", "v1"; "lowercased")]
    #[test_case("docker.io/library/redis", "docker.io", "library/redis", "latest"; "already canonical")]
    #[test_case("index.docker.io/library/redis", "docker.io", "library/redis", "latest"; "docker.io alias index")]
    #[test_case("registry-1.docker.io/library/redis", "docker.io", "library/redis", "latest"; "docker.io alias registry-1")]
    #[test_case("localhost:5000/app", "localhost:5000", "app", "latest"; "port is not a tag")]
    #[test_case("localhost:5000/app:v2", "localhost:5000", "app", "v2"; "port and tag")]
    #[test_case("redis@sha256:aaaa", "docker.io", "library/redis", "latest"; "digest stripped defaults tag")]
    #[test_case("redis:7.0@sha256:aaaa", "docker.io", "library/redis", "7.0"; "digest stripped keeps tag")]
    fn normalizes(input: &str, host: &str, repository: &str, tag: &str) {
        let reference = ImageReference::normalize(input).expect("normalize");
        assert_eq!(reference.host, host);
        assert_eq!(reference.repository, repository);
        assert_eq!(reference.tag, tag);
    }

    #[test]
    fn rejects_empty() {
        assert!(ImageReference::normalize("").is_err());
        assert!(ImageReference::normalize("/").is_err());
    }

    #[test]
    fn idempotent_on_canonical_form() {
        let cases = [
            "redis",
            "ghcr.io/org/app:v1",
            "localhost:5000/app:v2",
            "org/app",
        ];
        for case in cases {
            let once = ImageReference::normalize(case).expect("first normalize");
            let twice = ImageReference::normalize(&once.to_string()).expect("second normalize");
            assert_eq!(once, twice, "not idempotent for {case}");
        }
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_idempotence(
            host in "[a-z0-9]{2,10}\\.[a-z]{2,4}",
            namespace in "[a-z0-9]{2,10}",
            name in "[a-z0-9]{2,10}",
            tag in "[a-z0-9.]{1,10}",
        ) {
            let raw = format!("{host}/{namespace}/{name}:{tag}");
            let once = ImageReference::normalize(&raw).expect("normalize");
            let twice = ImageReference::normalize(&once.to_string()).expect("normalize again");
            prop_assert_eq!(once, twice);
        }
    }
}
