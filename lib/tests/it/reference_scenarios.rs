//! Cross-module reference normalization scenarios: the parts of the update pipeline
//! that depend on two references comparing equal (or not) once normalized, rather
//! than on the normalization rules in isolation.

use arcane_core::ImageReference;
use pretty_assertions::assert_eq;

/// Shorthand and fully-qualified spellings of the same Docker Hub image must collapse
/// to the same reference, since this is what lets the probe treat a locally-tagged
/// `redis:7.0` and a registry-reported `docker.io/library/redis:7.0` as one image.
#[test]
fn shorthand_and_qualified_forms_are_the_same_reference() {
    let shorthand = ImageReference::normalize("redis:7.0").expect("normalize shorthand");
    let qualified =
        ImageReference::normalize("index.docker.io/library/redis:7.0").expect("normalize qualified");
    assert_eq!(shorthand, qualified);
}

/// A bare org/name reference is Hub-scoped, not host-scoped: it must not collide with
/// a same-named repository on another registry.
#[test]
fn same_repository_name_on_different_hosts_does_not_collide() {
    let hub = ImageReference::normalize("org/app:v1").expect("normalize hub");
    let ghcr = ImageReference::normalize("ghcr.io/org/app:v1").expect("normalize ghcr");
    assert_ne!(hub, ghcr);
    assert_eq!(hub.host, "docker.io");
    assert_eq!(ghcr.host, "ghcr.io");
}

/// A private registry on a non-default port must keep the port as part of the host,
/// not misparse it as a tag separator.
#[test]
fn private_registry_port_round_trips_through_to_string() {
    let reference = ImageReference::normalize("localhost:5000/team/app:v3").expect("normalize");
    let rendered = reference.to_string();
    let reparsed = ImageReference::normalize(&rendered).expect("reparse");
    assert_eq!(reference, reparsed);
    assert_eq!(reference.host, "localhost:5000");
}

/// The digest stays out of band: two references to the same repository:tag that carry
/// different (or absent) digest pins must still normalize identically, since the
/// digest itself is compared separately by the update probe.
#[test]
fn digest_pin_is_irrelevant_to_reference_identity() {
    let a = ImageReference::normalize("org/app:v1@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        .expect("normalize a");
    let b = ImageReference::normalize("org/app:v1@sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
        .expect("normalize b");
    let bare = ImageReference::normalize("org/app:v1").expect("normalize bare");
    assert_eq!(a, b);
    assert_eq!(a, bare);
}
