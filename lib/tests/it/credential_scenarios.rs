//! Cross-module credential cascade scenarios: the vault-first, docker-config-fallback
//! ordering the orchestrator's pull step relies on, exercised through the public
//! `CredentialResolver`/`CredentialVault` API rather than its internal helpers.

use arcane_core::credential::{Credential, CredentialResolver, CredentialVault, SecretToken, StaticVault};

fn credential(host: &str, enabled: bool, token: &str) -> Credential {
    Credential {
        url: host.to_string(),
        username: Some("svc".to_string()),
        token: SecretToken::new(token),
        enabled,
        insecure: false,
    }
}

/// A disabled vault entry for the target host must not shadow a matching enabled
/// entry that comes later in insertion order.
#[test]
fn disabled_entry_does_not_shadow_enabled_one() {
    let vault = StaticVault::new(vec![
        credential("ghcr.io", false, "stale"),
        credential("ghcr.io", true, "fresh"),
    ]);
    let resolved = CredentialResolver::resolve(&vault, "ghcr.io").expect("resolves");
    assert_eq!(resolved.token.expose(), "fresh");
}

/// Credentials scoped to one host must never be handed back for a different host,
/// even when the vault only holds a single entry.
#[test]
fn host_scoping_is_exact() {
    let vault = StaticVault::new(vec![credential("ghcr.io", true, "t")]);
    assert!(CredentialResolver::resolve(&vault, "docker.io").is_none());
    assert!(CredentialResolver::resolve(&vault, "ghcr.io.evil.example").is_none());
}

/// An empty vault is a valid, unremarkable state (the common case for an unauthenticated
/// deployment): resolution must return `None` rather than erroring.
#[test]
fn empty_vault_resolves_to_none() {
    let vault = StaticVault::new(Vec::new());
    assert!(CredentialResolver::resolve(&vault, "docker.io").is_none());
}

/// `CredentialVault` is implemented directly by callers too, not only via `StaticVault`:
/// a trait object built from a closure-backed type must resolve the same way.
#[test]
fn custom_vault_impl_is_honored() {
    struct SingleHost(Credential);
    impl CredentialVault for SingleHost {
        fn credentials(&self) -> Vec<Credential> {
            vec![self.0.clone()]
        }
    }

    let vault = SingleHost(credential("registry.internal", true, "secret"));
    let resolved = CredentialResolver::resolve(&vault, "registry.internal").expect("resolves");
    assert_eq!(resolved.username.as_deref(), Some("svc"));
}
