//! Resolves registry credentials for a normalized host: stored credentials take
//! priority, falling back to the local `~/.docker/config.json` the same way the
//! `docker` CLI itself resolves auth for a pull.

use std::{collections::HashMap, path::PathBuf, process::Stdio};

use base64::Engine as _;
use color_eyre::{
    eyre::{eyre, Context, OptionExt},
    Result, Section, SectionExt,
};
use derive_more::derive::Debug;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// A registry credential, never logged or displayed with its token in the clear.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Normalized registry host this credential applies to.
    pub url: String,
    /// Username, if the registry uses Basic auth.
    pub username: Option<String>,
    /// The secret itself: a password, personal access token, or pre-issued Bearer token.
    #[debug(skip)]
    pub token: SecretToken,
    /// Whether this credential is currently eligible for use.
    pub enabled: bool,
    /// Whether to allow talking to this host over plaintext HTTP.
    pub insecure: bool,
}

/// A secret value whose `Debug`/`Display` never reveal the contents, so a credential
/// accidentally formatted into a log line or error message doesn't leak it.
#[derive(Clone)]
pub struct SecretToken(String);

impl SecretToken {
    /// Wraps a plaintext secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Reveals the secret. Callers must not log or `Debug`-format the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(..)")
    }
}

impl std::fmt::Display for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("..")
    }
}

/// Supplies decrypted credentials on demand. Encryption at rest is an external
/// collaborator's concern; this crate only ever sees a token once the vault decides
/// to hand one over.
pub trait CredentialVault: Send + Sync {
    /// Returns every enabled credential known to the vault, in stored (insertion) order.
    fn credentials(&self) -> Vec<Credential>;
}

/// An in-memory vault, useful for the demonstration binary and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticVault {
    entries: Vec<Credential>,
}

impl StaticVault {
    /// Builds a vault from an already-ordered list of credentials.
    pub fn new(entries: Vec<Credential>) -> Self {
        Self { entries }
    }
}

impl CredentialVault for StaticVault {
    fn credentials(&self) -> Vec<Credential> {
        self.entries.clone()
    }
}

/// Matches a normalized host against a vault's credentials, and falls back to the
/// local Docker CLI config when nothing matches.
#[derive(Debug, Default)]
pub struct CredentialResolver;

impl CredentialResolver {
    /// Finds the first enabled credential whose normalized `url` equals `host`.
    ///
    /// First-enabled wins: if multiple stored credentials match the same host, the
    /// one that appears earliest in the vault's insertion order is used, even if a
    /// later entry might seem "more specific" (this crate doesn't attempt that).
    ///
    /// `host` is assumed already normalized (it's an [`ImageReference::host`]); a
    /// credential's own `url` is normalized the same way a registry host is before
    /// comparing, so a vault entry stored as `https://ghcr.io/` still matches `ghcr.io`.
    pub fn resolve(vault: &dyn CredentialVault, host: &str) -> Option<Credential> {
        vault
            .credentials()
            .into_iter()
            .find(|c| c.enabled && normalize_registry_url(&c.url) == host)
    }

    /// Falls back to a credential sourced from `~/.docker/config.json`, trying
    /// plaintext `auth` entries and then credential-helper shellouts, exactly as the
    /// `docker` CLI does for a given host (with the `docker.io` alias fallback key).
    pub async fn resolve_docker_config(host: &str) -> Result<Option<Credential>> {
        match resolve_docker_config_internal(host).await {
            Ok(cred) => Ok(cred),
            Err(err) => {
                warn!(?err, "unable to infer docker cli credential; trying unauthenticated");
                Ok(None)
            }
        }
    }
}

/// Normalizes a stored credential's `url` the same way a registry host is normalized:
/// scheme and trailing slash stripped, then `docker.io` aliases collapsed and the
/// whole thing lowercased.
fn normalize_registry_url(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let without_trailing_slash = without_scheme.trim_end_matches('/');
    crate::reference::normalize_host(without_trailing_slash)
}

async fn resolve_docker_config_internal(host: &str) -> Result<Option<Credential>> {
    let path = home_docker_config_path().context("locate docker config")?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .context("read docker config")
        .with_section(|| path.display().to_string().header("Config file path:"))?;

    let config = serde_json::from_str::<DockerConfig>(&raw)
        .context("parse docker config")
        .with_section(|| path.display().to_string().header("Config file path:"))?;

    config.credential_for(host).await
}

fn home_docker_config_path() -> Result<PathBuf> {
    let home = dirs_next_home().ok_or_eyre("could not determine home directory")?;
    Ok(home.join(".docker").join("config.json"))
}

/// Minimal home-directory lookup so this crate does not need a dedicated `dirs` crate
/// dependency purely for this one path.
fn dirs_next_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    fn auth_keys(host: &str) -> Vec<&str> {
        if host == "docker.io" {
            vec!["docker.io", "https://index.docker.io/v1/"]
        } else {
            vec![host]
        }
    }

    async fn credential_for(&self, host: &str) -> Result<Option<Credential>> {
        for key in Self::auth_keys(host) {
            if let Some(auth) = self.auths.get(key) {
                match auth.decode(self, key).await {
                    Ok((username, token)) => {
                        debug!(host, "resolved docker cli credential");
                        return Ok(Some(Credential {
                            url: host.to_string(),
                            username: Some(username),
                            token: SecretToken::new(token),
                            enabled: true,
                            insecure: false,
                        }));
                    }
                    Err(err) => {
                        warn!(host = key, ?err, "failed decoding docker cli auth entry");
                        continue;
                    }
                }
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DockerAuth {
    Plain { auth: String },
    Helper {},
}

impl DockerAuth {
    async fn decode(&self, config: &DockerConfig, host: &str) -> Result<(String, String)> {
        match self {
            DockerAuth::Plain { auth } => Self::decode_plain(auth),
            DockerAuth::Helper {} => Self::decode_helper(config, host).await,
        }
    }

    fn decode_plain(auth: &str) -> Result<(String, String)> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .context("decode base64 auth key")?;
        let decoded = String::from_utf8(decoded).context("parse auth key as utf-8")?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_eyre("invalid auth key format, expected username:password")?;
        Ok((username.to_string(), password.to_string()))
    }

    async fn decode_helper(config: &DockerConfig, host: &str) -> Result<(String, String)> {
        let helper = config
            .cred_helpers
            .get(host)
            .or(config.creds_store.as_ref())
            .ok_or_eyre("no credential helper configured for host")?;

        let binary = format!("docker-credential-{helper}");
        let mut child = tokio::process::Command::new(&binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn docker credential helper")
            .with_section(|| binary.clone().header("Helper binary:"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(host.as_bytes())
                .await
                .context("write request to credential helper")?;
        }

        let output = child.wait_with_output().await.context("run credential helper")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(eyre!("credential helper failed with status: {}", output.status))
                .with_section(|| binary.header("Helper binary:"))
                .with_section(|| host.to_string().header("Host:"))
                .with_section(|| stderr.header("Stderr:"));
        }

        let decoded: HelperCredential =
            serde_json::from_slice(&output.stdout).context("decode credential helper output")?;
        Ok((decoded.username, decoded.secret))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperCredential {
    username: String,
    secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cred(url: &str, enabled: bool) -> Credential {
        Credential {
            url: url.to_string(),
            username: Some("u".to_string()),
            token: SecretToken::new("t"),
            enabled,
            insecure: false,
        }
    }

    #[test]
    fn first_enabled_wins() {
        let vault = StaticVault::new(vec![
            cred("ghcr.io", false),
            cred("ghcr.io", true),
            cred("ghcr.io", true),
        ]);
        let resolved = CredentialResolver::resolve(&vault, "ghcr.io").expect("match");
        assert_eq!(resolved.username.as_deref(), Some("u"));
        assert!(resolved.enabled);
    }

    #[test]
    fn no_match_returns_none() {
        let vault = StaticVault::new(vec![cred("ghcr.io", true)]);
        assert!(CredentialResolver::resolve(&vault, "docker.io").is_none());
    }

    #[test]
    fn stored_url_normalizes_scheme_and_trailing_slash() {
        let vault = StaticVault::new(vec![cred("https://ghcr.io/", true)]);
        assert!(CredentialResolver::resolve(&vault, "ghcr.io").is_some());
    }

    #[test]
    fn stored_url_collapses_docker_io_aliases() {
        let vault = StaticVault::new(vec![cred("index.docker.io", true)]);
        assert!(CredentialResolver::resolve(&vault, "docker.io").is_some());
    }

    #[test]
    fn secret_token_never_prints_contents() {
        let token = SecretToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "SecretToken(..)");
        assert_eq!(format!("{token}"), "..");
        assert_eq!(token.expose(), "super-secret");
    }
}
