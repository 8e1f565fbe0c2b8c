//! Talks to OCI/Docker registries: resolves a manifest digest for a reference,
//! negotiating `WWW-Authenticate` Bearer challenges and batching token requests
//! across repositories on the same host.

use std::{collections::HashMap, str::FromStr, time::Duration};

use color_eyre::{
    eyre::{bail, ensure, eyre},
    Result,
};
use serde::Deserialize;
use tracing::warn;

use crate::{credential::SecretToken, Digest, ImageReference};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How a digest lookup's auth, if any, was ultimately resolved — recorded on the
/// audit trail so the used method is observable without ever logging credentials.
#[derive(Debug, Clone, PartialEq, Eq, strum::AsRefStr)]
pub enum AuthMethod {
    /// No authentication was required.
    None,
    /// An anonymous (no-credential) Bearer token was sufficient.
    Anonymous,
    /// A stored or config-resolved credential was used.
    Credential {
        /// The username of the credential that succeeded.
        username: String,
    },
}

/// Basic or Bearer credentials to attach to a registry request.
#[derive(Debug, Clone, Default)]
pub struct RegistryCredential {
    /// Username for Basic auth or for the token service's Basic challenge.
    pub username: Option<String>,
    /// Password/token paired with `username`.
    pub password: Option<SecretToken>,
}

/// Outcome of a single digest lookup.
#[derive(Debug, Clone)]
pub struct DigestLookup {
    /// The digest the registry reports for the reference's tag.
    pub digest: Digest,
    /// How long the lookup took, end to end (including any token exchange).
    pub elapsed: Duration,
    /// How auth was resolved for this lookup.
    pub auth_method: AuthMethod,
}

/// A minimal, cloneable HTTP client for OCI registry interactions.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    /// Builds a client with the crate's standard request timeout.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Resolves the manifest digest for `reference`, trying anonymous access first and
    /// falling back to `credential` if the registry challenges for auth. Talks plain
    /// HTTP instead of HTTPS when `insecure` is set, for private deployments that
    /// don't terminate TLS at the registry itself.
    #[tracing::instrument(skip(self, credential), fields(host = %reference.host, repo = %reference.repository))]
    pub async fn digest(
        &self,
        reference: &ImageReference,
        credential: Option<&RegistryCredential>,
        insecure: bool,
    ) -> Result<DigestLookup> {
        let start = std::time::Instant::now();
        let url = manifest_url(reference, insecure);

        let anonymous = self.head_manifest(&url, None).await?;
        match anonymous {
            HeadOutcome::Digest(digest) => Ok(DigestLookup {
                digest,
                elapsed: start.elapsed(),
                auth_method: AuthMethod::None,
            }),
            HeadOutcome::Challenge(challenge) => {
                // Try anonymous token exchange first; many public repos accept it.
                if let Ok(token) = self.token_for(&challenge, None).await {
                    if let HeadOutcome::Digest(digest) = self.head_manifest(&url, Some(&token)).await? {
                        return Ok(DigestLookup {
                            digest,
                            elapsed: start.elapsed(),
                            auth_method: AuthMethod::Anonymous,
                        });
                    }
                }

                let credential = credential
                    .ok_or_else(|| eyre!("registry requires authentication and no credential is available"))?;
                let token = self.token_for(&challenge, Some(credential)).await?;
                match self.head_manifest(&url, Some(&token)).await? {
                    HeadOutcome::Digest(digest) => Ok(DigestLookup {
                        digest,
                        elapsed: start.elapsed(),
                        auth_method: AuthMethod::Credential {
                            username: credential.username.clone().unwrap_or_default(),
                        },
                    }),
                    HeadOutcome::Challenge(_) => bail!("registry rejected credentialed request"),
                }
            }
        }
    }

    /// Resolves a single Bearer token valid across multiple repositories on the same
    /// host, for batched probing. Falls back per-repository if the registry rejects a
    /// multi-scope request.
    #[tracing::instrument(skip(self, credential), fields(repos = repos.len()))]
    pub async fn token_multi(
        &self,
        realm: &str,
        service: &str,
        repos: &[String],
        credential: Option<&RegistryCredential>,
    ) -> Result<HashMap<String, SecretToken>> {
        let challenge = Challenge {
            realm: realm.to_string(),
            service: service.to_string(),
            scope: None,
        };

        let scopes: Vec<String> = repos.iter().map(|repo| format!("repository:{repo}:pull")).collect();

        match self.fetch_token(&challenge, &scopes, credential).await {
            Ok(token) => Ok(repos.iter().cloned().map(|repo| (repo, token.clone())).collect()),
            Err(err) => {
                warn!(?err, "multi-scope token request failed, falling back to per-repo tokens");
                let mut tokens = HashMap::new();
                for repo in repos {
                    let scope = vec![format!("repository:{repo}:pull")];
                    let token = self.fetch_token(&challenge, &scope, credential).await?;
                    tokens.insert(repo.clone(), token);
                }
                Ok(tokens)
            }
        }
    }

    /// Issues one anonymous HEAD against `reference` purely to learn whether the host
    /// challenges for auth and, if so, the realm/service to request tokens from.
    /// Used by the batch probe path so a host's auth is negotiated once instead of
    /// once per repository hosted there.
    pub async fn probe_auth(&self, reference: &ImageReference, insecure: bool) -> Result<Option<AuthChallenge>> {
        let url = manifest_url(reference, insecure);
        match self.head_manifest(&url, None).await? {
            HeadOutcome::Digest(_) => Ok(None),
            HeadOutcome::Challenge(challenge) => Ok(Some(AuthChallenge {
                realm: challenge.realm,
                service: challenge.service,
            })),
        }
    }

    /// Resolves one token per repository in `repos` for a host already known (via
    /// [`probe_auth`]) to require auth. Tries `credential` first, then falls back to
    /// an anonymous token request, per the same cascade [`digest`](Self::digest) uses
    /// for a single image — but here the result is shared across every repo on the
    /// host rather than re-negotiated per image.
    pub async fn resolve_batch_tokens(
        &self,
        challenge: &AuthChallenge,
        repos: &[String],
        credential: Option<&RegistryCredential>,
    ) -> Result<(HashMap<String, SecretToken>, AuthMethod)> {
        if let Some(credential) = credential {
            if let Ok(tokens) = self.token_multi(&challenge.realm, &challenge.service, repos, Some(credential)).await {
                return Ok((
                    tokens,
                    AuthMethod::Credential {
                        username: credential.username.clone().unwrap_or_default(),
                    },
                ));
            }
        }
        let tokens = self.token_multi(&challenge.realm, &challenge.service, repos, None).await?;
        Ok((tokens, AuthMethod::Anonymous))
    }

    /// Resolves the manifest digest for `reference` using an already-acquired token
    /// (or none, for a host that needs no auth at all), without repeating the
    /// challenge/token round trip. The caller is expected to retry via the slower,
    /// full [`digest`](Self::digest) cascade if this returns a challenge or error.
    pub async fn digest_with_token(
        &self,
        reference: &ImageReference,
        token: Option<&SecretToken>,
        insecure: bool,
    ) -> Result<Digest> {
        let url = manifest_url(reference, insecure);
        match self.head_manifest(&url, token).await? {
            HeadOutcome::Digest(digest) => Ok(digest),
            HeadOutcome::Challenge(_) => bail!("registry rejected cached-token request"),
        }
    }

    async fn token_for(&self, challenge: &Challenge, credential: Option<&RegistryCredential>) -> Result<SecretToken> {
        let scope = challenge.scope.clone().map(|s| vec![s]).unwrap_or_default();
        self.fetch_token(challenge, &scope, credential).await
    }

    async fn fetch_token(
        &self,
        challenge: &Challenge,
        scopes: &[String],
        credential: Option<&RegistryCredential>,
    ) -> Result<SecretToken> {
        let mut request = self.http.get(&challenge.realm).query(&[("service", &challenge.service)]);
        for scope in scopes {
            request = request.query(&[("scope", scope)]);
        }
        if let Some(credential) = credential {
            if let (Some(username), Some(password)) = (&credential.username, &credential.password) {
                request = request.basic_auth(username, Some(password.expose()));
            }
        }

        let response = request.send().await?;
        ensure!(
            response.status().is_success(),
            "token request failed with status {}",
            response.status()
        );

        let body: TokenResponse = response.json().await?;
        body.token()
    }

    async fn head_manifest(&self, url: &str, token: Option<&SecretToken>) -> Result<HeadOutcome> {
        let mut request = self.http.head(url).header("Accept", MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.bearer_auth(token.expose());
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| eyre!("registry returned 401 without a WWW-Authenticate header"))?;
            return Ok(HeadOutcome::Challenge(parse_challenge(header)?));
        }

        ensure!(
            response.status().is_success(),
            "manifest request failed with status {}",
            response.status()
        );

        let digest = response
            .headers()
            .get("docker-content-digest")
            .or_else(|| response.headers().get("etag"))
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| eyre!("registry response carried neither Docker-Content-Digest nor Etag"))?;
        Digest::from_str(digest).map(HeadOutcome::Digest)
    }
}

enum HeadOutcome {
    Digest(Digest),
    Challenge(Challenge),
}

/// The realm/service a host's `WWW-Authenticate` challenge named, carried from
/// [`RegistryClient::probe_auth`] to [`RegistryClient::resolve_batch_tokens`] without
/// exposing the raw `scope` parameter, which is per-repository and not reusable.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    /// Token service endpoint.
    pub realm: String,
    /// `service` parameter to pass through to the token request.
    pub service: String,
}

#[derive(Debug, Clone)]
struct Challenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

/// Parses a `WWW-Authenticate: Bearer realm="...",service="...",scope="..."` header.
fn parse_challenge(header: &str) -> Result<Challenge> {
    let rest = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| eyre!("unsupported auth scheme: {header}"))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in split_params(rest) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(Challenge {
        realm: realm.ok_or_else(|| eyre!("WWW-Authenticate missing realm: {header}"))?,
        service: service.unwrap_or_default(),
        scope,
    })
}

/// Splits a comma-separated parameter list, respecting quoted values that may
/// themselves contain commas.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

fn manifest_url(reference: &ImageReference, insecure: bool) -> String {
    let scheme = if insecure { "http" } else { "https" };
    format!(
        "{scheme}://{}/v2/{}/manifests/{}",
        reference.host, reference.repository, reference.tag
    )
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn token(self) -> Result<SecretToken> {
        self.token
            .or(self.access_token)
            .map(SecretToken::new)
            .ok_or_else(|| eyre!("token response carried neither 'token' nor 'access_token'"))
    }
}
