//! Checks whether locally-present images have newer versions available upstream,
//! persisting what it learns as [`ImageUpdateRecord`]s.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use color_eyre::Result;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::{
    credential::{Credential, CredentialResolver, CredentialVault, StaticVault},
    digest::DigestChecker,
    engine::Engine,
    event::{ImageChangeNotice, Notifier},
    registry::{AuthMethod, RegistryClient, RegistryCredential},
    ImageReference,
};

/// The maximum number of registry probes allowed to run concurrently in a batch check.
pub const MAX_CONCURRENT_PROBES: usize = 10;

/// Whether a detected update is a new digest for the same tag, or a tag that now
/// points somewhere else entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// The tag's manifest digest changed.
    Digest,
    /// The tag itself was reassigned (rare; tracked for completeness).
    Tag,
}

/// Persistent per-image-ID update status.
#[derive(Debug, Clone)]
pub struct ImageUpdateRecord {
    /// The local image ID this record is keyed on.
    pub image_id: String,
    /// Repository portion of the reference (e.g. `library/redis`).
    pub repository: String,
    /// Tag portion of the reference.
    pub tag: String,
    /// Whether the registry currently reports a newer digest.
    pub has_update: bool,
    /// Kind of update detected, when `has_update` is true.
    pub update_type: Option<UpdateType>,
    /// The digest the local image currently has, if known.
    pub current_digest: Option<String>,
    /// The digest the registry reports, if the check succeeded.
    pub latest_digest: Option<String>,
    /// When this record was last refreshed.
    pub check_time: OffsetDateTime,
    /// How long the registry round-trip took, in milliseconds.
    pub response_time_ms: u64,
    /// The error from the last check attempt, if it failed.
    pub last_error: Option<String>,
    /// How auth was resolved for the check that produced this record, if any.
    pub auth_method: Option<String>,
    /// Username used, if a credential was used.
    pub auth_username: Option<String>,
    /// Registry host this record pertains to.
    pub auth_registry: String,
    /// Whether a stored/config credential (as opposed to anonymous) was used.
    pub used_credential: bool,
}

/// Persists and retrieves [`ImageUpdateRecord`]s. Real persistence is an external
/// collaborator's concern; [`InMemoryRecordStore`] is provided for the demonstration
/// binary and for tests.
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record for an image ID.
    fn upsert(&self, record: ImageUpdateRecord);

    /// Retrieves the record for an image ID, if any.
    fn get(&self, image_id: &str) -> Option<ImageUpdateRecord>;

    /// Clears `has_update` on a record without discarding its history.
    fn clear_has_update(&self, image_id: &str);

    /// Removes records for image IDs that no longer exist locally.
    fn sweep_orphaned(&self, existing_image_ids: &[String]);
}

/// An in-memory [`RecordStore`].
///
/// Backed by a blocking `std::sync::Mutex` rather than `tokio::sync::Mutex`: every
/// critical section here is synchronous and never held across an `.await`, so a
/// blocking lock is correct and, unlike a `try_lock`, never silently drops a write
/// under the concurrent load `check_many` puts on it.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: StdMutex<HashMap<String, ImageUpdateRecord>>,
}

impl RecordStore for InMemoryRecordStore {
    fn upsert(&self, record: ImageUpdateRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(record.image_id.clone(), record);
        }
    }

    fn get(&self, image_id: &str) -> Option<ImageUpdateRecord> {
        self.records.lock().ok().and_then(|records| records.get(image_id).cloned())
    }

    fn clear_has_update(&self, image_id: &str) {
        if let Ok(mut records) = self.records.lock() {
            if let Some(record) = records.get_mut(image_id) {
                record.has_update = false;
            }
        }
    }

    fn sweep_orphaned(&self, existing_image_ids: &[String]) {
        if let Ok(mut records) = self.records.lock() {
            records.retain(|id, _| existing_image_ids.contains(id));
        }
    }
}

/// Outcome of checking a single image for updates.
#[derive(Debug, Clone)]
pub struct SingleCheckResult {
    /// The record produced by this check (also persisted to the [`RecordStore`]).
    pub record: ImageUpdateRecord,
}

/// Orchestrates registry probes for one image or a batch of images.
///
/// Collaborators are held as `Arc`s rather than borrows so a batch check can spawn
/// genuinely concurrent tasks (bounded by [`MAX_CONCURRENT_PROBES`]) instead of only
/// interleaving futures on one task.
pub struct UpdateProbeService<E: Engine + 'static> {
    engine: Arc<E>,
    registry: RegistryClient,
    vault: Arc<dyn CredentialVault>,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
}

impl<E: Engine + 'static> Clone for UpdateProbeService<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            registry: self.registry.clone(),
            vault: Arc::clone(&self.vault),
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl<E: Engine + 'static> UpdateProbeService<E> {
    /// Builds a probe service bound to the given collaborators.
    pub fn new(
        engine: Arc<E>,
        vault: Arc<dyn CredentialVault>,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            registry: RegistryClient::new(),
            vault,
            store,
            notifier,
        }
    }

    /// Checks a single image reference for an update, persisting and notifying on the
    /// outcome.
    #[tracing::instrument(skip(self), fields(image_id))]
    pub async fn check_one(&self, raw_ref: &str, image_id: &str) -> Result<SingleCheckResult> {
        let reference = ImageReference::normalize(raw_ref)?;
        let (credential, insecure) = resolve_credential(&[], self.vault.as_ref(), &reference.host).await;

        let checker = DigestChecker::new(self.engine.as_ref());
        let start = std::time::Instant::now();
        let lookup = self.registry.digest(&reference, credential.as_ref(), insecure).await;

        let record = match lookup {
            Ok(lookup) => {
                let check = checker.needs_update(&reference, image_id, Some(lookup.digest.clone())).await?;
                let record = ImageUpdateRecord {
                    image_id: image_id.to_string(),
                    repository: reference.repository.clone(),
                    tag: reference.tag.clone(),
                    has_update: check.needs_update,
                    update_type: check.needs_update.then_some(UpdateType::Digest),
                    current_digest: check.local_digests.first().map(|d| d.to_string()),
                    latest_digest: Some(lookup.digest.to_string()),
                    check_time: now(),
                    response_time_ms: lookup.elapsed.as_millis() as u64,
                    last_error: None,
                    auth_method: Some(auth_method_label(&lookup.auth_method)),
                    auth_username: auth_username(&lookup.auth_method),
                    auth_registry: reference.host.clone(),
                    used_credential: matches!(lookup.auth_method, AuthMethod::Credential { .. }),
                };
                if record.has_update {
                    self.notifier.notify_one(&ImageChangeNotice {
                        image_ref: reference.to_string(),
                        current_digest: record.current_digest.clone().unwrap_or_default(),
                        latest_digest: record.latest_digest.clone().unwrap_or_default(),
                        update_type: UpdateType::Digest,
                    });
                }
                record
            }
            Err(err) => {
                warn!(?err, "registry probe failed");
                ImageUpdateRecord {
                    image_id: image_id.to_string(),
                    repository: reference.repository.clone(),
                    tag: reference.tag.clone(),
                    has_update: false,
                    update_type: None,
                    current_digest: None,
                    latest_digest: None,
                    check_time: now(),
                    response_time_ms: start.elapsed().as_millis() as u64,
                    last_error: Some(err.to_string()),
                    auth_method: None,
                    auth_username: None,
                    auth_registry: reference.host.clone(),
                    used_credential: false,
                }
            }
        };

        self.store.upsert(record.clone());
        Ok(SingleCheckResult { record })
    }

    /// Checks many `(raw_ref, image_id)` pairs. Refs are first grouped by host so each
    /// host's auth is negotiated once — a single challenge probe plus one multi-scope
    /// token request covering every repository hosted there — rather than once per
    /// image; only when a host's cached token turns out not to cover a particular
    /// repo (a registry that rejected the multi-scope request and handed back a
    /// narrower grant) does that image fall back to the single-image cascade used by
    /// [`check_one`](Self::check_one). Per-image work then fans out with bounded
    /// concurrency (at most [`MAX_CONCURRENT_PROBES`] at a time), writing results into
    /// a single mutex-guarded map as each worker finishes.
    ///
    /// `external_creds` are credentials supplied for this call only; for any host they
    /// cover, they take priority over both the bound vault and `~/.docker/config.json`.
    #[tracing::instrument(skip(self, images, external_creds), fields(count = images.len()))]
    pub async fn check_many(
        &self,
        images: &[(String, String)],
        external_creds: &[Credential],
    ) -> Result<Vec<SingleCheckResult>>
    where
        E: Send + Sync,
    {
        let parsed: Vec<(ImageReference, String)> = images
            .iter()
            .filter_map(|(raw_ref, image_id)| ImageReference::normalize(raw_ref).ok().map(|r| (r, image_id.clone())))
            .collect();

        let mut repos_by_host: HashMap<String, Vec<String>> = HashMap::new();
        for (reference, _) in &parsed {
            let repos = repos_by_host.entry(reference.host.clone()).or_default();
            if !repos.contains(&reference.repository) {
                repos.push(reference.repository.clone());
            }
        }

        let mut host_auth: HashMap<String, HostAuth> = HashMap::new();
        for (host, repos) in &repos_by_host {
            let Some((sample, _)) = parsed.iter().find(|(r, _)| &r.host == host) else {
                continue;
            };
            let (registry_credential, insecure) = resolve_credential(external_creds, self.vault.as_ref(), host).await;

            let auth = match self.registry.probe_auth(sample, insecure).await {
                Ok(None) => HostAuth {
                    insecure,
                    tokens: None,
                    method: AuthMethod::None,
                },
                Ok(Some(challenge)) => match self
                    .registry
                    .resolve_batch_tokens(&challenge, repos, registry_credential.as_ref())
                    .await
                {
                    Ok((tokens, method)) => HostAuth {
                        insecure,
                        tokens: Some(tokens),
                        method,
                    },
                    Err(err) => {
                        debug!(?err, host, "batch token acquisition failed, falling back per-image");
                        HostAuth {
                            insecure,
                            tokens: None,
                            method: AuthMethod::None,
                        }
                    }
                },
                Err(err) => {
                    debug!(?err, host, "auth probe failed, falling back per-image");
                    HostAuth {
                        insecure,
                        tokens: None,
                        method: AuthMethod::None,
                    }
                }
            };
            host_auth.insert(host.clone(), auth);
        }
        let host_auth = Arc::new(host_auth);

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let results: Arc<Mutex<HashMap<String, SingleCheckResult>>> = Arc::new(Mutex::new(HashMap::new()));
        let external_creds = Arc::new(external_creds.to_vec());

        let mut joins = tokio::task::JoinSet::new();
        for (reference, image_id) in parsed {
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let host_auth = Arc::clone(&host_auth);
            let external_creds = Arc::clone(&external_creds);
            let service = self.clone();
            joins.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                match service
                    .check_one_cached(&reference, &image_id, host_auth.get(&reference.host), &external_creds)
                    .await
                {
                    Ok(result) => {
                        results.lock().await.insert(image_id, result);
                    }
                    Err(err) => {
                        debug!(?err, %reference, "skipping image after probe error");
                    }
                }
            });
        }

        while joins.join_next().await.is_some() {}

        let collected: Vec<SingleCheckResult> = results.lock().await.values().cloned().collect();

        let notices: Vec<ImageChangeNotice> = collected
            .iter()
            .filter(|r| r.record.has_update)
            .map(|r| ImageChangeNotice {
                image_ref: format!("{}:{}", r.record.repository, r.record.tag),
                current_digest: r.record.current_digest.clone().unwrap_or_default(),
                latest_digest: r.record.latest_digest.clone().unwrap_or_default(),
                update_type: UpdateType::Digest,
            })
            .collect();
        if !notices.is_empty() {
            self.notifier.notify_batch(&notices);
        }

        Ok(collected)
    }

    /// Checks one image as part of a batch, preferring a host-cached token (from
    /// [`check_many`](Self::check_many)'s auth negotiation) and falling back to the
    /// full single-image cascade when no cached token covers this repository or the
    /// cached token is rejected (`unauthorized`) — the one retry-on-`unauthorized`
    /// the batch protocol promises per image.
    async fn check_one_cached(
        &self,
        reference: &ImageReference,
        image_id: &str,
        host_auth: Option<&HostAuth>,
        external_creds: &[Credential],
    ) -> Result<SingleCheckResult> {
        let checker = DigestChecker::new(self.engine.as_ref());
        let start = std::time::Instant::now();

        let cached_lookup = match host_auth {
            Some(auth) if auth.tokens.is_none() => {
                // Host needs no auth at all; a direct cached-token (token=None) lookup
                // is exactly the anonymous path and never needs a fallback.
                let digest = self.registry.digest_with_token(reference, None, auth.insecure).await;
                Some(digest.map(|digest| (digest, auth.method.clone())))
            }
            Some(auth) => match auth.tokens.as_ref().and_then(|tokens| tokens.get(&reference.repository)) {
                Some(token) => {
                    let digest = self.registry.digest_with_token(reference, Some(token), auth.insecure).await;
                    match digest {
                        Ok(digest) => Some(Ok((digest, auth.method.clone()))),
                        Err(_) => None, // token didn't cover this repo; fall through to the full cascade
                    }
                }
                None => None,
            },
            None => None,
        };

        let record = if let Some(lookup) = cached_lookup {
            match lookup {
                Ok((digest, method)) => {
                    let elapsed = start.elapsed();
                    self.record_success(reference, image_id, &checker, digest, elapsed, &method, None)
                        .await?
                }
                Err(err) => self.record_failure(reference, image_id, start.elapsed(), &err),
            }
        } else {
            // No usable cached token for this repo: fall back to the same
            // credential-cascade path a standalone `check_one` call would take.
            let (credential, insecure) = resolve_credential(external_creds, self.vault.as_ref(), &reference.host).await;
            match self.registry.digest(reference, credential.as_ref(), insecure).await {
                Ok(lookup) => {
                    self.record_success(
                        reference,
                        image_id,
                        &checker,
                        lookup.digest,
                        lookup.elapsed,
                        &lookup.auth_method,
                        auth_username(&lookup.auth_method),
                    )
                    .await?
                }
                Err(err) => self.record_failure(reference, image_id, start.elapsed(), &err),
            }
        };

        self.store.upsert(record.clone());
        if record.has_update {
            self.notifier.notify_one(&ImageChangeNotice {
                image_ref: reference.to_string(),
                current_digest: record.current_digest.clone().unwrap_or_default(),
                latest_digest: record.latest_digest.clone().unwrap_or_default(),
                update_type: UpdateType::Digest,
            });
        }
        Ok(SingleCheckResult { record })
    }

    async fn record_success(
        &self,
        reference: &ImageReference,
        image_id: &str,
        checker: &DigestChecker<'_, E>,
        digest: crate::Digest,
        elapsed: std::time::Duration,
        method: &AuthMethod,
        username_override: Option<String>,
    ) -> Result<ImageUpdateRecord> {
        let check = checker.needs_update(reference, image_id, Some(digest.clone())).await?;
        Ok(ImageUpdateRecord {
            image_id: image_id.to_string(),
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            has_update: check.needs_update,
            update_type: check.needs_update.then_some(UpdateType::Digest),
            current_digest: check.local_digests.first().map(|d| d.to_string()),
            latest_digest: Some(digest.to_string()),
            check_time: now(),
            response_time_ms: elapsed.as_millis() as u64,
            last_error: None,
            auth_method: Some(auth_method_label(method)),
            auth_username: username_override.or_else(|| auth_username(method)),
            auth_registry: reference.host.clone(),
            used_credential: matches!(method, AuthMethod::Credential { .. }),
        })
    }

    fn record_failure(
        &self,
        reference: &ImageReference,
        image_id: &str,
        elapsed: std::time::Duration,
        err: &color_eyre::Report,
    ) -> ImageUpdateRecord {
        warn!(?err, "registry probe failed");
        ImageUpdateRecord {
            image_id: image_id.to_string(),
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            has_update: false,
            update_type: None,
            current_digest: None,
            latest_digest: None,
            check_time: now(),
            response_time_ms: elapsed.as_millis() as u64,
            last_error: Some(err.to_string()),
            auth_method: None,
            auth_username: None,
            auth_registry: reference.host.clone(),
            used_credential: false,
        }
    }
}

/// A host's cached batch auth, resolved once per [`UpdateProbeService::check_many`]
/// run and shared across every repository probed on that host.
struct HostAuth {
    insecure: bool,
    /// `None` when the host needs no auth; `Some` (possibly not covering every repo,
    /// if the registry rejected the multi-scope request for one) otherwise.
    tokens: Option<HashMap<String, crate::credential::SecretToken>>,
    method: AuthMethod,
}

/// Resolves a registry credential for `host`: an externally-supplied credential (from
/// the current batch call) takes priority over the vault, which in turn takes priority
/// over `~/.docker/config.json`. Returns alongside whether that credential's host
/// should be reached over plaintext HTTP.
async fn resolve_credential(
    external: &[Credential],
    vault: &dyn CredentialVault,
    host: &str,
) -> (Option<RegistryCredential>, bool) {
    let external_vault = StaticVault::new(external.to_vec());
    if let Some(credential) = CredentialResolver::resolve(&external_vault, host) {
        let insecure = credential.insecure;
        return (
            Some(RegistryCredential {
                username: credential.username,
                password: Some(credential.token),
            }),
            insecure,
        );
    }
    if let Some(credential) = CredentialResolver::resolve(vault, host) {
        let insecure = credential.insecure;
        return (
            Some(RegistryCredential {
                username: credential.username,
                password: Some(credential.token),
            }),
            insecure,
        );
    }
    match CredentialResolver::resolve_docker_config(host).await {
        Ok(Some(credential)) => {
            let insecure = credential.insecure;
            (
                Some(RegistryCredential {
                    username: credential.username,
                    password: Some(credential.token),
                }),
                insecure,
            )
        }
        _ => (None, false),
    }
}

fn auth_method_label(method: &AuthMethod) -> String {
    match method {
        AuthMethod::None => "none".to_string(),
        AuthMethod::Anonymous => "anonymous".to_string(),
        AuthMethod::Credential { .. } => "credential".to_string(),
    }
}

fn auth_username(method: &AuthMethod) -> Option<String> {
    match method {
        AuthMethod::Credential { username } => Some(username.clone()),
        _ => None,
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_store_round_trip() {
        let store = InMemoryRecordStore::default();
        let record = ImageUpdateRecord {
            image_id: "sha256:abc".to_string(),
            repository: "library/redis".to_string(),
            tag: "latest".to_string(),
            has_update: true,
            update_type: Some(UpdateType::Digest),
            current_digest: Some("sha256:aaa".to_string()),
            latest_digest: Some("sha256:bbb".to_string()),
            check_time: now(),
            response_time_ms: 10,
            last_error: None,
            auth_method: Some("anonymous".to_string()),
            auth_username: None,
            auth_registry: "docker.io".to_string(),
            used_credential: false,
        };
        store.upsert(record.clone());
        assert_eq!(store.get("sha256:abc").map(|r| r.has_update), Some(true));

        store.clear_has_update("sha256:abc");
        assert_eq!(store.get("sha256:abc").map(|r| r.has_update), Some(false));
    }

    #[test]
    fn sweep_orphaned_drops_missing_ids() {
        let store = InMemoryRecordStore::default();
        store.upsert(ImageUpdateRecord {
            image_id: "sha256:keep".to_string(),
            repository: "r".to_string(),
            tag: "t".to_string(),
            has_update: false,
            update_type: None,
            current_digest: None,
            latest_digest: None,
            check_time: now(),
            response_time_ms: 0,
            last_error: None,
            auth_method: None,
            auth_username: None,
            auth_registry: "docker.io".to_string(),
            used_credential: false,
        });
        store.upsert(ImageUpdateRecord {
            image_id: "sha256:drop".to_string(),
            repository: "r".to_string(),
            tag: "t".to_string(),
            has_update: false,
            update_type: None,
            current_digest: None,
            latest_digest: None,
            check_time: now(),
            response_time_ms: 0,
            last_error: None,
            auth_method: None,
            auth_username: None,
            auth_registry: "docker.io".to_string(),
            used_credential: false,
        });

        store.sweep_orphaned(&["sha256:keep".to_string()]);
        assert!(store.get("sha256:keep").is_some());
        assert!(store.get("sha256:drop").is_none());
    }
}
