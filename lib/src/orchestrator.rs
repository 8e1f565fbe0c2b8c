//! Drives the end-to-end `ApplyPending` state machine: load pending update records,
//! collect in-use images, plan pulls, pull, restart in dependency order, prune
//! superseded images, and clear satisfied records.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use color_eyre::Result;
use time::OffsetDateTime;
use tracing::warn;

use crate::{
    classify,
    credential::{Credential, CredentialResolver, CredentialVault},
    digest::DigestChecker,
    engine::{Engine, RegistryAuth},
    event::{AuditSink, AutoUpdateRecord, Event, EventSink, ResourceType, RunStatus, Severity},
    graph::{ContainerWithDeps, DependencyGraph},
    inuse::InUseImageCollector,
    probe::RecordStore,
    recreate::{ContainerRecreator, RecreateOutcome, SelfUpgradeDyn},
    registry::{RegistryClient, RegistryCredential},
    ErrorClass, ImageReference,
};

/// Resolves a credential for `host`: a stored vault entry first, falling back to the
/// local `~/.docker/config.json`, matching the same cascade the probe service uses
/// when checking for updates.
async fn resolve_credential(vault: &dyn CredentialVault, host: &str) -> Option<Credential> {
    match CredentialResolver::resolve(vault, host) {
        Some(credential) => Some(credential),
        None => CredentialResolver::resolve_docker_config(host).await.ok().flatten(),
    }
}

fn pull_auth(credential: &Credential) -> RegistryAuth {
    RegistryAuth {
        username: credential.username.clone(),
        password: Some(credential.token.expose().to_string()),
        identity_token: None,
        server_address: Some(credential.url.clone()),
    }
}

fn registry_credential(credential: &Credential) -> RegistryCredential {
    RegistryCredential {
        username: credential.username.clone(),
        password: Some(credential.token.clone()),
    }
}

/// A transient per-run record of one attempted image update.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// The reference as it currently exists locally.
    pub old_ref: String,
    /// The reference to pull.
    pub new_ref: String,
    /// Local image IDs backing `old_ref`, captured before any pull so a post-pull tag
    /// reassignment can't hide which containers need to move.
    pub old_ids: Vec<String>,
    /// Whether the pull (or pull-skip) step completed.
    pub pulled: bool,
}

/// Options controlling one `ApplyPending` run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// When true, stop after PLAN and report what would happen without pulling or
    /// restarting anything.
    pub dry_run: bool,
}

/// Summary of one `ApplyPending`/`UpdateSingleContainer` run.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    /// Number of resources examined.
    pub checked: usize,
    /// Number of resources successfully updated.
    pub updated: usize,
    /// Number of resources that failed.
    pub failed: usize,
    /// Number of resources intentionally skipped.
    pub skipped: usize,
    /// The plans considered during PLAN, regardless of outcome.
    pub plans: Vec<UpdatePlan>,
}

/// A snapshot of in-progress work, for the advisory `Status` query.
#[derive(Debug, Clone, Default)]
pub struct StatusView {
    /// IDs of containers currently being recreated.
    pub updating_containers: HashSet<String>,
    /// Names of compose projects currently being updated.
    pub updating_projects: HashSet<String>,
}

/// Tracks in-progress work so concurrent callers can query [`StatusView`].
#[derive(Debug, Default)]
pub struct ProgressTracker {
    containers: Mutex<HashSet<String>>,
    projects: Mutex<HashSet<String>>,
}

impl ProgressTracker {
    /// Marks a container as in-progress. Idempotent.
    pub fn start_container(&self, id: &str) {
        if let Ok(mut set) = self.containers.lock() {
            set.insert(id.to_string());
        }
    }

    /// Clears a container's in-progress marker.
    pub fn finish_container(&self, id: &str) {
        if let Ok(mut set) = self.containers.lock() {
            set.remove(id);
        }
    }

    /// Snapshots current progress.
    pub fn status(&self) -> StatusView {
        StatusView {
            updating_containers: self.containers.lock().map(|s| s.clone()).unwrap_or_default(),
            updating_projects: self.projects.lock().map(|s| s.clone()).unwrap_or_default(),
        }
    }
}

/// Drives `ApplyPending` and `UpdateSingleContainer` over a fixed set of collaborators.
pub struct Orchestrator<'a, E: Engine> {
    engine: &'a E,
    vault: &'a dyn CredentialVault,
    store: &'a dyn RecordStore,
    events: &'a dyn EventSink,
    audit: &'a dyn AuditSink,
    progress: &'a ProgressTracker,
    registry: RegistryClient,
}

impl<'a, E: Engine> Orchestrator<'a, E> {
    /// Builds an orchestrator bound to the given collaborators.
    pub fn new(
        engine: &'a E,
        vault: &'a dyn CredentialVault,
        store: &'a dyn RecordStore,
        events: &'a dyn EventSink,
        audit: &'a dyn AuditSink,
        progress: &'a ProgressTracker,
    ) -> Self {
        Self {
            engine,
            vault,
            store,
            events,
            audit,
            progress,
            registry: RegistryClient::new(),
        }
    }

    /// Runs the full `ApplyPending` state machine:
    /// `START -> LOAD_RECORDS -> COLLECT_IN_USE -> PLAN -> PULL -> RESTART -> PRUNE -> CLEAR_RECORDS -> COMPLETE`.
    #[tracing::instrument(skip(self, pending, containers, self_upgrade))]
    pub async fn apply_pending(
        &self,
        pending: &[(ImageReference, String, String)], // (reference, image_id, latest_digest)
        containers: &[ContainerWithDeps],
        options: ApplyOptions,
        self_upgrade: &dyn SelfUpgradeDyn,
    ) -> Result<ApplyResult> {
        self.emit_phase("start", "beginning update run");

        // LOAD_RECORDS is implicit: `pending` is already the caller's filtered set of
        // records with has_update = true.

        // COLLECT_IN_USE
        let in_use = InUseImageCollector::new(self.engine).collect().await.unwrap_or_default();

        // PLAN
        let mut plans = Vec::new();
        let checker = DigestChecker::new(self.engine);
        for (reference, image_id, _latest_digest) in pending {
            if !in_use.is_empty() && !in_use.contains(&reference.to_string()) {
                continue;
            }
            let old_ids = checker.image_ids_for_ref(reference).await.unwrap_or_default();
            plans.push(UpdatePlan {
                old_ref: reference.to_string(),
                new_ref: reference.to_string(),
                old_ids: if old_ids.is_empty() { vec![image_id.clone()] } else { old_ids },
                pulled: false,
            });
        }

        self.emit_phase("plan", &format!("{} image(s) planned", plans.len()));
        if options.dry_run {
            return Ok(ApplyResult {
                checked: plans.len(),
                plans,
                ..Default::default()
            });
        }

        // PULL
        let mut result = ApplyResult::default();
        let mut old_id_to_new_ref: HashMap<String, String> = HashMap::new();
        for plan in &mut plans {
            result.checked += 1;
            let reference = ImageReference::normalize(&plan.new_ref).ok();
            let credential = match &reference {
                Some(reference) => resolve_credential(self.vault, &reference.host).await,
                None => None,
            };

            // Digest Checker's pre-pull check: if the registry still reports a digest
            // the image already has locally, the pull is a no-op and no container
            // needs to move. This covers upstream reverting between probe and apply.
            if let (Some(reference), Some(anchor_id)) = (&reference, plan.old_ids.first()) {
                let lookup = self
                    .registry
                    .digest(
                        reference,
                        credential.as_ref().map(registry_credential).as_ref(),
                        credential.as_ref().is_some_and(|c| c.insecure),
                    )
                    .await;
                if let Ok(lookup) = lookup {
                    if let Ok(check) = checker.needs_update(reference, anchor_id, Some(lookup.digest)).await {
                        if check.checked_via_api && !check.needs_update {
                            plan.pulled = true;
                            plan.old_ids.clear();
                            result.skipped += 1;
                            self.emit_phase(
                                "image_pull",
                                &format!("{} already up to date, skipping pull", plan.new_ref),
                            );
                            self.audit.record(audit_row(
                                plan.new_ref.clone(),
                                ResourceType::Image,
                                RunStatus::Skipped,
                                Some("image digest unchanged after pull".to_string()),
                            ));
                            continue;
                        }
                    }
                }
            }

            let auth = credential.as_ref().map(pull_auth);
            match self.engine.pull_image(&plan.new_ref, auth).await {
                Ok(()) => {
                    plan.pulled = true;
                    result.updated += 1;
                    self.emit_phase("image_pull", &format!("pulled {}", plan.new_ref));
                    for old_id in &plan.old_ids {
                        old_id_to_new_ref.insert(old_id.clone(), plan.new_ref.clone());
                    }
                }
                Err(err) => {
                    warn!(?err, image = %plan.new_ref, "pull failed");
                    result.failed += 1;
                    self.audit.record(audit_row(
                        plan.new_ref.clone(),
                        ResourceType::Image,
                        RunStatus::Failed,
                        Some(err.to_string()),
                    ));
                }
            }
        }

        // RESTART. ID match (digest-driven pulls) takes priority over ref match
        // (tag-driven record swaps) when a container matches both.
        let old_ref_to_new_ref: HashMap<String, String> = plans
            .iter()
            .filter(|p| p.pulled && p.old_ref != p.new_ref)
            .map(|p| (p.old_ref.clone(), p.new_ref.clone()))
            .collect();

        let restart_seed: HashSet<String> = containers
            .iter()
            .filter(|c| {
                old_id_to_new_ref.contains_key(&c.image_id) || old_ref_to_new_ref.contains_key(&c.image_ref)
            })
            .map(|c| c.id.clone())
            .collect();

        let graph = DependencyGraph::build(containers);
        let restart_set = graph.propagate_restarts(&restart_seed);
        let order = graph
            .topological_sort()
            .into_iter()
            .filter(|id| restart_set.contains(id))
            .collect::<Vec<_>>();

        let recreator = ContainerRecreator::new(self.engine, self.events);
        for container_id in &order {
            result.checked += 1;
            self.progress.start_container(container_id);
            let Some(container) = containers.iter().find(|c| &c.id == container_id) else {
                self.progress.finish_container(container_id);
                continue;
            };

            // An implicitly-restarted container (in `restart_set` but not the seed)
            // keeps its current image: no image change is smuggled in.
            let new_image = old_id_to_new_ref
                .get(&container.image_id)
                .or_else(|| old_ref_to_new_ref.get(&container.image_ref))
                .cloned()
                .unwrap_or_else(|| container.image_ref.clone());

            match recreator.recreate(container_id, &new_image, self_upgrade).await {
                Ok(RecreateOutcome::Updated { new_id, .. }) => {
                    result.updated += 1;
                    self.audit.record(audit_row(
                        new_id,
                        ResourceType::Container,
                        RunStatus::Updated,
                        None,
                    ));
                }
                Ok(RecreateOutcome::SelfUpgraded) => {
                    result.updated += 1;
                }
                Err(err) => {
                    result.failed += 1;
                    let class = classify(&err);
                    warn!(?err, ?class, container_id, "recreate failed");
                    self.audit.record(audit_row(
                        container_id.clone(),
                        ResourceType::Container,
                        RunStatus::Failed,
                        Some(err.to_string()),
                    ));
                }
            }
            self.progress.finish_container(container_id);
        }

        // PRUNE: only image IDs whose pull actually changed digest and that no
        // container references any more.
        let still_in_use: HashSet<String> = self
            .engine
            .list_containers(true)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.image_id)
            .collect();

        for plan in &plans {
            if !plan.pulled {
                continue;
            }
            for old_id in &plan.old_ids {
                if !still_in_use.contains(old_id) {
                    if let Err(err) = self.engine.remove_image(old_id, false).await {
                        warn!(?err, old_id, "prune failed, leaving image in place");
                    } else {
                        self.emit_phase("image_prune", &format!("pruned {old_id}"));
                    }
                }
            }
        }

        // CLEAR_RECORDS: only when no remaining container references the old IDs.
        for plan in &plans {
            if !plan.pulled {
                continue;
            }
            let still_referenced = plan.old_ids.iter().any(|id| still_in_use.contains(id));
            if !still_referenced {
                for old_id in &plan.old_ids {
                    self.store.clear_has_update(old_id);
                }
            }
        }

        self.emit_phase("complete", "update run complete");
        result.plans = plans;
        Ok(result)
    }

    /// Degenerate single-container entry point: skips `LOAD_RECORDS`/`COLLECT_IN_USE`
    /// and drives exactly one plan through the same pipeline.
    pub async fn update_single_container(
        &self,
        container: &ContainerWithDeps,
        reference: ImageReference,
        image_id: String,
        self_upgrade: &dyn SelfUpgradeDyn,
    ) -> Result<ApplyResult> {
        self.apply_pending(
            &[(reference, image_id, String::new())],
            std::slice::from_ref(container),
            ApplyOptions::default(),
            self_upgrade,
        )
        .await
    }

    /// Returns the current in-progress snapshot.
    pub fn status(&self) -> StatusView {
        self.progress.status()
    }

    fn emit_phase(&self, phase: &str, title: &str) {
        let mut metadata = HashMap::new();
        metadata.insert("phase".to_string(), phase.to_string());
        self.events.emit(Event {
            kind: phase.to_string(),
            severity: Severity::Info,
            title: title.to_string(),
            resource_type: None,
            resource_name: None,
            metadata,
        });
    }
}

fn audit_row(
    resource_id: String,
    resource_type: ResourceType,
    status: RunStatus,
    error: Option<String>,
) -> AutoUpdateRecord {
    let now = OffsetDateTime::now_utc();
    AutoUpdateRecord {
        resource_id: resource_id.clone(),
        resource_type,
        resource_name: resource_id,
        status,
        start_time: now,
        end_time: now,
        update_available: true,
        update_applied: matches!(status, RunStatus::Updated),
        old_image_versions: Vec::new(),
        new_image_versions: Vec::new(),
        error,
    }
}
