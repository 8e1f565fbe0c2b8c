#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! Core logic for a Docker fleet auto-updater: probing registries for newer
//! image digests, planning which running containers need to adopt them, and
//! recreating those containers in dependency order.

use color_eyre::Result;

pub mod credential;
pub mod digest;
pub mod engine;
pub mod event;
pub mod graph;
pub mod inuse;
pub mod orchestrator;
pub mod probe;
pub mod recreate;
pub mod reference;
pub mod registry;

pub use credential::{Credential, CredentialVault, SecretToken};
pub use digest::{Digest, DigestChecker};
pub use engine::Engine;
pub use event::{AuditSink, AutoUpdateRecord, EventSink, Notifier, ResourceType, RunStatus};
pub use graph::{discover_candidates, ContainerWithDeps, DependencyGraph};
pub use inuse::{InUseImageCollector, OptOutLabels};
pub use orchestrator::{ApplyOptions, ApplyResult, Orchestrator, StatusView};
pub use probe::{ImageUpdateRecord, RecordStore, UpdateProbeService, UpdateType};
pub use recreate::{ContainerRecreator, SelfUpgrade};
pub use reference::ImageReference;
pub use registry::{AuthMethod, RegistryClient};

/// Users can set this environment variable to specify the default registry host.
/// If not set, the default is [`OCI_DEFAULT_BASE`].
pub const OCI_BASE_VAR: &str = "OCI_DEFAULT_BASE";

/// Users can set this environment variable to specify the default namespace.
/// If not set, the default is [`OCI_DEFAULT_NAMESPACE`].
pub const OCI_NAMESPACE_VAR: &str = "OCI_DEFAULT_NAMESPACE";

/// The default registry host, matching Docker's own shorthand expansion.
pub const OCI_DEFAULT_BASE: &str = "docker.io";

/// The default namespace for single-segment `docker.io` repositories.
pub const OCI_DEFAULT_NAMESPACE: &str = "library";

/// The default registry host.
pub fn oci_base() -> String {
    std::env::var(OCI_BASE_VAR).unwrap_or_else(|_| OCI_DEFAULT_BASE.to_string())
}

/// The default namespace.
pub fn oci_namespace() -> String {
    std::env::var(OCI_NAMESPACE_VAR).unwrap_or_else(|_| OCI_DEFAULT_NAMESPACE.to_string())
}

/// The error taxonomy the orchestrator classifies failures into.
///
/// Internal operations keep reporting rich [`color_eyre::Report`]s; this enum is only
/// the small set of buckets that a per-item run result is ultimately classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum ErrorClass {
    /// Registry or engine timeout, connection reset, and similar blips.
    TransientIo,
    /// Authentication was attempted and rejected.
    AuthDenied,
    /// The referenced image or container no longer exists.
    NotFound,
    /// The reference, credential, or label configuration was invalid.
    Configuration,
    /// An operation completed but produced no observable change (e.g. digest unchanged after pull).
    Integrity,
    /// The run cannot continue at all (e.g. the engine is unreachable).
    Fatal,
}

/// Classifies a [`color_eyre::Report`] into the error taxonomy.
///
/// This is a best-effort heuristic classification based on the report's display text,
/// used only to pick a bucket for audit/event reporting; it never changes control flow.
pub fn classify(err: &color_eyre::Report) -> ErrorClass {
    let text = err.to_string().to_lowercase();
    if text.contains("not found") || text.contains("no such container") || text.contains("404") {
        ErrorClass::NotFound
    } else if text.contains("unauthorized") || text.contains("forbidden") || text.contains("401") || text.contains("403")
    {
        ErrorClass::AuthDenied
    } else if text.contains("timed out") || text.contains("timeout") || text.contains("connection reset") {
        ErrorClass::TransientIo
    } else if text.contains("digest unchanged") {
        ErrorClass::Integrity
    } else if text.contains("invalid reference") || text.contains("invalid platform") || text.contains("missing credential")
    {
        ErrorClass::Configuration
    } else {
        ErrorClass::TransientIo
    }
}

/// Convenience alias matching the rest of the crate's error handling idiom.
pub type CrateResult<T> = Result<T>;
