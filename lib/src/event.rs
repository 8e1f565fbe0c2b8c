//! Semantic records the core emits about its own work, and the narrow traits external
//! collaborators (persistence, notification fan-out) implement to receive them.
//! Transport and templating are deliberately left to those collaborators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What kind of resource an audit record or event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A container image.
    Image,
    /// A running container.
    Container,
}

/// The outcome recorded for a single resource handled during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The resource was examined; no action was needed or taken yet.
    Checked,
    /// The resource was intentionally not acted on (opt-out label, not in use, etc).
    Skipped,
    /// The resource was successfully updated.
    Updated,
    /// An attempt to act on the resource failed.
    Failed,
}

/// One historical audit row: what happened to one resource during one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoUpdateRecord {
    /// ID of the resource this record describes (image ID or container ID).
    pub resource_id: String,
    /// Whether this record describes an image or a container.
    pub resource_type: ResourceType,
    /// Human-readable name (repository:tag, or container name).
    pub resource_name: String,
    /// Outcome of handling this resource.
    pub status: RunStatus,
    /// When work on this resource began.
    pub start_time: OffsetDateTime,
    /// When work on this resource concluded.
    pub end_time: OffsetDateTime,
    /// Whether an update was available for this resource.
    pub update_available: bool,
    /// Whether an update was actually applied.
    pub update_applied: bool,
    /// Image versions/tags in effect before this run, if applicable.
    pub old_image_versions: Vec<String>,
    /// Image versions/tags in effect after this run, if applicable.
    pub new_image_versions: Vec<String>,
    /// Error message, if `status` is `Failed`.
    pub error: Option<String>,
}

/// A semantic progress/outcome event, emitted in state-machine order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The event's own kind, e.g. `"container"`, `"image_pull"`.
    pub kind: String,
    /// How important the event is.
    pub severity: Severity,
    /// A short human-readable title.
    pub title: String,
    /// What kind of resource this event is about, if any.
    pub resource_type: Option<ResourceType>,
    /// Name of the resource this event is about, if any.
    pub resource_name: Option<String>,
    /// Phase-specific structured context.
    pub metadata: HashMap<String, String>,
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no action needed.
    Info,
    /// A successful, notable outcome.
    Success,
    /// A failure worth surfacing.
    Error,
}

/// Receives [`Event`]s as the orchestrator progresses through a run.
pub trait EventSink: Send + Sync {
    /// Records one event.
    fn emit(&self, event: Event);
}

/// An [`EventSink`] that forwards events to `tracing`, matching each [`Severity`] to a
/// tracing level the way the demonstration binary's log output is structured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event.severity {
            Severity::Info => tracing::info!(kind = %event.kind, title = %event.title, ?event.metadata),
            Severity::Success => tracing::info!(kind = %event.kind, title = %event.title, ?event.metadata, "success"),
            Severity::Error => tracing::warn!(kind = %event.kind, title = %event.title, ?event.metadata),
        }
    }
}

/// Persists [`AutoUpdateRecord`]s. Persistence mechanics are an external collaborator's
/// concern; this crate only needs somewhere to append rows.
pub trait AuditSink: Send + Sync {
    /// Appends one audit record.
    fn record(&self, record: AutoUpdateRecord);
}

/// An in-memory [`AuditSink`], useful for the demonstration binary and for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: std::sync::Mutex<Vec<AutoUpdateRecord>>,
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AutoUpdateRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

impl MemoryAuditSink {
    /// Snapshots every record appended so far.
    pub fn records(&self) -> Vec<AutoUpdateRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// A single-image or batch change to notify about.
#[derive(Debug, Clone)]
pub struct ImageChangeNotice {
    /// The canonical reference that changed.
    pub image_ref: String,
    /// The digest the image was previously at.
    pub current_digest: String,
    /// The digest the image is now at upstream.
    pub latest_digest: String,
    /// Whether this was detected as a digest change or a tag swap.
    pub update_type: crate::probe::UpdateType,
}

/// Fans out notifications about detected image updates. Transport (email, webhook,
/// chat) is an external collaborator's concern.
pub trait Notifier: Send + Sync {
    /// Notifies about a single image's update.
    fn notify_one(&self, notice: &ImageChangeNotice);

    /// Notifies about a batch of images' updates at once.
    fn notify_batch(&self, notices: &[ImageChangeNotice]);
}

/// A [`Notifier`] that only logs; useful as a default and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_one(&self, notice: &ImageChangeNotice) {
        tracing::info!(image = %notice.image_ref, current = %notice.current_digest, latest = %notice.latest_digest, "update available");
    }

    fn notify_batch(&self, notices: &[ImageChangeNotice]) {
        tracing::info!(count = notices.len(), "batch update check complete");
    }
}
