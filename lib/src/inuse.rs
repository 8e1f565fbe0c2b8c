//! Walks running containers to determine which normalized image references the
//! host actually relies on, so the planner can drop update records for images
//! nothing references any more.

use std::collections::HashSet;

use color_eyre::Result;

use crate::{engine::Engine, ImageReference};

/// A label, with the value that means "opt out", recognized by the in-use collector
/// and by restart propagation. The set is closed: any other label is ignored.
#[derive(Debug, Clone, Copy)]
pub struct OptOutLabel {
    /// The label key.
    pub key: &'static str,
    /// The value that disables management for the container bearing this label.
    pub disabled_value: &'static str,
}

/// The closed, documented set of opt-out labels this crate recognizes.
pub struct OptOutLabels;

impl OptOutLabels {
    /// This project's own opt-out label.
    pub const SELF: OptOutLabel = OptOutLabel {
        key: "com.getarcaneapp.arcane.enable",
        disabled_value: "false",
    };

    /// Interop with Watchtower's de-facto standard opt-out label, so migrating a
    /// fleet does not result in a container being managed by two updaters at once.
    pub const WATCHTOWER: OptOutLabel = OptOutLabel {
        key: "com.centurylinklabs.watchtower.enable",
        disabled_value: "false",
    };

    /// Interop with Podman's auto-update opt-out convention.
    pub const PODMAN: OptOutLabel = OptOutLabel {
        key: "io.containers.autoupdate",
        disabled_value: "disabled",
    };

    /// All recognized opt-out labels, in the order they are checked.
    pub const ALL: &'static [OptOutLabel] = &[Self::SELF, Self::WATCHTOWER, Self::PODMAN];

    /// Returns true if any recognized opt-out label is present on `labels` with its
    /// disabling value.
    pub fn excludes(labels: &std::collections::HashMap<String, String>) -> bool {
        Self::ALL
            .iter()
            .any(|opt_out| labels.get(opt_out.key).map(String::as_str) == Some(opt_out.disabled_value))
    }
}

/// The label identifying a container as the updater application itself, whose
/// recreation must be delegated to an external upgrade mechanism instead of being
/// recreated inline.
pub const SELF_IDENTIFYING_LABEL: &str = "com.getarcaneapp.arcane";

/// Collects the set of normalized image references currently relied on by running,
/// non-opted-out containers.
pub struct InUseImageCollector<'a, E: Engine> {
    engine: &'a E,
}

impl<'a, E: Engine> InUseImageCollector<'a, E> {
    /// Builds a collector bound to the given engine.
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Returns the set of canonical `host/repository:tag` strings in use.
    ///
    /// Returns an empty set (rather than an error) when containers can be listed
    /// but none are running, matching the "collector found nothing" contract the
    /// planner uses to decide whether filtering should be skipped. Callers that need
    /// to distinguish "nothing in use" from "collection failed" should inspect the
    /// `Result`'s `Err` case, which only occurs when the container list itself could
    /// not be retrieved.
    pub async fn collect(&self) -> Result<HashSet<String>> {
        let containers = self.engine.list_containers(false).await?;
        let mut in_use = HashSet::new();

        for container in containers {
            let labels = container.labels.clone().unwrap_or_default();
            if OptOutLabels::excludes(&labels) {
                continue;
            }

            if let Some(image) = container.image.as_deref() {
                if let Ok(reference) = ImageReference::normalize(image) {
                    in_use.insert(reference.to_string());
                }
            }

            // Config.Image alone can miss it: the container's backing image may carry
            // additional RepoTags (e.g. a shared base tag) that the planner also needs
            // to treat as in use.
            if let Some(image_id) = container.image_id.as_deref().filter(|id| !id.is_empty()) {
                if let Ok(image) = self.engine.inspect_image(image_id).await {
                    for tag in image.repo_tags.unwrap_or_default() {
                        if let Ok(reference) = ImageReference::normalize(&tag) {
                            in_use.insert(reference.to_string());
                        }
                    }
                }
            }
        }

        Ok(in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn excludes_on_watchtower_label() {
        let mut labels = HashMap::new();
        labels.insert("com.centurylinklabs.watchtower.enable".to_string(), "false".to_string());
        assert!(OptOutLabels::excludes(&labels));
    }

    #[test]
    fn excludes_on_podman_label() {
        let mut labels = HashMap::new();
        labels.insert("io.containers.autoupdate".to_string(), "disabled".to_string());
        assert!(OptOutLabels::excludes(&labels));
    }

    #[test]
    fn unrecognized_label_has_no_effect() {
        let mut labels = HashMap::new();
        labels.insert("some.other.label".to_string(), "false".to_string());
        assert!(!OptOutLabels::excludes(&labels));
    }

    #[test]
    fn enabled_value_does_not_exclude() {
        let mut labels = HashMap::new();
        labels.insert("com.centurylinklabs.watchtower.enable".to_string(), "true".to_string());
        assert!(!OptOutLabels::excludes(&labels));
    }
}
