//! Recreates a single container against a new image, preserving its configuration
//! and working around the networking edge cases `NetworkMode=host`/`container:...`
//! introduce, via stop -> remove -> create -> start against the engine.

use std::future::Future;

use bollard::{
    container::{Config as ContainerConfig, NetworkingConfig},
    models::ContainerInspectResponse,
};
use color_eyre::{eyre::Context, Result};
use tracing::{info, warn};

use crate::{
    engine::Engine,
    event::{Event, EventSink, ResourceType, Severity},
    inuse::SELF_IDENTIFYING_LABEL,
};

/// Default label clients can set on a container to override the signal used to stop
/// it gracefully before removal.
pub const STOP_SIGNAL_LABEL: &str = "com.getarcaneapp.stop-signal";

/// External collaborator contract for the self-update special case: a container
/// identified as the updater application itself must not be recreated inline (the
/// process would terminate mid-operation), so its "recreation" is delegated here.
pub trait SelfUpgrade: Send + Sync {
    /// Triggers an external upgrade flow (e.g. re-exec via the host CLI) and reports
    /// whether it was successfully kicked off.
    fn trigger_upgrade_via_cli(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of attempting to recreate one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreateOutcome {
    /// The container was stopped, removed, recreated, and started successfully.
    Updated {
        /// ID of the container that was removed.
        old_id: String,
        /// ID of the container that was created in its place.
        new_id: String,
    },
    /// The container was the updater application itself; upgrade was delegated.
    SelfUpgraded,
}

/// Recreates containers one at a time against a new image reference.
pub struct ContainerRecreator<'a, E: Engine> {
    engine: &'a E,
    events: &'a dyn EventSink,
}

impl<'a, E: Engine> ContainerRecreator<'a, E> {
    /// Builds a recreator bound to the given engine and event sink.
    pub fn new(engine: &'a E, events: &'a dyn EventSink) -> Self {
        Self { engine, events }
    }

    /// Recreates `container_id` using `new_image`, or delegates to `self_upgrade` if
    /// the container is the updater application itself.
    #[tracing::instrument(skip(self, self_upgrade), fields(container_id))]
    pub async fn recreate(
        &self,
        container_id: &str,
        new_image: &str,
        self_upgrade: &dyn SelfUpgradeDyn,
    ) -> Result<RecreateOutcome> {
        let inspect = self.engine.inspect_container(container_id).await?;

        if is_self(&inspect) {
            info!(container_id, "container is the updater itself; delegating to external upgrade");
            self_upgrade.trigger_upgrade_via_cli_dyn().await?;
            self.emit(container_id, "update", Severity::Success, "self upgrade triggered");
            return Ok(RecreateOutcome::SelfUpgraded);
        }

        let name = inspect
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let stop_signal = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(STOP_SIGNAL_LABEL))
            .cloned();

        self.engine.stop_container(container_id, stop_signal.as_deref()).await?;
        self.emit(container_id, "container", Severity::Info, "stopped");

        self.engine.remove_container(container_id).await?;
        self.emit(container_id, "container", Severity::Info, "removed");

        let config = build_recreate_config(&inspect, new_image)?;
        let created = self
            .engine
            .create_container(&name, config)
            .await
            .with_context(|| format!("recreate container {name}"))?;
        self.emit(&created.id, "container", Severity::Info, "created");

        self.engine.start_container(&created.id).await?;
        self.emit(&created.id, "container", Severity::Success, "started");

        Ok(RecreateOutcome::Updated {
            old_id: container_id.to_string(),
            new_id: created.id,
        })
    }

    fn emit(&self, container_id: &str, kind: &str, severity: Severity, title: &str) {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("containerId".to_string(), container_id.to_string());
        self.events.emit(Event {
            kind: kind.to_string(),
            severity,
            title: title.to_string(),
            resource_type: Some(ResourceType::Container),
            resource_name: Some(container_id.to_string()),
            metadata,
        });
    }
}

/// Object-safe wrapper around [`SelfUpgrade`], since the trait's own method returns
/// an `impl Future` and cannot be used as `&dyn SelfUpgrade` directly.
pub trait SelfUpgradeDyn: Send + Sync {
    /// Triggers the external upgrade, boxed for dynamic dispatch.
    fn trigger_upgrade_via_cli_dyn<'a>(&'a self) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: SelfUpgrade> SelfUpgradeDyn for T {
    fn trigger_upgrade_via_cli_dyn<'a>(&'a self) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.trigger_upgrade_via_cli())
    }
}

fn is_self(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .map(|labels| labels.contains_key(SELF_IDENTIFYING_LABEL))
        .unwrap_or(false)
}

/// Builds the `Config` for a recreated container from the inspected original,
/// substituting the image and applying the `NetworkMode` edge-case mutations.
fn build_recreate_config(inspect: &ContainerInspectResponse, new_image: &str) -> Result<ContainerConfig<String>> {
    let mut config: ContainerConfig<String> = inspect
        .config
        .clone()
        .map(convert_config)
        .unwrap_or_default();
    config.image = Some(new_image.to_string());
    config.host_config = inspect.host_config.clone();

    let network_mode = inspect
        .host_config
        .as_ref()
        .and_then(|hc| hc.network_mode.clone());
    let is_container_mode = network_mode.as_deref().is_some_and(|m| m.starts_with("container:"));
    let is_host_mode = network_mode.as_deref() == Some("host");

    if is_host_mode || is_container_mode {
        config.hostname = None;
        config.domainname = None;
    }

    if is_container_mode {
        config.exposed_ports = None;
        if let Some(host_config) = config.host_config.as_mut() {
            host_config.port_bindings = None;
            host_config.publish_all_ports = None;
        }
    } else {
        let networks = inspect.network_settings.as_ref().and_then(|ns| ns.networks.clone());
        config.networking_config = Some(NetworkingConfig {
            endpoints_config: networks.unwrap_or_default(),
        });
    }

    Ok(config)
}

fn convert_config(inspect_config: bollard::models::ContainerConfig) -> ContainerConfig<String> {
    ContainerConfig {
        hostname: inspect_config.hostname,
        domainname: inspect_config.domainname,
        user: inspect_config.user,
        exposed_ports: inspect_config.exposed_ports,
        env: inspect_config.env,
        cmd: inspect_config.cmd,
        entrypoint: inspect_config.entrypoint,
        image: inspect_config.image,
        labels: inspect_config.labels,
        working_dir: inspect_config.working_dir,
        volumes: inspect_config.volumes,
        tty: inspect_config.tty,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig as InspectConfig, HostConfig, PortBinding};
    use std::collections::HashMap;

    #[test]
    fn stop_signal_label_constant_is_namespaced() {
        assert!(STOP_SIGNAL_LABEL.starts_with("com.getarcaneapp."));
    }

    fn inspect_with_network_mode(mode: &str) -> ContainerInspectResponse {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding { host_ip: None, host_port: Some("8080".to_string()) }]),
        );
        ContainerInspectResponse {
            config: Some(InspectConfig {
                hostname: Some("original-host".to_string()),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                network_mode: Some(mode.to_string()),
                port_bindings: Some(port_bindings),
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn container_network_mode_clears_port_bindings_and_hostname() {
        let inspect = inspect_with_network_mode("container:abc123");
        let config = build_recreate_config(&inspect, "org/app:v2").expect("build config");

        assert_eq!(config.hostname, None);
        assert_eq!(config.exposed_ports, None);
        let host_config = config.host_config.expect("host config carried over");
        assert_eq!(host_config.port_bindings, None);
        assert_eq!(host_config.publish_all_ports, None);
    }

    #[test]
    fn bridge_network_mode_keeps_port_bindings() {
        let inspect = inspect_with_network_mode("bridge");
        let config = build_recreate_config(&inspect, "org/app:v2").expect("build config");

        assert_eq!(config.hostname, Some("original-host".to_string()));
        let host_config = config.host_config.expect("host config carried over");
        assert!(host_config.port_bindings.is_some());
    }
}
