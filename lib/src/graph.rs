//! Extracts container dependency edges and produces a restart order, tolerating
//! cycles by falling back to insertion order rather than ever refusing to proceed.

use std::collections::{HashMap, HashSet, VecDeque};

use color_eyre::Result;
use tracing::warn;

use crate::{engine::Engine, inuse::OptOutLabels};

/// A candidate container for restart, along with the dependency edges extracted
/// from its configuration.
#[derive(Debug, Clone)]
pub struct ContainerWithDeps {
    /// Container ID.
    pub id: String,
    /// Container name, with any leading `/` stripped.
    pub name: String,
    /// The local image ID this container currently runs, i.e. `ContainerSummary.image_id`.
    pub image_id: String,
    /// The `Config.Image` reference the container was created with.
    pub image_ref: String,
    /// Labels, used to detect opt-outs and the stop-signal override.
    pub labels: HashMap<String, String>,
    /// The container's `HostConfig.NetworkMode`, e.g. `bridge`, `host`, `container:foo`.
    pub network_mode: Option<String>,
    /// IDs of containers this one depends on (compose `depends_on`).
    pub depends_on: Vec<String>,
    /// IDs of containers this one legacy-links to.
    pub links: Vec<String>,
    /// IDs of containers this one mounts volumes from.
    pub volumes_from: Vec<String>,
    /// User-defined network names this container is attached to.
    pub networks: Vec<String>,
    /// If `network_mode` is `container:<id>`, the target container's ID.
    pub network_container_target: Option<String>,
}

impl ContainerWithDeps {
    /// The union of every dependency edge this container carries: it must be
    /// restarted *after* each of these.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        deps.extend(self.depends_on.iter().cloned());
        deps.extend(self.links.iter().cloned());
        deps.extend(self.volumes_from.iter().cloned());
        if let Some(target) = &self.network_container_target {
            deps.push(target.clone());
        }
        deps.sort();
        deps.dedup();
        deps
    }
}

/// A directed dependency graph over a candidate restart set: an edge `A -> B` means
/// "A depends on B", so B must be restarted before A.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Builds a graph from the candidate containers, keeping only edges whose target
    /// is itself a candidate (edges pointing outside the restart set are irrelevant
    /// to ordering within it).
    pub fn build(containers: &[ContainerWithDeps]) -> Self {
        let candidate_ids: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        let mut nodes = Vec::with_capacity(containers.len());
        let mut edges = HashMap::new();

        for container in containers {
            nodes.push(container.id.clone());
            let deps = container
                .dependencies()
                .into_iter()
                .filter(|dep| candidate_ids.contains(dep.as_str()))
                .collect();
            edges.insert(container.id.clone(), deps);
        }

        Self { nodes, edges }
    }

    /// Returns container IDs in dependency order (dependencies before dependents).
    /// Ties are broken by insertion order. Cycles are tolerated: when Kahn's
    /// algorithm stalls with nodes remaining, the rest are appended in insertion
    /// order and a warning is logged, rather than refusing to produce an order.
    pub fn topological_sort(&self) -> Vec<String> {
        // in_degree[n] counts how many of n's own dependencies have not yet been
        // resolved (visited); n is ready once this reaches zero.
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.edges.get(n.as_str()).map(Vec::len).unwrap_or(0)))
            .collect();

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| in_degree.get(n.as_str()).copied().unwrap_or(0) == 0)
            .map(String::as_str)
            .collect();

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (node, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        let mut sorted = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            sorted.push(node.to_string());

            if let Some(deps) = dependents.get(node) {
                for &dependent in deps {
                    if let Some(entry) = in_degree.get_mut(dependent) {
                        if *entry > 0 {
                            *entry -= 1;
                        }
                        if *entry == 0 && !visited.contains(dependent) {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() < self.nodes.len() {
            warn!(
                remaining = self.nodes.len() - sorted.len(),
                "dependency cycle detected; falling back to insertion order for the rest"
            );
            for node in &self.nodes {
                if !visited.contains(node.as_str()) {
                    sorted.push(node.clone());
                }
            }
        }

        sorted
    }

    /// Expands a restart set to a fixed point: any container that depends on a
    /// container already in the set is added too, since its dependency's restart
    /// will disrupt it regardless.
    pub fn propagate_restarts(&self, seed: &HashSet<String>) -> HashSet<String> {
        let mut restart = seed.clone();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (node, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        loop {
            let mut added = false;
            for node in &self.nodes {
                if restart.contains(node) {
                    continue;
                }
                if let Some(deps) = self.edges.get(node) {
                    if deps.iter().any(|dep| restart.contains(dep)) {
                        restart.insert(node.clone());
                        added = true;
                    }
                }
            }
            if !added {
                break;
            }
        }

        restart
    }
}

/// Compose's "service depends on service" label, carrying a comma-separated list of
/// `service[:condition[:required]]` entries.
const COMPOSE_DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Walks every running, non-opted-out container and extracts its dependency edges,
/// producing the candidate set [`DependencyGraph::build`] operates on.
///
/// Links and `volumes-from` entries are resolved against the container name they
/// name (`Links`/`VolumesFrom` refer to containers by name, with an optional leading
/// `/`); compose `depends_on` entries are resolved against sibling containers in the
/// same compose project sharing the named service.
pub async fn discover_candidates(engine: &impl Engine) -> Result<Vec<ContainerWithDeps>> {
    let summaries = engine.list_containers(false).await?;

    let mut by_name: HashMap<String, String> = HashMap::new();
    let mut by_service: HashMap<(String, String), String> = HashMap::new();
    for summary in &summaries {
        let Some(id) = summary.id.clone() else { continue };
        for name in summary.names.clone().unwrap_or_default() {
            by_name.insert(name.trim_start_matches('/').to_string(), id.clone());
        }
        let labels = summary.labels.clone().unwrap_or_default();
        if let (Some(project), Some(service)) =
            (labels.get(COMPOSE_PROJECT_LABEL), labels.get(COMPOSE_SERVICE_LABEL))
        {
            by_service.insert((project.clone(), service.clone()), id.clone());
        }
    }

    let mut candidates = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let Some(id) = summary.id.clone() else { continue };
        let labels = summary.labels.clone().unwrap_or_default();
        if OptOutLabels::excludes(&labels) {
            continue;
        }

        let inspect = engine.inspect_container(&id).await?;
        let host_config = inspect.host_config.clone().unwrap_or_default();
        let network_mode = host_config.network_mode.clone();
        let network_container_target = network_mode
            .as_deref()
            .and_then(|m| m.strip_prefix("container:"))
            .map(str::to_string);

        let links = host_config
            .links
            .unwrap_or_default()
            .into_iter()
            .filter_map(|link| {
                let name = link.split(':').next().unwrap_or(&link).trim_start_matches('/');
                by_name.get(name).cloned()
            })
            .collect();

        let volumes_from = host_config
            .volumes_from
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let name = entry.split(':').next().unwrap_or(&entry).trim_start_matches('/');
                by_name.get(name).cloned()
            })
            .collect();

        let project = labels.get(COMPOSE_PROJECT_LABEL).cloned();
        let depends_on = project
            .as_ref()
            .and_then(|project| labels.get(COMPOSE_DEPENDS_ON_LABEL).map(|v| (project, v)))
            .map(|(project, value)| {
                value
                    .split(',')
                    .filter_map(|entry| entry.split(':').next())
                    .filter(|service| !service.is_empty())
                    .filter_map(|service| by_service.get(&(project.clone(), service.to_string())).cloned())
                    .collect()
            })
            .unwrap_or_default();

        let name = summary
            .names
            .as_ref()
            .and_then(|n| n.first())
            .cloned()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        candidates.push(ContainerWithDeps {
            id,
            name,
            image_id: summary.image_id.clone().unwrap_or_default(),
            image_ref: inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .or_else(|| summary.image.clone())
                .unwrap_or_default(),
            labels,
            network_mode,
            depends_on,
            links,
            volumes_from,
            networks: inspect
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .map(|n| n.keys().cloned().collect())
                .unwrap_or_default(),
            network_container_target,
        });
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn container(id: &str, deps: &[&str]) -> ContainerWithDeps {
        ContainerWithDeps {
            id: id.to_string(),
            name: id.to_string(),
            image_id: format!("image-{id}"),
            image_ref: format!("repo/{id}:latest"),
            labels: HashMap::new(),
            network_mode: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            links: Vec::new(),
            volumes_from: Vec::new(),
            networks: Vec::new(),
            network_container_target: None,
        }
    }

    #[test]
    fn sorts_dependencies_before_dependents() {
        let containers = vec![container("web", &["api"]), container("api", &[])];
        let graph = DependencyGraph::build(&containers);
        let sorted = graph.topological_sort();
        let api_pos = sorted.iter().position(|n| n == "api").unwrap();
        let web_pos = sorted.iter().position(|n| n == "web").unwrap();
        assert!(api_pos < web_pos);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let containers = vec![container("a", &[]), container("b", &[]), container("c", &[])];
        let graph = DependencyGraph::build(&containers);
        assert_eq!(graph.topological_sort(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_falls_back_to_insertion_order_without_panicking() {
        let containers = vec![container("a", &["b"]), container("b", &["a"])];
        let graph = DependencyGraph::build(&containers);
        let sorted = graph.topological_sort();
        assert_eq!(sorted.len(), 2);
        assert!(sorted.contains(&"a".to_string()));
        assert!(sorted.contains(&"b".to_string()));
    }

    #[test]
    fn propagates_restart_through_dependents() {
        let containers = vec![
            container("web", &["api"]),
            container("api", &[]),
            container("unrelated", &[]),
        ];
        let graph = DependencyGraph::build(&containers);
        let seed: HashSet<String> = ["api".to_string()].into_iter().collect();
        let restart = graph.propagate_restarts(&seed);
        assert!(restart.contains("web"));
        assert!(restart.contains("api"));
        assert!(!restart.contains("unrelated"));
    }
}
