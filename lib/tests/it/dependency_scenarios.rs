//! Exercises [`DependencyGraph`] end to end against the dependency-propagation and
//! cycle-tolerance scenarios described for the recreator: restart orderings and the
//! implicit-restart fixed point, without needing a live engine.

use std::collections::{HashMap, HashSet};

use arcane_core::{ContainerWithDeps, DependencyGraph};
use pretty_assertions::assert_eq;

fn container(id: &str, image_id: &str, image_ref: &str, depends_on: &[&str]) -> ContainerWithDeps {
    ContainerWithDeps {
        id: id.to_string(),
        name: id.to_string(),
        image_id: image_id.to_string(),
        image_ref: image_ref.to_string(),
        labels: HashMap::new(),
        network_mode: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        links: Vec::new(),
        volumes_from: Vec::new(),
        networks: Vec::new(),
        network_container_target: None,
    }
}

/// Mirrors the "dependency propagation" end-to-end scenario: `web` depends on `api`;
/// only `api`'s image changed. Both must be recreated, in that order, and `web`'s
/// backing image must be unchanged.
#[test]
fn dependency_propagation_scenario() {
    let api = container("c-api", "img-api-old", "org/api:1", &[]);
    let web = container("c-web", "img-web-1", "org/web:1", &["c-api"]);
    let containers = vec![web.clone(), api.clone()];

    let graph = DependencyGraph::build(&containers);

    // Only api's image was pulled.
    let mut old_id_to_new_ref = HashMap::new();
    old_id_to_new_ref.insert("img-api-old".to_string(), "org/api:2".to_string());

    let seed: HashSet<String> = containers
        .iter()
        .filter(|c| old_id_to_new_ref.contains_key(&c.image_id))
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(seed, HashSet::from(["c-api".to_string()]));

    let restart_set = graph.propagate_restarts(&seed);
    assert_eq!(restart_set, HashSet::from(["c-api".to_string(), "c-web".to_string()]));

    let order: Vec<String> = graph
        .topological_sort()
        .into_iter()
        .filter(|id| restart_set.contains(id))
        .collect();
    assert_eq!(order, vec!["c-api".to_string(), "c-web".to_string()]);

    // web's new image is its own unchanged reference: no image change smuggled in.
    let web_new_image = old_id_to_new_ref
        .get(&web.image_id)
        .cloned()
        .unwrap_or_else(|| web.image_ref.clone());
    assert_eq!(web_new_image, "org/web:1");
}

/// A cycle between two containers in the restart set must not deadlock or panic;
/// both are recreated, in insertion order.
#[test]
fn cyclical_dependency_falls_back_to_insertion_order() {
    let a = container("a", "img-a", "org/a:1", &["b"]);
    let b = container("b", "img-b", "org/b:1", &["a"]);
    let containers = vec![a, b];

    let graph = DependencyGraph::build(&containers);
    let order = graph.topological_sort();
    assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
}

/// An unrelated container sharing no dependency edge with the seed must never be
/// swept into the restart set.
#[test]
fn unrelated_container_is_not_restarted() {
    let api = container("c-api", "img-api", "org/api:1", &[]);
    let unrelated = container("c-unrelated", "img-u", "org/u:1", &[]);
    let containers = vec![api.clone(), unrelated];

    let graph = DependencyGraph::build(&containers);
    let seed = HashSet::from(["c-api".to_string()]);
    let restart_set = graph.propagate_restarts(&seed);
    assert!(!restart_set.contains("c-unrelated"));
}
