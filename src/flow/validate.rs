//! Structural validation of flow definitions
//!
//! Builds the transition graph with petgraph so unresolved edges and nodes no
//! reactor can reach are found before a definition is registered.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

use crate::context::GLOBAL_SCOPE;
use crate::error::{FlowError, Result};
use crate::flow::types::FlowMeta;
use crate::node::NodeRegistry;

/// Owns the flow's `/flow/{id}/rest` route, so a flow may hold only one
const HTTP_TRIGGER: &str = "http_trigger";

/// Config keys ending with this suffix are treated as extra transitions (e.g. `true_transition`)
const TRANSITION_SUFFIX: &str = "_transition";

/// Flow ids double as file names and context scope keys
pub fn is_safe_flow_id(id: &str) -> bool {
    !id.is_empty()
        && id != GLOBAL_SCOPE
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.')
}

/// Reject definitions whose transitions don't resolve; warn about unreachable nodes
pub fn validate(meta: &FlowMeta, registry: &NodeRegistry) -> Result<()> {
    if !is_safe_flow_id(&meta.id) {
        return Err(FlowError::Validation(format!("'{}' is not a valid flow id", meta.id)));
    }

    let mut graph: DiGraph<&str, &str> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &meta.nodes {
        if node.id.is_empty() {
            return Err(FlowError::Validation("node id can't be empty".into()));
        }
        if index.insert(node.id.as_str(), graph.add_node(node.id.as_str())).is_some() {
            return Err(FlowError::Validation(format!("duplicate node id '{}'", node.id)));
        }
        if !registry.contains(&node.node_type) {
            return Err(FlowError::Validation(format!(
                "node '{}' has unknown type '{}'",
                node.id, node.node_type
            )));
        }
    }

    if meta.nodes.iter().filter(|n| n.node_type == HTTP_TRIGGER).count() > 1 {
        return Err(FlowError::Validation(format!(
            "flow '{}' has more than one {} node",
            meta.id, HTTP_TRIGGER
        )));
    }

    for node in &meta.nodes {
        let from = index[node.id.as_str()];
        let extra = node
            .config
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(key, _)| key.ends_with(TRANSITION_SUFFIX))
            .filter_map(|(key, value)| value.as_str().map(|target| (key.as_str(), target)))
            .filter(|(_, target)| !target.is_empty());

        let mut edges: Vec<(&str, &str)> = node.transitions().collect();
        edges.extend(extra);

        for (kind, target) in edges {
            let to = index.get(target).ok_or_else(|| {
                FlowError::Validation(format!(
                    "node '{}' has {} transition to unknown node '{}'",
                    node.id, kind, target
                ))
            })?;
            graph.add_edge(from, *to, kind);
        }
    }

    warn_unreachable(meta, registry, &graph, &index);
    Ok(())
}

fn warn_unreachable(
    meta: &FlowMeta,
    registry: &NodeRegistry,
    graph: &DiGraph<&str, &str>,
    index: &HashMap<&str, NodeIndex>,
) {
    let mut reachable = vec![false; graph.node_count()];
    for node in &meta.nodes {
        if registry.is_reactor(&node.node_type) != Some(true) {
            continue;
        }
        let mut dfs = Dfs::new(graph, index[node.id.as_str()]);
        while let Some(idx) = dfs.next(graph) {
            reachable[idx.index()] = true;
        }
    }

    for node in &meta.nodes {
        if !reachable[index[node.id.as_str()].index()] {
            tracing::warn!(fid = %meta.id, "Node '{}' can't be reached from any reactor node", node.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::MetaNode;
    use serde_json::json;

    fn node(id: &str, node_type: &str, next: &str) -> MetaNode {
        let mut n = MetaNode::new(id, node_type);
        n.success_transition = next.into();
        n
    }

    fn flow(nodes: Vec<MetaNode>) -> FlowMeta {
        let mut meta = FlowMeta::skeleton("f1");
        meta.nodes = nodes;
        meta
    }

    #[test]
    fn resolving_transitions_pass() {
        let meta = flow(vec![node("a", "trigger", "b"), node("b", "action", "")]);
        assert!(validate(&meta, &NodeRegistry::with_builtin()).is_ok());
    }

    #[test]
    fn empty_flow_is_valid() {
        assert!(validate(&flow(vec![]), &NodeRegistry::with_builtin()).is_ok());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let meta = flow(vec![node("a", "trigger", "ghost")]);
        let err = validate(&meta, &NodeRegistry::with_builtin()).unwrap_err();
        assert!(matches!(err, FlowError::Validation(m) if m.contains("ghost")));
    }

    #[test]
    fn config_transitions_are_checked_too() {
        let mut branch = node("b", "if", "");
        branch.config = json!({ "true_transition": "c", "false_transition": "nowhere" });
        let meta = flow(vec![node("a", "trigger", "b"), branch, node("c", "action", "")]);
        assert!(validate(&meta, &NodeRegistry::with_builtin()).is_err());
    }

    #[test]
    fn duplicate_ids_and_unknown_types_are_rejected() {
        let registry = NodeRegistry::with_builtin();
        assert!(validate(&flow(vec![node("a", "trigger", ""), node("a", "action", "")]), &registry).is_err());
        assert!(validate(&flow(vec![node("a", "teleport", "")]), &registry).is_err());
    }

    #[test]
    fn one_http_trigger_per_flow() {
        let registry = NodeRegistry::with_builtin();
        let single = flow(vec![node("h1", "http_trigger", "r"), node("r", "http_reply", "")]);
        assert!(validate(&single, &registry).is_ok());

        let double = flow(vec![
            node("h1", "http_trigger", "r"),
            node("h2", "http_trigger", "r"),
            node("r", "http_reply", ""),
        ]);
        let err = validate(&double, &registry).unwrap_err();
        assert!(matches!(err, FlowError::Validation(m) if m.contains("http_trigger")));
    }

    #[test]
    fn flow_id_must_be_file_safe() {
        assert!(is_safe_flow_id("9c1e-flow_1.v2"));
        assert!(!is_safe_flow_id("../etc/passwd"));
        assert!(!is_safe_flow_id(""));
        assert!(!is_safe_flow_id("global"));
        let mut meta = flow(vec![]);
        meta.id = "a/b".into();
        assert!(validate(&meta, &NodeRegistry::with_builtin()).is_err());
    }
}
