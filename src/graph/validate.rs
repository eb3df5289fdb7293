//! Graph validation
//!
//! Promotes a raw [`Graph`] into a [`ValidatedGraph`]: duplicate ids,
//! unknown endpoints, per-kind configuration defects, and cycles across
//! enabled non-compensation edges are all fatal before any worker starts.

use std::collections::{HashMap, HashSet};

use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::types::{
    BranchConfig, ContainerConfig, EdgeDescriptor, ForeachConfig, Graph, SubflowConfig,
    SwitchConfig, UserTaskConfig, VertexDescriptor, VertexKind, WhileConfig,
};

/// A graph that passed structural validation; immutable afterwards
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: Graph,
    entries: Vec<String>,
}

impl ValidatedGraph {
    /// Validate a graph, consuming it on success
    pub fn validate(graph: Graph) -> WorkflowResult<Self> {
        check_duplicate_ids(&graph.vertices)?;
        check_endpoints(&graph)?;
        for vertex in &graph.vertices {
            check_vertex_config(vertex)?;
        }
        check_cycles(&graph.vertices, &graph.edges)?;
        let entries = detect_entries(&graph)?;
        Ok(Self { graph, entries })
    }

    /// The underlying definition
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Graph identifier
    pub fn id(&self) -> &str {
        &self.graph.id
    }

    /// Vertex descriptors in declaration order
    pub fn vertices(&self) -> &[VertexDescriptor] {
        &self.graph.vertices
    }

    /// Edge descriptors in declaration order
    pub fn edges(&self) -> &[EdgeDescriptor] {
        &self.graph.edges
    }

    /// Look up a vertex by id
    pub fn vertex(&self, id: &str) -> Option<&VertexDescriptor> {
        self.graph.vertices.iter().find(|v| v.id == id)
    }

    /// Entry vertex ids: the explicit override, or every vertex without an
    /// enabled non-compensation inbound edge
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Ids reachable from the entry set over enabled non-compensation edges
    pub fn reachable(&self) -> HashSet<String> {
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in routable_edges(&self.graph.edges) {
            out.entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<&str> = self.entries.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.to_string()) {
                continue;
            }
            if let Some(targets) = out.get(id) {
                stack.extend(targets.iter().copied());
            }
        }
        seen
    }
}

fn routable_edges(edges: &[EdgeDescriptor]) -> impl Iterator<Item = &EdgeDescriptor> {
    edges.iter().filter(|e| e.enabled && !e.is_compensation)
}

fn check_duplicate_ids(vertices: &[VertexDescriptor]) -> WorkflowResult<()> {
    let mut seen = HashSet::new();
    for vertex in vertices {
        if !seen.insert(vertex.id.as_str()) {
            return Err(WorkflowError::Validation {
                reason: format!("duplicate vertex id '{}'", vertex.id),
            });
        }
    }
    Ok(())
}

fn check_endpoints(graph: &Graph) -> WorkflowResult<()> {
    let ids: HashSet<&str> = graph.vertices.iter().map(|v| v.id.as_str()).collect();
    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                return Err(WorkflowError::Validation {
                    reason: format!(
                        "edge {} -> {} references unknown vertex '{}'",
                        edge.source, edge.target, endpoint
                    ),
                });
            }
        }
    }
    for vertex in &graph.vertices {
        for (label, reference) in [
            ("fallback", &vertex.fallback),
            ("compensation", &vertex.compensation),
        ] {
            if let Some(target) = reference {
                if !ids.contains(target.as_str()) {
                    return Err(WorkflowError::Validation {
                        reason: format!(
                            "vertex '{}' names unknown {} vertex '{}'",
                            vertex.id, label, target
                        ),
                    });
                }
            }
        }
    }
    if let Some(entry) = &graph.entry_vertex {
        if !ids.contains(entry.as_str()) {
            return Err(WorkflowError::Validation {
                reason: format!("entry vertex '{}' does not exist", entry),
            });
        }
    }
    Ok(())
}

fn config_error(vertex: &VertexDescriptor, detail: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Validation {
        reason: format!(
            "vertex '{}' ({}) has invalid configuration: {}",
            vertex.id,
            vertex.kind.as_str(),
            detail
        ),
    }
}

fn check_vertex_config(vertex: &VertexDescriptor) -> WorkflowResult<()> {
    match vertex.kind {
        VertexKind::UserTask => {
            let config: UserTaskConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.handler.is_empty() {
                return Err(config_error(vertex, "handler name is empty"));
            }
        }
        VertexKind::Branch => {
            let config: BranchConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.condition.trim().is_empty() {
                return Err(config_error(vertex, "condition is empty"));
            }
        }
        VertexKind::Switch => {
            let config: SwitchConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.expression.trim().is_empty() {
                return Err(config_error(vertex, "expression is empty"));
            }
        }
        VertexKind::Foreach => {
            let config: ForeachConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.item_var.is_empty() {
                return Err(config_error(vertex, "item_var is empty"));
            }
            if config.expression.is_none() == config.items.is_none() {
                return Err(config_error(
                    vertex,
                    "exactly one of 'expression' or 'items' must be set",
                ));
            }
        }
        VertexKind::WhileLoop => {
            let config: WhileConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.condition.trim().is_empty() {
                return Err(config_error(vertex, "condition is empty"));
            }
            if config.max_iterations == 0 {
                return Err(config_error(vertex, "max_iterations must be positive"));
            }
        }
        VertexKind::Subflow => {
            let config: SubflowConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.graph.is_none() == config.path.is_none() {
                return Err(config_error(
                    vertex,
                    "exactly one of 'graph' or 'path' must be set",
                ));
            }
        }
        VertexKind::Container => {
            let config: ContainerConfig =
                vertex.typed_config().map_err(|e| config_error(vertex, e))?;
            if config.vertices.is_empty() {
                return Err(config_error(vertex, "container has no children"));
            }
            check_duplicate_ids(&config.vertices).map_err(|e| config_error(vertex, e))?;
            let ids: HashSet<&str> = config.vertices.iter().map(|v| v.id.as_str()).collect();
            for edge in &config.edges {
                for endpoint in [&edge.source, &edge.target] {
                    if !ids.contains(endpoint.as_str()) {
                        return Err(config_error(
                            vertex,
                            format!("child edge references unknown vertex '{}'", endpoint),
                        ));
                    }
                }
            }
            for child in &config.vertices {
                check_vertex_config(child).map_err(|e| config_error(vertex, e))?;
            }
            check_cycles(&config.vertices, &config.edges).map_err(|e| config_error(vertex, e))?;
        }
        VertexKind::Trigger => {
            return Err(config_error(vertex, "vertex kind not supported"));
        }
    }
    Ok(())
}

/// DFS cycle detection over enabled non-compensation edges; the error names
/// every vertex on the offending cycle.
fn check_cycles(vertices: &[VertexDescriptor], edges: &[EdgeDescriptor]) -> WorkflowResult<()> {
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in routable_edges(edges) {
        out.entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = vertices
        .iter()
        .map(|v| (v.id.as_str(), Mark::Unvisited))
        .collect();

    fn visit<'a>(
        id: &'a str,
        out: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::InProgress);
        path.push(id);
        for &next in out.get(id).into_iter().flatten() {
            match marks.get(next).copied().unwrap_or(Mark::Done) {
                Mark::InProgress => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, out, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for vertex in vertices {
        if marks.get(vertex.id.as_str()) == Some(&Mark::Unvisited) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(vertex.id.as_str(), &out, &mut marks, &mut path) {
                return Err(WorkflowError::Validation {
                    reason: format!("cycle detected: {}", cycle.join(" -> ")),
                });
            }
        }
    }
    Ok(())
}

fn detect_entries(graph: &Graph) -> WorkflowResult<Vec<String>> {
    if let Some(entry) = &graph.entry_vertex {
        return Ok(vec![entry.clone()]);
    }
    let with_inbound: HashSet<&str> = routable_edges(&graph.edges)
        .map(|e| e.target.as_str())
        .collect();
    let entries: Vec<String> = graph
        .vertices
        .iter()
        .filter(|v| !with_inbound.contains(v.id.as_str()))
        .map(|v| v.id.clone())
        .collect();
    if entries.is_empty() && !graph.vertices.is_empty() {
        return Err(WorkflowError::Validation {
            reason: "no entry vertex: every vertex has an inbound edge".to_string(),
        });
    }
    Ok(entries)
}
