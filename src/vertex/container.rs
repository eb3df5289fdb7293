//! Container vertex: a private child graph executed inline
//!
//! Children share the parent's global bag but run inside the container's
//! activation rather than through mailboxes. Sequential mode walks the
//! dependency order one child at a time; parallel mode runs each
//! dependency level concurrently. The container completes only when every
//! child completes; any child failure fails the container with an
//! aggregated error.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::{ContainerConfig, ContainerMode, VertexDescriptor};
use crate::message::{Bag, Fault};
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Executes a private child graph to completion
#[derive(Default)]
pub struct Container {
    config: Option<ContainerConfig>,
}

#[async_trait]
impl VertexImpl for Container {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: ContainerConfig =
            descriptor
                .typed_config()
                .map_err(|e| WorkflowError::VertexInit {
                    vertex_id: descriptor.id.clone(),
                    reason: e,
                })?;
        if config.vertices.is_empty() {
            return Err(WorkflowError::VertexInit {
                vertex_id: descriptor.id.clone(),
                reason: "container has no children".to_string(),
            });
        }
        self.config = Some(config);
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome> {
        let config = self.config.as_ref().ok_or_else(|| {
            WorkflowError::Internal(format!("container '{}' not initialized", ctx.vertex_id))
        })?;
        let hooks = ctx.hooks.clone();
        let factory = hooks
            .as_ref()
            .map(|h| h.factory.clone())
            .ok_or_else(|| {
                WorkflowError::Internal("container requires an engine context".to_string())
            })?;

        let levels = dependency_levels(config)?;
        let by_id: HashMap<&str, &VertexDescriptor> = config
            .vertices
            .iter()
            .map(|v| (v.id.as_str(), v))
            .collect();
        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in config.edges.iter().filter(|e| e.enabled && !e.is_compensation) {
            predecessors
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.source.as_str());
        }

        let mut outputs: HashMap<String, Bag> = HashMap::new();
        let mut failures: Vec<(String, Fault)> = Vec::new();

        'levels: for level in levels {
            let mut runnable = Vec::new();
            for child_id in &level {
                let descriptor = by_id.get(child_id.as_str()).ok_or_else(|| {
                    WorkflowError::Internal(format!("container lost child '{}'", child_id))
                })?;
                let mut implementation = factory.build(descriptor)?;
                implementation.initialize(descriptor)?;

                let mut input = ctx.input.clone();
                for predecessor in predecessors.get(child_id.as_str()).into_iter().flatten() {
                    if let Some(bag) = outputs.get(*predecessor) {
                        input.extend(bag.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                let child_ctx = ExecuteContext {
                    vertex_id: child_id.clone(),
                    input,
                    globals: ctx.globals.clone(),
                    cancel: ctx.cancel.child(),
                    evaluator: ctx.evaluator.clone(),
                    clock: ctx.clock.clone(),
                    correlation: ctx.correlation,
                    hooks: hooks.clone(),
                };
                runnable.push((child_id.clone(), implementation, child_ctx));
            }

            match config.mode {
                ContainerMode::Sequential => {
                    for (child_id, implementation, mut child_ctx) in runnable {
                        match implementation.execute(&mut child_ctx).await {
                            Ok(outcome) => {
                                outputs.insert(child_id, outcome.output);
                            }
                            Err(WorkflowError::Cancelled) => {
                                return Err(WorkflowError::Cancelled);
                            }
                            Err(e) => {
                                failures.push((child_id, e.to_fault()));
                                break 'levels;
                            }
                        }
                    }
                }
                ContainerMode::Parallel => {
                    let results = join_all(runnable.into_iter().map(
                        |(child_id, implementation, mut child_ctx)| async move {
                            let result = implementation.execute(&mut child_ctx).await;
                            (child_id, result)
                        },
                    ))
                    .await;
                    let mut cancelled = false;
                    for (child_id, result) in results {
                        match result {
                            Ok(outcome) => {
                                outputs.insert(child_id, outcome.output);
                            }
                            Err(WorkflowError::Cancelled) => cancelled = true,
                            Err(e) => failures.push((child_id, e.to_fault())),
                        }
                    }
                    if cancelled && failures.is_empty() {
                        return Err(WorkflowError::Cancelled);
                    }
                    if !failures.is_empty() {
                        break 'levels;
                    }
                }
            }
        }

        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|(id, fault)| format!("'{}': {}", id, fault))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WorkflowError::Task {
                fault: Fault::new(
                    "container-children-failed",
                    format!(
                        "{} of {} children failed: {}",
                        failures.len(),
                        config.vertices.len(),
                        summary
                    ),
                ),
            });
        }

        let mut output = Bag::new();
        output.insert(
            "Children".to_string(),
            Value::Object(
                outputs
                    .into_iter()
                    .map(|(id, bag)| {
                        (
                            id,
                            Value::Object(bag.into_iter().collect()),
                        )
                    })
                    .collect(),
            ),
        );
        output.insert("ChildCount".to_string(), json!(config.vertices.len()));
        Ok(ExecuteOutcome::with_output(output))
    }
}

/// Kahn layering of the child graph; validation already rejected cycles,
/// so a short result here is an internal defect
fn dependency_levels(config: &ContainerConfig) -> WorkflowResult<Vec<Vec<String>>> {
    let mut in_degree: HashMap<&str, usize> = config
        .vertices
        .iter()
        .map(|v| (v.id.as_str(), 0))
        .collect();
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in config.edges.iter().filter(|e| e.enabled && !e.is_compensation) {
        out.entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
            *degree += 1;
        }
    }

    let mut frontier: VecDeque<&str> = config
        .vertices
        .iter()
        .filter(|v| in_degree.get(v.id.as_str()) == Some(&0))
        .map(|v| v.id.as_str())
        .collect();
    let mut levels = Vec::new();
    let mut placed = 0;
    while !frontier.is_empty() {
        let level: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
        placed += level.len();
        let mut next = VecDeque::new();
        for id in frontier.drain(..) {
            for &target in out.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push_back(target);
                    }
                }
            }
        }
        levels.push(level);
        frontier = next;
    }
    if placed < config.vertices.len() {
        return Err(WorkflowError::Internal(
            "container children form a cycle".to_string(),
        ));
    }
    Ok(levels)
}
