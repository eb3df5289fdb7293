//! Subflow vertex: an isolated child workflow
//!
//! The child runs in its own engine with its own global bag; parent
//! globals cross the boundary only through explicit input/output mappings.
//! Cancellation propagates through a child token, and cyclic inclusion is
//! cut off by a depth counter.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::engine::EngineBuilder;
use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::{Graph, SubflowConfig, ValidatedGraph, VertexDescriptor};
use crate::instance::{Globals, WorkflowStatus};
use crate::message::{Bag, Fault};
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Runs a child graph to a verdict and maps its outputs back
#[derive(Default)]
pub struct Subflow {
    config: Option<SubflowConfig>,
}

#[async_trait]
impl VertexImpl for Subflow {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: SubflowConfig =
            descriptor
                .typed_config()
                .map_err(|e| WorkflowError::VertexInit {
                    vertex_id: descriptor.id.clone(),
                    reason: e,
                })?;
        if config.graph.is_none() == config.path.is_none() {
            return Err(WorkflowError::VertexInit {
                vertex_id: descriptor.id.clone(),
                reason: "exactly one of 'graph' or 'path' must be set".to_string(),
            });
        }
        self.config = Some(config);
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome> {
        let config = self.config.as_ref().ok_or_else(|| {
            WorkflowError::Internal(format!("subflow '{}' not initialized", ctx.vertex_id))
        })?;
        let hooks = ctx.hooks.clone().ok_or_else(|| {
            WorkflowError::Internal("subflow requires an engine context".to_string())
        })?;

        if hooks.subflow_depth >= hooks.options.max_subflow_depth {
            return Err(WorkflowError::RecursionDepthExceeded {
                depth: hooks.subflow_depth,
            });
        }

        let graph: Graph = match (&config.graph, &config.path) {
            (Some(inline), _) => {
                serde_json::from_value(inline.clone()).map_err(|e| WorkflowError::Codec {
                    reason: format!("inline subflow graph: {}", e),
                })?
            }
            (None, Some(path)) => {
                let bytes = std::fs::read(path).map_err(|e| WorkflowError::Codec {
                    reason: format!("subflow definition '{}': {}", path, e),
                })?;
                hooks.codec.decode(&bytes)?
            }
            (None, None) => {
                return Err(WorkflowError::Internal(
                    "subflow config lost its definition".to_string(),
                ));
            }
        };
        let validated = ValidatedGraph::validate(graph)?;

        // The child sees nothing of the parent except the mapped keys
        let child_globals = Globals::new();
        for (parent_key, child_key) in &config.input_mappings {
            if let Some(value) = ctx.globals.get(parent_key) {
                child_globals.set(child_key.clone(), value);
            }
        }

        let child = EngineBuilder::new(validated)
            .options(hooks.options.clone())
            .evaluator(ctx.evaluator.clone())
            .factory(hooks.factory.clone())
            .clock(ctx.clock.clone())
            .codec(hooks.codec.clone())
            .globals(child_globals.clone())
            .parent_cancel(ctx.cancel.clone())
            .subflow_depth(hooks.subflow_depth + 1)
            .build()?;

        tracing::debug!(
            parent = %ctx.vertex_id,
            child_run = %child.run_id(),
            depth = hooks.subflow_depth + 1,
            "starting subflow"
        );
        let mut handle = child.start()?;

        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .or(hooks.options.subflow_timeout);
        let verdict = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle.verdict()).await {
                Ok(verdict) => verdict,
                Err(_) => {
                    child.cancel();
                    return Err(WorkflowError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => handle.verdict().await,
        };

        match verdict {
            WorkflowStatus::Completed => {
                for (child_key, parent_key) in &config.output_mappings {
                    if let Some(value) = child_globals.get(child_key) {
                        ctx.globals.set(parent_key.clone(), value);
                    }
                }
                let mut output = Bag::new();
                output.insert("SubflowStatus".to_string(), json!("completed"));
                output.insert("SubflowRunId".to_string(), json!(child.run_id()));
                Ok(ExecuteOutcome::with_output(output))
            }
            WorkflowStatus::Cancelled => Err(WorkflowError::Cancelled),
            WorkflowStatus::Failed => Err(WorkflowError::Task {
                fault: child
                    .first_fault()
                    .unwrap_or_else(|| Fault::new("subflow-failed", "child workflow failed")),
            }),
            other => Err(WorkflowError::Internal(format!(
                "subflow verdict was non-terminal: {:?}",
                other
            ))),
        }
    }
}
