//! While-loop vertex: condition-driven iteration with settle barriers

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::evaluate_bool;
use crate::graph::{VertexDescriptor, WhileConfig};
use crate::message::{Bag, Fault};
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Re-evaluates its condition before each iteration, emitting one `Next`
/// per iteration and waiting for the emitted message tree to settle before
/// the next evaluation, so body effects on globals are observed. Reaching
/// `max_iterations` is a failure, not a completion.
#[derive(Default)]
pub struct WhileLoop {
    config: Option<WhileConfig>,
}

#[async_trait]
impl VertexImpl for WhileLoop {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: WhileConfig =
            descriptor
                .typed_config()
                .map_err(|e| WorkflowError::VertexInit {
                    vertex_id: descriptor.id.clone(),
                    reason: e,
                })?;
        self.config = Some(config);
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome> {
        let config = self.config.as_ref().ok_or_else(|| {
            WorkflowError::Internal(format!("while '{}' not initialized", ctx.vertex_id))
        })?;

        let mut iterations: u64 = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            // Vars rebuilt each pass: the condition must see body effects
            let proceed = evaluate_bool(ctx.evaluator.as_ref(), &config.condition, &ctx.vars())?;
            if !proceed {
                break;
            }
            if iterations >= config.max_iterations {
                return Err(WorkflowError::Task {
                    fault: Fault::new(
                        "max-iterations",
                        format!(
                            "loop '{}' reached {} iterations without the condition turning false",
                            ctx.vertex_id, config.max_iterations
                        ),
                    ),
                });
            }

            let correlation = Uuid::new_v4();
            let mut payload = Bag::new();
            payload.insert("Iteration".to_string(), json!(iterations));
            ctx.emit_next(payload, iterations, Some(correlation));
            ctx.progress(format!("iteration {}", iterations + 1));

            if !ctx.settle(correlation).await {
                return Err(WorkflowError::Cancelled);
            }
            iterations += 1;
        }

        let mut output = Bag::new();
        output.insert("Iterations".to_string(), json!(iterations));
        Ok(ExecuteOutcome::with_output(output))
    }
}
