//! Foreach vertex: fan a sequence out as one Next event per element

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::EvalError;
use crate::graph::{ForeachConfig, VertexDescriptor};
use crate::message::Bag;
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Iterates a sequence in order, binding each element under the configured
/// item variable and emitting a `Next` per element, then completing with
/// the element count. Cancellation mid-iteration aborts the fan-out.
#[derive(Default)]
pub struct Foreach {
    config: Option<ForeachConfig>,
}

#[async_trait]
impl VertexImpl for Foreach {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: ForeachConfig =
            descriptor
                .typed_config()
                .map_err(|e| WorkflowError::VertexInit {
                    vertex_id: descriptor.id.clone(),
                    reason: e,
                })?;
        if config.expression.is_none() == config.items.is_none() {
            return Err(WorkflowError::VertexInit {
                vertex_id: descriptor.id.clone(),
                reason: "exactly one of 'expression' or 'items' must be set".to_string(),
            });
        }
        self.config = Some(config);
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome> {
        let config = self.config.as_ref().ok_or_else(|| {
            WorkflowError::Internal(format!("foreach '{}' not initialized", ctx.vertex_id))
        })?;

        let items: Vec<Value> = match (&config.items, &config.expression) {
            (Some(items), _) => items.clone(),
            (None, Some(expression)) => {
                match ctx.evaluator.evaluate(expression, &ctx.vars())? {
                    Value::Array(items) => items,
                    other => {
                        return Err(WorkflowError::Evaluation(EvalError::Type {
                            message: format!(
                                "foreach expression must produce a list, got {}",
                                match other {
                                    Value::Null => "null",
                                    Value::Bool(_) => "boolean",
                                    Value::Number(_) => "number",
                                    Value::String(_) => "string",
                                    Value::Object(_) => "map",
                                    Value::Array(_) => "list",
                                }
                            ),
                        }));
                    }
                }
            }
            (None, None) => {
                return Err(WorkflowError::Internal(
                    "foreach config lost its sequence".to_string(),
                ));
            }
        };

        let total = items.len();
        for (index, element) in items.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let mut payload = Bag::new();
            payload.insert(config.item_var.clone(), element);
            payload.insert("Index".to_string(), json!(index));
            ctx.emit_next(payload, index as u64, None);
            ctx.progress(format!("iteration {} of {}", index + 1, total));
        }

        let mut output = Bag::new();
        output.insert("Count".to_string(), json!(total));
        Ok(ExecuteOutcome::with_output(output))
    }
}
