//! Switch vertex: multi-way split on a stringified expression value

use async_trait::async_trait;
use serde_json::json;

use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::evaluate_string;
use crate::graph::{SwitchConfig, VertexDescriptor};
use crate::message::Bag;
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Port emitted when no case matches
pub const DEFAULT_PORT: &str = "Default";

/// Matches a stringified expression value against configured case keys.
/// Comparison is case-sensitive and exact; an empty port name in the case
/// map means "use the key as the port".
#[derive(Default)]
pub struct Switch {
    config: Option<SwitchConfig>,
}

#[async_trait]
impl VertexImpl for Switch {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: SwitchConfig =
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
            WorkflowError::Internal(format!("switch '{}' not initialized", ctx.vertex_id))
        })?;
        let value = evaluate_string(ctx.evaluator.as_ref(), &config.expression, &ctx.vars())?;

        let (matched_key, port) = match config.cases.get(&value) {
            Some(port) if port.is_empty() => (Some(value.clone()), value.clone()),
            Some(port) => (Some(value.clone()), port.clone()),
            None => (None, DEFAULT_PORT.to_string()),
        };

        let mut output = Bag::new();
        output.insert("SwitchValue".to_string(), json!(value));
        output.insert(
            "SelectedCase".to_string(),
            matched_key.map(|k| json!(k)).unwrap_or(json!(null)),
        );
        Ok(ExecuteOutcome::with_output(output).on_port(port))
    }
}
