//! Branch vertex: two-way conditional split

use async_trait::async_trait;
use serde_json::json;

use crate::error::{WorkflowError, WorkflowResult};
use crate::eval::evaluate_bool;
use crate::graph::{BranchConfig, VertexDescriptor};
use crate::message::Bag;
use crate::vertex::{ExecuteContext, ExecuteOutcome, VertexImpl};

/// Port emitted when the condition holds
pub const TRUE_PORT: &str = "TrueBranch";
/// Port emitted when the condition does not hold
pub const FALSE_PORT: &str = "FalseBranch";

/// Evaluates a boolean condition and emits on one of two fixed ports
#[derive(Default)]
pub struct Branch {
    config: Option<BranchConfig>,
}

#[async_trait]
impl VertexImpl for Branch {
    fn initialize(&mut self, descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        let config: BranchConfig =
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
            WorkflowError::Internal(format!("branch '{}' not initialized", ctx.vertex_id))
        })?;
        let taken = evaluate_bool(ctx.evaluator.as_ref(), &config.condition, &ctx.vars())?;
        let port = if taken { TRUE_PORT } else { FALSE_PORT };

        let mut output = Bag::new();
        output.insert("BranchTaken".to_string(), json!(port));
        output.insert("ConditionResult".to_string(), json!(taken));
        Ok(ExecuteOutcome::with_output(output).on_port(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VertexKind;
    use crate::instance::Globals;
    use crate::vertex::test_support;

    fn branch(condition: &str) -> Branch {
        let mut descriptor = VertexDescriptor::new("b", "b", VertexKind::Branch);
        descriptor
            .config
            .insert("condition".to_string(), json!(condition));
        let mut branch = Branch::default();
        branch.initialize(&descriptor).unwrap();
        branch
    }

    #[tokio::test]
    async fn test_true_branch() {
        let globals = Globals::new();
        globals.set("x", json!(10));
        let mut ctx = test_support::context("b", Bag::new(), globals);
        let outcome = branch("globals.x > 5").execute(&mut ctx).await.unwrap();
        assert_eq!(outcome.port.as_deref(), Some(TRUE_PORT));
        assert_eq!(outcome.output.get("BranchTaken"), Some(&json!(TRUE_PORT)));
        assert_eq!(outcome.output.get("ConditionResult"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_false_branch() {
        let globals = Globals::new();
        globals.set("x", json!(1));
        let mut ctx = test_support::context("b", Bag::new(), globals);
        let outcome = branch("globals.x > 5").execute(&mut ctx).await.unwrap();
        assert_eq!(outcome.port.as_deref(), Some(FALSE_PORT));
        assert_eq!(outcome.output.get("ConditionResult"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_condition_reads_input() {
        let mut input = Bag::new();
        input.insert("flag".to_string(), json!(true));
        let mut ctx = test_support::context("b", input, Globals::new());
        let outcome = branch("input.flag").execute(&mut ctx).await.unwrap();
        assert_eq!(outcome.port.as_deref(), Some(TRUE_PORT));
    }

    #[tokio::test]
    async fn test_non_boolean_condition_fails() {
        let globals = Globals::new();
        globals.set("x", json!(3));
        let mut ctx = test_support::context("b", Bag::new(), globals);
        let err = branch("globals.x + 1").execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.fault_kind(), "evaluation");
    }
}
