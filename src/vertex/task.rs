//! User task vertex: an opaque registered handler

use async_trait::async_trait;

use crate::error::WorkflowResult;
use crate::graph::VertexDescriptor;
use crate::vertex::{ExecuteContext, ExecuteOutcome, TaskCall, TaskHandler, VertexImpl};

/// Runs a handler from the factory registry
pub struct UserTask {
    handler: TaskHandler,
}

impl UserTask {
    /// Wrap a resolved handler
    pub fn new(handler: TaskHandler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl VertexImpl for UserTask {
    fn initialize(&mut self, _descriptor: &VertexDescriptor) -> WorkflowResult<()> {
        // Handler resolution happened at build time
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecuteContext) -> WorkflowResult<ExecuteOutcome> {
        let call = TaskCall {
            input: ctx.input.clone(),
            globals: ctx.globals.clone(),
            cancel: ctx.cancel.clone(),
        };
        (self.handler)(call).await
    }
}
