//! Compensation walk
//!
//! When a run is about to be declared Failed, vertices that completed are
//! walked in reverse completion order; each with a configured compensation
//! target receives a Complete message carrying the original output bag
//! plus a `CompensationContext` record. Compensation edges become active
//! for events produced during the walk. Best-effort and idempotent:
//! compensation vertices must tolerate repeated triggers with the same
//! context.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::WorkflowEngine;
use crate::instance::{InstanceStatus, VertexInstance};
use crate::message::{Fault, Message, MessageKind};

/// Enqueue one compensation trigger per completed vertex with a target;
/// returns how many were delivered
pub(crate) fn run_walk(engine: &Arc<WorkflowEngine>) -> usize {
    let fault = engine
        .first_fault()
        .unwrap_or_else(|| Fault::new("unknown", "workflow failed"));
    let failed_vertex = engine
        .instances
        .iter()
        .find(|entry| entry.status == InstanceStatus::Failed)
        .map(|entry| entry.vertex_id.clone())
        .unwrap_or_default();

    let mut completed: Vec<VertexInstance> = engine
        .instances
        .iter()
        .filter(|entry| entry.status == InstanceStatus::Completed)
        .map(|entry| entry.value().clone())
        .collect();
    completed.sort_by_key(|instance| std::cmp::Reverse(instance.completion_index.unwrap_or(0)));

    let mut enqueued = 0;
    for instance in completed {
        let Some(descriptor) = engine.graph.vertex(&instance.vertex_id) else {
            continue;
        };
        let Some(target) = &descriptor.compensation else {
            continue;
        };

        let mut payload = instance.output.clone();
        payload.insert(
            "CompensationContext".to_string(),
            json!({
                "failed_vertex": failed_vertex,
                "reason": fault.message,
                "fault_kind": fault.kind,
            }),
        );
        let message = Message {
            kind: MessageKind::Complete,
            source: Some(instance.vertex_id.clone()),
            source_port: None,
            target_port: None,
            payload,
            fault: None,
            iteration: None,
            correlation: Uuid::new_v4(),
        };
        if engine.router.deliver(target, message) {
            tracing::info!(
                vertex_id = %instance.vertex_id,
                target,
                "compensation triggered"
            );
            enqueued += 1;
        }
    }
    enqueued
}
