//! Per-vertex worker loop
//!
//! Each worker repeats until shutdown: lease a message, acquire the
//! workflow gate then the vertex-type gate, consult the retry budget and
//! the circuit breaker, execute under the per-call timeout, and translate
//! the outcome into acknowledge/requeue plus routed events.

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::concurrency::PriorityGate;
use crate::engine::{CheckpointPolicy, WorkflowEngine};
use crate::error::WorkflowError;
use crate::events::WorkflowEvent;
use crate::graph::VertexDescriptor;
use crate::instance::{InstanceStatus, VertexInstance};
use crate::mailbox::{LeaseHandle, Mailbox, RequeueResult};
use crate::message::{Fault, Message, MessageKind};
use crate::resilience::{Admission, RetryPolicy, Transition};
use crate::router::RouteEvent;
use crate::vertex::{EngineHooks, ExecuteContext, VertexImpl};

pub(crate) async fn worker_loop(engine: Arc<WorkflowEngine>, vertex_id: String) {
    let Some(descriptor) = engine.graph.vertex(&vertex_id).cloned() else {
        return;
    };
    let Some(mailbox) = engine.mailboxes.get(&vertex_id).cloned() else {
        return;
    };
    let Some(implementation) = engine.vertex_impls.get(&vertex_id).cloned() else {
        return;
    };
    let retry = descriptor
        .retry
        .clone()
        .unwrap_or_else(|| engine.options.default_retry.clone());
    let kind_gate = match engine.kind_gates.get(&descriptor.type_key()) {
        Some(gate) => gate.clone(),
        None => return,
    };

    tracing::debug!(vertex_id, "worker started");
    loop {
        if engine.shutdown.is_cancelled() {
            break;
        }
        engine.wait_resumed().await;
        if engine.shutdown.is_cancelled() {
            break;
        }

        let lease = tokio::select! {
            lease = mailbox.lease(None, &engine.cancel_root) => lease,
            _ = engine.shutdown.cancelled() => break,
        };
        let Some(lease) = lease else {
            if engine.cancel_root.is_cancelled() {
                // Stay parked so the completion detector can settle the run
                engine.shutdown.cancelled().await;
                break;
            }
            continue;
        };

        // A pause that landed while this worker slept in lease() must not
        // admit new work; hand the envelope back untouched
        if engine.is_paused() {
            mailbox.release(lease.lease_id);
            continue;
        }

        engine.active.fetch_add(1, Ordering::SeqCst);
        process_message(
            &engine,
            &descriptor,
            implementation.as_ref(),
            &mailbox,
            &retry,
            &kind_gate,
            lease,
        )
        .await;
        engine.active.fetch_sub(1, Ordering::SeqCst);
        engine.poke();
    }
    tracing::debug!(vertex_id, "worker stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_message(
    engine: &Arc<WorkflowEngine>,
    descriptor: &VertexDescriptor,
    implementation: &dyn VertexImpl,
    mailbox: &Arc<Mailbox>,
    retry: &RetryPolicy,
    kind_gate: &Arc<PriorityGate>,
    lease: LeaseHandle,
) {
    let message = lease.message.clone();
    let correlation = message.correlation;

    // Admission: workflow gate first, kind gate second; permits release in
    // reverse on drop
    let _workflow_permit = match engine
        .workflow_gate
        .acquire(descriptor.priority, &engine.cancel_root)
        .await
    {
        Ok(permit) => permit,
        Err(_) => {
            admission_cancelled(engine, mailbox, &lease, correlation);
            return;
        }
    };
    let _kind_permit = match kind_gate
        .acquire(descriptor.priority, &engine.cancel_root)
        .await
    {
        Ok(permit) => permit,
        Err(_) => {
            admission_cancelled(engine, mailbox, &lease, correlation);
            return;
        }
    };

    // Per-run retry budget: each re-observation of a message counts
    if lease.retry_count > 0 {
        let cap = retry.budget.or(engine.options.retry_budget);
        if let Some(cap) = cap {
            let used = engine.retries_used.fetch_add(1, Ordering::SeqCst) + 1;
            if used > cap {
                tracing::warn!(
                    vertex_id = %descriptor.id,
                    used,
                    cap,
                    "retry budget exhausted"
                );
                let consumed =
                    mailbox.dead_letter(lease.lease_id, "retry-budget-exhausted", None);
                let now = engine.clock.now();
                let instance = VertexInstance::running(&descriptor.id, engine.run_id(), now);
                let instance_id = instance.id;
                engine.instances.insert(instance_id, instance);
                terminal_failure(
                    engine,
                    descriptor,
                    instance_id,
                    now,
                    Fault::new(
                        "retry-budget-exhausted",
                        format!("run-wide retry budget of {} consumed", cap),
                    ),
                    correlation,
                    consumed,
                );
                if consumed {
                    engine.tracker.release(correlation);
                }
                engine.publish_progress();
                return;
            }
        }
    }

    // Circuit breaker, keyed on vertex kind and shared across the run.
    // Only vertices that opted in via a policy consult it, so a fallback
    // vertex of the same kind still runs while the breaker is open.
    let breaker = if descriptor.circuit_breaker.is_some() {
        engine.breakers.get(descriptor.kind.as_str())
    } else {
        None
    };
    if let Some(breaker) = &breaker {
        let (admission, transition) = breaker.try_acquire();
        publish_transition(engine, descriptor, transition);
        if admission == Admission::Rejected {
            dispatch_rejected(engine, descriptor, mailbox, &lease, &message);
            return;
        }
    }

    // Instance created when the worker consumes the message
    let started = engine.clock.now();
    let instance = VertexInstance::running(&descriptor.id, engine.run_id(), started);
    let instance_id = instance.id;
    engine.instances.insert(instance_id, instance);
    engine.events.publish(WorkflowEvent::NodeStarted {
        vertex_id: descriptor.id.clone(),
        instance_id,
    });
    tracing::debug!(vertex_id = %descriptor.id, %instance_id, "node started");

    let mut input = message.payload.clone();
    if let Some(port) = &message.target_port {
        input.insert("TargetPort".to_string(), json!(port));
    }
    if let Some(fault) = &message.fault {
        input.insert("Fault".to_string(), json!(fault));
    }

    let call_cancel = engine.cancel_root.child();
    let mut ctx = ExecuteContext {
        vertex_id: descriptor.id.clone(),
        input,
        globals: engine.globals.clone(),
        cancel: call_cancel.clone(),
        evaluator: engine.evaluator.clone(),
        clock: engine.clock.clone(),
        correlation,
        hooks: Some(EngineHooks {
            router: engine.router.clone(),
            events: engine.events.clone(),
            tracker: engine.tracker.clone(),
            codec: engine.codec.clone(),
            factory: engine.factory.clone(),
            options: engine.options.clone(),
            compensating: engine.compensating.clone(),
            subflow_depth: engine.subflow_depth,
        }),
    };

    let timeout = engine.call_timeout;
    let result = match tokio::time::timeout(timeout, implementation.execute(&mut ctx)).await {
        Ok(inner) => inner,
        Err(_) => {
            call_cancel.cancel();
            Err(WorkflowError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };
    let ended = engine.clock.now();

    match result {
        Ok(outcome) => {
            let chosen_port = outcome
                .port
                .or_else(|| descriptor.on_completion_port.clone());
            let completion_index = engine.completion_seq.fetch_add(1, Ordering::SeqCst);
            let mut duration_ms = 0;
            if let Some(mut entry) = engine.instances.get_mut(&instance_id) {
                entry.status = InstanceStatus::Completed;
                entry.ended_at = Some(ended);
                entry.output = outcome.output.clone();
                entry.chosen_port = chosen_port.clone();
                entry.completion_index = Some(completion_index);
                duration_ms = entry.duration_ms().unwrap_or(0);
            }
            if let Some(breaker) = &breaker {
                publish_transition(engine, descriptor, breaker.record_success());
            }
            let acked = mailbox.acknowledge(lease.lease_id);
            engine.events.publish(WorkflowEvent::NodeCompleted {
                vertex_id: descriptor.id.clone(),
                instance_id,
                duration_ms,
            });
            tracing::debug!(vertex_id = %descriptor.id, duration_ms, "node completed");
            if acked {
                engine.route_event(RouteEvent {
                    source: descriptor.id.clone(),
                    kind: MessageKind::Complete,
                    source_port: chosen_port,
                    payload: outcome.output,
                    fault: None,
                    iteration: None,
                    correlation,
                });
                engine.tracker.release(correlation);
            }
            if engine.options.checkpoint == CheckpointPolicy::OnNodeCompletion {
                engine.save_checkpoint().await;
            }
            engine.publish_progress();
        }
        Err(error)
            if matches!(error, WorkflowError::Cancelled) || engine.cancel_root.is_cancelled() =>
        {
            if let Some(mut entry) = engine.instances.get_mut(&instance_id) {
                entry.status = InstanceStatus::Cancelled;
                entry.ended_at = Some(ended);
            }
            engine.events.publish(WorkflowEvent::NodeCancelled {
                vertex_id: descriptor.id.clone(),
                instance_id,
            });
            tracing::debug!(vertex_id = %descriptor.id, "node cancelled");
            // Cancellation is terminal for the run: consume, never route
            if mailbox.acknowledge(lease.lease_id) {
                engine.tracker.release(correlation);
            }
            engine.publish_progress();
        }
        Err(error) => {
            let fault = error.to_fault();
            if let Some(breaker) = &breaker {
                publish_transition(engine, descriptor, breaker.record_failure());
            }
            let may_retry =
                retry.permits_kind(&fault.kind) && retry.permits_retry(lease.retry_count);
            if may_retry {
                match mailbox.requeue(lease.lease_id, &fault.kind) {
                    RequeueResult::Requeued { visible_after } => {
                        tracing::debug!(
                            vertex_id = %descriptor.id,
                            kind = %fault.kind,
                            %visible_after,
                            "node failed, retry scheduled"
                        );
                        engine.events.publish(WorkflowEvent::NodeFailed {
                            vertex_id: descriptor.id.clone(),
                            instance_id,
                            fault,
                            will_retry: true,
                        });
                        // Failed-for-retry activations do not count as
                        // instances of record
                        engine.instances.remove(&instance_id);
                        return;
                    }
                    RequeueResult::DeadLettered => {
                        terminal_failure(
                            engine,
                            descriptor,
                            instance_id,
                            ended,
                            fault,
                            correlation,
                            true,
                        );
                        engine.tracker.release(correlation);
                    }
                    RequeueResult::Stale => {
                        engine.instances.remove(&instance_id);
                    }
                }
            } else {
                // Terminal: the envelope leaves through the dead-letter
                // path so the retry counter survives in the record
                let consumed = if retry.permits_retry(lease.retry_count) {
                    mailbox.dead_letter(lease.lease_id, "not-retryable", Some(fault.to_string()))
                } else {
                    !matches!(
                        mailbox.requeue(lease.lease_id, &fault.kind),
                        RequeueResult::Stale
                    )
                };
                terminal_failure(
                    engine,
                    descriptor,
                    instance_id,
                    ended,
                    fault,
                    correlation,
                    consumed,
                );
                if consumed {
                    engine.tracker.release(correlation);
                }
            }
            engine.publish_progress();
        }
    }
}

fn terminal_failure(
    engine: &Arc<WorkflowEngine>,
    descriptor: &VertexDescriptor,
    instance_id: Uuid,
    ended: chrono::DateTime<chrono::Utc>,
    fault: Fault,
    correlation: Uuid,
    route: bool,
) {
    if let Some(mut entry) = engine.instances.get_mut(&instance_id) {
        entry.status = InstanceStatus::Failed;
        entry.ended_at = Some(ended);
        entry.fault = Some(fault.clone());
    }
    engine.record_first_fault(&fault);
    engine.events.publish(WorkflowEvent::NodeFailed {
        vertex_id: descriptor.id.clone(),
        instance_id,
        fault: fault.clone(),
        will_retry: false,
    });
    tracing::warn!(vertex_id = %descriptor.id, %fault, "node failed");
    if route {
        engine.route_event(RouteEvent {
            source: descriptor.id.clone(),
            kind: MessageKind::Fail,
            source_port: None,
            payload: crate::message::Bag::new(),
            fault: Some(fault),
            iteration: None,
            correlation,
        });
    }
}

/// The breaker rejected the dispatch: substitute the fallback vertex when
/// one is configured, otherwise fail synthetically with kind "circuit-open"
fn dispatch_rejected(
    engine: &Arc<WorkflowEngine>,
    descriptor: &VertexDescriptor,
    mailbox: &Arc<Mailbox>,
    lease: &LeaseHandle,
    message: &Message,
) {
    let correlation = message.correlation;
    if let Some(fallback) = &descriptor.fallback {
        tracing::warn!(
            vertex_id = %descriptor.id,
            fallback,
            "circuit open, dispatching fallback"
        );
        if mailbox.acknowledge(lease.lease_id) {
            let mut forwarded = message.clone();
            forwarded.source = Some(descriptor.id.clone());
            engine.router.deliver(fallback, forwarded);
            engine.tracker.release(correlation);
        }
        return;
    }

    let fault = Fault::new(
        "circuit-open",
        format!(
            "circuit breaker open for vertex kind '{}'",
            descriptor.kind.as_str()
        ),
    );
    let now = engine.clock.now();
    let instance = VertexInstance::running(&descriptor.id, engine.run_id(), now);
    let instance_id = instance.id;
    engine.instances.insert(instance_id, instance);
    let consumed = mailbox.acknowledge(lease.lease_id);
    terminal_failure(
        engine,
        descriptor,
        instance_id,
        now,
        fault,
        correlation,
        consumed,
    );
    if consumed {
        engine.tracker.release(correlation);
    }
    engine.publish_progress();
}

fn admission_cancelled(
    engine: &Arc<WorkflowEngine>,
    mailbox: &Arc<Mailbox>,
    lease: &LeaseHandle,
    correlation: uuid::Uuid,
) {
    match mailbox.requeue(lease.lease_id, "admission-cancelled") {
        RequeueResult::DeadLettered => {
            engine.tracker.release(correlation);
        }
        RequeueResult::Requeued { .. } | RequeueResult::Stale => {}
    }
}

fn publish_transition(
    engine: &Arc<WorkflowEngine>,
    descriptor: &VertexDescriptor,
    transition: Option<Transition>,
) {
    if let Some(transition) = transition {
        tracing::info!(
            kind = descriptor.kind.as_str(),
            from = ?transition.from,
            to = ?transition.to,
            "circuit breaker transition"
        );
        engine.events.publish(WorkflowEvent::BreakerTransition {
            kind: descriptor.kind.as_str().to_string(),
            from: transition.from,
            to: transition.to,
        });
    }
}
