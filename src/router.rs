//! Event router
//!
//! Translates one source vertex event into enqueue operations on target
//! mailboxes. Edges filter on trigger kind, source port, and an optional
//! guard expression evaluated over the source output plus globals. The
//! router never deduplicates: routing the same event twice delivers twice.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::concurrency::CorrelationTracker;
use crate::eval::{evaluate_bool, ExpressionEvaluator};
use crate::graph::{EdgeDescriptor, TriggerKind, ValidatedGraph};
use crate::instance::Globals;
use crate::mailbox::{DeadLetterQueue, Mailbox};
use crate::message::{Bag, Fault, Message, MessageKind};

/// A completion/failure/cancel/iteration event handed to the router
#[derive(Debug, Clone)]
pub struct RouteEvent {
    /// Source vertex id
    pub source: String,
    /// What happened
    pub kind: MessageKind,
    /// Port the source emitted on
    pub source_port: Option<String>,
    /// Source output bag
    pub payload: Bag,
    /// Error descriptor for Fail events
    pub fault: Option<Fault>,
    /// Iteration index for Next events
    pub iteration: Option<u64>,
    /// Correlation inherited by every derived message
    pub correlation: Uuid,
}

struct CompiledEdge {
    descriptor: EdgeDescriptor,
    declaration_index: usize,
}

/// Routes source events to target mailboxes
pub struct Router {
    /// Enabled non-compensation edges grouped by source, in delivery order
    routes: HashMap<String, Vec<CompiledEdge>>,
    /// Enabled compensation edges, active only during the walk
    compensation_routes: HashMap<String, Vec<CompiledEdge>>,
    mailboxes: HashMap<String, Arc<Mailbox>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    dlq: Arc<DeadLetterQueue>,
    tracker: Arc<CorrelationTracker>,
}

impl Router {
    /// Build routing tables from a validated graph
    pub fn new(
        graph: &ValidatedGraph,
        mailboxes: HashMap<String, Arc<Mailbox>>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        dlq: Arc<DeadLetterQueue>,
        tracker: Arc<CorrelationTracker>,
    ) -> Self {
        let mut routes: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
        let mut compensation_routes: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
        for (declaration_index, edge) in graph.edges().iter().enumerate() {
            if !edge.enabled {
                continue;
            }
            let bucket = if edge.is_compensation {
                &mut compensation_routes
            } else {
                &mut routes
            };
            bucket
                .entry(edge.source.clone())
                .or_default()
                .push(CompiledEdge {
                    descriptor: edge.clone(),
                    declaration_index,
                });
        }
        for bucket in routes.values_mut().chain(compensation_routes.values_mut()) {
            bucket.sort_by_key(|e| (e.descriptor.priority, e.declaration_index));
        }
        Self {
            routes,
            compensation_routes,
            mailboxes,
            evaluator,
            dlq,
            tracker,
        }
    }

    /// Fan an event out to every matching edge; returns the number of
    /// messages delivered. A source with no matching enabled edge is a
    /// dead-end and drops silently.
    pub fn route(&self, event: &RouteEvent, globals: &Globals, include_compensation: bool) -> usize {
        let mut delivered = 0;
        delivered += self.route_over(self.routes.get(&event.source), event, globals);
        if include_compensation {
            delivered += self.route_over(
                self.compensation_routes.get(&event.source),
                event,
                globals,
            );
        }
        if delivered == 0 {
            tracing::trace!(source = %event.source, kind = ?event.kind, "dead-end event");
        }
        delivered
    }

    fn route_over(
        &self,
        edges: Option<&Vec<CompiledEdge>>,
        event: &RouteEvent,
        globals: &Globals,
    ) -> usize {
        let mut delivered = 0;
        for edge in edges.into_iter().flatten() {
            let descriptor = &edge.descriptor;
            if !descriptor.triggers.iter().any(|t| t.matches(event.kind)) {
                continue;
            }
            if let Some(wanted) = &descriptor.source_port {
                if event.source_port.as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }
            if let Some(guard) = descriptor.guard.as_deref().filter(|g| !g.trim().is_empty()) {
                let mut vars = Bag::new();
                vars.insert(
                    "output".to_string(),
                    serde_json::Value::Object(
                        event
                            .payload
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ),
                );
                vars.insert("globals".to_string(), globals.as_value());
                match evaluate_bool(self.evaluator.as_ref(), guard, &vars) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        self.dlq.record(
                            &event.source,
                            "guard-eval-failed",
                            Some(format!("edge to '{}': {}", descriptor.target, e)),
                            None,
                            0,
                        );
                        continue;
                    }
                }
            }

            let Some(target) = self.mailboxes.get(&descriptor.target) else {
                continue;
            };
            let derived = Message::derived(
                derived_kind(event.kind),
                &event.source,
                event.source_port.clone(),
                descriptor.target_port.clone(),
                event.payload.clone(),
                event.fault.clone(),
                event.iteration,
                event.correlation,
            );
            self.tracker.retain(derived.correlation);
            target.enqueue(derived);
            delivered += 1;
        }
        delivered
    }

    /// Deliver a message straight into a vertex's mailbox, bypassing edge
    /// filters; used for start feeding, fallback dispatch, and the
    /// compensation walk
    pub fn deliver(&self, target: &str, message: Message) -> bool {
        match self.mailboxes.get(target) {
            Some(mailbox) => {
                self.tracker.retain(message.correlation);
                mailbox.enqueue(message);
                true
            }
            None => false,
        }
    }

    /// Whether any enabled edge (either table) leaves this source
    pub fn has_routes_from(&self, source: &str) -> bool {
        self.routes.contains_key(source) || self.compensation_routes.contains_key(source)
    }
}

fn derived_kind(kind: MessageKind) -> MessageKind {
    match kind {
        MessageKind::Complete | MessageKind::Fail | MessageKind::Cancel => kind,
        MessageKind::Next | MessageKind::Start => MessageKind::Next,
    }
}

/// Trigger-kind view of a message kind, if one exists
pub fn trigger_for(kind: MessageKind) -> Option<TriggerKind> {
    match kind {
        MessageKind::Complete => Some(TriggerKind::Complete),
        MessageKind::Fail => Some(TriggerKind::Fail),
        MessageKind::Cancel => Some(TriggerKind::Cancel),
        MessageKind::Next => Some(TriggerKind::Next),
        MessageKind::Start => None,
    }
}
