//! Codec round-trip fidelity: validation outcome and reachability survive
//! encode/decode for both JSON and YAML

mod common;

use common::*;
use flowgraph_engine::{
    EdgeDescriptor, Graph, GraphCodec, JsonGraphCodec, Priority, RetryPolicy, TriggerKind,
    ValidatedGraph, VertexDescriptor, VertexKind, YamlGraphCodec,
};
use serde_json::json;

fn rich_graph() -> Graph {
    let mut seed = task("seed", "noop");
    seed.priority = Priority::High;
    seed.retry = Some(RetryPolicy::exponential(10, 2.0, 1000, 3));
    seed.compensation = Some("undo".to_string());

    let mut decide = branch("decide", "globals.x > 5");
    decide.max_concurrent = 2;

    let mut fanout = VertexDescriptor::new("fanout", "fanout", VertexKind::Foreach);
    fanout
        .config
        .insert("items".to_string(), json!([1, 2, 3]));
    fanout.config.insert("item_var".to_string(), json!("n"));

    let mut comp_edge = EdgeDescriptor::new("undo", "seed");
    comp_edge.is_compensation = true;

    let mut graph = Graph::new("rich")
        .vertex(seed)
        .vertex(decide)
        .vertex(fanout)
        .vertex(task("t", "noop"))
        .vertex(task("undo", "noop"))
        .edge(EdgeDescriptor::new("seed", "decide"))
        .edge(
            EdgeDescriptor::new("decide", "fanout")
                .with_source_port("TrueBranch")
                .with_guard("output.ConditionResult == true"),
        )
        .edge(EdgeDescriptor::new("fanout", "t").with_triggers([TriggerKind::Next]))
        .edge(comp_edge);
    graph.entry_vertex = Some("seed".to_string());
    graph.max_concurrency = 4;
    graph
}

fn assert_equivalent(original: &Graph, decoded: Graph) {
    let validated_original = ValidatedGraph::validate(original.clone()).unwrap();
    let validated_decoded = ValidatedGraph::validate(decoded).unwrap();

    assert_eq!(validated_decoded.id(), validated_original.id());
    assert_eq!(
        validated_decoded.entries(),
        validated_original.entries()
    );
    assert_eq!(
        validated_decoded.reachable(),
        validated_original.reachable()
    );
    assert_eq!(
        validated_decoded.vertices().len(),
        validated_original.vertices().len()
    );
    assert_eq!(
        validated_decoded.edges().len(),
        validated_original.edges().len()
    );
    for (decoded, original) in validated_decoded
        .vertices()
        .iter()
        .zip(validated_original.vertices())
    {
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.config, original.config);
        assert_eq!(decoded.priority, original.priority);
        assert_eq!(decoded.retry, original.retry);
        assert_eq!(decoded.compensation, original.compensation);
    }
    for (decoded, original) in validated_decoded
        .edges()
        .iter()
        .zip(validated_original.edges())
    {
        assert_eq!(decoded.triggers, original.triggers);
        assert_eq!(decoded.source_port, original.source_port);
        assert_eq!(decoded.guard, original.guard);
        assert_eq!(decoded.is_compensation, original.is_compensation);
    }
}

#[test]
fn test_json_roundtrip_preserves_semantics() {
    let codec = JsonGraphCodec;
    let graph = rich_graph();
    let bytes = codec.encode(&graph).unwrap();
    assert_equivalent(&graph, codec.decode(&bytes).unwrap());
}

#[test]
fn test_yaml_roundtrip_preserves_semantics() {
    let codec = YamlGraphCodec;
    let graph = rich_graph();
    let bytes = codec.encode(&graph).unwrap();
    assert_equivalent(&graph, codec.decode(&bytes).unwrap());
}

#[test]
fn test_invalid_graph_stays_invalid_through_roundtrip() {
    let cyclic = Graph::new("cyclic")
        .vertex(task("a", "noop"))
        .vertex(task("b", "noop"))
        .edge(EdgeDescriptor::new("a", "b"))
        .edge(EdgeDescriptor::new("b", "a"));
    assert!(ValidatedGraph::validate(cyclic.clone()).is_err());

    let codec = JsonGraphCodec;
    let decoded = codec.decode(&codec.encode(&cyclic).unwrap()).unwrap();
    assert!(ValidatedGraph::validate(decoded).is_err());
}

#[test]
fn test_cross_codec_equivalence() {
    let graph = rich_graph();
    let json_bytes = JsonGraphCodec.encode(&graph).unwrap();
    let from_json = JsonGraphCodec.decode(&json_bytes).unwrap();
    let yaml_bytes = YamlGraphCodec.encode(&from_json).unwrap();
    assert_equivalent(&graph, YamlGraphCodec.decode(&yaml_bytes).unwrap());
}
