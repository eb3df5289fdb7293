//! Graph codec seam
//!
//! Encodes and decodes graph definitions to self-describing text. Both
//! codecs go through serde, so vertex kinds, configuration bags, edge
//! filters, and policy fields survive a round trip verbatim.

use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::types::Graph;

/// Serialization seam for graph definitions
pub trait GraphCodec: Send + Sync {
    /// Encode a graph to bytes
    fn encode(&self, graph: &Graph) -> WorkflowResult<Vec<u8>>;
    /// Decode a graph from bytes
    fn decode(&self, bytes: &[u8]) -> WorkflowResult<Graph>;
}

/// JSON codec
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonGraphCodec;

impl GraphCodec for JsonGraphCodec {
    fn encode(&self, graph: &Graph) -> WorkflowResult<Vec<u8>> {
        serde_json::to_vec_pretty(graph).map_err(|e| WorkflowError::Codec {
            reason: format!("JSON encode: {}", e),
        })
    }

    fn decode(&self, bytes: &[u8]) -> WorkflowResult<Graph> {
        serde_json::from_slice(bytes).map_err(|e| WorkflowError::Codec {
            reason: format!("JSON decode: {}", e),
        })
    }
}

/// YAML codec
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlGraphCodec;

impl GraphCodec for YamlGraphCodec {
    fn encode(&self, graph: &Graph) -> WorkflowResult<Vec<u8>> {
        serde_yaml::to_string(graph)
            .map(String::into_bytes)
            .map_err(|e| WorkflowError::Codec {
                reason: format!("YAML encode: {}", e),
            })
    }

    fn decode(&self, bytes: &[u8]) -> WorkflowResult<Graph> {
        serde_yaml::from_slice(bytes).map_err(|e| WorkflowError::Codec {
            reason: format!("YAML decode: {}", e),
        })
    }
}
