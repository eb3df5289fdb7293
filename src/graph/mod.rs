//! Graph definition model
//!
//! Descriptors are plain serde records so the JSON/YAML codec surface
//! round-trips them verbatim; validation promotes a [`Graph`] into a
//! [`ValidatedGraph`] that the engine accepts.

mod codec;
mod types;
mod validate;

pub use codec::{GraphCodec, JsonGraphCodec, YamlGraphCodec};
pub use types::{
    BranchConfig, ContainerConfig, ContainerMode, EdgeDescriptor, ForeachConfig, Graph, Priority,
    SubflowConfig, SwitchConfig, TriggerKind, UserTaskConfig, VertexDescriptor, VertexKind,
    WhileConfig,
};
pub use validate::ValidatedGraph;
