use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares the endpoints a service provides and consumes, and the policies its pods run under.
///
/// The service this definition belongs to is addressed by the resource's identity labels
/// (`cluster`/`sector`/`service`), not by the resource name.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "topology.dev",
    version = "v1alpha1",
    kind = "MeshService",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshServiceSpec {
    /// Endpoints exposed by this service's pods, keyed by container port name.
    #[serde(default)]
    pub provided: BTreeMap<String, ProvidedEndpoint>,

    /// Endpoints this service consumes from other services or clusters.
    #[serde(default)]
    pub consumed: BTreeMap<String, ConsumedEndpoint>,

    /// Endpoints advertised at cluster level, resolvable by consumers that target the cluster
    /// rather than this service directly.
    #[serde(default)]
    pub cluster_provided: BTreeMap<String, ClusterProvidedEndpoint>,

    /// Opaque policy documents forwarded verbatim in pod reports.
    #[serde(default)]
    pub policies: BTreeMap<String, serde_json::Value>,

    /// Opaque consumption metadata forwarded verbatim in pod reports.
    #[serde(default)]
    pub consumed_meta: Vec<serde_json::Value>,

    /// Static peer declarations merged into every pod report's peer map.
    #[serde(default)]
    pub native_peers: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedEndpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_protocol: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedEndpoint {
    /// `service://{cluster}-{sector}-{service}` or `cluster://{cluster}`.
    pub target_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub isolation: Isolation,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProvidedEndpoint {
    /// The provided endpoint (on the declaring service) that backs the cluster-level name.
    pub target_endpoint: String,
}

/// Whether a consumer's peer view is narrowed to peers on its own node or spans the whole
/// provider.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Shared,
    Instance,
}
