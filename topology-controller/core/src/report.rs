//! The wire format pushed to a node's elected agent, and the outbound seam it is pushed through.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

/// One provided endpoint as exposed by a single pod instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEndpoint {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_protocol: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// The metadata assembled for one pod: its own endpoints plus its resolved view of every peer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PodMetadata {
    pub endpoints: HashMap<String, PeerEndpoint>,
    pub policies: HashMap<String, serde_json::Value>,
    pub consumes: Vec<serde_json::Value>,
    pub peers: HashMap<String, serde_json::Value>,
}

/// One element of the report body POSTed to the agent.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PodReport {
    pub id: String,
    pub metadata: PodMetadata,
}

/// Fire-and-forget delivery of pod reports to a node agent.
///
/// Implementations must not block: delivery failures are logged by the sink, never surfaced, and
/// a report is retried only when the underlying state changes again.
pub trait MetadataSink: Send + Sync {
    fn publish(&self, agent_address: &str, reports: Vec<PodReport>);
}
