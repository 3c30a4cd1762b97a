use std::fmt;

/// The closed set of entity kinds addressable by relations and invalidation keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Pod,
    Node,
    Service,
    Cluster,
    NodeAgent,
    AgentPod,
    Consumers,
    Metadata,
    ClusterProvided,
    Pods,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Pod => "pod",
            Kind::Node => "node",
            Kind::Service => "service",
            Kind::Cluster => "cluster",
            Kind::NodeAgent => "node-agent",
            Kind::AgentPod => "agent-pod",
            Kind::Consumers => "consumers",
            Kind::Metadata => "metadata",
            Kind::ClusterProvided => "cluster-provided",
            Kind::Pods => "pods",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(kind, id)` pair: the universal addressing unit for relation endpoints and invalidation
/// keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: Kind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: Kind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
