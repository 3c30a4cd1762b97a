use std::fmt;

const SERVICE_SCHEME: &str = "service://";
const CLUSTER_SCHEME: &str = "cluster://";

/// A service identity: `service://{cluster}-{sector}-{service}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(cluster: &str, sector: &str, service: &str) -> Self {
        Self(format!("{SERVICE_SCHEME}{cluster}-{sector}-{service}"))
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The cluster a service belongs to: the leading segment of its identity.
    pub fn cluster_id(&self) -> ClusterId {
        let body = self.0.strip_prefix(SERVICE_SCHEME).unwrap_or(&self.0);
        let cluster = body.split('-').next().unwrap_or_default();
        ClusterId::new(cluster)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cluster identity: `cluster://{cluster}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(cluster: &str) -> Self {
        Self(format!("{CLUSTER_SCHEME}{cluster}"))
    }

    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The target of a consumed-endpoint declaration, discriminated by scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetId {
    Service(ServiceId),
    Cluster(ClusterId),
}

impl TargetId {
    /// Anything without the cluster scheme addresses a service, matching how definitions are
    /// written.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with(CLUSTER_SCHEME) {
            TargetId::Cluster(ClusterId::from_raw(raw))
        } else {
            TargetId::Service(ServiceId::from_raw(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetId::Service(id) => id.as_str(),
            TargetId::Cluster(id) => id.as_str(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
