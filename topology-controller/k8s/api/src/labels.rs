//! Well-known labels carried by managed pods and `MeshService` resources.

/// Selects the pods (and definitions) this controller indexes.
pub const MANAGED: &str = "topology.dev/managed";

/// Cluster segment of a workload's service identity.
pub const CLUSTER: &str = "cluster";
/// Sector segment of a workload's service identity.
pub const SECTOR: &str = "sector";
/// Service segment of a workload's service identity.
pub const SERVICE: &str = "service";

/// Names the deployment scope a workload belongs to; workloads without it land in the shared
/// common scope.
pub const DEPLOYMENT: &str = "deployment";

/// Names a pod's main container, used for identity extraction.
pub const NAME: &str = "name";
