use crate::{Config, Scope, ServiceId};
use ahash::AHashMap as HashMap;
use std::collections::BTreeMap;
use topology_controller_core::PeerEndpoint;
use topology_controller_k8s_api::{self as k8s, labels, ProvidedEndpoint, ResourceExt};

/// The indexed state of one live pod.
///
/// A record is parsed once per watch event and kept in the physical layer; the logical layer
/// refers to it by uid only, so a replacement pod reusing an identity never aliases its
/// predecessor's state.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PodRecord {
    pub(crate) uid: String,
    pub(crate) name: String,
    pub(crate) node: Option<String>,
    pub(crate) address: Option<String>,
    pub(crate) identity: Option<String>,
    pub(crate) is_agent: bool,
    pub(crate) scope: Scope,
    pub(crate) service: ServiceId,
    phase: Option<String>,
    named_ports: Vec<(String, u16)>,
    /// Named ports joined against the owning service's provided declarations.
    pub(crate) endpoints: HashMap<String, PeerEndpoint>,
}

impl PodRecord {
    /// Returns `None` only when the resource carries no uid, which a watch never produces.
    pub(crate) fn parse(
        pod: &k8s::Pod,
        scope: Scope,
        service: ServiceId,
        config: &Config,
    ) -> Option<Self> {
        let uid = pod.metadata.uid.clone()?;
        let name = pod.name_unchecked();
        let empty = BTreeMap::new();
        let pod_labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let is_agent = pod_labels.get(labels::CLUSTER) == Some(&config.agent_cluster)
            && pod_labels.get(labels::SECTOR) == Some(&config.agent_sector)
            && pod_labels.get(labels::SERVICE) == Some(&config.agent_service);

        let identity = pod_labels
            .get(labels::NAME)
            .and_then(|main| extract_identity(pod, main, &config.identity_env));

        let named_ports = spec
            .map(|spec| {
                spec.containers
                    .iter()
                    .flat_map(|c| c.ports.iter().flatten())
                    .filter_map(|port| {
                        let name = port.name.clone()?;
                        let number = u16::try_from(port.container_port).ok()?;
                        Some((name, number))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            uid,
            name,
            node: spec.and_then(|spec| spec.node_name.clone()),
            address: status.and_then(|status| status.pod_ip.clone()),
            identity,
            is_agent,
            scope,
            service,
            phase: status.and_then(|status| status.phase.clone()),
            named_ports,
            endpoints: HashMap::default(),
        })
    }

    /// A pod counts only once it is running, placed on a node, and carries an identity.
    pub(crate) fn is_present(&self) -> bool {
        self.phase.as_deref() == Some("Running") && self.node.is_some() && self.identity.is_some()
    }

    /// Joins the pod's named container ports against the service's provided declarations.
    /// Unnamed ports and ports without a matching declaration are dropped.
    pub(crate) fn build_endpoints(
        &self,
        provided: &BTreeMap<String, ProvidedEndpoint>,
    ) -> HashMap<String, PeerEndpoint> {
        self.named_ports
            .iter()
            .filter_map(|(name, port)| {
                let decl = provided.get(name)?;
                let endpoint = PeerEndpoint {
                    name: name.clone(),
                    protocol: decl.protocol.clone(),
                    network_protocol: decl.network_protocol.clone(),
                    port: *port,
                    address: self.address.clone(),
                };
                Some((name.clone(), endpoint))
            })
            .collect()
    }
}

/// Reads the identity variable from the pod's main container. A literal value wins; a downward
/// API reference to `metadata.name` resolves to the pod's own name.
fn extract_identity(pod: &k8s::Pod, main_container: &str, identity_env: &str) -> Option<String> {
    let container = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == main_container)?;

    for var in container.env.iter().flatten() {
        if var.name != identity_env {
            continue;
        }
        if let Some(value) = &var.value {
            return Some(value.clone());
        }
        let field_ref = var.value_from.as_ref().and_then(|vf| vf.field_ref.as_ref());
        if field_ref.is_some_and(|fr| fr.field_path == "metadata.name") {
            return Some(pod.name_unchecked());
        }
    }
    None
}
