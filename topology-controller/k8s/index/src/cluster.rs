//! Cluster-level endpoint aggregation: names advertised by a cluster, backed by endpoints on its
//! member services.

use crate::{ClusterId, Controller, Scope, ServiceId};
use ahash::AHashMap as HashMap;
use topology_controller_core::{EntityRef, HandlerToken, Kind};
use tracing::debug;

#[derive(Default)]
pub(crate) struct Cluster {
    /// Cluster-level endpoint name to the providing service and its endpoint.
    pub(crate) provided_map: HashMap<String, (ServiceId, String)>,

    handler_tokens: Vec<HandlerToken>,
}

// === impl Cluster ===

impl Cluster {
    pub(crate) fn track_handler(&mut self, token: HandlerToken) {
        self.handler_tokens.push(token);
    }

    pub(crate) fn release_handlers(&mut self) -> Vec<HandlerToken> {
        self.handler_tokens.drain(..).collect()
    }
}

// === impl Controller: cluster aggregation ===

impl Controller {
    /// Rebuilds a cluster's advertised endpoint map from its member services' declarations, and
    /// refreshes the `cluster -> service` relation so consumers re-resolve on membership changes.
    pub(crate) fn rebuild_cluster_provided(
        &mut self,
        scope: &Scope,
        cluster_id: &ClusterId,
    ) -> anyhow::Result<()> {
        let Some(dep) = self.deployment(scope) else {
            return Ok(());
        };
        if !dep.clusters.contains_key(cluster_id) {
            return Ok(());
        }

        let mut mapping = HashMap::default();
        let mut targets = Vec::new();
        if let Some(members) = dep.cluster_services.get(cluster_id) {
            // Sorted so duplicate names resolve the same way on every rebuild.
            let mut members = members.iter().cloned().collect::<Vec<_>>();
            members.sort();
            for member in members {
                let Some(service) = dep.services.get(&member) else {
                    continue;
                };
                for (name, endpoint) in &service.cluster_provided {
                    targets.push(EntityRef::new(Kind::Service, member.as_str()));
                    mapping.insert(name.clone(), (member.clone(), endpoint.target_endpoint.clone()));
                }
            }
        }
        debug!(%scope, cluster = %cluster_id, names = mapping.len(), "Rebuilt cluster endpoints");

        let changes = {
            let Some(dep) = self.deployment_mut(scope) else {
                return Ok(());
            };
            if let Some(cluster) = dep.clusters.get_mut(cluster_id) {
                cluster.provided_map = mapping;
            }
            dep.relations.replace_source(
                &EntityRef::new(Kind::Cluster, cluster_id.as_str()),
                targets,
            )
        };
        self.dispatch_deployment_changes(scope, changes);
        Ok(())
    }
}
