//! The service processor: definition state, derived peer views, and per-pod report publishing.

use crate::cluster::Cluster;
use crate::{ClusterId, Controller, QueueId, Scheduler, Scope, ServiceId, TargetId};
use ahash::AHashMap as HashMap;
use std::collections::BTreeMap;
use topology_controller_core::{
    EntityRef, HandlerToken, Invalidator, Kind, PassOutcome, PeerEndpoint, PodMetadata, PodReport,
};
use topology_controller_k8s_api::{
    ClusterProvidedEndpoint, Isolation, MeshServiceSpec, ProvidedEndpoint,
};
use tracing::{debug, error, info, warn};

/// Identities to their endpoint instance, for one provided endpoint.
pub(crate) type PeerMap = HashMap<String, PeerEndpoint>;

/// A consumer's resolved view of one provider endpoint.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ConsumedPeers {
    /// All provider instances, regardless of placement.
    Shared(PeerMap),
    /// Provider instances partitioned by node; each consuming pod sees only its own node's.
    ByNode(HashMap<String, PeerMap>),
}

/// One consumed-endpoint declaration, normalized for resolution.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ConsumedBinding {
    /// `{target id}-{endpoint}`: the key reports and resolved views are filed under.
    pub(crate) key: String,
    pub(crate) target: TargetId,
    pub(crate) endpoint: String,
    pub(crate) isolation: Isolation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PodQueueHandler {
    Publish,
}

pub(crate) struct Service {
    pub(crate) id: ServiceId,
    pub(crate) cluster_id: ClusterId,
    scope: Scope,
    scheduler: Scheduler,

    /// False until (and again after) a definition resource addresses this service. Pods are
    /// indexed regardless, but nothing is derived or published for an undefined service.
    pub(crate) defined: bool,
    pub(crate) provided: BTreeMap<String, ProvidedEndpoint>,
    pub(crate) cluster_provided: BTreeMap<String, ClusterProvidedEndpoint>,
    pub(crate) consumed: Vec<ConsumedBinding>,
    pub(crate) policies: BTreeMap<String, serde_json::Value>,
    pub(crate) consumed_meta: Vec<serde_json::Value>,
    pub(crate) native_peers: BTreeMap<String, serde_json::Value>,

    /// Present pods by identity. A replacement pod overwrites its predecessor's slot; stale
    /// removals are guarded by uid.
    pub(crate) pods: HashMap<String, String>,

    /// Derived: endpoint name -> identity -> instance.
    pub(crate) provided_peers: HashMap<String, PeerMap>,
    /// Derived: endpoint name -> node -> identity -> instance.
    pub(crate) provided_peers_by_node: HashMap<String, HashMap<String, PeerMap>>,
    /// Derived: consumed binding key -> resolved view.
    pub(crate) consumed_peers: HashMap<String, ConsumedPeers>,

    /// Rebuild-consumed handlers registered on provider consumers keys, by provider id.
    pub(crate) consumer_handles: HashMap<String, HandlerToken>,
    /// Debounces per-pod publishes so one report covers a burst of changes.
    pub(crate) pod_invalidator: Invalidator<PodQueueHandler>,

    handler_tokens: Vec<HandlerToken>,
    pod_handler_tokens: Vec<HandlerToken>,
}

// === impl Service ===

impl Service {
    pub(crate) fn new(scope: Scope, id: ServiceId, scheduler: Scheduler) -> Self {
        let mut pod_invalidator = Invalidator::default();
        // Publish every pod key that ever gets invalidated; no keys are tracked yet.
        let (token, _) = pod_invalidator.handle_all(Kind::Pod, PodQueueHandler::Publish);

        Self {
            cluster_id: id.cluster_id(),
            id,
            scope,
            scheduler,
            defined: false,
            provided: BTreeMap::new(),
            cluster_provided: BTreeMap::new(),
            consumed: Vec::new(),
            policies: BTreeMap::new(),
            consumed_meta: Vec::new(),
            native_peers: BTreeMap::new(),
            pods: HashMap::default(),
            provided_peers: HashMap::default(),
            provided_peers_by_node: HashMap::default(),
            consumed_peers: HashMap::default(),
            consumer_handles: HashMap::default(),
            pod_invalidator,
            handler_tokens: Vec::new(),
            pod_handler_tokens: vec![token],
        }
    }

    pub(crate) fn track_handler(&mut self, token: HandlerToken) {
        self.handler_tokens.push(token);
    }

    /// Drops the handlers registered on this service's own queue and returns the ones registered
    /// on the owning scope's invalidator for the caller to release.
    pub(crate) fn release_handlers(&mut self) -> Vec<HandlerToken> {
        for token in self.pod_handler_tokens.drain(..) {
            self.pod_invalidator.remove_handler(token);
        }
        let mut tokens: Vec<HandlerToken> = self.handler_tokens.drain(..).collect();
        tokens.extend(self.consumer_handles.drain().map(|(_, token)| token));
        tokens
    }

    /// Queues a (debounced) re-publish of one pod's report.
    pub(crate) fn invalidate_pod(&mut self, uid: &str) {
        let key = EntityRef::new(Kind::Pod, uid);
        if self.pod_invalidator.invalidate(&key) {
            self.scheduler.schedule(
                QueueId::ServicePods(self.scope.clone(), self.id.clone()),
                key,
            );
        }
    }
}

// === impl Controller: service semantics ===

impl Controller {
    /// Applies (or retracts) the definition addressing a service, refreshing its consumption
    /// edges and invalidating everything derived from the declarations.
    pub(crate) fn apply_definition(
        &mut self,
        scope: &Scope,
        id: &ServiceId,
        spec: Option<MeshServiceSpec>,
    ) {
        let present = spec.is_some();
        info!(%scope, service = %id, present, "Applying service definition");

        let changes = {
            let dep = self.fetch_deployment_mut(scope);
            let service = dep.fetch_service(id);
            let targets: Vec<EntityRef> = match spec {
                Some(spec) => {
                    service.defined = true;
                    service.provided = spec.provided;
                    service.cluster_provided = spec.cluster_provided;
                    service.policies = spec.policies;
                    service.consumed_meta = spec.consumed_meta;
                    service.native_peers = spec.native_peers;
                    service.consumed = spec
                        .consumed
                        .into_values()
                        .map(|c| ConsumedBinding {
                            key: format!("{}-{}", c.target_id, c.endpoint),
                            target: TargetId::parse(&c.target_id),
                            endpoint: c.endpoint,
                            isolation: c.isolation,
                        })
                        .collect();
                    service
                        .consumed
                        .iter()
                        .map(|binding| EntityRef::new(Kind::Service, binding.target.as_str()))
                        .collect()
                }
                None => {
                    service.defined = false;
                    service.provided = BTreeMap::new();
                    service.cluster_provided = BTreeMap::new();
                    service.consumed = Vec::new();
                    service.policies = BTreeMap::new();
                    service.consumed_meta = Vec::new();
                    service.native_peers = BTreeMap::new();
                    Vec::new()
                }
            };
            dep.relations
                .replace_source(&EntityRef::new(Kind::Service, id.as_str()), targets)
        };
        self.dispatch_deployment_changes(scope, changes);

        // Provided declarations shape each pod's endpoints directly.
        self.rebuild_pod_endpoints(scope, id);
        self.deployment_invalidate(scope, Kind::Pods, id.as_str());
        self.deployment_invalidate(scope, Kind::Metadata, id.as_str());
        let cluster = id.cluster_id();
        self.deployment_invalidate(scope, Kind::ClusterProvided, cluster.as_str());
    }

    /// Re-joins every indexed pod of the service against its provided declarations, queueing a
    /// re-publish only for pods whose endpoints actually changed.
    fn rebuild_pod_endpoints(&mut self, scope: &Scope, id: &ServiceId) {
        let Some(service) = self.deployment(scope).and_then(|dep| dep.services.get(id)) else {
            return;
        };
        let provided = service.provided.clone();
        let uids: Vec<String> = service.pods.values().cloned().collect();

        for uid in uids {
            let changed = match self.infra.pods.get_mut(&uid) {
                Some(pod) => {
                    let endpoints = pod.build_endpoints(&provided);
                    if endpoints != pod.endpoints {
                        pod.endpoints = endpoints;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if changed {
                self.invalidate_pod_metadata(&uid);
            }
        }
    }

    /// Queues a re-publish for one pod, routed through its owning service's queue.
    pub(crate) fn invalidate_pod_metadata(&mut self, uid: &str) {
        let Some(pod) = self.infra.pods.get(uid) else {
            return;
        };
        if pod.is_agent {
            return;
        }
        let scope = pod.scope.clone();
        let service_id = pod.service.clone();
        let Some(service) = self
            .deployment_mut(&scope)
            .and_then(|dep| dep.services.get_mut(&service_id))
        else {
            warn!(%uid, service = %service_id, "Pod refers to an unindexed service");
            return;
        };
        service.invalidate_pod(uid);
    }

    /// Rebuilds the service's provider-side peer views from its present pods, then invalidates
    /// everything consuming it directly or through its cluster.
    pub(crate) fn rebuild_pods(&mut self, scope: &Scope, id: &ServiceId) -> anyhow::Result<()> {
        let Some(service) = self.deployment(scope).and_then(|dep| dep.services.get(id)) else {
            return Ok(());
        };
        if !service.defined {
            return Ok(());
        }

        let mut provided_peers = HashMap::default();
        let mut by_node: HashMap<String, HashMap<String, PeerMap>> = HashMap::default();
        for name in service.provided.keys() {
            let mut peers = PeerMap::default();
            let mut node_peers: HashMap<String, PeerMap> = HashMap::default();
            for (identity, uid) in service.pods.iter() {
                let Some(pod) = self.infra.pods.get(uid) else {
                    continue;
                };
                let Some(endpoint) = pod.endpoints.get(name) else {
                    continue;
                };
                peers.insert(identity.clone(), endpoint.clone());
                if let Some(node) = &pod.node {
                    node_peers
                        .entry(node.clone())
                        .or_default()
                        .insert(identity.clone(), endpoint.clone());
                }
            }
            provided_peers.insert(name.clone(), peers);
            by_node.insert(name.clone(), node_peers);
        }
        debug!(%scope, service = %id, endpoints = provided_peers.len(), "Rebuilt provided peers");

        let Some(service) = self
            .deployment_mut(scope)
            .and_then(|dep| dep.services.get_mut(id))
        else {
            return Ok(());
        };
        service.provided_peers = provided_peers;
        service.provided_peers_by_node = by_node;

        self.invalidate_consumers(scope, id.as_str());
        let cluster = id.cluster_id();
        self.invalidate_consumers(scope, cluster.as_str());
        Ok(())
    }

    /// Re-resolves every consumed binding of one service against current provider state.
    pub(crate) fn rebuild_consumed(
        &mut self,
        scope: &Scope,
        consumer: &ServiceId,
    ) -> anyhow::Result<()> {
        let Some(service) = self
            .deployment(scope)
            .and_then(|dep| dep.services.get(consumer))
        else {
            return Ok(());
        };
        if !service.defined {
            return Ok(());
        }
        let bindings = service.consumed.clone();

        let mut resolved = HashMap::default();
        for binding in bindings {
            let Some((provider_id, endpoint)) = self.map_consumed(scope, &binding) else {
                debug!(%scope, %consumer, target = %binding.target, "Consumed endpoint is unresolvable");
                continue;
            };
            let Some(provider) = self.find_service(scope, &provider_id) else {
                debug!(%scope, %consumer, provider = %provider_id, "Provider is not indexed yet");
                continue;
            };
            let peers = match binding.isolation {
                Isolation::Instance => ConsumedPeers::ByNode(
                    provider
                        .provided_peers_by_node
                        .get(&endpoint)
                        .cloned()
                        .unwrap_or_default(),
                ),
                Isolation::Shared => ConsumedPeers::Shared(
                    provider
                        .provided_peers
                        .get(&endpoint)
                        .cloned()
                        .unwrap_or_default(),
                ),
            };
            resolved.insert(binding.key, peers);
        }

        let Some(service) = self
            .deployment_mut(scope)
            .and_then(|dep| dep.services.get_mut(consumer))
        else {
            return Ok(());
        };
        service.consumed_peers = resolved;
        self.deployment_invalidate(scope, Kind::Metadata, consumer.as_str());
        Ok(())
    }

    /// Declarations changed but pod membership didn't: every present pod re-publishes.
    pub(crate) fn rebuild_metadata(
        &mut self,
        scope: &Scope,
        id: &ServiceId,
    ) -> anyhow::Result<()> {
        let Some(service) = self.deployment(scope).and_then(|dep| dep.services.get(id)) else {
            return Ok(());
        };
        if !service.defined {
            return Ok(());
        }
        let uids: Vec<String> = service.pods.values().cloned().collect();
        for uid in uids {
            self.invalidate_pod_metadata(&uid);
        }
        Ok(())
    }

    /// Resolves a binding to the concrete providing service and endpoint, indirecting through
    /// the cluster's advertised names when the target is a cluster.
    fn map_consumed(&self, scope: &Scope, binding: &ConsumedBinding) -> Option<(ServiceId, String)> {
        match &binding.target {
            TargetId::Service(id) => Some((id.clone(), binding.endpoint.clone())),
            TargetId::Cluster(id) => self
                .find_cluster(scope, id)?
                .provided_map
                .get(&binding.endpoint)
                .cloned(),
        }
    }

    fn find_cluster(&self, scope: &Scope, id: &ClusterId) -> Option<&Cluster> {
        self.deployment(scope)
            .and_then(|dep| dep.clusters.get(id))
            .or_else(|| self.common.clusters.get(id))
    }

    pub(crate) fn run_pod_pass(&mut self, scope: Scope, service: ServiceId, key: EntityRef) {
        loop {
            let Some(revision) = self
                .deployment_mut(&scope)
                .and_then(|dep| dep.services.get_mut(&service))
                .and_then(|svc| svc.pod_invalidator.begin(&key))
            else {
                return;
            };
            self.metrics.invalidation_passes.inc();

            let handlers = self
                .deployment(&scope)
                .and_then(|dep| dep.services.get(&service))
                .map(|svc| svc.pod_invalidator.handlers(&key))
                .unwrap_or_default();
            let mut success = true;
            for handler in handlers {
                let result = match handler {
                    PodQueueHandler::Publish => self.publish_pod_metadata(&scope, &service, &key.id),
                };
                if let Err(error) = result {
                    error!(%scope, %service, %key, %error, "Publish handler failed");
                    success = false;
                    break;
                }
            }
            if !success {
                self.metrics.invalidation_failures.inc();
            }

            let Some(svc) = self
                .deployment_mut(&scope)
                .and_then(|dep| dep.services.get_mut(&service))
            else {
                return;
            };
            match svc.pod_invalidator.complete(&key, revision, success) {
                PassOutcome::RunNow => continue,
                PassOutcome::Reschedule => {
                    self.scheduler
                        .schedule(QueueId::ServicePods(scope.clone(), service.clone()), key);
                    return;
                }
                PassOutcome::Converged => return,
            }
        }
    }

    /// Assembles one pod's report and hands it to the agent elected on the pod's node.
    fn publish_pod_metadata(
        &self,
        scope: &Scope,
        service_id: &ServiceId,
        uid: &str,
    ) -> anyhow::Result<()> {
        let Some(pod) = self.infra.pods.get(uid) else {
            // The pod converged away before its debounce expired.
            return Ok(());
        };
        let Some(service) = self
            .deployment(scope)
            .and_then(|dep| dep.services.get(service_id))
        else {
            return Ok(());
        };
        let Some(node) = pod.node.as_deref() else {
            return Ok(());
        };

        let mut peers: HashMap<String, serde_json::Value> = HashMap::default();
        for binding in &service.consumed {
            let view = match service.consumed_peers.get(&binding.key) {
                Some(ConsumedPeers::Shared(map)) => serde_json::to_value(map)?,
                Some(ConsumedPeers::ByNode(by_node)) => match by_node.get(node) {
                    Some(map) => serde_json::to_value(map)?,
                    None => serde_json::json!({}),
                },
                None => serde_json::json!({}),
            };
            peers.insert(binding.key.clone(), view);
        }
        for (name, value) in &service.native_peers {
            peers.insert(name.clone(), value.clone());
        }

        let metadata = PodMetadata {
            endpoints: pod.endpoints.clone(),
            policies: service
                .policies
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            consumes: service.consumed_meta.clone(),
            peers,
        };

        let Some(agent) = self.infra.node_agent_pod(node) else {
            self.metrics.reports_skipped.inc();
            debug!(%uid, %node, "No agent elected on node; dropping report");
            return Ok(());
        };
        let Some(address) = agent.address.clone() else {
            self.metrics.reports_skipped.inc();
            warn!(%uid, %node, agent = %agent.uid, "Agent pod has no address; dropping report");
            return Ok(());
        };

        self.metrics.reports_published.inc();
        debug!(%uid, %node, agent = %address, "Publishing pod report");
        self.sink.publish(
            &address,
            vec![PodReport {
                id: pod.uid.clone(),
                metadata,
            }],
        );
        Ok(())
    }
}
