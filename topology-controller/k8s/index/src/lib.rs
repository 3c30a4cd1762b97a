//! Maintains a topology index over managed pods and `MeshService` definitions, and pushes each
//! pod's resolved metadata to the agent elected on its node.
//!
//! The index is split into a physical layer (pods, nodes, agent election) and per-scope logical
//! layers (services, clusters, consumption edges). All state lives behind one `RwLock`; watch
//! events mutate it directly, while recomputation is deferred through debounced invalidation
//! queues drained by [`process_wakes`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod deployment;
mod ids;
mod infra;
pub mod metrics;
mod pod;
mod service;

#[cfg(test)]
mod tests;

pub use self::ids::{ClusterId, ServiceId, TargetId};
use self::deployment::Deployment;
use self::infra::Infra;
use self::pod::PodRecord;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use topology_controller_core::{EntityRef, Kind, MetadataSink};
use topology_controller_k8s_api::{self as k8s, labels, ResourceExt};
use tracing::{debug, info, trace, warn};

pub type SharedIndex = Arc<RwLock<Controller>>;

/// Settings shared by every scope of the index.
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay between the first invalidation of a key and the start of its recomputation pass.
    pub debounce: Duration,
    /// Cluster segment of the node agent's service identity.
    pub agent_cluster: String,
    /// Sector segment of the node agent's service identity.
    pub agent_sector: String,
    /// Service segment of the node agent's service identity.
    pub agent_service: String,
    /// Environment variable on a pod's main container that carries its identity.
    pub identity_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            agent_cluster: "system".to_string(),
            agent_sector: "main".to_string(),
            agent_service: "agent".to_string(),
            identity_env: "POD_IDENTITY".to_string(),
        }
    }
}

/// A deployment scope. Workloads without a `deployment` label share the common scope, which also
/// serves as the lookup fallback for every named scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Common,
    Named(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Common => f.write_str("common"),
            Scope::Named(name) => f.write_str(name),
        }
    }
}

/// Routes a fired debounce timer back to the invalidator that owns the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueId {
    Infra,
    Deployment(Scope),
    ServicePods(Scope, ServiceId),
}

/// A debounce timer expiry, delivered to [`Controller::process_wake`].
#[derive(Clone, Debug)]
pub struct Wake {
    pub queue: QueueId,
    pub key: EntityRef,
}

/// Hands debounce timers to the runtime: each schedule spawns a sleep that sends a [`Wake`] when
/// it fires.
#[derive(Clone, Debug)]
pub(crate) struct Scheduler {
    tx: mpsc::UnboundedSender<Wake>,
    debounce: Duration,
}

impl Scheduler {
    pub(crate) fn schedule(&self, queue: QueueId, key: EntityRef) {
        let tx = self.tx.clone();
        let delay = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The receiver only closes on shutdown.
            let _ = tx.send(Wake { queue, key });
        });
    }
}

/// The root of the index: the physical layer plus one logical layer per deployment scope.
pub struct Controller {
    config: Arc<Config>,
    metrics: metrics::Metrics,
    scheduler: Scheduler,
    sink: Arc<dyn MetadataSink>,

    infra: Infra,
    common: Deployment,
    deployments: HashMap<String, Deployment>,

    /// Watch deletions carry only namespace and name; these map them back to index keys.
    pod_routes: HashMap<(String, String), PodRoute>,
    definition_routes: HashMap<(String, String), (Scope, ServiceId)>,
}

#[derive(Clone, Debug)]
struct PodRoute {
    scope: Scope,
    service: ServiceId,
    uid: String,
    identity: Option<String>,
}

/// Drains the wake channel, running one recomputation pass per expired timer.
pub async fn process_wakes(index: SharedIndex, mut wakes: mpsc::UnboundedReceiver<Wake>) {
    while let Some(wake) = wakes.recv().await {
        index.write().process_wake(wake);
    }
}

// === impl Controller ===

impl Controller {
    pub fn shared(
        config: Config,
        metrics: metrics::Metrics,
        sink: Arc<dyn MetadataSink>,
    ) -> (SharedIndex, mpsc::UnboundedReceiver<Wake>) {
        let (tx, wakes) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            tx,
            debounce: config.debounce,
        };
        let controller = Self {
            config: Arc::new(config),
            metrics,
            scheduler: scheduler.clone(),
            sink,
            infra: Infra::new(),
            common: Deployment::new(Scope::Common, scheduler),
            deployments: HashMap::default(),
            pod_routes: HashMap::default(),
            definition_routes: HashMap::default(),
        };
        (Arc::new(RwLock::new(controller)), wakes)
    }

    /// Runs the recomputation pass for one expired debounce timer.
    pub fn process_wake(&mut self, wake: Wake) {
        match wake.queue {
            QueueId::Infra => self.run_infra_pass(wake.key),
            QueueId::Deployment(scope) => self.run_deployment_pass(scope, wake.key),
            QueueId::ServicePods(scope, service) => self.run_pod_pass(scope, service, wake.key),
        }
    }

    /// Releases every handler and subscription the index registered on itself.
    pub fn shutdown(&mut self) {
        self.infra.shutdown();
        self.common.shutdown();
        for dep in self.deployments.values_mut() {
            dep.shutdown();
        }
    }

    fn apply_pod_event(
        &mut self,
        scope: Scope,
        service: ServiceId,
        pod: &k8s::Pod,
        namespace: String,
        name: String,
    ) {
        let Some(mut record) = PodRecord::parse(pod, scope.clone(), service.clone(), &self.config)
        else {
            warn!(%namespace, %name, "Pod event without uid");
            return;
        };
        let uid = record.uid.clone();
        let present = record.is_present();
        debug!(%namespace, %name, %uid, present, "Indexing pod");

        self.pod_routes.insert(
            (namespace, name),
            PodRoute {
                scope: scope.clone(),
                service: service.clone(),
                uid: uid.clone(),
                identity: record.identity.clone(),
            },
        );

        {
            let dep = self.fetch_deployment_mut(&scope);
            let svc = dep.fetch_service(&service);
            record.endpoints = record.build_endpoints(&svc.provided);
            if present {
                if let Some(identity) = &record.identity {
                    svc.pods.insert(identity.clone(), uid.clone());
                }
            } else if let Some(identity) = &record.identity {
                // A replacement pod may already own this identity; only the mapped uid may
                // retract it.
                if svc.pods.get(identity) == Some(&uid) {
                    svc.pods.remove(identity);
                }
            }
        }

        if present {
            // Placement notifications only fire when edges move; an in-place update that
            // changes the pod's endpoints must force a re-publish itself.
            let endpoints_changed = self
                .infra
                .pods
                .get(&uid)
                .is_some_and(|prior| prior.endpoints != record.endpoints);
            self.infra_add_pod(record);
            if endpoints_changed {
                self.invalidate_pod_metadata(&uid);
            }
        } else {
            self.infra_remove_pod(&uid);
        }
        self.deployment_invalidate(&scope, Kind::Pods, service.as_str());
    }

    fn delete_pod(&mut self, namespace: String, name: String) {
        let Some(route) = self.pod_routes.remove(&(namespace.clone(), name.clone())) else {
            trace!(%namespace, %name, "Deletion of untracked pod");
            return;
        };
        debug!(%namespace, %name, uid = %route.uid, "Removing pod");

        if let Some(svc) = self
            .deployment_mut(&route.scope)
            .and_then(|dep| dep.services.get_mut(&route.service))
        {
            if let Some(identity) = &route.identity {
                if svc.pods.get(identity) == Some(&route.uid) {
                    svc.pods.remove(identity);
                }
            }
        }

        self.infra_remove_pod(&route.uid);
        self.deployment_invalidate(&route.scope, Kind::Pods, route.service.as_str());
    }

    pub(crate) fn deployment(&self, scope: &Scope) -> Option<&Deployment> {
        match scope {
            Scope::Common => Some(&self.common),
            Scope::Named(name) => self.deployments.get(name),
        }
    }

    pub(crate) fn deployment_mut(&mut self, scope: &Scope) -> Option<&mut Deployment> {
        match scope {
            Scope::Common => Some(&mut self.common),
            Scope::Named(name) => self.deployments.get_mut(name),
        }
    }

    /// Lazily creates the scope on first reference.
    pub(crate) fn fetch_deployment_mut(&mut self, scope: &Scope) -> &mut Deployment {
        match scope {
            Scope::Common => &mut self.common,
            Scope::Named(name) => {
                if !self.deployments.contains_key(name) {
                    info!(deployment = %name, "Creating deployment scope");
                }
                self.deployments
                    .entry(name.clone())
                    .or_insert_with(|| Deployment::new(scope.clone(), self.scheduler.clone()))
            }
        }
    }

    /// Looks a service up in its own scope, falling back to the common scope.
    pub(crate) fn find_service(&self, scope: &Scope, id: &ServiceId) -> Option<&service::Service> {
        self.deployment(scope)
            .and_then(|dep| dep.services.get(id))
            .or_else(|| self.common.services.get(id))
    }

    /// The scope a service actually lives in, honoring the common fallback.
    pub(crate) fn owning_scope(&self, scope: &Scope, id: &ServiceId) -> Option<Scope> {
        if self
            .deployment(scope)
            .is_some_and(|dep| dep.services.contains_key(id))
        {
            Some(scope.clone())
        } else if self.common.services.contains_key(id) {
            Some(Scope::Common)
        } else {
            None
        }
    }

    pub(crate) fn deployment_invalidate(&mut self, scope: &Scope, kind: Kind, id: &str) {
        if let Some(dep) = self.deployment_mut(scope) {
            dep.invalidate(kind, id);
        }
    }

}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Controller {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_unchecked();
        let empty = BTreeMap::new();
        let pod_labels = pod.metadata.labels.as_ref().unwrap_or(&empty);

        if pod_labels.get(labels::MANAGED).map(String::as_str) != Some("true") {
            trace!(%namespace, %name, "Ignoring unmanaged pod");
            return;
        }
        let Some(service) = service_id_from_labels(pod_labels) else {
            info!(%namespace, %name, "Pod carries no service identity; skipping");
            return;
        };
        let scope = scope_from_labels(pod_labels);
        self.apply_pod_event(scope, service, &pod, namespace, name);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::MeshService> for Controller {
    fn apply(&mut self, resource: k8s::MeshService) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let empty = BTreeMap::new();
        let resource_labels = resource.metadata.labels.as_ref().unwrap_or(&empty);

        let Some(service) = service_id_from_labels(resource_labels) else {
            info!(%namespace, %name, "Definition carries no service identity; skipping");
            return;
        };
        let scope = scope_from_labels(resource_labels);
        self.definition_routes
            .insert((namespace, name), (scope.clone(), service.clone()));
        self.apply_definition(&scope, &service, Some(resource.spec));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some((scope, service)) = self.definition_routes.remove(&(namespace, name)) else {
            return;
        };
        self.apply_definition(&scope, &service, None);
    }
}

/// The service identity addressed by a resource's `cluster`/`sector`/`service` labels.
fn service_id_from_labels(resource_labels: &BTreeMap<String, String>) -> Option<ServiceId> {
    Some(ServiceId::new(
        resource_labels.get(labels::CLUSTER)?,
        resource_labels.get(labels::SECTOR)?,
        resource_labels.get(labels::SERVICE)?,
    ))
}

fn scope_from_labels(resource_labels: &BTreeMap<String, String>) -> Scope {
    match resource_labels.get(labels::DEPLOYMENT) {
        Some(name) if !name.is_empty() => Scope::Named(name.clone()),
        _ => Scope::Common,
    }
}
