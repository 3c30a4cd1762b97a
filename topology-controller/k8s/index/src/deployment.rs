//! A logical layer scoped to one deployment: its services, clusters, and consumption edges.

use crate::cluster::Cluster;
use crate::service::Service;
use crate::{ClusterId, Controller, QueueId, Scheduler, Scope, ServiceId};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use topology_controller_core::{
    EntityRef, Invalidator, Kind, Notification, PassOutcome, RelationStore, SubscriptionToken,
};
use tracing::{debug, error, info};

/// Relation subscriptions owned by a deployment scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeploymentWatch {
    /// `service -> service`: a consumer declared or retracted a provider.
    ServiceConsumers,
    /// `cluster -> service`: the set of services backing a cluster changed.
    ClusterServices,
}

/// Invalidation handlers owned by a deployment scope. The key's id names the service (or
/// cluster) the handler rebuilds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeploymentHandler {
    RebuildPods,
    RebuildMetadata,
    RebuildConsumed { consumer: ServiceId },
    RebuildClusterProvided,
}

pub(crate) struct Deployment {
    pub(crate) scope: Scope,
    pub(crate) scheduler: Scheduler,
    pub(crate) relations: RelationStore<DeploymentWatch>,
    pub(crate) invalidator: Invalidator<DeploymentHandler>,
    pub(crate) services: HashMap<ServiceId, Service>,
    pub(crate) clusters: HashMap<ClusterId, Cluster>,
    /// The services of each cluster, maintained as services are created in this scope.
    pub(crate) cluster_services: HashMap<ClusterId, HashSet<ServiceId>>,

    watch_tokens: Vec<SubscriptionToken>,
}

// === impl Deployment ===

impl Deployment {
    pub(crate) fn new(scope: Scope, scheduler: Scheduler) -> Self {
        let mut relations = RelationStore::default();
        let watch_tokens = vec![
            relations.monitor(Kind::Service, Kind::Service, DeploymentWatch::ServiceConsumers),
            relations.monitor(Kind::Cluster, Kind::Service, DeploymentWatch::ClusterServices),
        ];
        Self {
            scope,
            scheduler,
            relations,
            invalidator: Invalidator::default(),
            services: HashMap::default(),
            clusters: HashMap::default(),
            cluster_services: HashMap::default(),
            watch_tokens,
        }
    }

    pub(crate) fn invalidate(&mut self, kind: Kind, id: &str) {
        let key = EntityRef::new(kind, id);
        if self.invalidator.invalidate(&key) {
            self.scheduler
                .schedule(QueueId::Deployment(self.scope.clone()), key);
        }
    }

    /// Lazily creates the service (and its cluster) on first reference, registering the rebuild
    /// handlers that keep it current.
    pub(crate) fn fetch_service(&mut self, id: &ServiceId) -> &mut Service {
        if !self.services.contains_key(id) {
            debug!(scope = %self.scope, service = %id, "Creating service");
            let mut service = Service::new(self.scope.clone(), id.clone(), self.scheduler.clone());

            let pods_key = EntityRef::new(Kind::Pods, id.as_str());
            let (token, schedule) = self
                .invalidator
                .handle(pods_key.clone(), DeploymentHandler::RebuildPods);
            service.track_handler(token);
            if schedule {
                self.scheduler
                    .schedule(QueueId::Deployment(self.scope.clone()), pods_key);
            }

            let metadata_key = EntityRef::new(Kind::Metadata, id.as_str());
            let (token, schedule) = self
                .invalidator
                .handle(metadata_key.clone(), DeploymentHandler::RebuildMetadata);
            service.track_handler(token);
            if schedule {
                self.scheduler
                    .schedule(QueueId::Deployment(self.scope.clone()), metadata_key);
            }

            let cluster_id = service.cluster_id.clone();
            if !self.clusters.contains_key(&cluster_id) {
                let mut cluster = Cluster::default();
                let cluster_key = EntityRef::new(Kind::ClusterProvided, cluster_id.as_str());
                let (token, schedule) = self
                    .invalidator
                    .handle(cluster_key.clone(), DeploymentHandler::RebuildClusterProvided);
                cluster.track_handler(token);
                if schedule {
                    self.scheduler
                        .schedule(QueueId::Deployment(self.scope.clone()), cluster_key);
                }
                self.clusters.insert(cluster_id.clone(), cluster);
            }
            self.cluster_services
                .entry(cluster_id)
                .or_default()
                .insert(id.clone());

            self.services.insert(id.clone(), service);
        }
        self.services.get_mut(id).expect("service was just created")
    }

    pub(crate) fn shutdown(&mut self) {
        for service in self.services.values_mut() {
            for token in service.release_handlers() {
                self.invalidator.remove_handler(token);
            }
        }
        for cluster in self.clusters.values_mut() {
            for token in cluster.release_handlers() {
                self.invalidator.remove_handler(token);
            }
        }
        for token in self.watch_tokens.drain(..) {
            self.relations.unsubscribe(token);
        }
    }
}

// === impl Controller: logical layer plumbing ===

impl Controller {
    pub(crate) fn dispatch_deployment_changes(
        &mut self,
        scope: &Scope,
        changes: Vec<Notification<DeploymentWatch>>,
    ) {
        for change in changes {
            self.metrics.relation_changes.inc();
            match change.tag {
                DeploymentWatch::ServiceConsumers => {
                    let consumer = ServiceId::from_raw(change.src.id.clone());
                    self.handle_consumer(scope, &consumer, change.present, &change.target.id);
                }
                DeploymentWatch::ClusterServices => {
                    let cluster = ClusterId::from_raw(change.src.id.clone());
                    self.handle_service_mapping(scope, &cluster, change.present);
                }
            }
        }
    }

    /// Tracks (or drops) a consumer's interest in one provider: a handler on the provider's
    /// consumers key that rebuilds this consumer's resolved peers.
    fn handle_consumer(&mut self, scope: &Scope, consumer: &ServiceId, present: bool, provider: &str) {
        let Some(owner) = self.owning_scope(scope, consumer) else {
            error!(%scope, %consumer, "Consumer change for unknown service");
            return;
        };
        debug!(scope = %owner, %consumer, %provider, present, "Consumer edge changed");

        let scheduler = self.scheduler.clone();
        let Some(dep) = self.deployment_mut(&owner) else {
            return;
        };
        let Some(service) = dep.services.get_mut(consumer) else {
            return;
        };
        if present {
            if service.consumer_handles.contains_key(provider) {
                return;
            }
            let key = EntityRef::new(Kind::Consumers, provider);
            let (token, schedule) = dep.invalidator.handle(
                key.clone(),
                DeploymentHandler::RebuildConsumed {
                    consumer: consumer.clone(),
                },
            );
            service.consumer_handles.insert(provider.to_string(), token);
            if schedule {
                scheduler.schedule(QueueId::Deployment(owner.clone()), key);
            }
        } else if let Some(token) = service.consumer_handles.remove(provider) {
            dep.invalidator.remove_handler(token);
        }
    }

    /// A cluster's service set changed; anything consuming through the cluster must re-resolve.
    fn handle_service_mapping(&mut self, scope: &Scope, cluster: &ClusterId, present: bool) {
        let owner = if self
            .deployment(scope)
            .is_some_and(|dep| dep.clusters.contains_key(cluster))
        {
            scope.clone()
        } else if self.common.clusters.contains_key(cluster) {
            Scope::Common
        } else {
            error!(%scope, %cluster, "Service mapping change for unknown cluster");
            return;
        };
        info!(scope = %owner, %cluster, present, "Cluster service set changed");
        self.invalidate_consumers(&owner, cluster.as_str());
    }

    /// Invalidates the consumers key of a provider (or cluster) id. A change in the common scope
    /// is visible from every scope, so it fans out to all of them.
    pub(crate) fn invalidate_consumers(&mut self, scope: &Scope, id: &str) {
        match scope {
            Scope::Named(_) => self.deployment_invalidate(scope, Kind::Consumers, id),
            Scope::Common => {
                self.common.invalidate(Kind::Consumers, id);
                for dep in self.deployments.values_mut() {
                    dep.invalidate(Kind::Consumers, id);
                }
            }
        }
    }

    pub(crate) fn run_deployment_pass(&mut self, scope: Scope, key: EntityRef) {
        loop {
            let Some(revision) = self
                .deployment_mut(&scope)
                .and_then(|dep| dep.invalidator.begin(&key))
            else {
                return;
            };
            self.metrics.invalidation_passes.inc();

            let handlers = self
                .deployment(&scope)
                .map(|dep| dep.invalidator.handlers(&key))
                .unwrap_or_default();
            let mut success = true;
            for handler in handlers {
                if let Err(error) = self.run_deployment_handler(&scope, &key, handler) {
                    error!(%scope, %key, %error, "Invalidation handler failed");
                    success = false;
                    break;
                }
            }
            if !success {
                self.metrics.invalidation_failures.inc();
            }

            let Some(dep) = self.deployment_mut(&scope) else {
                return;
            };
            match dep.invalidator.complete(&key, revision, success) {
                PassOutcome::RunNow => continue,
                PassOutcome::Reschedule => {
                    self.scheduler
                        .schedule(QueueId::Deployment(scope.clone()), key);
                    return;
                }
                PassOutcome::Converged => return,
            }
        }
    }

    fn run_deployment_handler(
        &mut self,
        scope: &Scope,
        key: &EntityRef,
        handler: DeploymentHandler,
    ) -> anyhow::Result<()> {
        match handler {
            DeploymentHandler::RebuildPods => {
                self.rebuild_pods(scope, &ServiceId::from_raw(key.id.clone()))
            }
            DeploymentHandler::RebuildMetadata => {
                self.rebuild_metadata(scope, &ServiceId::from_raw(key.id.clone()))
            }
            DeploymentHandler::RebuildConsumed { consumer } => {
                self.rebuild_consumed(scope, &consumer)
            }
            DeploymentHandler::RebuildClusterProvided => {
                self.rebuild_cluster_provided(scope, &ClusterId::from_raw(key.id.clone()))
            }
        }
    }
}
