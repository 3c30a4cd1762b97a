//! The physical layer: pod placement on nodes and per-node agent election.

use crate::pod::PodRecord;
use crate::{Controller, QueueId};
use ahash::AHashMap as HashMap;
use topology_controller_core::{
    EntityRef, HandlerToken, Invalidator, Kind, Notification, PassOutcome, RelationStore,
    SubscriptionToken,
};
use tracing::{debug, error, info};

/// Relation subscriptions owned by the physical layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InfraWatch {
    /// `pod -> node`: a pod landed on or left a node.
    PodPlacement,
    /// `pod -> node-agent`: the candidate pool for a node's agent changed.
    AgentCandidates,
}

/// Subscriptions on the election result store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AgentWatch {
    /// `node -> agent-pod`: the node's elected agent changed.
    ActiveAgent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InfraHandler {
    ElectNodeAgent,
}

pub(crate) struct Infra {
    /// Pod placement and agent candidacy edges.
    pub(crate) relations: RelationStore<InfraWatch>,
    pub(crate) invalidator: Invalidator<InfraHandler>,
    /// Election results, kept separate so consumers observe only settled agents.
    pub(crate) agent_relations: RelationStore<AgentWatch>,
    /// Every indexed pod by uid; the single source of truth for pod state.
    pub(crate) pods: HashMap<String, PodRecord>,

    watch_tokens: Vec<SubscriptionToken>,
    agent_watch_tokens: Vec<SubscriptionToken>,
    handler_tokens: Vec<HandlerToken>,
}

// === impl Infra ===

impl Infra {
    pub(crate) fn new() -> Self {
        let mut relations = RelationStore::default();
        let watch_tokens = vec![
            relations.monitor(Kind::Pod, Kind::Node, InfraWatch::PodPlacement),
            relations.monitor(Kind::Pod, Kind::NodeAgent, InfraWatch::AgentCandidates),
        ];

        let mut agent_relations = RelationStore::default();
        let agent_watch_tokens =
            vec![agent_relations.monitor(Kind::Node, Kind::AgentPod, AgentWatch::ActiveAgent)];

        let mut invalidator = Invalidator::default();
        // No node-agent key exists yet, so nothing needs scheduling.
        let (token, _) = invalidator.handle_all(Kind::NodeAgent, InfraHandler::ElectNodeAgent);

        Self {
            relations,
            invalidator,
            agent_relations,
            pods: HashMap::default(),
            watch_tokens,
            agent_watch_tokens,
            handler_tokens: vec![token],
        }
    }

    /// The agent currently elected for a node, if any.
    pub(crate) fn node_agent_pod(&self, node: &str) -> Option<&PodRecord> {
        let agents = self
            .agent_relations
            .target_ids_by_kind(&EntityRef::new(Kind::Node, node), Kind::AgentPod);
        agents.first().and_then(|uid| self.pods.get(uid))
    }

    pub(crate) fn shutdown(&mut self) {
        for token in self.handler_tokens.drain(..) {
            self.invalidator.remove_handler(token);
        }
        for token in self.watch_tokens.drain(..) {
            self.relations.unsubscribe(token);
        }
        for token in self.agent_watch_tokens.drain(..) {
            self.agent_relations.unsubscribe(token);
        }
    }
}

// === impl Controller: physical layer ===

impl Controller {
    /// Registers (or refreshes) a present pod's placement and, for agent pods, its candidacy for
    /// the node agent role.
    pub(crate) fn infra_add_pod(&mut self, record: PodRecord) {
        let uid = record.uid.clone();
        let Some(node) = record.node.clone() else {
            return;
        };
        let is_agent = record.is_agent;
        debug!(%uid, pod = %record.name, %node, is_agent, "Placing pod");
        self.infra.pods.insert(uid.clone(), record);

        let mut targets = vec![EntityRef::new(Kind::Node, node.clone())];
        if is_agent {
            targets.push(EntityRef::new(Kind::NodeAgent, node.clone()));
            // Candidacy edges don't move on refresh, so presence flaps of an existing agent
            // must force a re-election explicitly.
            self.infra_invalidate_node_agent(&node);
        }
        let changes = self
            .infra
            .relations
            .replace_source(&EntityRef::new(Kind::Pod, uid), targets);
        self.dispatch_infra_changes(changes);
    }

    pub(crate) fn infra_remove_pod(&mut self, uid: &str) {
        self.infra.pods.remove(uid);
        let changes = self
            .infra
            .relations
            .remove_source(&EntityRef::new(Kind::Pod, uid));
        self.dispatch_infra_changes(changes);
    }

    fn infra_invalidate_node_agent(&mut self, node: &str) {
        let key = EntityRef::new(Kind::NodeAgent, node);
        if self.infra.invalidator.invalidate(&key) {
            self.scheduler.schedule(QueueId::Infra, key);
        }
    }

    fn dispatch_infra_changes(&mut self, changes: Vec<Notification<InfraWatch>>) {
        for change in changes {
            self.metrics.relation_changes.inc();
            match change.tag {
                InfraWatch::PodPlacement => {
                    debug!(pod = %change.src.id, node = %change.target.id, present = change.present, "Pod placement changed");
                    if change.present {
                        self.invalidate_pod_metadata(&change.src.id);
                    }
                }
                InfraWatch::AgentCandidates => {
                    // Both arrival and departure of a candidate re-run the election, so a
                    // standby agent is promoted when the active one goes away.
                    self.infra_invalidate_node_agent(&change.target.id);
                }
            }
        }
    }

    fn dispatch_agent_changes(&mut self, changes: Vec<Notification<AgentWatch>>) {
        for change in changes {
            self.metrics.relation_changes.inc();
            let AgentWatch::ActiveAgent = change.tag;
            info!(node = %change.src.id, agent = %change.target.id, present = change.present, "Node agent changed");

            // Every pod on the node reports to its agent, so all of them must re-publish.
            let pods = self
                .infra
                .relations
                .source_ids_by_kind(&change.src, Kind::Pod);
            for uid in pods {
                self.invalidate_pod_metadata(&uid);
            }
        }
    }

    pub(crate) fn run_infra_pass(&mut self, key: EntityRef) {
        loop {
            let Some(revision) = self.infra.invalidator.begin(&key) else {
                return;
            };
            self.metrics.invalidation_passes.inc();
            let mut success = true;
            for handler in self.infra.invalidator.handlers(&key) {
                let result = match handler {
                    InfraHandler::ElectNodeAgent => self.elect_node_agent(&key.id),
                };
                if let Err(error) = result {
                    error!(%key, %error, "Infra invalidation handler failed");
                    success = false;
                    break;
                }
            }
            if !success {
                self.metrics.invalidation_failures.inc();
            }
            match self.infra.invalidator.complete(&key, revision, success) {
                PassOutcome::RunNow => continue,
                PassOutcome::Reschedule => {
                    self.scheduler.schedule(QueueId::Infra, key);
                    return;
                }
                PassOutcome::Converged => return,
            }
        }
    }

    /// Elects the node's agent from present candidate pods; the lowest uid wins so concurrent
    /// controllers settle on the same pod.
    fn elect_node_agent(&mut self, node: &str) -> anyhow::Result<()> {
        let mut candidates = self
            .infra
            .relations
            .source_ids_by_kind(&EntityRef::new(Kind::NodeAgent, node), Kind::Pod);
        candidates.sort();

        let elected = candidates
            .into_iter()
            .find(|uid| self.infra.pods.get(uid).is_some_and(PodRecord::is_present));
        debug!(%node, agent = ?elected, "Elected node agent");

        let targets = elected
            .map(|uid| vec![EntityRef::new(Kind::AgentPod, uid)])
            .unwrap_or_default();
        let changes = self
            .infra
            .agent_relations
            .replace_source(&EntityRef::new(Kind::Node, node), targets);
        self.dispatch_agent_changes(changes);
        Ok(())
    }
}
