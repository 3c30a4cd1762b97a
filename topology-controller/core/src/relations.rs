use crate::{EntityRef, Kind};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::collections::BTreeMap;

/// A directed relation index with its inverse, plus change subscriptions.
///
/// An edge `(src kind, src id) -> (target kind, target id)` and its inverse are always inserted
/// and removed together within a single call, so the query API never observes a half-present
/// edge. Subscribers register a tag value `T` at one of three scopes (source kind, target kind,
/// or the kind pair); mutations return the matching notifications, in registration order per
/// scope, for the owning graph to dispatch before its own mutating call returns.
#[derive(Debug)]
pub struct RelationStore<T> {
    forward: EdgeIndex,
    inverse: EdgeIndex,

    src_subs: HashMap<Kind, BTreeMap<u64, T>>,
    target_subs: HashMap<Kind, BTreeMap<u64, T>>,
    pair_subs: HashMap<(Kind, Kind), BTreeMap<u64, T>>,

    /// Token arena; maps a token back to the scope it was registered under.
    tokens: HashMap<u64, SubScope>,
    next_token: u64,
}

/// kind -> id -> target kind -> target ids.
type EdgeIndex = HashMap<Kind, HashMap<String, HashMap<Kind, HashSet<String>>>>;

/// A change notification delivered to one subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification<T> {
    pub tag: T,
    pub present: bool,
    pub src: EntityRef,
    pub target: EntityRef,
}

/// Handle returned by the `monitor*` methods; release is idempotent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Clone, Debug)]
enum SubScope {
    Src(Kind),
    Target(Kind),
    Pair(Kind, Kind),
}

impl<T> Default for RelationStore<T> {
    fn default() -> Self {
        Self {
            forward: EdgeIndex::default(),
            inverse: EdgeIndex::default(),
            src_subs: HashMap::default(),
            target_subs: HashMap::default(),
            pair_subs: HashMap::default(),
            tokens: HashMap::default(),
            next_token: 0,
        }
    }
}

impl<T: Clone> RelationStore<T> {
    /// Inserts the edge and its inverse if not already present. Returns the notifications to
    /// dispatch; empty when the edge already existed.
    pub fn add(&mut self, src: &EntityRef, target: &EntityRef) -> Vec<Notification<T>> {
        if !Self::raw_add(&mut self.forward, src, target) {
            return Vec::new();
        }
        Self::raw_add(&mut self.inverse, target, src);
        self.notifications(true, src, target)
    }

    /// Symmetric deletion; notifies only if the edge existed.
    pub fn remove(&mut self, src: &EntityRef, target: &EntityRef) -> Vec<Notification<T>> {
        if !Self::raw_remove(&mut self.forward, src, target) {
            return Vec::new();
        }
        Self::raw_remove(&mut self.inverse, target, src);
        self.notifications(false, src, target)
    }

    /// Diffs the node's current target set against `desired` (deduplicated by kind+id) and emits
    /// the minimal add/remove sequence. This is the primary write path: callers always express
    /// "this is now my full target set".
    pub fn replace_source(
        &mut self,
        src: &EntityRef,
        desired: Vec<EntityRef>,
    ) -> Vec<Notification<T>> {
        let current: HashSet<EntityRef> = self.all_targets(src).into_iter().collect();
        let mut desired_set = HashSet::with_capacity(desired.len());
        let mut adds = Vec::new();
        for target in desired {
            if desired_set.insert(target.clone()) && !current.contains(&target) {
                adds.push(target);
            }
        }

        let mut notifications = Vec::new();
        for target in current {
            if !desired_set.contains(&target) {
                notifications.extend(self.remove(src, &target));
            }
        }
        for target in adds {
            notifications.extend(self.add(src, &target));
        }
        notifications
    }

    pub fn remove_source(&mut self, src: &EntityRef) -> Vec<Notification<T>> {
        self.replace_source(src, Vec::new())
    }

    fn notifications(
        &self,
        present: bool,
        src: &EntityRef,
        target: &EntityRef,
    ) -> Vec<Notification<T>> {
        let subscribers = self
            .src_subs
            .get(&src.kind)
            .into_iter()
            .chain(self.target_subs.get(&target.kind))
            .chain(self.pair_subs.get(&(src.kind, target.kind)))
            .flat_map(|subs| subs.values());

        subscribers
            .map(|tag| Notification {
                tag: tag.clone(),
                present,
                src: src.clone(),
                target: target.clone(),
            })
            .collect()
    }
}

impl<T> RelationStore<T> {
    pub fn target_ids_by_kind(&self, src: &EntityRef, target_kind: Kind) -> Vec<String> {
        Self::raw_ids_by_kind(&self.forward, src, target_kind)
    }

    pub fn source_ids_by_kind(&self, target: &EntityRef, src_kind: Kind) -> Vec<String> {
        Self::raw_ids_by_kind(&self.inverse, target, src_kind)
    }

    /// Enumerates every entity reachable from `src` in one hop.
    pub fn all_targets(&self, src: &EntityRef) -> Vec<EntityRef> {
        Self::raw_all(&self.forward, src)
    }

    pub fn all_sources(&self, target: &EntityRef) -> Vec<EntityRef> {
        Self::raw_all(&self.inverse, target)
    }

    pub fn contains(&self, src: &EntityRef, target: &EntityRef) -> bool {
        self.forward
            .get(&src.kind)
            .and_then(|ids| ids.get(&src.id))
            .and_then(|targets| targets.get(&target.kind))
            .is_some_and(|ids| ids.contains(&target.id))
    }

    /// Subscribes to every change with the given source and target kinds.
    pub fn monitor(&mut self, src_kind: Kind, target_kind: Kind, tag: T) -> SubscriptionToken {
        let token = self.mint_token(SubScope::Pair(src_kind, target_kind));
        self.pair_subs
            .entry((src_kind, target_kind))
            .or_default()
            .insert(token.0, tag);
        token
    }

    /// Subscribes to every change with the given source kind.
    pub fn monitor_src(&mut self, src_kind: Kind, tag: T) -> SubscriptionToken {
        let token = self.mint_token(SubScope::Src(src_kind));
        self.src_subs
            .entry(src_kind)
            .or_default()
            .insert(token.0, tag);
        token
    }

    /// Subscribes to every change with the given target kind.
    pub fn monitor_target(&mut self, target_kind: Kind, tag: T) -> SubscriptionToken {
        let token = self.mint_token(SubScope::Target(target_kind));
        self.target_subs
            .entry(target_kind)
            .or_default()
            .insert(token.0, tag);
        token
    }

    /// Releases a subscription. Idempotent; prunes now-empty scope levels.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) {
        let Some(scope) = self.tokens.remove(&token.0) else {
            return;
        };
        match scope {
            SubScope::Src(kind) => Self::prune_subs(&mut self.src_subs, &kind, token.0),
            SubScope::Target(kind) => Self::prune_subs(&mut self.target_subs, &kind, token.0),
            SubScope::Pair(src, target) => {
                Self::prune_subs(&mut self.pair_subs, &(src, target), token.0)
            }
        }
    }

    fn mint_token(&mut self, scope: SubScope) -> SubscriptionToken {
        let id = self.next_token;
        self.next_token += 1;
        self.tokens.insert(id, scope);
        SubscriptionToken(id)
    }

    fn prune_subs<K: std::hash::Hash + Eq>(
        subs: &mut HashMap<K, BTreeMap<u64, T>>,
        key: &K,
        token: u64,
    ) {
        if let Some(entries) = subs.get_mut(key) {
            entries.remove(&token);
            if entries.is_empty() {
                subs.remove(key);
            }
        }
    }

    fn raw_add(index: &mut EdgeIndex, src: &EntityRef, target: &EntityRef) -> bool {
        index
            .entry(src.kind)
            .or_default()
            .entry(src.id.clone())
            .or_default()
            .entry(target.kind)
            .or_default()
            .insert(target.id.clone())
    }

    fn raw_remove(index: &mut EdgeIndex, src: &EntityRef, target: &EntityRef) -> bool {
        let Some(ids) = index.get_mut(&src.kind) else {
            return false;
        };
        let Some(targets) = ids.get_mut(&src.id) else {
            return false;
        };
        let Some(target_ids) = targets.get_mut(&target.kind) else {
            return false;
        };
        if !target_ids.remove(&target.id) {
            return false;
        }

        if target_ids.is_empty() {
            targets.remove(&target.kind);
        }
        if targets.is_empty() {
            ids.remove(&src.id);
        }
        if ids.is_empty() {
            index.remove(&src.kind);
        }
        true
    }

    fn raw_ids_by_kind(index: &EdgeIndex, src: &EntityRef, target_kind: Kind) -> Vec<String> {
        index
            .get(&src.kind)
            .and_then(|ids| ids.get(&src.id))
            .and_then(|targets| targets.get(&target_kind))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn raw_all(index: &EdgeIndex, src: &EntityRef) -> Vec<EntityRef> {
        let Some(targets) = index.get(&src.kind).and_then(|ids| ids.get(&src.id)) else {
            return Vec::new();
        };
        targets
            .iter()
            .flat_map(|(kind, ids)| ids.iter().map(|id| EntityRef::new(*kind, id.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(id: &str) -> EntityRef {
        EntityRef::new(Kind::Pod, id)
    }

    fn node(id: &str) -> EntityRef {
        EntityRef::new(Kind::Node, id)
    }

    #[test]
    fn add_is_idempotent() {
        let mut store = RelationStore::<&str>::default();
        store.monitor(Kind::Pod, Kind::Node, "watch");

        assert_eq!(store.add(&pod("p1"), &node("n1")).len(), 1);
        assert_eq!(store.add(&pod("p1"), &node("n1")).len(), 0);
        assert_eq!(store.target_ids_by_kind(&pod("p1"), Kind::Node), ["n1"]);
    }

    #[test]
    fn remove_of_absent_edge_notifies_nothing() {
        let mut store = RelationStore::<&str>::default();
        store.monitor(Kind::Pod, Kind::Node, "watch");

        assert!(store.remove(&pod("p1"), &node("n1")).is_empty());

        store.add(&pod("p1"), &node("n1"));
        let removed = store.remove(&pod("p1"), &node("n1"));
        assert_eq!(removed.len(), 1);
        assert!(!removed[0].present);
        assert!(store.remove(&pod("p1"), &node("n1")).is_empty());
    }

    #[test]
    fn inverse_stays_symmetric() {
        let mut store = RelationStore::<()>::default();
        store.add(&pod("p1"), &node("n1"));
        store.add(&pod("p2"), &node("n1"));

        assert_eq!(
            store.source_ids_by_kind(&node("n1"), Kind::Pod).len(),
            2,
            "both pods reach n1 through the inverse index"
        );

        store.remove(&pod("p1"), &node("n1"));
        assert_eq!(store.source_ids_by_kind(&node("n1"), Kind::Pod), ["p2"]);
        assert!(store.target_ids_by_kind(&pod("p1"), Kind::Node).is_empty());
    }

    #[test]
    fn replace_source_emits_minimal_diff() {
        let mut store = RelationStore::<&str>::default();
        store.monitor_src(Kind::Pod, "watch");

        store.replace_source(&pod("p1"), vec![node("n1"), node("n2")]);

        // n1 is kept, n2 is dropped, n3 is added: exactly one remove and one add.
        let changes = store.replace_source(&pod("p1"), vec![node("n1"), node("n3")]);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.iter().filter(|c| !c.present).count(), 1);
        assert_eq!(changes.iter().filter(|c| c.present).count(), 1);

        let mut targets = store.target_ids_by_kind(&pod("p1"), Kind::Node);
        targets.sort();
        assert_eq!(targets, ["n1", "n3"]);
    }

    #[test]
    fn replace_source_deduplicates_desired_targets() {
        let mut store = RelationStore::<&str>::default();
        store.monitor_src(Kind::Pod, "watch");

        let changes = store.replace_source(&pod("p1"), vec![node("n1"), node("n1")]);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn subscription_scopes_are_independent() {
        let mut store = RelationStore::<&str>::default();
        store.monitor_src(Kind::Pod, "src");
        store.monitor_target(Kind::Node, "target");
        store.monitor(Kind::Pod, Kind::Node, "pair");
        store.monitor(Kind::Service, Kind::Node, "other-pair");

        let changes = store.add(&pod("p1"), &node("n1"));
        let mut tags = changes.iter().map(|c| c.tag).collect::<Vec<_>>();
        tags.sort_unstable();
        assert_eq!(tags, ["pair", "src", "target"]);

        let changes = store.add(&EntityRef::new(Kind::Service, "s1"), &node("n1"));
        let mut tags = changes.iter().map(|c| c.tag).collect::<Vec<_>>();
        tags.sort_unstable();
        assert_eq!(tags, ["other-pair", "target"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mut store = RelationStore::<&str>::default();
        let token = store.monitor(Kind::Pod, Kind::Node, "watch");

        store.unsubscribe(token);
        store.unsubscribe(token);
        assert!(store.add(&pod("p1"), &node("n1")).is_empty());
    }

    #[test]
    fn all_targets_spans_kinds() {
        let mut store = RelationStore::<()>::default();
        store.add(&pod("p1"), &node("n1"));
        store.add(&pod("p1"), &EntityRef::new(Kind::NodeAgent, "n1"));

        let targets = store.all_targets(&pod("p1"));
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&node("n1")));
        assert!(targets.contains(&EntityRef::new(Kind::NodeAgent, "n1")));
    }
}
