use crate::{EntityRef, Kind};
use ahash::AHashMap as HashMap;
use std::collections::BTreeMap;

/// A per-key debounced, revision-tracked recomputation scheduler.
///
/// Every `invalidate` call bumps the key's revision. The first invalidation of an idle key asks
/// the caller to schedule a debounce timer; further invalidations within the window coalesce into
/// the same pass. When the timer fires the owning graph drives one pass through the
/// [`Invalidator::begin`] / [`Invalidator::handlers`] / [`Invalidator::complete`] protocol:
///
/// 1. `begin` refuses to start unless the key is in the scheduled phase, so at most one pass per
///    key is ever in flight.
/// 2. The graph runs the handlers serially (global handlers for the kind first, then handlers
///    local to the id, each set in registration order), aborting the pass on the first failure.
/// 3. `complete` records the revision captured at `begin` as processed on success, then
///    re-checks the key: a revision that advanced mid-pass means an immediate re-run (no second
///    debounce wait); a failed pass keeps the old processed revision and retries after a fresh
///    debounce window; a converged key is deleted, bounding memory to dirty or in-flight keys.
///
/// Handlers are registered as tag values `H` dispatched by the owning graph; timers are scheduled
/// by the embedding layer. Registering a handler immediately invalidates the target key(s) so it
/// runs at least once against current state.
#[derive(Debug)]
pub struct Invalidator<H> {
    keys: HashMap<EntityRef, KeyState>,

    global: HashMap<Kind, BTreeMap<u64, H>>,
    local: HashMap<EntityRef, BTreeMap<u64, H>>,

    /// Token arena; maps a token back to the registration it belongs to.
    tokens: HashMap<u64, HandlerScope>,
    next_token: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct KeyState {
    /// Bumped on every `invalidate`.
    revision: u64,
    /// The revision last fully processed.
    current: u64,
    phase: Phase,
}

/// The per-key scheduling state machine. `Idle` entries are deleted rather than stored.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    /// A debounce timer is pending (or an immediate re-run was requested).
    Scheduled,
    /// A handler pass is running.
    Running,
    /// A handler pass is running and the key was re-invalidated meanwhile.
    RunningDirty,
}

/// What the driver must do after a completed pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// `revision == current`: the entry was deleted.
    Converged,
    /// The revision advanced during the pass; run again immediately.
    RunNow,
    /// The pass failed; retry after a fresh debounce window.
    Reschedule,
}

/// Handle returned by handler registration; release is idempotent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

#[derive(Clone, Debug)]
enum HandlerScope {
    Global(Kind),
    Local(EntityRef),
}

impl<H> Default for Invalidator<H> {
    fn default() -> Self {
        Self {
            keys: HashMap::default(),
            global: HashMap::default(),
            local: HashMap::default(),
            tokens: HashMap::default(),
            next_token: 0,
        }
    }
}

impl<H> Invalidator<H> {
    /// Bumps the key's revision. Returns true when the key just left the idle phase and the
    /// caller must schedule a debounce timer; invalidations of an already-scheduled or running
    /// key coalesce and return false.
    pub fn invalidate(&mut self, key: &EntityRef) -> bool {
        let state = self.keys.entry(key.clone()).or_default();
        state.revision += 1;
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Scheduled;
                true
            }
            Phase::Scheduled => false,
            Phase::Running => {
                state.phase = Phase::RunningDirty;
                false
            }
            Phase::RunningDirty => false,
        }
    }

    /// Starts a pass for a scheduled key, capturing its revision. Returns `None` when the key is
    /// idle or already mid-pass, so a second concurrent pass is never started.
    pub fn begin(&mut self, key: &EntityRef) -> Option<u64> {
        let state = self.keys.get_mut(key)?;
        if state.phase != Phase::Scheduled {
            return None;
        }
        state.phase = Phase::Running;
        Some(state.revision)
    }

    /// Finishes a pass started by [`Invalidator::begin`].
    pub fn complete(&mut self, key: &EntityRef, captured: u64, success: bool) -> PassOutcome {
        let Some(state) = self.keys.get_mut(key) else {
            return PassOutcome::Converged;
        };
        if success {
            state.current = captured;
        }
        if state.revision != state.current {
            state.phase = Phase::Scheduled;
            if success {
                PassOutcome::RunNow
            } else {
                PassOutcome::Reschedule
            }
        } else {
            self.keys.remove(key);
            PassOutcome::Converged
        }
    }

    /// Registers a handler local to one key and invalidates it. The boolean mirrors
    /// [`Invalidator::invalidate`].
    pub fn handle(&mut self, key: EntityRef, tag: H) -> (HandlerToken, bool) {
        let token = self.mint_token(HandlerScope::Local(key.clone()));
        self.local.entry(key.clone()).or_default().insert(token.0, tag);
        let schedule = self.invalidate(&key);
        (token, schedule)
    }

    /// Registers a handler for every id of a kind and invalidates all currently-tracked keys of
    /// that kind, returning the ones that now need a debounce timer.
    pub fn handle_all(&mut self, kind: Kind, tag: H) -> (HandlerToken, Vec<EntityRef>) {
        let token = self.mint_token(HandlerScope::Global(kind));
        self.global.entry(kind).or_default().insert(token.0, tag);

        let tracked = self
            .keys
            .keys()
            .filter(|key| key.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        let schedule = tracked
            .into_iter()
            .filter(|key| self.invalidate(key))
            .collect();
        (token, schedule)
    }

    /// Removes a handler without affecting other handlers on the same key. Idempotent; prunes
    /// now-empty levels.
    pub fn remove_handler(&mut self, token: HandlerToken) {
        let Some(scope) = self.tokens.remove(&token.0) else {
            return;
        };
        match scope {
            HandlerScope::Global(kind) => {
                if let Some(entries) = self.global.get_mut(&kind) {
                    entries.remove(&token.0);
                    if entries.is_empty() {
                        self.global.remove(&kind);
                    }
                }
            }
            HandlerScope::Local(key) => {
                if let Some(entries) = self.local.get_mut(&key) {
                    entries.remove(&token.0);
                    if entries.is_empty() {
                        self.local.remove(&key);
                    }
                }
            }
        }
    }

    /// True while the key is dirty or mid-pass.
    pub fn is_tracked(&self, key: &EntityRef) -> bool {
        self.keys.contains_key(key)
    }

    fn mint_token(&mut self, scope: HandlerScope) -> HandlerToken {
        let id = self.next_token;
        self.next_token += 1;
        self.tokens.insert(id, scope);
        HandlerToken(id)
    }
}

impl<H: Clone> Invalidator<H> {
    /// The handlers applicable to a key: global handlers for the kind, then local handlers for
    /// the id, each in registration order.
    pub fn handlers(&self, key: &EntityRef) -> Vec<H> {
        self.global
            .get(&key.kind)
            .into_iter()
            .flat_map(|entries| entries.values())
            .chain(
                self.local
                    .get(key)
                    .into_iter()
                    .flat_map(|entries| entries.values()),
            )
            .cloned()
            .collect()
    }
}
