//! Core primitives for the topology controller.
//!
//! The controller reconstructs a live service topology from watch events. Everything it derives
//! is built on two primitives defined here:
//!
//! - [`RelationStore`]: a bidirectional many-to-many relation index with change subscriptions.
//!   Relations are the only mechanism by which one entity learns about another without holding a
//!   direct reference; a service discovers its consumers through the `service -> service`
//!   relation, never through a pointer.
//! - [`Invalidator`]: a per-key debounced, revision-tracked recomputation scheduler. A burst of
//!   invalidations for one key within the debounce window costs exactly one handler pass, and a
//!   key whose revision advances mid-pass is re-processed immediately until it converges.
//!
//! Both primitives are plain data structures: subscribers and handlers are registered as small
//! tag values that the owning graph dispatches itself, and debounce timers are scheduled by the
//! embedding layer. This keeps the primitives free of runtime dependencies and lets multiple
//! independent scopes (one per deployment, plus the cluster-global physical layer) own their own
//! instances.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod entity;
mod invalidate;
mod relations;
pub mod report;

pub use self::entity::{EntityRef, Kind};
pub use self::invalidate::{HandlerToken, Invalidator, PassOutcome};
pub use self::relations::{Notification, RelationStore, SubscriptionToken};
pub use self::report::{MetadataSink, PeerEndpoint, PodMetadata, PodReport};
