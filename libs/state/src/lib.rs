//! # anvil-state
//!
//! In-memory, versioned, label-indexed resource store with watch semantics.
//!
//! The store maps `(namespace, type, id)` to a resource (metadata plus a
//! typed spec) and provides:
//!
//! - CRUD with optimistic concurrency (per-resource monotonic versions)
//! - Ownership tagging with internal-actor bypass
//! - Finalizer-deferred destroys (tearing-down phase)
//! - Label queries (`equal` / `exists` / `not_exists` / `in`)
//! - Per-collection watch channels with bounded queues and drop-safe
//!   resynchronization
//!
//! # Invariants
//!
//! - `(namespace, type, id)` is unique
//! - A resource has at most one owner; only the owner or an internal actor
//!   may mutate it
//! - Version increments on every successful mutation
//! - Watchers observe a total order consistent with commit order per
//!   `(type, namespace)`

mod error;
mod query;
mod resource;
mod store;
mod watch;

pub use error::StateError;
pub use query::{LabelTerm, Query};
pub use resource::{Metadata, Owner, Phase, Resource, ResourceRef, ResourceSpec, Version};
pub use store::{Actor, Store};
pub use watch::{Event, WatchStream, WATCH_QUEUE_DEPTH};
