//! # anvil-runtime
//!
//! Controller framework driving reconcilers against the resource store.
//!
//! A controller declares its inputs (watched collections) and outputs
//! (collections it exclusively owns), and derives intended outputs for a
//! reconcile key from current store state. The runtime:
//!
//! - Enforces exactly one owning controller per output collection
//! - Watches inputs and coalesces events into per-controller work sets
//! - Runs reconcile passes under a per-pass deadline, serialized per key
//! - Diffs intended outputs against stored state and suppresses empty writes
//! - Requeues failed keys with exponential backoff
//! - Holds finalizers on strong inputs while outputs exist
//!
//! # Invariants
//!
//! - A reconcile pass is a pure derivation from current inputs; running it
//!   twice without input changes performs zero writes
//! - Outputs carry the controller's name as owner; foreign writes fail
//! - Convergence does not depend on cross-resource event ordering

mod backoff;
mod controller;
mod runtime;

pub use backoff::Backoff;
pub use controller::{
    Controller, InputDecl, InputKind, OutputDecl, ReconcileContext, ReconcileError, ReconcileKey,
    ReconcileTrigger,
};
pub use runtime::{ControllerRuntime, RuntimeError, RuntimeOptions};
