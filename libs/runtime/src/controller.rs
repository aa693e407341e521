//! The controller contract.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use anvil_state::{Metadata, Resource, ResourceSpec, StateError, Store};

/// How a controller depends on an input collection.
///
/// The runtime holds a finalizer on strong input resources while the
/// controller's outputs for the same key exist; weak inputs are watch-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Strong,
    Weak,
}

/// A watched input collection.
#[derive(Debug, Clone)]
pub struct InputDecl {
    pub namespace: String,
    pub resource_type: &'static str,
    pub kind: InputKind,
}

impl InputDecl {
    pub fn strong(namespace: impl Into<String>, resource_type: &'static str) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
            kind: InputKind::Strong,
        }
    }

    pub fn weak(namespace: impl Into<String>, resource_type: &'static str) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
            kind: InputKind::Weak,
        }
    }
}

/// An output collection exclusively owned by one controller.
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub namespace: String,
    pub resource_type: &'static str,
}

impl OutputDecl {
    pub fn new(namespace: impl Into<String>, resource_type: &'static str) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
        }
    }
}

pub type ReconcileKey = String;

/// Reconcile pass failure.
///
/// Transient errors requeue the key with backoff; permanent errors shelve it
/// until the next input event.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Permanent(_) => false,
            Self::State(e) => e.is_retryable(),
        }
    }
}

/// Enqueues reconcile keys into a controller's work set.
///
/// Cloneable; handed to external signal sources such as per-machine
/// collector tasks.
#[derive(Debug, Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::UnboundedSender<ReconcileKey>,
}

impl ReconcileTrigger {
    /// A standalone trigger and its work-set receiver.
    ///
    /// The runtime wires one per controller; tests drive signal sources
    /// against a detached pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReconcileKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn queue(&self, key: impl Into<ReconcileKey>) {
        // Send failure means the runtime is shutting down.
        let _ = self.tx.send(key.into());
    }
}

/// State handed to a reconcile pass.
pub struct ReconcileContext<S: ResourceSpec> {
    store: Store<S>,
    trigger: ReconcileTrigger,
}

impl<S: ResourceSpec> ReconcileContext<S> {
    pub(crate) fn new(store: Store<S>, trigger: ReconcileTrigger) -> Self {
        Self { store, trigger }
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    /// Trigger for re-queueing this controller's keys from outside the
    /// watch graph.
    pub fn trigger(&self) -> ReconcileTrigger {
        self.trigger.clone()
    }
}

/// A reconciler owning one or more output collections.
#[async_trait]
pub trait Controller<S: ResourceSpec>: Send + Sync + 'static {
    /// Unique name; doubles as the owner tag on outputs.
    fn name(&self) -> &'static str;

    fn inputs(&self) -> Vec<InputDecl>;

    fn outputs(&self) -> Vec<OutputDecl>;

    /// Map an input resource to the reconcile key it affects; `None` skips
    /// the event.
    fn map_key(&self, input: &InputDecl, metadata: &Metadata) -> Option<ReconcileKey> {
        let _ = input;
        Some(metadata.id.clone())
    }

    /// Derive the intended outputs for a key from current store state.
    ///
    /// Must be idempotent: the same inputs yield the same intent. Each
    /// intended resource must belong to a declared output collection and
    /// carry the reconcile key as its id; an empty intent destroys the
    /// controller's outputs for the key.
    async fn reconcile(
        &self,
        ctx: &ReconcileContext<S>,
        key: &ReconcileKey,
    ) -> Result<Vec<Resource<S>>, ReconcileError>;
}
