//! Controller registration and the reconcile scheduler.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use anvil_state::{Actor, Event, Phase, Resource, ResourceRef, ResourceSpec, Store, Version};

use crate::backoff::Backoff;
use crate::controller::{
    Controller, InputDecl, InputKind, ReconcileContext, ReconcileError, ReconcileKey,
    ReconcileTrigger,
};

/// Per-controller scheduling options.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Worker degree; keys are serialized, controllers with degree 1 are
    /// fully serialized.
    pub degree: usize,

    /// Deadline for a single reconcile pass.
    pub reconcile_timeout: Duration,

    /// Requeue backoff for failed passes.
    pub backoff: Backoff,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            degree: 1,
            reconcile_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

/// Controller registration errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("output {namespace}/{resource_type} already owned by controller {owner}")]
    OutputAlreadyOwned {
        namespace: String,
        resource_type: &'static str,
        owner: &'static str,
    },

    #[error("controller {0} already registered")]
    DuplicateController(&'static str),
}

struct Registration<S: ResourceSpec> {
    controller: Arc<dyn Controller<S>>,
    options: RuntimeOptions,
}

/// Drives registered controllers against a store.
pub struct ControllerRuntime<S: ResourceSpec> {
    store: Store<S>,
    registrations: Vec<Registration<S>>,
    owners: HashMap<(String, &'static str), &'static str>,
}

impl<S: ResourceSpec> ControllerRuntime<S> {
    pub fn new(store: Store<S>) -> Self {
        Self {
            store,
            registrations: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Register a controller with default options.
    pub fn register<C: Controller<S>>(&mut self, controller: C) -> Result<(), RuntimeError> {
        self.register_with_options(controller, RuntimeOptions::default())
    }

    /// Register a controller, enforcing unique ownership of every declared
    /// output collection.
    pub fn register_with_options<C: Controller<S>>(
        &mut self,
        controller: C,
        options: RuntimeOptions,
    ) -> Result<(), RuntimeError> {
        let controller: Arc<dyn Controller<S>> = Arc::new(controller);

        if self
            .registrations
            .iter()
            .any(|r| r.controller.name() == controller.name())
        {
            return Err(RuntimeError::DuplicateController(controller.name()));
        }

        for output in controller.outputs() {
            let key = (output.namespace.clone(), output.resource_type);
            if let Some(&owner) = self.owners.get(&key) {
                return Err(RuntimeError::OutputAlreadyOwned {
                    namespace: output.namespace,
                    resource_type: output.resource_type,
                    owner,
                });
            }
            self.owners.insert(key, controller.name());
        }

        self.registrations.push(Registration { controller, options });

        Ok(())
    }

    /// Run all controllers until shutdown is signaled.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut controllers = JoinSet::new();

        for registration in self.registrations {
            controllers.spawn(controller_loop(
                self.store.clone(),
                registration,
                shutdown.clone(),
            ));
        }

        while controllers.join_next().await.is_some() {}
    }
}

async fn controller_loop<S: ResourceSpec>(
    store: Store<S>,
    registration: Registration<S>,
    shutdown: watch::Receiver<bool>,
) {
    let Registration { controller, options } = registration;
    let name = controller.name();

    info!(controller = name, "starting controller");

    let (trigger, work_rx) = ReconcileTrigger::channel();
    let ctx = Arc::new(ReconcileContext::new(store.clone(), trigger.clone()));

    let mut forwarders = JoinSet::new();
    for input in controller.inputs() {
        forwarders.spawn(input_forwarder(
            store.clone(),
            Arc::clone(&controller),
            input,
            trigger.clone(),
            shutdown.clone(),
        ));
    }

    dispatcher(controller, ctx, options, work_rx, trigger, shutdown).await;

    forwarders.shutdown().await;
    info!(controller = name, "controller stopped");
}

/// Forwards watch events of one input collection into the work set.
///
/// A resync sentinel (or a closed stream) restarts the subscription; the new
/// watch re-lists the collection, so every key is re-enqueued.
async fn input_forwarder<S: ResourceSpec>(
    store: Store<S>,
    controller: Arc<dyn Controller<S>>,
    input: InputDecl,
    trigger: ReconcileTrigger,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut stream = store.watch(&input.namespace, input.resource_type);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = stream.recv() => match event {
                    Some(Event::Created(res)) | Some(Event::Destroyed(res)) => {
                        if let Some(key) = controller.map_key(&input, res.metadata()) {
                            trigger.queue(key);
                        }
                    }
                    Some(Event::Updated { old, new }) => {
                        let old_key = controller.map_key(&input, old.metadata());
                        let new_key = controller.map_key(&input, new.metadata());

                        if let Some(key) = &new_key {
                            trigger.queue(key.clone());
                        }
                        if old_key != new_key {
                            if let Some(key) = old_key {
                                trigger.queue(key);
                            }
                        }
                    }
                    Some(Event::Bootstrapped) => {}
                    Some(Event::Resync) | None => {
                        warn!(
                            controller = controller.name(),
                            input = input.resource_type,
                            "input watch requires resync, re-subscribing"
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Work-set scheduler for one controller.
///
/// Key state machine: `Idle -> Queued -> Running -> (Idle | Backoff -> Queued)`.
/// Keys re-triggered while running are coalesced back into the pending set.
async fn dispatcher<S: ResourceSpec>(
    controller: Arc<dyn Controller<S>>,
    ctx: Arc<ReconcileContext<S>>,
    options: RuntimeOptions,
    mut work_rx: mpsc::UnboundedReceiver<ReconcileKey>,
    trigger: ReconcileTrigger,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = controller.name();

    let mut pending: BTreeSet<ReconcileKey> = BTreeSet::new();
    let mut running: HashSet<ReconcileKey> = HashSet::new();
    let mut attempts: HashMap<ReconcileKey, u32> = HashMap::new();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(ReconcileKey, Result<(), ReconcileError>)>();
    let mut tasks = JoinSet::new();

    loop {
        while running.len() < options.degree {
            let Some(key) = pending.iter().find(|key| !running.contains(*key)).cloned() else {
                break;
            };

            pending.remove(&key);
            running.insert(key.clone());

            let controller = Arc::clone(&controller);
            let ctx = Arc::clone(&ctx);
            let done_tx = done_tx.clone();
            let deadline = options.reconcile_timeout;

            tasks.spawn(async move {
                let result = run_pass(controller.as_ref(), &ctx, &key, deadline).await;
                let _ = done_tx.send((key, result));
            });
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tasks.shutdown().await;
                    return;
                }
            }
            Some(key) = work_rx.recv() => {
                pending.insert(key);
            }
            Some((key, result)) = done_rx.recv() => {
                running.remove(&key);

                match result {
                    Ok(()) => {
                        attempts.remove(&key);
                    }
                    Err(e) if e.is_retryable() => {
                        let attempt = attempts.entry(key.clone()).or_insert(0);
                        *attempt += 1;
                        let delay = options.backoff.delay(*attempt);

                        warn!(
                            controller = name,
                            key = %key,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "reconcile failed, requeueing"
                        );

                        let trigger = trigger.clone();
                        tasks.spawn(async move {
                            tokio::time::sleep(delay).await;
                            trigger.queue(key);
                        });
                    }
                    Err(e) => {
                        error!(
                            controller = name,
                            key = %key,
                            error = %e,
                            "reconcile failed, shelved until new inputs"
                        );
                        attempts.remove(&key);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
}

async fn run_pass<S: ResourceSpec>(
    controller: &dyn Controller<S>,
    ctx: &ReconcileContext<S>,
    key: &ReconcileKey,
    deadline: Duration,
) -> Result<(), ReconcileError> {
    debug!(controller = controller.name(), key = %key, "reconciling");

    let intent = match tokio::time::timeout(deadline, controller.reconcile(ctx, key)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ReconcileError::Transient(format!(
                "reconcile pass exceeded {deadline:?}"
            )))
        }
    };

    apply_intent(controller, ctx, key, intent)
}

/// Diff intended outputs against stored state and apply the difference,
/// carrying the controller as owner. Writes are suppressed when the diff is
/// empty.
fn apply_intent<S: ResourceSpec>(
    controller: &dyn Controller<S>,
    ctx: &ReconcileContext<S>,
    key: &ReconcileKey,
    intent: Vec<Resource<S>>,
) -> Result<(), ReconcileError> {
    let store = ctx.store();
    let actor = Actor::controller(controller.name());
    let outputs = controller.outputs();

    for resource in &intent {
        let meta = resource.metadata();

        let declared = outputs
            .iter()
            .any(|o| o.namespace == meta.namespace && o.resource_type == meta.resource_type);
        if !declared {
            return Err(ReconcileError::Permanent(format!(
                "undeclared output collection {}/{}",
                meta.namespace, meta.resource_type
            )));
        }

        if meta.id != *key {
            return Err(ReconcileError::Permanent(format!(
                "output id {} does not match reconcile key {key}",
                meta.id
            )));
        }
    }

    let produced_any = !intent.is_empty();

    // While outputs exist the controller pins its strong inputs, so their
    // destroy defers until this controller has cleaned up.
    if produced_any {
        hold_strong_inputs(controller, ctx, key, true)?;
    }

    for output in &outputs {
        let reference = ResourceRef::new(output.namespace.clone(), output.resource_type, key.clone());
        let intended = intent.iter().find(|r| {
            r.metadata().namespace == output.namespace
                && r.metadata().resource_type == output.resource_type
        });
        let stored = store.find(&reference);

        match (intended, stored) {
            (Some(want), None) => {
                store.create(want.clone(), &actor)?;
            }
            (Some(want), Some(have)) => {
                let differs = have.spec() != want.spec()
                    || have.metadata().labels != want.metadata().labels
                    || have.metadata().annotations != want.metadata().annotations;

                if differs {
                    store.update(&reference, Version::UNDEFINED, &actor, |res| {
                        *res.spec_mut() = want.spec().clone();
                        res.metadata_mut().labels = want.metadata().labels.clone();
                        res.metadata_mut().annotations = want.metadata().annotations.clone();
                        Ok(())
                    })?;
                }
            }
            (None, Some(_)) => match store.destroy(&reference, &actor) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            },
            (None, None) => {}
        }
    }

    if !produced_any {
        hold_strong_inputs(controller, ctx, key, false)?;
    }

    Ok(())
}

fn hold_strong_inputs<S: ResourceSpec>(
    controller: &dyn Controller<S>,
    ctx: &ReconcileContext<S>,
    key: &ReconcileKey,
    hold: bool,
) -> Result<(), ReconcileError> {
    let store = ctx.store();

    for input in controller.inputs() {
        if input.kind != InputKind::Strong {
            continue;
        }

        let reference = ResourceRef::new(input.namespace.clone(), input.resource_type, key.clone());
        let Some(resource) = store.find(&reference) else {
            continue;
        };
        let held = resource.metadata().finalizers.contains(controller.name());

        if hold && !held && resource.metadata().phase == Phase::Running {
            store.add_finalizer(&reference, controller.name())?;
        } else if !hold && held {
            store.remove_finalizer(&reference, controller.name())?;
        }
    }

    Ok(())
}
