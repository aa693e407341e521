//! The long-lived per-machine collector task.
//!
//! One task runs per connected machine. It dials the management address
//! (retrying with backoff), runs every poller once per session, then keeps
//! resource pollers driven by the node's change notifications and RPC
//! pollers on a fixed interval. Every completed poller signals the
//! controller through the reconcile trigger.
//!
//! Cancellation is prompt: the shutdown watch is checked between poller
//! iterations and races every in-flight RPC.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use anvil_runtime::{Backoff, ReconcileTrigger};

use crate::client::{NodeClient, NodeConnector};

use super::info::Info;
use super::poll::Poller;

/// Collector scheduling knobs.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Interval of the RPC pollers; doubles as the per-poller deadline.
    pub poll_interval: Duration,

    /// Backoff between failed connection attempts.
    pub connect_backoff: Backoff,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            connect_backoff: Backoff::default(),
        }
    }
}

type MachineLabels = Option<BTreeMap<String, String>>;

/// Handle to a running collector task.
pub struct CollectorHandle {
    info: Arc<Mutex<Info>>,
    labels_tx: watch::Sender<MachineLabels>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Spawn a collector for one machine.
    ///
    /// `seed` carries the last known info so a re-spawned task never
    /// regresses previously observed values.
    pub fn spawn(
        machine: String,
        address: String,
        connector: Arc<dyn NodeConnector>,
        trigger: ReconcileTrigger,
        seed: Info,
        config: CollectorConfig,
    ) -> Self {
        let labels = seed.machine_labels.clone();
        let info = Arc::new(Mutex::new(seed));
        let (labels_tx, labels_rx) = watch::channel(labels);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_collector(
            machine,
            address,
            connector,
            trigger,
            Arc::clone(&info),
            labels_rx,
            shutdown_rx,
            config,
        ));

        Self {
            info,
            labels_tx,
            shutdown_tx,
            task,
        }
    }

    /// Deep copy of the current snapshot.
    pub fn info(&self) -> Info {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Push the current user machine labels into the task; a change re-runs
    /// the meta poller so image-label masking follows.
    pub fn set_machine_labels(&self, labels: MachineLabels) {
        self.labels_tx.send_if_modified(|current| {
            if *current == labels {
                return false;
            }
            *current = labels;
            true
        });
    }

    /// Signal the task to stop; in-flight RPCs are abandoned promptly.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

#[allow(clippy::too_many_arguments)]
async fn run_collector(
    machine: String,
    address: String,
    connector: Arc<dyn NodeConnector>,
    trigger: ReconcileTrigger,
    info: Arc<Mutex<Info>>,
    mut labels_rx: watch::Receiver<MachineLabels>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: CollectorConfig,
) {
    info!(machine = %machine, address = %address, "machine collector started");

    let mut attempt = 0u32;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let connection = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            connection = connector.connect(&address) => connection,
        };

        let connection = match connection {
            Ok(connection) => connection,
            Err(status) => {
                attempt += 1;
                let delay = config.connect_backoff.delay(attempt);

                warn!(
                    machine = %machine,
                    error = %status,
                    delay_ms = delay.as_millis() as u64,
                    "management connection failed"
                );

                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        attempt = 0;
        {
            let mut info = info.lock().unwrap_or_else(|e| e.into_inner());
            info.maintenance_mode = connection.maintenance_mode;
        }

        let end = run_session(
            &machine,
            connection.client.as_ref(),
            &trigger,
            &info,
            &mut labels_rx,
            &mut shutdown_rx,
            &config,
        )
        .await;

        // The client is released here; a fresh session dials again.
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Reconnect => continue,
        }
    }

    debug!(machine = %machine, "machine collector stopped");
}

async fn run_session(
    machine: &str,
    client: &dyn NodeClient,
    trigger: &ReconcileTrigger,
    info: &Mutex<Info>,
    labels_rx: &mut watch::Receiver<MachineLabels>,
    shutdown_rx: &mut watch::Receiver<bool>,
    config: &CollectorConfig,
) -> SessionEnd {
    // Subscribe before the sweep so no change slips between them.
    let mut changes = match client.watch_changes().await {
        Ok(changes) => changes,
        Err(status) => {
            warn!(machine = %machine, error = %status, "resource watch failed");
            return SessionEnd::Reconnect;
        }
    };

    // Catch up on label changes that raced the (re)connect.
    {
        let labels = labels_rx.borrow_and_update().clone();
        let mut info = info.lock().unwrap_or_else(|e| e.into_inner());
        info.machine_labels = labels;
    }

    // Initial sweep: every poller once.
    for poller in Poller::all() {
        if run_poller(machine, poller, client, trigger, info, shutdown_rx, config).await {
            return SessionEnd::Shutdown;
        }
    }

    let mut interval = tokio::time::interval(config.poll_interval);
    // The initial sweep already ran the RPC pollers.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            _ = labels_rx.changed() => {
                let labels = labels_rx.borrow_and_update().clone();
                {
                    let mut info = info.lock().unwrap_or_else(|e| e.into_inner());
                    info.machine_labels = labels;
                }

                // Masking depends on user labels.
                if run_poller(machine, Poller::Meta, client, trigger, info, shutdown_rx, config).await {
                    return SessionEnd::Shutdown;
                }
            }
            _ = interval.tick() => {
                for poller in Poller::RPC.iter().copied() {
                    if run_poller(machine, poller, client, trigger, info, shutdown_rx, config).await {
                        return SessionEnd::Shutdown;
                    }
                }
            }
            change = changes.recv() => {
                let Some(change) = change else {
                    debug!(machine = %machine, "resource watch closed, reconnecting");
                    return SessionEnd::Reconnect;
                };

                if let Some(poller) = Poller::for_remote_collection(&change.namespace, &change.resource_type) {
                    if run_poller(machine, poller, client, trigger, info, shutdown_rx, config).await {
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }
}

/// Run one poller under its deadline; returns `true` on shutdown.
///
/// Failures are logged and retried on the poller's next tick or change
/// event; only a completed poller signals the controller.
async fn run_poller(
    machine: &str,
    poller: Poller,
    client: &dyn NodeClient,
    trigger: &ReconcileTrigger,
    info: &Mutex<Info>,
    shutdown_rx: &mut watch::Receiver<bool>,
    config: &CollectorConfig,
) -> bool {
    tokio::select! {
        biased;

        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        result = tokio::time::timeout(config.poll_interval, poller.run(client, info)) => {
            match result {
                Ok(Ok(())) => {
                    trigger.queue(machine);
                }
                Ok(Err(e)) => {
                    warn!(machine = %machine, poller = poller.key(), error = %e, "poller failed");
                }
                Err(_) => {
                    warn!(machine = %machine, poller = poller.key(), "poller deadline exceeded");
                }
            }

            false
        }
    }
}
