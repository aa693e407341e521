//! The `MachineStatus` reconciler.
//!
//! Derives one `MachineStatus` per machine from the `Machine` resource, the
//! collector's `Info` snapshot, user `MachineLabels`, and the presence of a
//! `MachineStatusSnapshot`. Owns the collector task lifecycle: a task runs
//! exactly while its machine is connected, and its last snapshot is retained
//! across disconnects so the status never regresses to empty.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use anvil_runtime::{
    Controller, InputDecl, OutputDecl, ReconcileContext, ReconcileError, ReconcileKey,
    ReconcileTrigger,
};
use anvil_state::{Phase, Resource};

use crate::client::NodeConnector;
use crate::collector::{CollectorConfig, CollectorHandle, Info};
use crate::resources::{
    labels, machine_labels_ref, machine_ref, machine_status_snapshot_ref, new_machine_status,
    types, FleetSpec, HardwareStatus, MachineSpec, MachineStatusSpec, NetworkStatus,
    DEFAULT_NAMESPACE,
};

type UserLabels = Option<BTreeMap<String, String>>;

struct CollectorEntry {
    address: String,
    handle: Option<CollectorHandle>,
    last_info: Info,
}

/// Reconciles `MachineStatus` resources and drives per-machine collectors.
pub struct MachineStatusController {
    connector: Arc<dyn NodeConnector>,
    config: CollectorConfig,
    collectors: Mutex<HashMap<String, CollectorEntry>>,
}

impl MachineStatusController {
    pub const NAME: &'static str = "MachineStatusController";

    pub fn new(connector: Arc<dyn NodeConnector>, config: CollectorConfig) -> Self {
        Self {
            connector,
            config,
            collectors: Mutex::new(HashMap::new()),
        }
    }

    /// Converge the collector task for one machine and return the snapshot
    /// to build the status from.
    fn converge_collector(
        &self,
        key: &str,
        machine: &MachineSpec,
        user_labels: &UserLabels,
        trigger: ReconcileTrigger,
    ) -> Info {
        let mut collectors = self.collectors.lock().unwrap_or_else(|e| e.into_inner());
        let entry = collectors.entry(key.to_string()).or_insert_with(|| CollectorEntry {
            address: machine.management_address.clone(),
            handle: None,
            last_info: Info::default(),
        });

        if machine.connected {
            // A moved management endpoint needs a fresh session.
            if entry.handle.is_some() && entry.address != machine.management_address {
                if let Some(handle) = entry.handle.take() {
                    entry.last_info = handle.info();
                    handle.stop();
                }

                info!(machine = %key, "management address changed, restarting collector");
            }

            match &entry.handle {
                Some(handle) => handle.set_machine_labels(user_labels.clone()),
                None => {
                    entry.address = machine.management_address.clone();

                    let mut seed = entry.last_info.clone();
                    seed.machine_labels = user_labels.clone();

                    entry.handle = Some(CollectorHandle::spawn(
                        key.to_string(),
                        entry.address.clone(),
                        Arc::clone(&self.connector),
                        trigger,
                        seed,
                        self.config.clone(),
                    ));

                    info!(machine = %key, address = %entry.address, "collector started");
                }
            }
        } else if let Some(handle) = entry.handle.take() {
            entry.last_info = handle.info();
            handle.stop();

            info!(machine = %key, "machine disconnected, collector stopped");
        }

        if let Some(handle) = &entry.handle {
            entry.last_info = handle.info();
        }

        entry.last_info.clone()
    }

    fn drop_collector(&self, key: &str) {
        let mut collectors = self.collectors.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(mut entry) = collectors.remove(key) {
            if let Some(handle) = entry.handle.take() {
                handle.stop();
            }

            info!(machine = %key, "machine gone, collector dropped");
        }
    }

    fn build_status(machine: &MachineSpec, info: &Info) -> MachineStatusSpec {
        MachineStatusSpec {
            connected: machine.connected,
            talos_version: info.talos_version.clone(),
            arch: info.arch.clone(),
            image_labels: info.image_labels.clone(),
            schematic: info.schematic.clone(),
            platform_metadata: info.platform_metadata.clone(),
            hardware: HardwareStatus {
                processors: info.processors.clone(),
                memory_modules: info.memory_modules.clone(),
                blockdevices: info.blockdevices.clone(),
            },
            network: NetworkStatus {
                hostname: info.hostname.clone(),
                domainname: info.domainname.clone(),
                addresses: info.addresses.clone(),
                default_gateways: info.default_gateways.clone(),
                links: info.network_links.clone(),
            },
        }
    }

    /// Metadata labels of the status resource.
    ///
    /// Deterministic overlay: image labels, then user labels (user wins,
    /// empty values preserved), then flag labels.
    fn merge_labels(
        spec: &MachineStatusSpec,
        user_labels: &UserLabels,
        snapshot_exists: bool,
    ) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();

        if let Some(image_labels) = &spec.image_labels {
            merged.extend(image_labels.clone());
        }

        if let Some(user_labels) = user_labels {
            for (key, value) in user_labels {
                merged.insert(key.clone(), value.clone());
            }
        }

        if spec.connected {
            merged.insert(labels::CONNECTED.to_string(), String::new());
        }

        if snapshot_exists {
            merged.insert(labels::REPORTING_EVENTS.to_string(), String::new());
        }

        if let Some(platform) = spec
            .platform_metadata
            .as_ref()
            .map(|metadata| metadata.platform.as_str())
            .filter(|platform| !platform.is_empty())
        {
            merged.insert(labels::PLATFORM.to_string(), platform.to_string());
        }

        if let Some(arch) = spec.arch.as_deref().filter(|arch| !arch.is_empty()) {
            merged.insert(labels::ARCH.to_string(), arch.to_string());
        }

        merged
    }
}

#[async_trait]
impl Controller<FleetSpec> for MachineStatusController {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<InputDecl> {
        vec![
            InputDecl::strong(DEFAULT_NAMESPACE, types::MACHINE),
            InputDecl::weak(DEFAULT_NAMESPACE, types::MACHINE_STATUS_SNAPSHOT),
            InputDecl::weak(DEFAULT_NAMESPACE, types::MACHINE_LABELS),
        ]
    }

    fn outputs(&self) -> Vec<OutputDecl> {
        vec![OutputDecl::new(DEFAULT_NAMESPACE, types::MACHINE_STATUS)]
    }

    async fn reconcile(
        &self,
        ctx: &ReconcileContext<FleetSpec>,
        key: &ReconcileKey,
    ) -> Result<Vec<Resource<FleetSpec>>, ReconcileError> {
        let store = ctx.store();

        // A missing or tearing-down machine drops the status resource.
        let machine = match store.find(&machine_ref(key.clone())) {
            Some(machine) if machine.metadata().phase == Phase::Running => machine,
            _ => {
                self.drop_collector(key);
                return Ok(vec![]);
            }
        };

        let Some(machine_spec) = machine.spec().as_machine() else {
            return Err(ReconcileError::Permanent(format!(
                "machine {key} carries a foreign spec"
            )));
        };

        let user_labels: UserLabels = store
            .find(&machine_labels_ref(key.clone()))
            .map(|res| res.metadata().labels.clone());
        let snapshot_exists = store
            .find(&machine_status_snapshot_ref(key.clone()))
            .is_some();

        let collector_info =
            self.converge_collector(key, machine_spec, &user_labels, ctx.trigger());

        let spec = Self::build_status(machine_spec, &collector_info);
        let merged = Self::merge_labels(&spec, &user_labels, snapshot_exists);

        let mut status = new_machine_status(key.clone(), spec);
        status.metadata_mut().labels = merged;

        Ok(vec![status])
    }
}
