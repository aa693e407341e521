//! Fleet resource types and their typed specs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use anvil_state::{Resource, ResourceRef, ResourceSpec};

use crate::schematic::Schematic;

/// Namespace holding all fleet resources.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource type tags.
pub mod types {
    pub const MACHINE: &str = "Machines.anvil.dev";
    pub const MACHINE_STATUS: &str = "MachineStatuses.anvil.dev";
    pub const MACHINE_STATUS_SNAPSHOT: &str = "MachineStatusSnapshots.anvil.dev";
    pub const MACHINE_LABELS: &str = "MachineLabels.anvil.dev";
}

/// Well-known label keys emitted on `MachineStatus`.
///
/// Flag labels carry an empty value; presence is the signal.
pub mod labels {
    /// Set while the machine is connected.
    pub const CONNECTED: &str = "anvil.dev/connected";

    /// Set while the machine is pushing status events.
    pub const REPORTING_EVENTS: &str = "anvil.dev/reporting-events";

    /// Platform reported by the node's metadata.
    pub const PLATFORM: &str = "anvil.dev/platform";

    /// CPU architecture reported by the node.
    pub const ARCH: &str = "anvil.dev/arch";
}

/// A known node of the fleet. Created by the admission pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub connected: bool,
    pub management_address: String,
}

/// Last raw status event pushed by a connected machine. Presence signals
/// that the machine is reporting events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatusSnapshotSpec {
    /// Serialized last event payload.
    pub last_event: String,
}

/// User-supplied label overrides; the labels live in resource metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineLabelsSpec {}

/// Derived machine status, produced by the `MachineStatus` controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatusSpec {
    pub connected: bool,
    pub talos_version: Option<String>,
    pub arch: Option<String>,
    /// Labels baked into the installation image, post-masking by user
    /// labels. `None` until the labels meta key has been observed.
    pub image_labels: Option<BTreeMap<String, String>>,
    pub schematic: Option<Schematic>,
    pub platform_metadata: Option<PlatformMetadata>,
    pub hardware: HardwareStatus,
    pub network: NetworkStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub processors: Vec<Processor>,
    pub memory_modules: Vec<MemoryModule>,
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub core_count: u32,
    pub thread_count: u32,
    /// Max frequency in MHz.
    pub frequency: u32,
    pub manufacturer: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryModule {
    pub size_mb: u32,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub size: u64,
    pub model: String,
    pub linux_name: String,
    pub name: String,
    pub serial: String,
    pub uuid: String,
    pub wwid: String,
    pub device_type: String,
    pub bus_path: String,
    pub system_disk: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub addresses: Vec<String>,
    pub default_gateways: Vec<String>,
    pub links: Vec<NetworkLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkLink {
    pub linux_name: String,
    pub hardware_address: String,
    pub speed_mbps: u32,
    pub link_up: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub platform: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub instance_id: String,
    pub provider_id: String,
    pub spot: bool,
}

/// Tagged spec payload for every fleet resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetSpec {
    Machine(MachineSpec),
    MachineStatus(MachineStatusSpec),
    MachineStatusSnapshot(MachineStatusSnapshotSpec),
    MachineLabels(MachineLabelsSpec),
}

impl ResourceSpec for FleetSpec {
    fn resource_type(&self) -> &'static str {
        match self {
            FleetSpec::Machine(_) => types::MACHINE,
            FleetSpec::MachineStatus(_) => types::MACHINE_STATUS,
            FleetSpec::MachineStatusSnapshot(_) => types::MACHINE_STATUS_SNAPSHOT,
            FleetSpec::MachineLabels(_) => types::MACHINE_LABELS,
        }
    }
}

impl FleetSpec {
    pub fn as_machine(&self) -> Option<&MachineSpec> {
        match self {
            FleetSpec::Machine(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_machine_status(&self) -> Option<&MachineStatusSpec> {
        match self {
            FleetSpec::MachineStatus(spec) => Some(spec),
            _ => None,
        }
    }
}

pub fn new_machine(id: impl Into<String>, spec: MachineSpec) -> Resource<FleetSpec> {
    Resource::new(DEFAULT_NAMESPACE, id, FleetSpec::Machine(spec))
}

pub fn new_machine_status(id: impl Into<String>, spec: MachineStatusSpec) -> Resource<FleetSpec> {
    Resource::new(DEFAULT_NAMESPACE, id, FleetSpec::MachineStatus(spec))
}

pub fn new_machine_status_snapshot(
    id: impl Into<String>,
    spec: MachineStatusSnapshotSpec,
) -> Resource<FleetSpec> {
    Resource::new(DEFAULT_NAMESPACE, id, FleetSpec::MachineStatusSnapshot(spec))
}

pub fn new_machine_labels(id: impl Into<String>) -> Resource<FleetSpec> {
    Resource::new(DEFAULT_NAMESPACE, id, FleetSpec::MachineLabels(MachineLabelsSpec {}))
}

pub fn machine_ref(id: impl Into<String>) -> ResourceRef {
    ResourceRef::new(DEFAULT_NAMESPACE, types::MACHINE, id)
}

pub fn machine_status_ref(id: impl Into<String>) -> ResourceRef {
    ResourceRef::new(DEFAULT_NAMESPACE, types::MACHINE_STATUS, id)
}

pub fn machine_status_snapshot_ref(id: impl Into<String>) -> ResourceRef {
    ResourceRef::new(DEFAULT_NAMESPACE, types::MACHINE_STATUS_SNAPSHOT, id)
}

pub fn machine_labels_ref(id: impl Into<String>) -> ResourceRef {
    ResourceRef::new(DEFAULT_NAMESPACE, types::MACHINE_LABELS, id)
}
