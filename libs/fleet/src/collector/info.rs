//! Volatile per-machine snapshot.

use std::collections::BTreeMap;

use crate::resources::{BlockDevice, MemoryModule, NetworkLink, PlatformMetadata, Processor};
use crate::schematic::Schematic;

/// Everything the collector has observed about one machine.
///
/// Mutated only by the owning collector task; the controller reads deep
/// copies through the task handle. `None` means "not yet observed" and never
/// overwrites a previously observed value; pollers commit whole fields only
/// on successful completion.
#[derive(Debug, Clone, Default)]
pub struct Info {
    pub talos_version: Option<String>,
    pub arch: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub addresses: Vec<String>,
    pub default_gateways: Vec<String>,
    pub network_links: Vec<NetworkLink>,
    pub processors: Vec<Processor>,
    pub memory_modules: Vec<MemoryModule>,
    pub blockdevices: Vec<BlockDevice>,
    pub platform_metadata: Option<PlatformMetadata>,
    pub schematic: Option<Schematic>,
    /// Image labels post-masking by user labels.
    pub image_labels: Option<BTreeMap<String, String>>,
    pub maintenance_mode: bool,
    /// User machine labels, pushed in by the controller; masks image labels.
    pub machine_labels: Option<BTreeMap<String, String>>,
}
