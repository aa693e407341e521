//! Client seam to a managed node.
//!
//! The collector consumes three surfaces from the node's management API: a
//! typed resource listing under the `network`, `hardware`, and `runtime`
//! namespaces, a push stream of type-level change notifications, and the
//! `version` / `disks` unary RPCs. Errors are `tonic::Status` so callers can
//! branch on wire codes (`Unimplemented` in particular). The transport
//! adapter implementing these traits lives outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;

/// Remote namespaces and resource types served by a node.
pub mod remote {
    pub const NETWORK_NAMESPACE: &str = "network";
    pub const HARDWARE_NAMESPACE: &str = "hardware";
    pub const RUNTIME_NAMESPACE: &str = "runtime";

    pub const HOSTNAME_STATUS: &str = "HostnameStatuses";
    pub const ROUTE_STATUS: &str = "RouteStatuses";
    pub const NODE_ADDRESS: &str = "NodeAddresses";
    pub const LINK_STATUS: &str = "LinkStatuses";
    pub const PROCESSOR: &str = "Processors";
    pub const MEMORY_MODULE: &str = "MemoryModules";
    pub const PLATFORM_METADATA: &str = "PlatformMetadatas";
    pub const META_KEY: &str = "MetaKeys";
    pub const EXTENSION_STATUS: &str = "ExtensionStatuses";

    /// Id of the current node-address set.
    pub const NODE_ADDRESS_CURRENT: &str = "current";

    /// Id of the current set with Kubernetes-managed addresses filtered out.
    pub const NODE_ADDRESS_CURRENT_NO_K8S: &str = "current-no-k8s";
}

/// Routing scope of a route status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Global,
    Link,
    Host,
}

/// A typed resource read from the node.
#[derive(Debug, Clone)]
pub enum NodeResource {
    HostnameStatus {
        hostname: String,
        domainname: String,
    },
    RouteStatus {
        /// Destination prefix; empty for default routes.
        destination: String,
        gateway: String,
        scope: RouteScope,
    },
    NodeAddress {
        id: String,
        /// Addresses in `ip/prefix` form.
        addresses: Vec<String>,
    },
    LinkStatus {
        name: String,
        physical: bool,
        hardware_address: String,
        speed_mbps: u32,
        link_up: bool,
        vendor: String,
        product: String,
    },
    Processor {
        core_count: u32,
        thread_count: u32,
        max_speed: u32,
        manufacturer: String,
        product_name: String,
    },
    MemoryModule {
        size_mb: u32,
        manufacturer: String,
    },
    PlatformMetadata {
        platform: String,
        hostname: String,
        region: String,
        zone: String,
        instance_type: String,
        instance_id: String,
        provider_id: String,
        spot: bool,
    },
    MetaKey {
        id: String,
        value: String,
    },
    ExtensionStatus {
        name: String,
        version: String,
        description: String,
    },
}

impl NodeResource {
    /// The remote collection this resource belongs to.
    pub fn collection(&self) -> (&'static str, &'static str) {
        use remote::*;

        match self {
            NodeResource::HostnameStatus { .. } => (NETWORK_NAMESPACE, HOSTNAME_STATUS),
            NodeResource::RouteStatus { .. } => (NETWORK_NAMESPACE, ROUTE_STATUS),
            NodeResource::NodeAddress { .. } => (NETWORK_NAMESPACE, NODE_ADDRESS),
            NodeResource::LinkStatus { .. } => (NETWORK_NAMESPACE, LINK_STATUS),
            NodeResource::Processor { .. } => (HARDWARE_NAMESPACE, PROCESSOR),
            NodeResource::MemoryModule { .. } => (HARDWARE_NAMESPACE, MEMORY_MODULE),
            NodeResource::PlatformMetadata { .. } => (RUNTIME_NAMESPACE, PLATFORM_METADATA),
            NodeResource::MetaKey { .. } => (RUNTIME_NAMESPACE, META_KEY),
            NodeResource::ExtensionStatus { .. } => (RUNTIME_NAMESPACE, EXTENSION_STATUS),
        }
    }
}

/// Version message returned by the `version` RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub tag: String,
    pub arch: String,
}

/// A block device returned by the `disks` RPC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDeviceInfo {
    pub size: u64,
    pub model: String,
    pub device_name: String,
    pub name: String,
    pub serial: String,
    pub uuid: String,
    pub wwid: String,
    pub device_type: String,
    pub bus_path: String,
    pub system_disk: bool,
}

/// Type-level change notification from the node's resource watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    pub namespace: String,
    pub resource_type: String,
}

/// Management API of a single node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// The `version` RPC; may legitimately be unimplemented on old nodes.
    async fn version(&self) -> Result<Vec<VersionInfo>, Status>;

    /// The `disks` RPC.
    async fn disks(&self) -> Result<Vec<BlockDeviceInfo>, Status>;

    /// List resources of one remote collection.
    async fn list_resources(
        &self,
        namespace: &str,
        resource_type: &str,
    ) -> Result<Vec<NodeResource>, Status>;

    /// Subscribe to change notifications; the stream ends when the
    /// connection is lost.
    async fn watch_changes(&self) -> Result<mpsc::Receiver<ResourceChange>, Status>;
}

/// An established management session.
pub struct NodeConnection {
    pub client: Arc<dyn NodeClient>,
    /// Whether the node is running in maintenance mode, detected during the
    /// connection handshake.
    pub maintenance_mode: bool,
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("maintenance_mode", &self.maintenance_mode)
            .finish()
    }
}

/// Dials nodes by management address.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<NodeConnection, Status>;
}
