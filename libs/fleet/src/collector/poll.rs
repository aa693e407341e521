//! Pollers reading node state into [`Info`].
//!
//! Each poller owns a distinct slice of the snapshot. Pollers gather first
//! and commit under the info lock last, so a failed or cancelled poller
//! advances no fields.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Mutex;

use thiserror::Error;
use tonic::{Code, Status};

use crate::client::{remote, NodeClient, NodeResource};
use crate::meta;
use crate::resources::{BlockDevice, MemoryModule, NetworkLink, PlatformMetadata, Processor};
use crate::schematic::{self, ExtensionEntry};

use super::info::Info;

/// First 64 bits of the management overlay's ULA range; addresses in it are
/// plumbing, not machine addresses.
const MANAGEMENT_ULA_PREFIX: [u16; 4] = [0xfdae, 0x41e4, 0x649b, 0x9303];

/// Poller failure. A failed poller is retried on its next tick or change
/// event; it never aborts the collector task.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("rpc: {0}")]
    Rpc(#[from] Status),

    #[error("malformed labels meta value: {0}")]
    MalformedLabels(#[from] serde_json::Error),
}

/// A named unit updating a subset of [`Info`].
///
/// Resource pollers re-run when the node reports a change to their remote
/// collection; RPC pollers run on a fixed interval. All run once on
/// (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poller {
    Hostname,
    Routes,
    Addresses,
    Links,
    Processors,
    Memory,
    PlatformMetadata,
    Meta,
    Extensions,
    Version,
    Disks,
}

impl Poller {
    pub const RESOURCE: &'static [Poller] = &[
        Poller::Hostname,
        Poller::Routes,
        Poller::Addresses,
        Poller::Links,
        Poller::Processors,
        Poller::Memory,
        Poller::PlatformMetadata,
        Poller::Meta,
        Poller::Extensions,
    ];

    pub const RPC: &'static [Poller] = &[Poller::Version, Poller::Disks];

    pub fn all() -> impl Iterator<Item = Poller> {
        Self::RESOURCE.iter().chain(Self::RPC).copied()
    }

    /// Name used in logs.
    pub fn key(&self) -> &'static str {
        match self {
            Poller::Hostname => "hostname",
            Poller::Routes => "routes",
            Poller::Addresses => "addresses",
            Poller::Links => "links",
            Poller::Processors => "processors",
            Poller::Memory => "memory",
            Poller::PlatformMetadata => "platform-metadata",
            Poller::Meta => "meta",
            Poller::Extensions => "extensions",
            Poller::Version => "version",
            Poller::Disks => "disks",
        }
    }

    /// The remote collection backing a resource poller.
    pub fn remote_collection(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Poller::Hostname => Some((remote::NETWORK_NAMESPACE, remote::HOSTNAME_STATUS)),
            Poller::Routes => Some((remote::NETWORK_NAMESPACE, remote::ROUTE_STATUS)),
            Poller::Addresses => Some((remote::NETWORK_NAMESPACE, remote::NODE_ADDRESS)),
            Poller::Links => Some((remote::NETWORK_NAMESPACE, remote::LINK_STATUS)),
            Poller::Processors => Some((remote::HARDWARE_NAMESPACE, remote::PROCESSOR)),
            Poller::Memory => Some((remote::HARDWARE_NAMESPACE, remote::MEMORY_MODULE)),
            Poller::PlatformMetadata => Some((remote::RUNTIME_NAMESPACE, remote::PLATFORM_METADATA)),
            Poller::Meta => Some((remote::RUNTIME_NAMESPACE, remote::META_KEY)),
            Poller::Extensions => Some((remote::RUNTIME_NAMESPACE, remote::EXTENSION_STATUS)),
            Poller::Version | Poller::Disks => None,
        }
    }

    /// The poller reacting to a remote change notification.
    pub fn for_remote_collection(namespace: &str, resource_type: &str) -> Option<Poller> {
        Self::RESOURCE
            .iter()
            .copied()
            .find(|poller| poller.remote_collection() == Some((namespace, resource_type)))
    }

    pub async fn run(&self, client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
        match self {
            Poller::Hostname => poll_hostname(client, info).await,
            Poller::Routes => poll_routes(client, info).await,
            Poller::Addresses => poll_addresses(client, info).await,
            Poller::Links => poll_links(client, info).await,
            Poller::Processors => poll_processors(client, info).await,
            Poller::Memory => poll_memory(client, info).await,
            Poller::PlatformMetadata => poll_platform_metadata(client, info).await,
            Poller::Meta => poll_meta(client, info).await,
            Poller::Extensions => poll_extensions(client, info).await,
            Poller::Version => poll_version(client, info).await,
            Poller::Disks => poll_disks(client, info).await,
        }
    }
}

fn lock(info: &Mutex<Info>) -> std::sync::MutexGuard<'_, Info> {
    info.lock().unwrap_or_else(|e| e.into_inner())
}

async fn poll_version(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let messages = match client.version().await {
        Ok(messages) => messages,
        // Old nodes may not serve the version RPC; advance nothing.
        Err(status) if status.code() == Code::Unimplemented => return Ok(()),
        Err(status) => return Err(status.into()),
    };

    let mut info = lock(info);
    for message in messages {
        info.talos_version = Some(message.tag);
        info.arch = Some(message.arch);
    }

    Ok(())
}

async fn poll_disks(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let disks = client.disks().await?;

    let blockdevices = disks
        .into_iter()
        .map(|disk| BlockDevice {
            size: disk.size,
            model: disk.model,
            linux_name: disk.device_name,
            name: disk.name,
            serial: disk.serial,
            uuid: disk.uuid,
            wwid: disk.wwid,
            device_type: disk.device_type,
            bus_path: disk.bus_path,
            system_disk: disk.system_disk,
        })
        .collect();

    lock(info).blockdevices = blockdevices;

    Ok(())
}

async fn poll_hostname(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::NETWORK_NAMESPACE, remote::HOSTNAME_STATUS)
        .await?;

    let mut observed = None;
    for resource in resources {
        if let NodeResource::HostnameStatus {
            hostname,
            domainname,
        } = resource
        {
            observed = Some((hostname, domainname));
        }
    }

    if let Some((hostname, domainname)) = observed {
        let mut info = lock(info);
        info.hostname = Some(hostname);
        info.domainname = Some(domainname);
    }

    Ok(())
}

fn in_management_ula(address: &str) -> bool {
    let ip = address.split('/').next().unwrap_or(address);

    match ip.parse::<Ipv6Addr>() {
        Ok(ip) => ip.segments()[..4] == MANAGEMENT_ULA_PREFIX,
        Err(_) => false,
    }
}

async fn poll_addresses(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    // In maintenance mode there is no Kubernetes, so the unfiltered current
    // set is the right one; otherwise use the set with Kubernetes-managed
    // addresses excluded.
    let maintenance_mode = lock(info).maintenance_mode;
    let wanted_id = if maintenance_mode {
        remote::NODE_ADDRESS_CURRENT
    } else {
        remote::NODE_ADDRESS_CURRENT_NO_K8S
    };

    let resources = client
        .list_resources(remote::NETWORK_NAMESPACE, remote::NODE_ADDRESS)
        .await?;

    let mut observed = None;
    for resource in resources {
        if let NodeResource::NodeAddress { id, addresses } = resource {
            if id != wanted_id {
                continue;
            }

            observed = Some(
                addresses
                    .into_iter()
                    .filter(|address| !in_management_ula(address))
                    .collect::<Vec<_>>(),
            );
        }
    }

    if let Some(addresses) = observed {
        lock(info).addresses = addresses;
    }

    Ok(())
}

async fn poll_routes(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::NETWORK_NAMESPACE, remote::ROUTE_STATUS)
        .await?;

    let mut gateways = Vec::new();
    for resource in resources {
        if let NodeResource::RouteStatus {
            destination,
            gateway,
            scope,
        } = resource
        {
            let is_default = destination.is_empty();
            let gateway_valid = gateway.parse::<IpAddr>().is_ok();

            if is_default && gateway_valid && scope == crate::client::RouteScope::Global {
                gateways.push(gateway);
            }
        }
    }

    lock(info).default_gateways = gateways;

    Ok(())
}

async fn poll_links(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::NETWORK_NAMESPACE, remote::LINK_STATUS)
        .await?;

    let mut links = Vec::new();
    for resource in resources {
        if let NodeResource::LinkStatus {
            name,
            physical,
            hardware_address,
            speed_mbps,
            link_up,
            vendor,
            product,
        } = resource
        {
            if !physical {
                continue;
            }

            links.push(NetworkLink {
                linux_name: name,
                hardware_address,
                speed_mbps,
                link_up,
                description: format!("{vendor} {product}"),
            });
        }
    }

    lock(info).network_links = links;

    Ok(())
}

async fn poll_processors(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::HARDWARE_NAMESPACE, remote::PROCESSOR)
        .await?;

    let mut processors = Vec::new();
    for resource in resources {
        if let NodeResource::Processor {
            core_count,
            thread_count,
            max_speed,
            manufacturer,
            product_name,
        } = resource
        {
            // Sockets without a populated CPU report zeroes.
            if core_count == 0 || max_speed == 0 {
                continue;
            }

            processors.push(Processor {
                core_count,
                thread_count,
                frequency: max_speed,
                description: format!("{manufacturer} {product_name}"),
                manufacturer,
            });
        }
    }

    lock(info).processors = processors;

    Ok(())
}

async fn poll_memory(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::HARDWARE_NAMESPACE, remote::MEMORY_MODULE)
        .await?;

    let mut modules = Vec::new();
    for resource in resources {
        if let NodeResource::MemoryModule {
            size_mb,
            manufacturer,
        } = resource
        {
            // Empty slots report zero size.
            if size_mb == 0 {
                continue;
            }

            modules.push(MemoryModule {
                size_mb,
                description: manufacturer,
            });
        }
    }

    lock(info).memory_modules = modules;

    Ok(())
}

async fn poll_platform_metadata(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::RUNTIME_NAMESPACE, remote::PLATFORM_METADATA)
        .await?;

    let mut observed = None;
    for resource in resources {
        if let NodeResource::PlatformMetadata {
            platform,
            hostname,
            region,
            zone,
            instance_type,
            instance_id,
            provider_id,
            spot,
        } = resource
        {
            observed = Some(PlatformMetadata {
                platform,
                hostname,
                region,
                zone,
                instance_type,
                instance_id,
                provider_id,
                spot,
            });
        }
    }

    if let Some(metadata) = observed {
        lock(info).platform_metadata = Some(metadata);
    }

    Ok(())
}

async fn poll_meta(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::RUNTIME_NAMESPACE, remote::META_KEY)
        .await?;

    for resource in resources {
        let NodeResource::MetaKey { id, value } = resource else {
            continue;
        };

        if id != meta::LABELS_META_KEY {
            continue;
        }

        let labels = meta::parse_image_labels(&value)?;

        let mut info = lock(info);
        let masked = match labels {
            Some(mut labels) => {
                if let Some(user_labels) = info.machine_labels.clone() {
                    meta::mask_user_labels(&mut labels, &user_labels);
                }
                Some(labels)
            }
            None => None,
        };
        info.image_labels = masked;
    }

    Ok(())
}

async fn poll_extensions(client: &dyn NodeClient, info: &Mutex<Info>) -> Result<(), PollError> {
    let resources = client
        .list_resources(remote::RUNTIME_NAMESPACE, remote::EXTENSION_STATUS)
        .await?;

    let schematic = schematic::resolve(resources.iter().filter_map(|resource| {
        if let NodeResource::ExtensionStatus {
            name,
            version,
            description,
        } = resource
        {
            Some(ExtensionEntry {
                name,
                version,
                description,
            })
        } else {
            None
        }
    }));

    lock(info).schematic = Some(schematic);

    Ok(())
}
