//! Mock node for tests and development.
//!
//! Holds a mutable node model shared with every client connected to it;
//! mutations notify active watchers so collectors re-poll the affected
//! resource type.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;

use crate::client::{
    BlockDeviceInfo, NodeClient, NodeConnection, NodeConnector, NodeResource, ResourceChange,
    VersionInfo,
};

#[derive(Default)]
struct MockNodeState {
    resources: Vec<NodeResource>,
    version: Option<VersionInfo>,
    disks: Vec<BlockDeviceInfo>,
    maintenance_mode: bool,
    offline: bool,
    watchers: Vec<mpsc::Sender<ResourceChange>>,
}

impl MockNodeState {
    fn notify(&mut self, namespace: &str, resource_type: &str) {
        let change = ResourceChange {
            namespace: namespace.to_string(),
            resource_type: resource_type.to_string(),
        };

        self.watchers.retain(|tx| tx.try_send(change.clone()).is_ok());
    }
}

/// A scriptable in-memory node.
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<MockNodeState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockNodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_version(&self, tag: &str, arch: &str) {
        self.lock().version = Some(VersionInfo {
            tag: tag.to_string(),
            arch: arch.to_string(),
        });
    }

    pub fn set_disks(&self, disks: Vec<BlockDeviceInfo>) {
        self.lock().disks = disks;
    }

    pub fn set_maintenance_mode(&self, maintenance: bool) {
        self.lock().maintenance_mode = maintenance;
    }

    /// Refuse new connections while set; active sessions keep their state.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Add a resource and notify watchers of its collection.
    pub fn insert(&self, resource: NodeResource) {
        let (namespace, resource_type) = resource.collection();
        let mut state = self.lock();
        state.resources.push(resource);
        state.notify(namespace, resource_type);
    }

    /// Drop every resource of a collection and notify watchers.
    pub fn clear(&self, namespace: &str, resource_type: &str) {
        let mut state = self.lock();
        state
            .resources
            .retain(|res| res.collection() != (namespace, resource_type));
        state.notify(namespace, resource_type);
    }

    /// Replace a collection's contents in one step.
    pub fn replace(&self, namespace: &str, resource_type: &str, resources: Vec<NodeResource>) {
        let mut state = self.lock();
        state
            .resources
            .retain(|res| res.collection() != (namespace, resource_type));
        state.resources.extend(resources);
        state.notify(namespace, resource_type);
    }

    pub fn connector(&self) -> Arc<dyn NodeConnector> {
        Arc::new(MockConnector { node: self.clone() })
    }
}

/// Connector handing out clients over the shared mock state.
pub struct MockConnector {
    node: MockNode,
}

#[async_trait]
impl NodeConnector for MockConnector {
    async fn connect(&self, _address: &str) -> Result<NodeConnection, Status> {
        let (offline, maintenance_mode) = {
            let state = self.node.lock();
            (state.offline, state.maintenance_mode)
        };

        if offline {
            return Err(Status::unavailable("node offline"));
        }

        Ok(NodeConnection {
            client: Arc::new(MockNodeClient {
                node: self.node.clone(),
            }),
            maintenance_mode,
        })
    }
}

struct MockNodeClient {
    node: MockNode,
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn version(&self) -> Result<Vec<VersionInfo>, Status> {
        match self.node.lock().version.clone() {
            Some(version) => Ok(vec![version]),
            None => Err(Status::unimplemented("version not supported")),
        }
    }

    async fn disks(&self) -> Result<Vec<BlockDeviceInfo>, Status> {
        Ok(self.node.lock().disks.clone())
    }

    async fn list_resources(
        &self,
        namespace: &str,
        resource_type: &str,
    ) -> Result<Vec<NodeResource>, Status> {
        Ok(self
            .node
            .lock()
            .resources
            .iter()
            .filter(|res| res.collection() == (namespace, resource_type))
            .cloned()
            .collect())
    }

    async fn watch_changes(&self) -> Result<mpsc::Receiver<ResourceChange>, Status> {
        let (tx, rx) = mpsc::channel(64);
        self.node.lock().watchers.push(tx);
        Ok(rx)
    }
}
