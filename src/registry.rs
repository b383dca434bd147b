//! Registry of the devices reserved for a run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::{
    ConnectionError, ConnectionFactory, DescriptorError, Device, DeviceRecord, DeviceType, NodeId,
    PortPool, parse_device_reply,
};
use crate::error::StepError;

/// Errors raised while building the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The server reply could not be parsed.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// A device record has no connection descriptor.
    #[error("node {node_id} has no connection details")]
    NoConnection {
        /// Node without descriptors.
        node_id: NodeId,
    },
    /// The same node id appeared twice.
    #[error("node {node_id} is listed more than once")]
    Duplicate {
        /// Repeated node id.
        node_id: NodeId,
    },
    /// The connection factory rejected a descriptor.
    #[error("node {node_id}: {source}")]
    Connection {
        /// Node whose descriptor was rejected.
        node_id: NodeId,
        /// Factory error.
        #[source]
        source: ConnectionError,
    },
}

/// Map of node id to device, built once per run.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: BTreeMap<NodeId, Arc<Device>>,
    pool: Arc<PortPool>,
    closed: AtomicBool,
}

impl DeviceRegistry {
    /// Builds a registry from ready-made devices.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when two devices share a node id.
    pub fn new(
        devices: impl IntoIterator<Item = Device>,
        pool: Arc<PortPool>,
    ) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for device in devices {
            let node_id = device.node_id;
            if map.insert(node_id, Arc::new(device)).is_some() {
                return Err(RegistryError::Duplicate { node_id });
            }
        }
        Ok(Self {
            devices: map,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// A registry without devices.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            devices: BTreeMap::new(),
            pool: Arc::new(PortPool::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a registry from the `data` of the device-details reply,
    /// creating one unopened connection per device.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the reply is malformed or a
    /// descriptor cannot be served.
    pub fn from_server_reply(
        data: &Value,
        factory: &dyn ConnectionFactory,
        pool: Arc<PortPool>,
    ) -> Result<Self, RegistryError> {
        let records = parse_device_reply(data)?;
        let devices = records
            .into_iter()
            .map(|record| build_device(record, factory))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(devices, pool)
    }

    /// Looks a device up by node id.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<Arc<Device>> {
        self.devices.get(&node_id).cloned()
    }

    /// Looks a device up, failing the step when it is not part of the setup.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::TestUsage`] for unknown node ids.
    pub fn require(&self, node_id: NodeId) -> Result<Arc<Device>, StepError> {
        self.get(node_id).ok_or_else(|| {
            StepError::usage(format!("Node {node_id} is not part of the test setup"))
        })
    }

    /// Every device, ordered by node id.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.values().cloned().collect()
    }

    /// Every node id, ascending.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.devices.keys().copied().collect()
    }

    /// Devices accepted by `predicate`, ordered by node id.
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&Device) -> bool) -> Vec<Arc<Device>> {
        self.devices
            .values()
            .filter(|device| predicate(device))
            .cloned()
            .collect()
    }

    /// Devices of one category.
    #[must_use]
    pub fn of_type(&self, device_type: DeviceType) -> Vec<Arc<Device>> {
        self.filter(|device| device.device_type == device_type)
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry holds no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forwarding-port pool shared by this registry's jump-host tunnels.
    #[must_use]
    pub const fn port_pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Closes every connection. Later calls do nothing; close failures are
    /// logged and otherwise ignored.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let closing = self.devices.values().map(|device| async move {
            if let Err(err) = device.connection.close().await {
                warn!(node_id = device.node_id, error = %err, "failed to close device connection");
            }
        });
        join_all(closing).await;
        debug!(devices = self.devices.len(), "device connections closed");
    }

    /// Whether [`DeviceRegistry::close_all`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn build_device(record: DeviceRecord, factory: &dyn ConnectionFactory) -> Result<Device, RegistryError> {
    let node_id = record.node_id;
    let primary = record
        .descriptors
        .first()
        .ok_or(RegistryError::NoConnection { node_id })?;
    let connection = factory
        .build(node_id, primary)
        .map_err(|source| RegistryError::Connection { node_id, source })?;
    Ok(Device {
        node_id,
        name: record.name,
        device_type: record.device_type,
        device_sub_type: record.device_sub_type,
        descriptors: record.descriptors,
        metadata: record.metadata,
        connection,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::device::{SshSettings, TransportFactory};
    use crate::error::StepErrorKind;
    use crate::process::ProcessCommandRunner;
    use crate::test_support::{ScriptedConnection, scripted_device};

    #[test]
    fn builds_devices_from_server_reply() {
        let pool = Arc::new(PortPool::new());
        let factory = TransportFactory::new(
            SshSettings::default(),
            Arc::new(ProcessCommandRunner),
            Arc::clone(&pool),
        );
        let reply = json!([
            {"node_number": 2, "name": "cn", "device_type_data": {"device_type_name": "terragraph"},
             "connections": [{"connection_type": 100, "ip_address": "10.0.0.2", "username": "root"}]},
            {"node_number": 1, "name": "ctrl", "device_type_data": {"device_type_name": "controller"},
             "connections": [{"connection_type": 100, "chroot": "/srv/ctrl"}]}
        ]);

        let registry = DeviceRegistry::from_server_reply(&reply, &factory, pool).expect("registry");
        assert_eq!(registry.node_ids(), vec![1, 2]);
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert_eq!(registry.of_type(DeviceType::RadioNode).len(), 1);
        let ctrl = registry.get(1).expect("node 1");
        assert_eq!(ctrl.connection.describe(), "chroot /srv/ctrl");
    }

    #[test]
    fn devices_without_connections_are_rejected() {
        let factory = TransportFactory::new(
            SshSettings::default(),
            Arc::new(ProcessCommandRunner),
            Arc::new(PortPool::new()),
        );
        let reply = json!([{"node_number": 5, "connections": []}]);
        let err = DeviceRegistry::from_server_reply(&reply, &factory, Arc::new(PortPool::new()))
            .expect_err("no connection");
        assert!(matches!(err, RegistryError::NoConnection { node_id: 5 }));
    }

    #[test]
    fn unknown_node_is_a_usage_error() {
        let registry = DeviceRegistry::new(Vec::new(), Arc::new(PortPool::new())).expect("empty");
        assert!(registry.is_empty());
        let err = registry.require(9).expect_err("missing node");
        assert_eq!(err.kind(), StepErrorKind::TestUsage);
    }

    #[tokio::test]
    async fn close_all_is_idempotent() {
        let conn = Arc::new(ScriptedConnection::new("dut"));
        let registry = DeviceRegistry::new(
            vec![scripted_device(1, DeviceType::RadioNode, Arc::clone(&conn))],
            Arc::new(PortPool::new()),
        )
        .expect("registry");

        registry.close_all().await;
        registry.close_all().await;
        assert_eq!(conn.close_count(), 1);
        assert!(registry.is_closed());
    }
}
