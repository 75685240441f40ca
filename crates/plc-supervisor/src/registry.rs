use crate::controller::{DeviceController, DeviceSnapshot, SupervisorContext};
use crate::error::{ConnectError, RegistryError};
use crate::loader::group_device_id;
use crate::types::{DeploymentConfig, DeviceProfile};
use plc_link::DeviceLink;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Creates the link a device talks through.
pub trait LinkFactory {
    fn create(&self, device_id: &str, address: &str) -> Box<dyn DeviceLink>;
}

impl<F> LinkFactory for F
where
    F: Fn(&str, &str) -> Box<dyn DeviceLink>,
{
    fn create(&self, device_id: &str, address: &str) -> Box<dyn DeviceLink> {
        self(device_id, address)
    }
}

/// Outcome of [`DeviceRegistry::connect_all`].
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, ConnectError)>,
}

impl ConnectReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Every controller of a deployment, keyed by device id.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceController>,
}

impl DeviceRegistry {
    /// One controller per address, ids `"{type_name}{n}"` counting from 1.
    /// No I/O happens here.
    pub fn init<A: AsRef<str>>(
        addresses: &[A],
        type_name: &str,
        profile: &DeviceProfile,
        links: &dyn LinkFactory,
        ctx: &SupervisorContext,
    ) -> Self {
        let devices = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| {
                let id = group_device_id(type_name, i);
                let address = address.as_ref();
                let link = links.create(&id, address);
                let dev = DeviceController::new(id.clone(), address, profile.clone(), link, ctx.clone());
                (id, dev)
            })
            .collect();
        Self { devices }
    }

    /// Validate `config` and build every group and standalone device it declares.
    pub fn from_config(
        config: &DeploymentConfig,
        links: &dyn LinkFactory,
        ctx: &SupervisorContext,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        let mut reg = Self::default();
        for planned in config.planned_devices() {
            // validate() already resolved every profile name
            let Some(profile) = config.profiles.get(&planned.profile) else {
                continue;
            };
            let link = links.create(&planned.id, &planned.address);
            reg.insert(DeviceController::new(
                planned.id,
                planned.address,
                profile.clone(),
                link,
                ctx.clone(),
            ))?;
        }
        info!(devices = reg.len(), "registry built");
        Ok(reg)
    }

    pub fn insert(&mut self, dev: DeviceController) -> Result<(), RegistryError> {
        if self.devices.contains_key(dev.id()) {
            return Err(RegistryError::DuplicateId(dev.id().to_string()));
        }
        self.devices.insert(dev.id().to_string(), dev);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&DeviceController> {
        self.devices.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceController> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Attempt every device once. A failure is logged and recorded in the
    /// report; the remaining devices are still attempted.
    pub fn connect_all(&self) -> ConnectReport {
        let mut report = ConnectReport::default();
        for dev in self.devices.values() {
            match dev.connect() {
                Ok(()) => report.connected.push(dev.id().to_string()),
                Err(e) => {
                    warn!(device = %dev.id(), error = %e, "device left disconnected");
                    report.failed.push((dev.id().to_string(), e));
                }
            }
        }
        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "connect_all finished"
        );
        report
    }

    pub fn disconnect_all(&self) {
        for dev in self.devices.values() {
            dev.disconnect();
        }
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices.values().map(DeviceController::snapshot).collect()
    }
}
