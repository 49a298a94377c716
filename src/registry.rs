//! # Device Registry
//!
//! Owns every `Device` the gateway knows about. Pools, breakers, and
//! pending requests refer to devices by id, never by pointer (spec §3
//! ownership note, §9 "back-references & cycles").

use crate::value::{Device, DeviceId};
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Created by config or discovery (spec §3). Overwrites any existing
    /// entry with the same id via atomic replace, never a partial mutation.
    pub fn insert(&self, device: Device) {
        self.devices.write().insert(device.id.clone(), device);
    }

    pub fn remove(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.write().remove(device_id)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn all(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Protocol;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = DeviceRegistry::new();
        registry.insert(Device::new("dev-1", Protocol::Modbus, "10.0.0.1", 502));
        let device = registry.get(&DeviceId::from("dev-1")).unwrap();
        assert_eq!(device.port, 502);
    }

    #[test]
    fn remove_drops_the_device() {
        let registry = DeviceRegistry::new();
        registry.insert(Device::new("dev-1", Protocol::Modbus, "10.0.0.1", 502));
        registry.remove(&DeviceId::from("dev-1"));
        assert!(registry.get(&DeviceId::from("dev-1")).is_none());
    }

    #[test]
    fn insert_overwrites_by_atomic_replace() {
        let registry = DeviceRegistry::new();
        registry.insert(Device::new("dev-1", Protocol::Modbus, "10.0.0.1", 502));
        registry.insert(Device::new("dev-1", Protocol::Modbus, "10.0.0.2", 503));
        let device = registry.get(&DeviceId::from("dev-1")).unwrap();
        assert_eq!(device.address, "10.0.0.2");
        assert_eq!(registry.all().len(), 1);
    }
}
