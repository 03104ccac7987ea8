//! Bluetooth adapter registry level.

use dbus::Path;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};

use crate::{device::Device, Address, Error, ErrorKind, Result, MANAGER_PATH};

pub(crate) const BLUEZ_PREFIX: &str = "/org/bluez/";

/// A local Bluetooth adapter with its connected devices.
///
/// Entries are kept alive by [Arc] references; the devices map is guarded
/// by its own mutex, taken before any device-level lock.
pub struct Adapter {
    /// HCI device index, e.g. 0 for `hci0`.
    pub index: u16,
    /// Adapter name, e.g. `hci0`.
    pub name: String,
    /// Object path of the adapter within the Bluetooth host stack.
    pub bluez_path: Path<'static>,
    /// Object path of the adapter on our bus.
    pub path: Path<'static>,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ name: {} }}", &self.name)
    }
}

impl Adapter {
    /// Creates an adapter entry for the given name, e.g. `hci0`.
    pub(crate) fn new(name: &str) -> Result<Arc<Self>> {
        let index: u16 = name
            .strip_prefix("hci")
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| Error::new(ErrorKind::InvalidName(name.to_string())))?;
        Ok(Arc::new(Self {
            index,
            name: name.to_string(),
            bluez_path: Path::new(format!("{BLUEZ_PREFIX}{name}"))
                .map_err(|_| Error::new(ErrorKind::InvalidName(name.to_string())))?,
            path: Path::new(format!("{MANAGER_PATH}/{name}"))
                .map_err(|_| Error::new(ErrorKind::InvalidName(name.to_string())))?,
            devices: Mutex::new(HashMap::new()),
        }))
    }

    /// Looks up a connected device by address.
    pub fn device_lookup(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// Looks up a device, creating and inserting it when absent.
    ///
    /// Insertion is atomic with respect to the devices mutex.
    pub(crate) fn device_lookup_or_create(
        self: &Arc<Self>, address: Address, bluez_path: Path<'static>,
    ) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(address)
            .or_insert_with(|| Device::new(self, address, bluez_path))
            .clone()
    }

    /// Removes a device from the registry; its transports stay referenced
    /// until torn down by the caller.
    pub(crate) fn device_remove(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().remove(&address)
    }

    /// All currently registered devices.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_paths_follow_the_name() {
        let adapter = Adapter::new("hci2").unwrap();
        assert_eq!(adapter.index, 2);
        assert_eq!(&*adapter.bluez_path, "/org/bluez/hci2");
        assert_eq!(&*adapter.path, "/org/bluad/hci2");
    }

    #[test]
    fn bogus_names_are_rejected() {
        assert!(Adapter::new("wlan0").is_err());
        assert!(Adapter::new("hci").is_err());
        assert!(Adapter::new("hcix").is_err());
    }

    #[test]
    fn device_lookup_or_create_is_idempotent() {
        let adapter = Adapter::new("hci0").unwrap();
        let addr: Address = "00:11:22:33:44:55".parse().unwrap();
        let path = Path::new("/org/bluez/hci0/dev_00_11_22_33_44_55").unwrap();

        let d1 = adapter.device_lookup_or_create(addr, path.clone());
        let d2 = adapter.device_lookup_or_create(addr, path);
        assert!(Arc::ptr_eq(&d1, &d2));
        assert_eq!(adapter.devices().len(), 1);

        assert!(adapter.device_remove(addr).is_some());
        assert!(adapter.device_lookup(addr).is_none());
    }
}
