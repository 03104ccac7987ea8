//! Remote Bluetooth device registry level.

use dbus::Path;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex, Weak},
};

use crate::{
    adapter::Adapter,
    transport::{Transport, TransportId},
    Address,
};

/// A connected remote device with its audio transports.
///
/// The link to the owning adapter is weak: a transport keeps its device
/// alive and a device its adapter, never the other way around.
pub struct Device {
    /// Remote device address.
    pub address: Address,
    /// Object path of the device within the Bluetooth host stack.
    pub bluez_path: Path<'static>,
    /// Object path prefix of the device's transports on our bus.
    pub path: Path<'static>,
    adapter: Weak<Adapter>,
    transports: Mutex<HashMap<TransportId, Arc<Transport>>>,
    battery: Mutex<Option<u8>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Device {{ address: {} }}", self.address)
    }
}

impl Device {
    pub(crate) fn new(adapter: &Arc<Adapter>, address: Address, bluez_path: Path<'static>) -> Arc<Self> {
        let path = Path::new(format!("{}/{}", &*adapter.path, address.to_path_component()))
            .expect("device path is valid");
        Arc::new(Self {
            address,
            bluez_path,
            path,
            adapter: Arc::downgrade(adapter),
            transports: Mutex::new(HashMap::new()),
            battery: Mutex::new(None),
        })
    }

    /// The owning adapter, while it is still registered.
    pub fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter.upgrade()
    }

    /// Looks up a transport by its identity.
    pub fn transport_lookup(&self, id: TransportId) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().get(&id).cloned()
    }

    /// Inserts a transport; fails when the identity is already present.
    pub(crate) fn transport_insert(&self, transport: Arc<Transport>) -> bool {
        let mut transports = self.transports.lock().unwrap();
        if transports.contains_key(&transport.id()) {
            return false;
        }
        transports.insert(transport.id(), transport);
        true
    }

    /// Removes a transport by identity.
    pub(crate) fn transport_remove(&self, id: TransportId) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().remove(&id)
    }

    /// All transports of this device.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.lock().unwrap().values().cloned().collect()
    }

    /// Battery level in percent, when the device reports one.
    pub fn battery(&self) -> Option<u8> {
        *self.battery.lock().unwrap()
    }

    /// Updates the battery level; returns whether the value changed.
    pub(crate) fn set_battery(&self, level: Option<u8>) -> bool {
        let mut battery = self.battery.lock().unwrap();
        let changed = *battery != level;
        *battery = level;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Arc<Device> {
        let adapter = Adapter::new("hci0").unwrap();
        let addr: Address = "00:1B:66:AB:CD:EF".parse().unwrap();
        let d = adapter.device_lookup_or_create(
            addr,
            Path::new("/org/bluez/hci0/dev_00_1B_66_AB_CD_EF").unwrap(),
        );
        // keep the adapter alive through the device's weak link in tests
        std::mem::forget(adapter);
        d
    }

    #[test]
    fn device_path_nests_under_adapter() {
        let d = device();
        assert_eq!(&*d.path, "/org/bluad/hci0/dev_00_1B_66_AB_CD_EF");
        assert!(d.adapter().is_some());
    }

    #[test]
    fn battery_change_detection() {
        let d = device();
        assert_eq!(d.battery(), None);
        assert!(d.set_battery(Some(80)));
        assert!(!d.set_battery(Some(80)));
        assert!(d.set_battery(None));
    }
}
