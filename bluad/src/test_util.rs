//! Shared fixtures for unit tests.

use dbus::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{
    adapter::Adapter,
    codec::Codec,
    config::Config,
    device::Device,
    session::DaemonEvent,
    sock,
    transport::{Backend, Profile, ScoSocket, Transport, TransportParams},
    Address,
};

/// Builds a SCO transport in a one-device registry.
///
/// The returned adapter and device keep the weak parent links alive for
/// the duration of the test. Daemon events go nowhere.
pub(crate) fn sco_transport(codec: Codec) -> (Arc<Transport>, Arc<Device>, Arc<Adapter>) {
    let adapter = Adapter::new("hci0").unwrap();
    let address: Address = "00:1B:66:AB:CD:EF".parse().unwrap();
    let bluez_path = Path::new("/org/bluez/hci0/dev_00_1B_66_AB_CD_EF").unwrap();
    let device = adapter.device_lookup_or_create(address, bluez_path.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    std::mem::forget(events_rx);
    let sampling = match codec {
        Codec::Msbc => 16_000,
        _ => 8_000,
    };
    let transport = Transport::new(
        &device,
        Arc::new(Config::default()),
        events_tx,
        TransportParams {
            profile: Profile::HfpAg,
            codec,
            channels: 1,
            sampling,
            config: Vec::new(),
        },
        Backend::Sco { pending: Mutex::new(None) },
        bluez_path,
    );
    device.transport_insert(transport.clone());
    (transport, device, adapter)
}

/// Test double of an acquired A2DP source link.
///
/// The device and adapter are carried only to keep the weak parent links
/// alive.
pub(crate) struct A2dpRig {
    pub transport: Arc<Transport>,
    pub _device: Arc<Device>,
    pub _adapter: Arc<Adapter>,
    /// The far end of the "Bluetooth" socket.
    pub peer: sock::OwnedFd,
    pub events: mpsc::UnboundedReceiver<DaemonEvent>,
}

/// Builds an A2DP source transport whose socket handover is backed by a
/// socketpair, with its I/O task running. 16 kHz mono SBC keeps the test
/// batches small.
pub(crate) fn a2dp_source_rig(mtu_write: usize) -> A2dpRig {
    let adapter = Adapter::new("hci0").unwrap();
    let address: Address = "00:1B:66:AB:CD:EF".parse().unwrap();
    let bluez_path = Path::new("/org/bluez/hci0/dev_00_1B_66_AB_CD_EF").unwrap();
    let device = adapter.device_lookup_or_create(address, bluez_path.clone());

    let (local, peer) = sock::seqpacket_pair().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();

    // 16 kHz, mono, 16 blocks, 8 subbands, loudness, bitpool 26
    let config = vec![0x88, 0x15, 26, 26];
    let transport = Transport::new(
        &device,
        Arc::new(Config::default()),
        events_tx,
        TransportParams {
            profile: Profile::A2dpSource,
            codec: Codec::Sbc,
            channels: 1,
            sampling: 16_000,
            config,
        },
        Backend::Sco {
            pending: Mutex::new(Some(ScoSocket { fd: local, mtu_read: mtu_write, mtu_write })),
        },
        bluez_path,
    );
    device.transport_insert(transport.clone());
    transport.start_io().unwrap();
    A2dpRig { transport, _device: device, _adapter: adapter, peer, events }
}
