//! Host Bluetooth stack integration.
//!
//! The daemon consumes the host stack through its D-Bus surface: media
//! transport objects appear once a remote audio endpoint is configured and
//! hand over a socket plus an MTU pair on acquire; telephony profiles are
//! registered with the profile manager and deliver their RFCOMM streams
//! through `NewConnection`.

use dbus::{
    arg::{prop_cast, PropMap, RefArg, Variant},
    message::{MatchRule, SignalArgs},
    nonblock::{
        stdintf::org_freedesktop_dbus::{
            ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
        },
        Proxy, SyncConnection,
    },
    strings::BusName,
    MethodErr, Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use futures::{channel::mpsc, StreamExt};
use lazy_static::lazy_static;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{
    os::unix::io::IntoRawFd,
    sync::{Arc, Weak},
};

use crate::{
    all_bluez_objects, bus,
    codec::{sbc::SbcConfig, Codec},
    method_call,
    session::{DaemonEvent, SessionInner},
    sock::OwnedFd,
    transport::{Backend, Profile, TransportParams},
    Address, Error, ErrorKind, Result, BLUEZ_SERVICE, MANAGER_PATH, TIMEOUT,
};

pub(crate) const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
pub(crate) const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub(crate) const PROFILE_INTERFACE: &str = "org.bluez.Profile1";
pub(crate) const PROFILE_MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
pub(crate) const PROFILE_MANAGER_PATH: &str = "/org/bluez";

/// Acquires the Bluetooth socket of a media transport.
///
/// Returns the socket and the read/write MTU pair. With `try_only` the
/// non-blocking probe variant is used, as required before the remote
/// device powers up its audio path.
pub(crate) async fn transport_acquire(
    connection: &Arc<SyncConnection>, path: &Path<'static>, try_only: bool,
) -> Result<(OwnedFd, u16, u16)> {
    let proxy = Proxy::new(BLUEZ_SERVICE, path, TIMEOUT, connection.clone());
    let method = if try_only { "TryAcquire" } else { "Acquire" };
    let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) =
        proxy.method_call(MEDIA_TRANSPORT_INTERFACE, method, ()).await?;
    let fd = unsafe { OwnedFd::new(fd.into_raw_fd()) };
    Ok((fd, mtu_read, mtu_write))
}

/// Releases a previously acquired media transport.
pub(crate) async fn transport_release(
    connection: &Arc<SyncConnection>, path: &Path<'static>,
) -> Result<()> {
    let proxy = Proxy::new(BLUEZ_SERVICE, path, TIMEOUT, connection.clone());
    proxy.method_call::<(), _, _, _>(MEDIA_TRANSPORT_INTERFACE, "Release", ()).await?;
    Ok(())
}

/// Splits a host-stack device path into adapter name and device address.
pub(crate) fn parse_device_path(path: &Path<'_>) -> Option<(String, Address)> {
    let rest = path.strip_prefix("/org/bluez/")?;
    let (adapter, dev) = rest.split_once('/')?;
    let address = Address::parse_path_component(dev)?;
    Some((adapter.to_string(), address))
}

fn uuid_profile(uuid: &str) -> Option<Profile> {
    match uuid.get(..8)? {
        "0000110a" => Some(Profile::A2dpSource),
        "0000110b" => Some(Profile::A2dpSink),
        _ => None,
    }
}

/// A2DP media codec identifiers as carried by the transport object.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
enum A2dpCodecId {
    Sbc = 0x00,
    Mpeg12 = 0x01,
    Aac = 0x02,
    Vendor = 0xff,
}

fn vendor_codec(config: &[u8]) -> Option<Codec> {
    if config.len() < 6 {
        return None;
    }
    let vendor = u32::from_le_bytes([config[0], config[1], config[2], config[3]]);
    let codec = u16::from_le_bytes([config[4], config[5]]);
    match (vendor, codec) {
        (0x0000004f, 0x0001) => Some(Codec::AptX),
        (0x0000012d, 0x00aa) => Some(Codec::Ldac),
        _ => None,
    }
}

/// Channels and sample rate of a configured A2DP stream.
fn stream_params(codec: Codec, config: &[u8]) -> (u8, u32) {
    match codec {
        Codec::Sbc => match SbcConfig::from_a2dp(config) {
            Ok(sbc) => (sbc.channels() as u8, sbc.frequency),
            Err(_) => (2, 44_100),
        },
        Codec::Aac if config.len() >= 3 => {
            let channels = if config[2] & 0x08 != 0 { 1 } else { 2 };
            let sampling = match (config[1], config[2] & 0xf0) {
                (f, _) if f & 0x01 != 0 => 44_100,
                (_, s) if s & 0x80 != 0 => 48_000,
                (f, _) if f & 0x02 != 0 => 32_000,
                (_, s) if s & 0x10 != 0 => 96_000,
                _ => 44_100,
            };
            (channels, sampling)
        }
        Codec::AptX if config.len() >= 7 => {
            let channels = if config[6] & 0x01 != 0 { 1 } else { 2 };
            let sampling = match config[6] & 0xf0 {
                0x80 => 16_000,
                0x40 => 32_000,
                0x20 => 44_100,
                0x10 => 48_000,
                _ => 44_100,
            };
            (channels, sampling)
        }
        Codec::Ldac if config.len() >= 8 => {
            let channels = if config[7] & 0x04 != 0 { 1 } else { 2 };
            let sampling = match config[6] & 0x3f {
                0x20 => 44_100,
                0x10 => 48_000,
                0x08 => 88_200,
                0x04 => 96_000,
                _ => 48_000,
            };
            (channels, sampling)
        }
        _ => (2, 44_100),
    }
}

fn a2dp_profile_enabled(inner: &SessionInner, profile: Profile) -> bool {
    match profile {
        Profile::A2dpSource => inner.config.enable.a2dp_source,
        Profile::A2dpSink => inner.config.enable.a2dp_sink,
        _ => false,
    }
}

async fn handle_transport_added(inner: &Arc<SessionInner>, path: Path<'static>, props: &PropMap) {
    let Some(device_path) = prop_cast::<Path>(props, "Device").cloned() else {
        return;
    };
    let Some(uuid) = prop_cast::<String>(props, "UUID") else {
        return;
    };
    let Some(profile) = uuid_profile(&uuid.to_lowercase()) else {
        return;
    };
    if !a2dp_profile_enabled(inner, profile) {
        return;
    }
    let Some((adapter_name, address)) = parse_device_path(&device_path) else {
        log::error!("Cannot parse device path: {device_path}");
        return;
    };
    if !inner.config.adapter_enabled(&adapter_name) {
        return;
    }

    let codec_id = prop_cast::<u8>(props, "Codec").copied().unwrap_or(0);
    let config = prop_cast::<Vec<u8>>(props, "Configuration").cloned().unwrap_or_default();
    let codec = match A2dpCodecId::from_u8(codec_id) {
        Some(A2dpCodecId::Sbc) => Codec::Sbc,
        Some(A2dpCodecId::Mpeg12) => Codec::Mpeg12,
        Some(A2dpCodecId::Aac) => Codec::Aac,
        Some(A2dpCodecId::Vendor) => match vendor_codec(&config) {
            Some(codec) => codec,
            None => {
                log::warn!("Unknown vendor codec: {config:02x?}");
                return;
            }
        },
        None => {
            log::warn!("Codec not supported: {codec_id}");
            return;
        }
    };
    let (channels, sampling) = stream_params(codec, &config);

    let adapter = match inner.adapter_lookup_or_create(&adapter_name) {
        Ok(adapter) => adapter,
        Err(err) => {
            log::error!("Invalid adapter {adapter_name}: {err}");
            return;
        }
    };
    let device = adapter.device_lookup_or_create(address, device_path.into_static());

    let params = TransportParams { profile, codec, channels, sampling, config };
    let backend = Backend::A2dp { connection: inner.connection.clone() };
    if let Err(err) = inner.add_transport(&device, params, backend, path).await {
        log::warn!("Couldn't add transport: {err}");
    }
}

async fn handle_transport_state(inner: &Arc<SessionInner>, path: &Path<'static>, state: &str) {
    let Some(transport) = inner.transport_by_bluez_path(path) else {
        return;
    };
    match state {
        // the remote device started streaming to us
        "pending" if transport.profile == Profile::A2dpSink => {
            if let Err(err) = transport.acquire().await {
                log::warn!("{}: acquire failed: {err}", &transport.path);
                return;
            }
            transport.set_state(crate::transport::State::Active);
            transport.send_signal(crate::transport::Signal::Ping);
        }
        "idle" if transport.profile == Profile::A2dpSink => {
            transport.set_state(crate::transport::State::Idle);
        }
        _ => (),
    }
}

fn handle_battery(inner: &Arc<SessionInner>, device_path: &Path<'static>, level: Option<u8>) {
    let Some((adapter_name, address)) = parse_device_path(device_path) else {
        return;
    };
    let adapters = inner.adapters.lock().unwrap();
    let Some(device) = adapters.get(&adapter_name).and_then(|a| a.device_lookup(address)) else {
        return;
    };
    drop(adapters);
    if !device.set_battery(level) {
        return;
    }
    for transport in device.transports() {
        if transport.profile == Profile::Rfcomm {
            continue;
        }
        let mut changed = PropMap::new();
        if let Some(level) = level {
            changed.insert("Battery".into(), Variant(Box::new(level)));
        }
        bus::emit_properties_changed(&inner.connection, &transport.path, bus::PCM_INTERFACE, changed);
    }
}

/// Starts the host-stack integration: scans for already configured
/// transports, watches for new ones and registers the enabled telephony
/// profiles.
pub(crate) async fn start(inner: Arc<SessionInner>) -> Result<()> {
    lazy_static! {
        static ref SERVICE_NAME_BUS: BusName<'static> = BusName::new(BLUEZ_SERVICE).unwrap();
        static ref SERVICE_NAME_REF: Option<&'static BusName<'static>> = Some(&SERVICE_NAME_BUS);
    }

    let connection = inner.connection.clone();
    let (msg_tx, mut msg_rx) = mpsc::unbounded();
    let handle_msg = move |msg: dbus::Message| {
        let _ = msg_tx.unbounded_send(msg);
        true
    };

    let rule_add = ObjectManagerInterfacesAdded::match_rule(*SERVICE_NAME_REF, None);
    let _msg_match_add = connection.add_match(rule_add).await?.msg_cb(handle_msg.clone());

    let rule_removed = ObjectManagerInterfacesRemoved::match_rule(*SERVICE_NAME_REF, None);
    let _msg_match_removed = connection.add_match(rule_removed).await?.msg_cb(handle_msg.clone());

    let rule_prop = PropertiesPropertiesChanged::match_rule(*SERVICE_NAME_REF, None);
    let _msg_match_prop = connection.add_match(rule_prop).await?.msg_cb(handle_msg);

    register_profiles(&inner).await?;

    // pick up transports configured before we started
    match all_bluez_objects(&connection).await {
        Ok(objects) => {
            for (path, interfaces) in objects {
                if let Some(props) = interfaces.get(MEDIA_TRANSPORT_INTERFACE) {
                    handle_transport_added(&inner, path.clone(), props).await;
                }
                if let Some(props) = interfaces.get(BATTERY_INTERFACE) {
                    let level = prop_cast::<u8>(props, "Percentage").copied();
                    handle_battery(&inner, &path, level);
                }
            }
        }
        Err(err) => log::warn!("Couldn't enumerate host stack objects: {err}"),
    }

    let weak = Arc::downgrade(&inner);
    tokio::spawn(async move {
        // keep the match rules alive for the lifetime of the watcher
        let _matches = (_msg_match_add, _msg_match_removed, _msg_match_prop);
        while let Some(msg) = msg_rx.next().await {
            let Some(inner) = weak.upgrade() else { break };

            if let Some(ObjectManagerInterfacesAdded { object, interfaces }) =
                ObjectManagerInterfacesAdded::from_message(&msg)
            {
                if let Some(props) = interfaces.get(MEDIA_TRANSPORT_INTERFACE) {
                    handle_transport_added(&inner, object.clone(), props).await;
                }
                if let Some(props) = interfaces.get(BATTERY_INTERFACE) {
                    let level = prop_cast::<u8>(props, "Percentage").copied();
                    handle_battery(&inner, &object, level);
                }
                continue;
            }

            if let Some(ObjectManagerInterfacesRemoved { object, interfaces, .. }) =
                ObjectManagerInterfacesRemoved::from_message(&msg)
            {
                if interfaces.iter().any(|i| i == MEDIA_TRANSPORT_INTERFACE) {
                    let _ = inner.events_tx.send(DaemonEvent::BluezGone(object.clone()));
                }
                if interfaces.iter().any(|i| i == BATTERY_INTERFACE) {
                    handle_battery(&inner, &object, None);
                }
                continue;
            }

            if let (Some(path), Some(PropertiesPropertiesChanged { interface_name, changed_properties, .. })) =
                (msg.path(), PropertiesPropertiesChanged::from_message(&msg))
            {
                let path = path.into_static();
                match interface_name.as_str() {
                    MEDIA_TRANSPORT_INTERFACE => {
                        if let Some(state) = prop_cast::<String>(&changed_properties, "State") {
                            handle_transport_state(&inner, &path, state).await;
                        }
                    }
                    BATTERY_INTERFACE => {
                        let level = prop_cast::<u8>(&changed_properties, "Percentage").copied();
                        handle_battery(&inner, &path, level);
                    }
                    _ => (),
                }
            }
        }
    });

    Ok(())
}

// ---- telephony profiles ----

/// A telephony profile published towards the host stack.
pub struct RegisteredProfile {
    inner: Weak<SessionInner>,
    profile: Profile,
}

impl RegisteredProfile {
    fn uuid(profile: Profile) -> &'static str {
        match profile {
            Profile::HspHs => "00001108-0000-1000-8000-00805f9b34fb",
            Profile::HspAg => "00001112-0000-1000-8000-00805f9b34fb",
            Profile::HfpHf => "0000111e-0000-1000-8000-00805f9b34fb",
            _ => "0000111f-0000-1000-8000-00805f9b34fb",
        }
    }
}

/// Registers the `org.bluez.Profile1` interface we serve for telephony
/// connections.
pub(crate) fn profile_interface(cr: &mut Crossroads) -> IfaceToken<Arc<RegisteredProfile>> {
    cr.register(PROFILE_INTERFACE, |ib: &mut IfaceBuilder<Arc<RegisteredProfile>>| {
        ib.method_with_cr_async(
            "NewConnection",
            ("device", "fd", "fd_properties"),
            (),
            |ctx, cr, (device_path, fd, props): (Path<'static>, dbus::arg::OwnedFd, PropMap)| {
                method_call(ctx, cr, |reg: Arc<RegisteredProfile>| async move {
                    let Some(inner) = reg.inner.upgrade() else {
                        return Err(MethodErr::failed("daemon is shutting down"));
                    };
                    handle_rfcomm_connection(&inner, reg.profile, device_path, fd, &props)
                        .await
                        .map_err(MethodErr::from)?;
                    Ok(())
                })
            },
        );

        ib.method_with_cr_async(
            "RequestDisconnection",
            ("device",),
            (),
            |ctx, cr, (device_path,): (Path<'static>,)| {
                method_call(ctx, cr, |reg: Arc<RegisteredProfile>| async move {
                    let Some(inner) = reg.inner.upgrade() else {
                        return Ok(());
                    };
                    let Some((adapter_name, address)) = parse_device_path(&device_path) else {
                        return Err(MethodErr::invalid_arg("device"));
                    };
                    let device = {
                        let adapters = inner.adapters.lock().unwrap();
                        adapters.get(&adapter_name).and_then(|a| a.device_lookup(address))
                    };
                    if let Some(device) = device {
                        for transport in device.transports() {
                            if transport.profile.is_sco() {
                                inner.destroy_transport(transport).await;
                            }
                        }
                    }
                    Ok(())
                })
            },
        );

        ib.method_with_cr_async("Release", (), (), |ctx, cr, (): ()| {
            method_call(ctx, cr, |_reg: Arc<RegisteredProfile>| async move { Ok(()) })
        });
    })
}

async fn handle_rfcomm_connection(
    inner: &Arc<SessionInner>, profile: Profile, device_path: Path<'static>, fd: dbus::arg::OwnedFd,
    props: &PropMap,
) -> Result<()> {
    let Some((adapter_name, address)) = parse_device_path(&device_path) else {
        return Err(Error::with_message(ErrorKind::InvalidArguments, "cannot parse device path"));
    };
    if !inner.config.adapter_enabled(&adapter_name) {
        return Err(Error::new(ErrorKind::NotSupported));
    }

    let adapter = inner.adapter_lookup_or_create(&adapter_name)?;
    let device = adapter.device_lookup_or_create(address, device_path.clone());

    // headset profiles run narrow-band from the start; hands-free selects
    // its codec during service level negotiation
    let codec = match profile {
        Profile::HspAg | Profile::HspHs => Codec::Cvsd,
        _ => Codec::Undefined,
    };
    let sco = inner
        .add_transport(
            &device,
            TransportParams { profile, codec, channels: 1, sampling: 8_000, config: Vec::new() },
            Backend::Sco { pending: std::sync::Mutex::new(None) },
            device_path.clone(),
        )
        .await?;

    let rfcomm = inner
        .add_rfcomm_transport(
            &device,
            &sco,
            TransportParams {
                profile: Profile::Rfcomm,
                codec: Codec::Undefined,
                channels: 0,
                sampling: 0,
                config: Vec::new(),
            },
            device_path,
        )
        .await?;

    if let crate::transport::TransportKind::Rfcomm { features, .. } = &rfcomm.kind {
        let value = prop_cast::<u16>(props, "Features").copied().unwrap_or(0);
        features.store(value as u32, std::sync::atomic::Ordering::Relaxed);
    }
    let stream = unsafe { OwnedFd::new(fd.into_raw_fd()) };
    rfcomm.set_bt_socket(stream, 0, 0)?;
    rfcomm.send_signal(crate::transport::Signal::Ping);

    Ok(())
}

async fn register_profiles(inner: &Arc<SessionInner>) -> Result<()> {
    let enable = &inner.config.enable;
    let profiles = [
        (Profile::HfpAg, enable.hfp_ag),
        (Profile::HfpHf, enable.hfp_hf),
        (Profile::HspAg, enable.hsp_ag),
        (Profile::HspHs, enable.hsp_hs),
    ];

    for (profile, enabled) in profiles {
        if !enabled {
            continue;
        }
        let path = Path::new(format!("{MANAGER_PATH}/profile/{profile}"))
            .map_err(|_| Error::new(ErrorKind::Failed))?;
        {
            let mut cr = inner.crossroads.lock().await;
            let registered =
                Arc::new(RegisteredProfile { inner: Arc::downgrade(inner), profile });
            let token = inner.profile_token;
            cr.insert(path.clone(), &[token], registered);
        }

        let mut options = PropMap::new();
        options.insert("Name".into(), Variant(Box::new(format!("bluad {profile}"))));
        let proxy =
            Proxy::new(BLUEZ_SERVICE, PROFILE_MANAGER_PATH, TIMEOUT, inner.connection.clone());
        match proxy
            .method_call(
                PROFILE_MANAGER_INTERFACE,
                "RegisterProfile",
                (path.clone(), RegisteredProfile::uuid(profile).to_string(), options),
            )
            .await
        {
            Ok(()) => log::debug!("Registered profile {profile} at {path}"),
            Err(err) => log::warn!("Couldn't register profile {profile}: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_parsing() {
        let path = Path::new("/org/bluez/hci0/dev_00_1B_66_AB_CD_EF").unwrap();
        let (adapter, address) = parse_device_path(&path).unwrap();
        assert_eq!(adapter, "hci0");
        assert_eq!(address.to_string(), "00:1B:66:AB:CD:EF");

        assert!(parse_device_path(&Path::new("/org/bluez/hci0").unwrap()).is_none());
        assert!(parse_device_path(&Path::new("/org/other/hci0/dev_x").unwrap()).is_none());
    }

    #[test]
    fn uuid_to_profile() {
        assert_eq!(uuid_profile("0000110a-0000-1000-8000-00805f9b34fb"), Some(Profile::A2dpSource));
        assert_eq!(uuid_profile("0000110b-0000-1000-8000-00805f9b34fb"), Some(Profile::A2dpSink));
        assert_eq!(uuid_profile("0000111f-0000-1000-8000-00805f9b34fb"), None);
    }

    #[test]
    fn vendor_codec_detection() {
        let aptx = [0x4f, 0x00, 0x00, 0x00, 0x01, 0x00, 0x22];
        assert_eq!(vendor_codec(&aptx), Some(Codec::AptX));
        let ldac = [0x2d, 0x01, 0x00, 0x00, 0xaa, 0x00, 0x20, 0x01];
        assert_eq!(vendor_codec(&ldac), Some(Codec::Ldac));
        assert_eq!(vendor_codec(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]), None);
        assert_eq!(vendor_codec(&[0x4f]), None);
    }

    #[test]
    fn sbc_stream_params_from_blob() {
        // 44.1 kHz joint stereo
        let (channels, sampling) = stream_params(Codec::Sbc, &[0x21, 0x15, 0x02, 53]);
        assert_eq!(channels, 2);
        assert_eq!(sampling, 44_100);
        // broken blob falls back to a sane default
        let (channels, sampling) = stream_params(Codec::Sbc, &[]);
        assert_eq!(channels, 2);
        assert_eq!(sampling, 44_100);
    }

    #[test]
    fn aptx_stream_params_from_blob() {
        let blob = [0x4f, 0x00, 0x00, 0x00, 0x01, 0x00, 0x22];
        let (channels, sampling) = stream_params(Codec::AptX, &blob);
        assert_eq!(channels, 2);
        assert_eq!(sampling, 44_100);
    }
}
