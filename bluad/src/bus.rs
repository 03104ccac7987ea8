//! Published D-Bus surface.
//!
//! The daemon exposes a Manager object at the service root and one PCM
//! object per transport. `Open` hands two descriptors to the client over
//! the bus: the PCM FIFO and a SEQPACKET control channel accepting the
//! single-frame commands `Drain`, `Drop`, `Pause` and `Resume`.

use dbus::{
    arg::{OwnedFd, PropMap, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    Message, MethodErr, Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{
    collections::HashMap,
    os::unix::io::IntoRawFd,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::io::unix::AsyncFd;

use crate::{
    cr_property, method_call,
    pcm::PcmMode,
    session::SessionInner,
    sock,
    transport::{Profile, Transport, TransportKind},
    MANAGER_PATH,
};

/// Manager interface name.
pub const MANAGER_INTERFACE: &str = "org.bluad.Manager1";
/// PCM interface name.
pub const PCM_INTERFACE: &str = "org.bluad.PCM1";
/// RFCOMM interface name.
pub const RFCOMM_INTERFACE: &str = "org.bluad.RFCOMM1";

/// Upper bound on a control-channel drain request.
const PCM_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Data behind the Manager object.
pub struct Manager {
    inner: Weak<SessionInner>,
}

impl Manager {
    pub(crate) fn new(inner: Weak<SessionInner>) -> Self {
        Self { inner }
    }
}

/// Registers the Manager interface.
pub(crate) fn manager_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Manager>> {
    cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Manager>>| {
        ib.signal::<(Path<'static>, PropMap), _>("PCMAdded", ("path", "props"));
        ib.signal::<(Path<'static>,), _>("PCMRemoved", ("path",));
        ib.method_with_cr_async("GetPCMs", (), ("pcms",), |ctx, cr, (): ()| {
            method_call(ctx, cr, |manager: Arc<Manager>| async move {
                let mut pcms: HashMap<Path<'static>, PropMap> = HashMap::new();
                if let Some(inner) = manager.inner.upgrade() {
                    for transport in inner.transports() {
                        if transport.profile == Profile::Rfcomm {
                            continue;
                        }
                        pcms.insert(transport.path.clone(), transport_properties(&transport));
                    }
                }
                Ok((pcms,))
            })
        });
    })
}

/// Registers the PCM interface served by every non-RFCOMM transport.
pub(crate) fn pcm_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Transport>> {
    cr.register(PCM_INTERFACE, |ib: &mut IfaceBuilder<Arc<Transport>>| {
        cr_property!(ib, "Device", t => {
            t.device().map(|d| d.bluez_path.clone())
        });
        cr_property!(ib, "Modes", t => {
            Some(t.modes().iter().map(|m| m.to_string()).collect::<Vec<_>>())
        });
        cr_property!(ib, "Channels", t => {
            Some(t.channels())
        });
        cr_property!(ib, "Sampling", t => {
            Some(t.sampling())
        });
        cr_property!(ib, "Codec", t => {
            Some(t.codec().id())
        });
        cr_property!(ib, "Delay", t => {
            Some(t.delay())
        });
        ib.property("Volume")
            .get(|_, t| Ok(t.volume().pack()))
            .set(|_, t, value| {
                if t.set_volume_packed(value) {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            });
        cr_property!(ib, "Battery", t => {
            t.device().and_then(|d| d.battery())
        });

        ib.method_with_cr_async(
            "Open",
            ("mode",),
            ("data", "ctrl"),
            |ctx, cr, (mode,): (String,)| {
                method_call(ctx, cr, |t: Arc<Transport>| async move {
                    let mode: PcmMode =
                        mode.parse().map_err(|_| MethodErr::invalid_arg("mode"))?;
                    let opened = t.open(mode).await.map_err(MethodErr::from)?;
                    spawn_pcm_controller(&t, mode, opened.ctrl_local);
                    let data = unsafe { OwnedFd::new(opened.data.into_raw_fd()) };
                    let ctrl = unsafe { OwnedFd::new(opened.ctrl.into_raw_fd()) };
                    Ok((data, ctrl))
                })
            },
        );
    })
}

/// Registers the RFCOMM interface of SCO control-plane sub-transports.
pub(crate) fn rfcomm_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Transport>> {
    cr.register(RFCOMM_INTERFACE, |ib: &mut IfaceBuilder<Arc<Transport>>| {
        cr_property!(ib, "Mode", t => {
            rfcomm_owner_profile(t).and_then(|p| p.rfcomm_mode()).map(|m| m.to_string())
        });
        cr_property!(ib, "Features", t => {
            match &t.kind {
                TransportKind::Rfcomm { features, .. } => {
                    Some(features.load(std::sync::atomic::Ordering::Relaxed))
                }
                _ => None,
            }
        });

        ib.method_with_cr_async("Open", (), ("fd",), |ctx, cr, (): ()| {
            method_call(ctx, cr, |t: Arc<Transport>| async move {
                let TransportKind::Rfcomm { handler, .. } = &t.kind else {
                    return Err(MethodErr::failed("not an RFCOMM transport"));
                };
                {
                    let slot = handler.lock().unwrap();
                    if slot.is_some() {
                        return Err(MethodErr::failed("handler is busy"));
                    }
                }
                let (local, remote) =
                    sock::seqpacket_pair().map_err(|err| MethodErr::failed(&err))?;
                let local = AsyncFd::new(local).map_err(|err| MethodErr::failed(&err))?;
                *handler.lock().unwrap() = Some(Arc::new(local));
                t.send_signal(crate::transport::Signal::Ping);
                let remote = unsafe { OwnedFd::new(remote.into_raw_fd()) };
                Ok((remote,))
            })
        });
    })
}

/// The SCO transport owning an RFCOMM sub-transport.
fn rfcomm_owner_profile(t: &Arc<Transport>) -> Option<Profile> {
    let device = t.device()?;
    device.transports().into_iter().find_map(|candidate| match &candidate.kind {
        TransportKind::Sco { rfcomm, .. } => {
            let owned = rfcomm.lock().unwrap();
            match owned.as_ref() {
                Some(sub) if Arc::ptr_eq(sub, t) => Some(candidate.profile),
                _ => None,
            }
        }
        _ => None,
    })
}

/// The property dictionary of a transport, as carried by `GetPCMs` and
/// `PCMAdded`.
pub(crate) fn transport_properties(t: &Arc<Transport>) -> PropMap {
    let mut props = PropMap::new();
    if let Some(device) = t.device() {
        props.insert("Device".into(), Variant(Box::new(device.bluez_path.clone())));
        if let Some(level) = device.battery() {
            props.insert("Battery".into(), Variant(Box::new(level)));
        }
    }
    let modes: Vec<String> = t.modes().iter().map(|m| m.to_string()).collect();
    props.insert("Modes".into(), Variant(Box::new(modes)));
    props.insert("Channels".into(), Variant(Box::new(t.channels())));
    props.insert("Sampling".into(), Variant(Box::new(t.sampling())));
    props.insert("Codec".into(), Variant(Box::new(t.codec().id())));
    props.insert("Delay".into(), Variant(Box::new(t.delay())));
    props.insert("Volume".into(), Variant(Box::new(t.volume().pack())));
    props
}

/// Publishes a transport object and announces it.
///
/// `PCMAdded` goes out before any `PropertiesChanged` can be observed for
/// the transport.
pub(crate) async fn register_transport(inner: &Arc<SessionInner>, t: &Arc<Transport>) {
    {
        let mut cr = inner.crossroads.lock().await;
        if t.profile == Profile::Rfcomm {
            cr.insert(t.path.clone(), &[inner.rfcomm_token], t.clone());
        } else {
            cr.insert(t.path.clone(), &[inner.pcm_token], t.clone());
        }
    }
    if t.profile != Profile::Rfcomm {
        if let Ok(msg) = Message::new_signal(MANAGER_PATH, MANAGER_INTERFACE, "PCMAdded") {
            let _ = inner.connection.send(msg.append2(t.path.clone(), transport_properties(t)));
        }
    }
}

/// Removes a transport object from the bus without signalling.
pub(crate) async fn unregister_transport(inner: &Arc<SessionInner>, t: &Arc<Transport>) {
    let mut cr = inner.crossroads.lock().await;
    let _: Option<Arc<Transport>> = cr.remove(&t.path);
}

/// Emits the final `PCMRemoved` for a destroyed transport.
///
/// RFCOMM sub-transports disappear silently.
pub(crate) async fn emit_pcm_removed(inner: &Arc<SessionInner>, t: &Arc<Transport>) {
    if t.profile == Profile::Rfcomm {
        return;
    }
    if let Ok(msg) = Message::new_signal(MANAGER_PATH, MANAGER_INTERFACE, "PCMRemoved") {
        let _ = inner.connection.send(msg.append1(t.path.clone()));
    }
}

/// Emits `PropertiesChanged` for a transport property updated outside of a
/// bus write.
pub(crate) fn emit_properties_changed(
    connection: &SyncConnection, path: &Path<'static>, interface: &str, changed: PropMap,
) {
    let ppc = PropertiesPropertiesChanged {
        interface_name: interface.to_string(),
        changed_properties: changed,
        invalidated_properties: Vec::new(),
    };
    let _ = connection.send(ppc.to_emit_message(path));
}

async fn reply_all(fd: &AsyncFd<sock::OwnedFd>, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let mut guard = match fd.writable().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
            Ok(Ok(n)) => buf = &buf[n..],
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(_)) => return false,
            Err(_would_block) => continue,
        }
    }
    true
}

/// Serves the SEQPACKET control channel of an opened PCM endpoint.
///
/// Each received packet is one command; anything outside the command set
/// is answered with `Invalid` and the channel stays usable. Channel EOF
/// releases the endpoint.
pub(crate) fn spawn_pcm_controller(t: &Arc<Transport>, mode: PcmMode, ctrl: sock::OwnedFd) {
    let t = t.clone();
    tokio::spawn(async move {
        let ctrl = match AsyncFd::new(ctrl) {
            Ok(ctrl) => ctrl,
            Err(err) => {
                log::error!("{}: control channel setup failed: {err}", &t.path);
                return;
            }
        };
        let mut buf = [0u8; 32];
        loop {
            let mut guard = match ctrl.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };
            let len = match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => {
                    log::error!("{}: control channel read failed: {err}", &t.path);
                    break;
                }
                Err(_would_block) => continue,
            };

            let reply: &[u8] = match &buf[..len] {
                b"Drain" => {
                    t.drain(PCM_DRAIN_TIMEOUT).await;
                    b"OK"
                }
                b"Drop" => {
                    t.drop_pcm();
                    b"OK"
                }
                b"Pause" => {
                    t.pause();
                    b"OK"
                }
                b"Resume" => {
                    t.resume();
                    b"OK"
                }
                other => {
                    log::warn!(
                        "{}: invalid PCM control command: {}",
                        &t.path,
                        String::from_utf8_lossy(other)
                    );
                    b"Invalid"
                }
            };
            if !reply_all(&ctrl, reply).await {
                break;
            }
        }

        if let Some(endpoint) = t.endpoint(mode) {
            t.release_pcm(endpoint);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Codec, test_util::sco_transport};

    #[tokio::test]
    async fn control_channel_command_round_trip() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        spawn_pcm_controller(&t, PcmMode::Source, opened.ctrl_local);

        let ctrl = AsyncFd::new(opened.ctrl).unwrap();
        let mut buf = [0u8; 16];

        for (command, reply) in
            [(&b"Drain"[..], &b"OK"[..]), (b"Drop", b"OK"), (b"Pause", b"OK"), (b"Resume", b"OK")]
        {
            reply_all(&ctrl, command).await;
            let n = read_packet(&ctrl, &mut buf).await;
            assert_eq!(&buf[..n], reply, "command {:?}", String::from_utf8_lossy(command));
        }
    }

    #[tokio::test]
    async fn control_channel_rejects_unknown_commands() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        spawn_pcm_controller(&t, PcmMode::Source, opened.ctrl_local);

        let ctrl = AsyncFd::new(opened.ctrl).unwrap();
        let mut buf = [0u8; 16];

        reply_all(&ctrl, b"Xyzzy").await;
        let n = read_packet(&ctrl, &mut buf).await;
        assert_eq!(&buf[..n], b"Invalid");

        // the channel stays usable
        reply_all(&ctrl, b"Pause").await;
        let n = read_packet(&ctrl, &mut buf).await;
        assert_eq!(&buf[..n], b"OK");
        assert_eq!(t.state(), crate::transport::State::Paused);
    }

    #[tokio::test]
    async fn control_channel_is_case_sensitive() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Sink).await.unwrap();
        spawn_pcm_controller(&t, PcmMode::Sink, opened.ctrl_local);

        let ctrl = AsyncFd::new(opened.ctrl).unwrap();
        let mut buf = [0u8; 16];
        reply_all(&ctrl, b"drain").await;
        let n = read_packet(&ctrl, &mut buf).await;
        assert_eq!(&buf[..n], b"Invalid");
    }

    #[tokio::test]
    async fn control_channel_eof_releases_endpoint() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        spawn_pcm_controller(&t, PcmMode::Source, opened.ctrl_local);
        assert!(t.endpoint(PcmMode::Source).unwrap().is_open());

        drop(opened.ctrl);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!t.endpoint(PcmMode::Source).unwrap().is_open());
    }

    #[tokio::test]
    async fn property_dict_carries_the_full_surface() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let props = transport_properties(&t);
        for key in ["Device", "Modes", "Channels", "Sampling", "Codec", "Delay", "Volume"] {
            assert!(props.contains_key(key), "missing {key}");
        }
        // battery is absent until the device reports one
        assert!(!props.contains_key("Battery"));
    }

    async fn read_packet(fd: &AsyncFd<sock::OwnedFd>, buf: &mut [u8]) -> usize {
        loop {
            let mut guard = fd.readable().await.unwrap();
            match guard.try_io(|inner| sock::read(inner.get_ref(), buf)) {
                Ok(Ok(n)) => return n,
                Ok(Err(err)) => panic!("read failed: {err}"),
                Err(_would_block) => continue,
            }
        }
    }
}
