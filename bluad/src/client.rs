//! Client-side access to a running daemon.
//!
//! Used by the command line tools and useful for any local consumer: list
//! the PCM endpoints, open one, exchange control commands and follow the
//! manager signals.

use dbus::{
    arg::{prop_cast, PropMap},
    message::MatchRule,
    nonblock::{stdintf::org_freedesktop_dbus::Properties, Proxy, SyncConnection},
    Path,
};
use dbus_tokio::connection;
use futures::StreamExt;
use std::{
    collections::HashMap,
    os::fd::OwnedFd,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::{spawn_blocking, JoinHandle},
};

use crate::{bus, Error, ErrorKind, Result, MANAGER_PATH, SERVICE_NAME, TIMEOUT};

/// Properties of one PCM endpoint as published by the daemon.
#[derive(Clone, Debug)]
pub struct PcmProperties {
    /// Host-stack path of the owning device.
    pub device: Option<Path<'static>>,
    /// Supported open modes.
    pub modes: Vec<String>,
    /// Number of interleaved channels.
    pub channels: u8,
    /// Sample rate in Hz.
    pub sampling: u32,
    /// Codec identifier.
    pub codec: u16,
    /// Encoding delay in units of 0.1 ms.
    pub delay: u16,
    /// Packed volume word.
    pub volume: u16,
    /// Battery level in percent, when the device reports one.
    pub battery: Option<u8>,
}

impl PcmProperties {
    fn from_props(props: &PropMap) -> Self {
        Self {
            device: prop_cast::<Path>(props, "Device").map(|p| p.clone().into_static()),
            modes: prop_cast::<Vec<String>>(props, "Modes").cloned().unwrap_or_default(),
            channels: prop_cast::<u8>(props, "Channels").copied().unwrap_or(0),
            sampling: prop_cast::<u32>(props, "Sampling").copied().unwrap_or(0),
            codec: prop_cast::<u16>(props, "Codec").copied().unwrap_or(0),
            delay: prop_cast::<u16>(props, "Delay").copied().unwrap_or(0),
            volume: prop_cast::<u16>(props, "Volume").copied().unwrap_or(0),
            battery: prop_cast::<u8>(props, "Battery").copied(),
        }
    }
}

/// A PCM endpoint opened through the daemon.
pub struct OpenPcm {
    /// The PCM FIFO: write end for the source mode, read end for sink.
    pub data: OwnedFd,
    /// The SEQPACKET control channel.
    pub ctrl: CtrlChannel,
}

/// The control channel of an opened PCM endpoint.
pub struct CtrlChannel {
    fd: OwnedFd,
}

impl CtrlChannel {
    /// Sends one command frame and waits for the reply frame.
    ///
    /// Valid commands are `Drain`, `Drop`, `Pause` and `Resume`; the reply
    /// is `OK` or `Invalid`.
    pub fn command(&self, command: &str) -> Result<String> {
        let n = unsafe {
            libc::send(self.fd.as_raw_fd(), command.as_ptr() as *const _, command.len(), 0)
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut buf = [0u8; 32];
        let n = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(String::from_utf8_lossy(&buf[..n as usize]).into_owned())
    }
}

/// A manager event observed on the bus.
#[derive(Clone, Debug)]
pub enum PcmEvent {
    /// A PCM endpoint appeared.
    Added(Path<'static>, PcmProperties),
    /// A PCM endpoint went away.
    Removed(Path<'static>),
}

/// Connection to a running daemon.
pub struct Client {
    connection: Arc<SyncConnection>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

impl Client {
    /// Connects to the daemon over the system bus.
    pub async fn new() -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        Ok(Self { connection, dbus_task })
    }

    fn manager(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, MANAGER_PATH, TIMEOUT, &*self.connection)
    }

    fn pcm<'a>(&'a self, path: &Path<'a>) -> Proxy<'a, &'a SyncConnection> {
        Proxy::new(SERVICE_NAME, path.clone(), TIMEOUT, &*self.connection)
    }

    /// Lists all PCM endpoints with their properties.
    pub async fn get_pcms(&self) -> Result<Vec<(Path<'static>, PcmProperties)>> {
        let (pcms,): (HashMap<Path<'static>, PropMap>,) =
            self.manager().method_call(bus::MANAGER_INTERFACE, "GetPCMs", ()).await?;
        let mut list: Vec<_> =
            pcms.iter().map(|(path, props)| (path.clone(), PcmProperties::from_props(props))).collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(list)
    }

    /// Properties of a single PCM endpoint.
    pub async fn properties(&self, path: &Path<'_>) -> Result<PcmProperties> {
        let props = self.pcm(path).get_all(bus::PCM_INTERFACE).await?;
        Ok(PcmProperties::from_props(&props))
    }

    /// Reads the packed volume word.
    pub async fn volume(&self, path: &Path<'_>) -> Result<u16> {
        Ok(self.pcm(path).get(bus::PCM_INTERFACE, "Volume").await?)
    }

    /// Writes the packed volume word.
    pub async fn set_volume(&self, path: &Path<'_>, volume: u16) -> Result<()> {
        self.pcm(path).set(bus::PCM_INTERFACE, "Volume", volume).await?;
        Ok(())
    }

    /// Opens a PCM endpoint; `mode` is `source` or `sink`.
    ///
    /// The returned descriptors are switched to blocking mode, which is
    /// what a simple file-style client wants.
    pub async fn open(&self, path: &Path<'_>, mode: &str) -> Result<OpenPcm> {
        let (data, ctrl): (dbus::arg::OwnedFd, dbus::arg::OwnedFd) = self
            .pcm(path)
            .method_call(bus::PCM_INTERFACE, "Open", (mode.to_string(),))
            .await?;
        let data = adopt_blocking(data)?;
        let ctrl = adopt_blocking(ctrl)?;
        Ok(OpenPcm { data, ctrl: CtrlChannel { fd: ctrl } })
    }

    /// Follows `PCMAdded` and `PCMRemoved` signals.
    pub async fn events(&self) -> Result<mpsc::UnboundedReceiver<PcmEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let added_rule = MatchRule::new_signal(bus::MANAGER_INTERFACE, "PCMAdded");
        let removed_rule = MatchRule::new_signal(bus::MANAGER_INTERFACE, "PCMRemoved");
        let added = self.connection.add_match(added_rule).await?;
        let removed = self.connection.add_match(removed_rule).await?;

        tokio::spawn(async move {
            let (_added, mut added_stream) = added.stream::<(Path<'static>, PropMap)>();
            let (_removed, mut removed_stream) = removed.stream::<(Path<'static>,)>();
            loop {
                tokio::select! {
                    item = added_stream.next() => match item {
                        Some((_, (path, props))) => {
                            if tx.send(PcmEvent::Added(path, PcmProperties::from_props(&props))).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    item = removed_stream.next() => match item {
                        Some((_, (path,))) => {
                            if tx.send(PcmEvent::Removed(path)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(rx)
    }

    /// Waits until the daemon name appears on the bus.
    pub async fn wait_for_service(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let dbus = Proxy::new("org.freedesktop.DBus", "/org/freedesktop/DBus", TIMEOUT, &*self.connection);
            let (has,): (bool,) = dbus
                .method_call("org.freedesktop.DBus", "NameHasOwner", (SERVICE_NAME,))
                .await?;
            if has {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::with_message(ErrorKind::NotFound, "daemon is not running"));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Takes ownership of a descriptor received over the bus and clears its
/// non-blocking flag.
fn adopt_blocking(fd: dbus::arg::OwnedFd) -> Result<OwnedFd> {
    let raw = fd.into_raw_fd();
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags >= 0 {
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    }
    Ok(fd)
}
