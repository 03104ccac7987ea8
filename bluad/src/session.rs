//! Daemon session.
//!
//! Owns the D-Bus connection, the published object tree and the adapter
//! registry. Transport lifecycle events from the host stack and from the
//! I/O tasks funnel into one queue processed here, which keeps teardown
//! ordered: interfaces disappear first, then the I/O task is joined, then
//! the registry reference is dropped and the removal signal goes out last.

use dbus::{message::MatchRule, nonblock::SyncConnection, Path};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::StreamExt;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::{Arc, Mutex},
};
use tokio::{
    sync::mpsc,
    task::{spawn_blocking, JoinHandle},
};

use crate::{
    adapter::Adapter,
    bluez,
    bus::{self, Manager},
    config::Config,
    device::Device,
    transport::{Backend, ScoSocket, Transport, TransportParams},
    Error, ErrorKind, Result, MANAGER_PATH, SERVICE_NAME,
};

/// Lifecycle events processed by the session event loop.
#[derive(Debug)]
pub(crate) enum DaemonEvent {
    /// A transport's I/O task observed the peer going away; the path is
    /// the transport's path on our bus.
    TransportLost(Path<'static>),
    /// The host stack removed the backing object; the path is the
    /// object's path within the host stack.
    BluezGone(Path<'static>),
}

/// Shared state of a running daemon session.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: futures::lock::Mutex<Crossroads>,
    pub manager_token: IfaceToken<Arc<Manager>>,
    pub pcm_token: IfaceToken<Arc<Transport>>,
    pub rfcomm_token: IfaceToken<Arc<Transport>>,
    pub profile_token: IfaceToken<Arc<bluez::RegisteredProfile>>,
    pub config: Arc<Config>,
    pub adapters: Mutex<HashMap<String, Arc<Adapter>>>,
    pub events_tx: mpsc::UnboundedSender<DaemonEvent>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // documentation for dbus_tokio::connection::IOResource indicates it is abortable
        self.dbus_task.abort();
    }
}

impl SessionInner {
    /// Looks up an adapter, creating the registry entry when absent.
    pub(crate) fn adapter_lookup_or_create(&self, name: &str) -> Result<Arc<Adapter>> {
        let mut adapters = self.adapters.lock().unwrap();
        if let Some(adapter) = adapters.get(name) {
            return Ok(adapter.clone());
        }
        let adapter = Adapter::new(name)?;
        adapters.insert(name.to_string(), adapter.clone());
        Ok(adapter)
    }

    /// All transports across the registry.
    pub(crate) fn transports(&self) -> Vec<Arc<Transport>> {
        let adapters: Vec<_> = self.adapters.lock().unwrap().values().cloned().collect();
        adapters
            .iter()
            .flat_map(|a| a.devices())
            .flat_map(|d| d.transports())
            .collect()
    }

    /// Finds a transport by its path on our bus.
    pub(crate) fn transport_by_path(&self, path: &Path<'_>) -> Option<Arc<Transport>> {
        self.transports().into_iter().find(|t| t.path == *path)
    }

    /// Finds a transport by the path of its backing host-stack object.
    pub(crate) fn transport_by_bluez_path(&self, path: &Path<'_>) -> Option<Arc<Transport>> {
        self.transports().into_iter().find(|t| t.bluez_path == *path)
    }

    /// Creates a transport, starts its I/O task and announces it on the
    /// bus.
    pub(crate) async fn add_transport(
        self: &Arc<Self>, device: &Arc<Device>, params: TransportParams, backend: Backend,
        bluez_path: Path<'static>,
    ) -> Result<Arc<Transport>> {
        let transport =
            Transport::new(device, self.config.clone(), self.events_tx.clone(), params, backend, bluez_path);
        if !device.transport_insert(transport.clone()) {
            return Err(Error::with_message(ErrorKind::Failed, "transport already exists"));
        }
        if let Err(err) = transport.start_io() {
            device.transport_remove(transport.id());
            return Err(err);
        }
        bus::register_transport(self, &transport).await;
        log::info!("Added transport {}", &transport.path);
        Ok(transport)
    }

    /// Attaches an RFCOMM sub-transport to a SCO transport.
    pub(crate) async fn add_rfcomm_transport(
        self: &Arc<Self>, device: &Arc<Device>, sco: &Arc<Transport>, params: TransportParams,
        bluez_path: Path<'static>,
    ) -> Result<Arc<Transport>> {
        let rfcomm = self.add_transport(device, params, Backend::Rfcomm, bluez_path).await?;
        if let crate::transport::TransportKind::Sco { rfcomm: slot, .. } = &sco.kind {
            *slot.lock().unwrap() = Some(rfcomm.clone());
        }
        Ok(rfcomm)
    }

    /// Tears a transport down: unpublish, join the I/O task, drop the
    /// registry reference, then emit the removal signal.
    pub(crate) async fn destroy_transport(self: &Arc<Self>, transport: Arc<Transport>) {
        log::info!("Removing transport {}", &transport.path);
        bus::unregister_transport(self, &transport).await;

        // a SCO transport takes its control channel down with it
        if let crate::transport::TransportKind::Sco { rfcomm, .. } = &transport.kind {
            let sub = rfcomm.lock().unwrap().take();
            if let Some(sub) = sub {
                Box::pin(self.destroy_transport(sub)).await;
            }
        }

        transport.stop_io().await;

        if let Some(device) = transport.device() {
            device.transport_remove(transport.id());
            if device.transports().is_empty() {
                if let Some(adapter) = device.adapter() {
                    adapter.device_remove(device.address);
                }
            }
        }

        bus::emit_pcm_removed(self, &transport).await;
    }
}

/// A running daemon session.
///
/// Connects to the system bus, claims the service name and serves the
/// Manager and PCM object tree.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Creates a new daemon session on the system bus.
    pub async fn new(config: Config) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        connection.request_name(SERVICE_NAME, false, true, false).await?;

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));

        let manager_token = bus::manager_interface(&mut crossroads);
        let pcm_token = bus::pcm_interface(&mut crossroads);
        let rfcomm_token = bus::rfcomm_interface(&mut crossroads);
        let profile_token = bluez::profile_interface(&mut crossroads);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            connection: connection.clone(),
            crossroads: futures::lock::Mutex::new(crossroads),
            manager_token,
            pcm_token,
            rfcomm_token,
            profile_token,
            config: config.into_shared(),
            adapters: Mutex::new(HashMap::new()),
            events_tx,
            dbus_task,
        });

        {
            let mut cr = inner.crossroads.lock().await;
            let manager = Arc::new(Manager::new(Arc::downgrade(&inner)));
            let token = inner.manager_token;
            cr.insert(Path::from(MANAGER_PATH), &[token], manager);
        }

        // route incoming method calls through crossroads
        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner = match mc_inner.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*mc_inner.connection);
            }
        });

        Self::spawn_event_loop(&inner, events_rx);
        bluez::start(inner.clone()).await?;

        Ok(Self { inner })
    }

    fn spawn_event_loop(inner: &Arc<SessionInner>, mut events_rx: mpsc::UnboundedReceiver<DaemonEvent>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    DaemonEvent::TransportLost(path) => {
                        if let Some(transport) = inner.transport_by_path(&path) {
                            inner.destroy_transport(transport).await;
                        }
                    }
                    DaemonEvent::BluezGone(path) => {
                        if let Some(transport) = inner.transport_by_bluez_path(&path) {
                            inner.destroy_transport(transport).await;
                        }
                    }
                }
            }
        });
    }

    /// Daemon configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Registered adapters.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.inner.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Selects the negotiated HFP codec of a SCO transport and announces
    /// the change on the bus.
    pub fn select_sco_codec(&self, transport_path: &Path<'_>, codec: crate::codec::Codec) -> Result<()> {
        let transport = self
            .inner
            .transport_by_path(transport_path)
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        if !transport.profile.is_sco() {
            return Err(Error::new(ErrorKind::NotSupported));
        }
        if transport.set_codec(codec) {
            use dbus::arg::{PropMap, Variant};
            let mut changed = PropMap::new();
            changed.insert("Codec".into(), Variant(Box::new(transport.codec().id())));
            changed.insert("Sampling".into(), Variant(Box::new(transport.sampling())));
            bus::emit_properties_changed(
                &self.inner.connection,
                &transport.path,
                bus::PCM_INTERFACE,
                changed,
            );
            transport.send_signal(crate::transport::Signal::Ping);
        }
        Ok(())
    }

    /// Hands a SCO socket from the host-stack integration to the matching
    /// transport and wakes its I/O task.
    pub fn deposit_sco_socket(&self, transport_path: &Path<'_>, socket: ScoSocket) -> Result<()> {
        let transport = self
            .inner
            .transport_by_path(transport_path)
            .ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        transport.deposit_sco_socket(socket);
        transport.send_signal(crate::transport::Signal::Ping);
        Ok(())
    }

    /// Serves until the D-Bus connection is lost.
    pub async fn serve(self) -> Result<()> {
        // the connection resource task ends only on error
        futures::future::pending::<()>().await;
        Ok(())
    }
}
