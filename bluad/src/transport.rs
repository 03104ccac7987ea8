//! Audio transport and its controller.
//!
//! A transport is one directional or bidirectional audio channel of a
//! device for a specific profile and codec. Exactly one I/O task runs per
//! transport while it exists; the controller talks to it through a small
//! queue of signal codes and owns the endpoint descriptors handed out to
//! local clients.

use dbus::{nonblock::SyncConnection, Path};
use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use strum::{Display, EnumString};
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::{
    bluez,
    codec::Codec,
    config::Config,
    device::Device,
    pcm::{PcmEndpoint, PcmMode},
    session::DaemonEvent,
    sock::{self, OwnedFd},
    volume::{Volume, A2DP_VOLUME_MAX, SCO_VOLUME_MAX},
    Error, ErrorKind, Result,
};

/// Bluetooth audio profile of a transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
#[non_exhaustive]
pub enum Profile {
    /// A2DP source: we stream to the remote device.
    #[strum(serialize = "a2dpsource")]
    A2dpSource,
    /// A2DP sink: the remote device streams to us.
    #[strum(serialize = "a2dpsink")]
    A2dpSink,
    /// HSP audio gateway.
    #[strum(serialize = "hspag")]
    HspAg,
    /// HSP headset.
    #[strum(serialize = "hsphs")]
    HspHs,
    /// HFP audio gateway.
    #[strum(serialize = "hfpag")]
    HfpAg,
    /// HFP hands-free.
    #[strum(serialize = "hfphf")]
    HfpHf,
    /// Control-plane channel attached to a SCO transport.
    #[strum(serialize = "rfcomm")]
    Rfcomm,
}

impl Profile {
    /// True for the A2DP streaming profiles.
    pub fn is_a2dp(self) -> bool {
        matches!(self, Self::A2dpSource | Self::A2dpSink)
    }

    /// True for the SCO telephony profiles.
    pub fn is_sco(self) -> bool {
        matches!(self, Self::HspAg | Self::HspHs | Self::HfpAg | Self::HfpHf)
    }

    /// Mode string of the attached RFCOMM channel, for SCO profiles.
    pub fn rfcomm_mode(self) -> Option<&'static str> {
        match self {
            Self::HfpAg => Some("HFP-AG"),
            Self::HfpHf => Some("HFP-HF"),
            Self::HspAg => Some("HSP-AG"),
            Self::HspHs => Some("HSP-HS"),
            _ => None,
        }
    }
}

/// Identity of a transport within its device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransportId {
    /// Profile of the transport.
    pub profile: Profile,
    /// Codec the transport was created with.
    pub codec: Codec,
}

/// Bulk transfer state of a transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum State {
    /// No client-opened PCM.
    #[default]
    Idle,
    /// Bulk transfer enabled.
    Active,
    /// Bluetooth socket unattended, PCM side ignored.
    Paused,
}

/// Signal codes delivered to the transport I/O task, in FIFO order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Signal {
    /// Wake the I/O task without further meaning.
    Ping,
    /// A client opened a PCM endpoint.
    PcmOpen,
    /// A PCM endpoint was closed.
    PcmClose,
    /// Pause bulk transfer.
    PcmPause,
    /// Resume bulk transfer.
    PcmResume,
    /// Drain request: report once the FIFO stays empty for a poll period.
    PcmSync,
    /// Flush request: discard pending FIFO data.
    PcmDrop,
}

/// A Bluetooth socket handed over by the host stack, with its MTUs.
pub struct ScoSocket {
    /// The SEQPACKET socket.
    pub fd: OwnedFd,
    /// Read MTU in bytes.
    pub mtu_read: usize,
    /// Write MTU in bytes.
    pub mtu_write: usize,
}

/// Per-profile acquire/release capability of a transport.
pub(crate) enum Backend {
    /// Socket negotiated with the host stack's media transport object.
    A2dp {
        /// Bus connection used for the acquire and release calls.
        connection: Arc<SyncConnection>,
    },
    /// Socket deposited by the host-stack integration when the link
    /// comes up.
    Sco {
        /// Pending socket handover.
        pending: Mutex<Option<ScoSocket>>,
    },
    /// No socket of its own.
    Rfcomm,
}

/// Profile- and direction-specific state of a transport.
pub(crate) enum TransportKind {
    A2dp {
        pcm: PcmEndpoint,
    },
    Sco {
        spk: PcmEndpoint,
        mic: PcmEndpoint,
        rfcomm: Mutex<Option<Arc<Transport>>>,
    },
    Rfcomm {
        handler: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
        features: AtomicU32,
    },
}

/// Construction parameters of a transport.
pub(crate) struct TransportParams {
    pub profile: Profile,
    pub codec: Codec,
    pub channels: u8,
    pub sampling: u32,
    pub config: Vec<u8>,
}

/// Descriptors returned by a successful PCM open.
#[derive(Debug)]
pub(crate) struct OpenedPcm {
    /// External end of the PCM FIFO, for the client.
    pub data: OwnedFd,
    /// External end of the control channel, for the client.
    pub ctrl: OwnedFd,
    /// Internal end of the control channel, to be served by a control task.
    pub ctrl_local: OwnedFd,
}

/// One audio channel of a device for a specific profile and codec.
pub struct Transport {
    device: Weak<Device>,
    /// Profile of this transport.
    pub profile: Profile,
    id: TransportId,
    /// Object path of this transport on our bus.
    pub path: Path<'static>,
    /// Object path of the backing object within the host stack.
    pub bluez_path: Path<'static>,
    daemon_config: Arc<Config>,
    codec: Mutex<Codec>,
    codec_config: Mutex<Vec<u8>>,
    channels: AtomicU8,
    sampling: AtomicU32,
    state: Mutex<State>,
    volume: AtomicU16,
    delay: AtomicU16,
    mtu_read: AtomicUsize,
    mtu_write: AtomicUsize,
    bt: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
    coutq_init: AtomicU32,
    sig_tx: mpsc::Sender<Signal>,
    sig_rx: Mutex<Option<mpsc::Receiver<Signal>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    drained: Notify,
    pub(crate) kind: TransportKind,
    pub(crate) backend: Backend,
    pub(crate) events: mpsc::UnboundedSender<DaemonEvent>,
}

impl Debug for Transport {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Transport {{ path: {}, codec: {} }}", &self.path, self.codec())
    }
}

impl Transport {
    pub(crate) fn new(
        device: &Arc<Device>, daemon_config: Arc<Config>, events: mpsc::UnboundedSender<DaemonEvent>,
        params: TransportParams, backend: Backend, bluez_path: Path<'static>,
    ) -> Arc<Self> {
        let path = Path::new(format!("{}/{}", &*device.path, params.profile))
            .expect("transport path is valid");
        let kind = match params.profile {
            p if p.is_a2dp() => {
                let mode = if p == Profile::A2dpSource { PcmMode::Source } else { PcmMode::Sink };
                TransportKind::A2dp { pcm: PcmEndpoint::new(mode) }
            }
            Profile::Rfcomm => {
                TransportKind::Rfcomm { handler: Mutex::new(None), features: AtomicU32::new(0) }
            }
            _ => TransportKind::Sco {
                spk: PcmEndpoint::new(PcmMode::Source),
                mic: PcmEndpoint::new(PcmMode::Sink),
                rfcomm: Mutex::new(None),
            },
        };
        let volume = if params.profile.is_a2dp() {
            Volume::full(A2DP_VOLUME_MAX).pack()
        } else {
            Volume::full(SCO_VOLUME_MAX).pack()
        };
        let (sig_tx, sig_rx) = mpsc::channel(32);
        Arc::new(Self {
            device: Arc::downgrade(device),
            profile: params.profile,
            id: TransportId { profile: params.profile, codec: params.codec },
            path,
            bluez_path,
            daemon_config,
            codec: Mutex::new(params.codec),
            codec_config: Mutex::new(params.config),
            channels: AtomicU8::new(params.channels),
            sampling: AtomicU32::new(params.sampling),
            state: Mutex::new(State::Idle),
            volume: AtomicU16::new(volume),
            delay: AtomicU16::new(0),
            mtu_read: AtomicUsize::new(0),
            mtu_write: AtomicUsize::new(0),
            bt: Mutex::new(None),
            coutq_init: AtomicU32::new(0),
            sig_tx,
            sig_rx: Mutex::new(Some(sig_rx)),
            io_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            drained: Notify::new(),
            kind,
            backend,
            events,
        })
    }

    /// The owning device, while it is still registered.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Registry identity of this transport.
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Current codec; differs from the identity codec once an HFP codec
    /// has been selected on a SCO transport.
    pub fn codec(&self) -> Codec {
        *self.codec.lock().unwrap()
    }

    /// Selects the HFP codec of a SCO transport; updates the sample rate.
    /// Returns whether the codec changed.
    pub(crate) fn set_codec(&self, codec: Codec) -> bool {
        let mut current = self.codec.lock().unwrap();
        if *current == codec {
            return false;
        }
        *current = codec;
        match codec {
            Codec::Msbc => self.sampling.store(16_000, Ordering::Relaxed),
            Codec::Cvsd => self.sampling.store(8_000, Ordering::Relaxed),
            _ => (),
        }
        true
    }

    /// Codec configuration blob negotiated with the peer.
    pub fn codec_config(&self) -> Vec<u8> {
        self.codec_config.lock().unwrap().clone()
    }

    /// Number of interleaved PCM channels.
    pub fn channels(&self) -> u8 {
        self.channels.load(Ordering::Relaxed)
    }

    /// PCM sample rate in Hz.
    pub fn sampling(&self) -> u32 {
        self.sampling.load(Ordering::Relaxed)
    }

    /// Daemon configuration.
    pub(crate) fn daemon_config(&self) -> &Arc<Config> {
        &self.daemon_config
    }

    /// Operation modes a client may open.
    pub fn modes(&self) -> Vec<PcmMode> {
        match self.profile {
            Profile::A2dpSource => vec![PcmMode::Source],
            Profile::A2dpSink => vec![PcmMode::Sink],
            p if p.is_sco() => vec![PcmMode::Source, PcmMode::Sink],
            _ => Vec::new(),
        }
    }

    /// Current transfer state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    /// Encoding delay estimate in units of 0.1 ms.
    pub fn delay(&self) -> u16 {
        self.delay.load(Ordering::Relaxed)
    }

    pub(crate) fn set_delay(&self, delay: u16) {
        self.delay.store(delay, Ordering::Relaxed);
    }

    /// Packed per-channel volume of this transport.
    pub fn volume(&self) -> Volume {
        Volume::unpack(self.volume.load(Ordering::Relaxed))
    }

    /// Volume magnitude ceiling of this transport's profile.
    pub fn volume_max(&self) -> u8 {
        if self.profile.is_a2dp() {
            A2DP_VOLUME_MAX
        } else {
            SCO_VOLUME_MAX
        }
    }

    /// Stores a packed volume; returns whether it changed.
    pub fn set_volume_packed(&self, packed: u16) -> bool {
        self.volume.swap(packed, Ordering::Relaxed) != packed
    }

    /// Read MTU of the Bluetooth socket.
    pub fn mtu_read(&self) -> usize {
        self.mtu_read.load(Ordering::Relaxed)
    }

    /// Write MTU of the Bluetooth socket.
    pub fn mtu_write(&self) -> usize {
        self.mtu_write.load(Ordering::Relaxed)
    }

    /// Idle baseline of the socket outgoing queue, in bytes.
    pub(crate) fn coutq_init(&self) -> u32 {
        self.coutq_init.load(Ordering::Relaxed)
    }

    // ---- signalling ----

    /// Queues a signal for the I/O task.
    pub fn send_signal(&self, signal: Signal) {
        if self.sig_tx.try_send(signal).is_err() {
            log::warn!("{}: signal queue full, dropping {:?}", &self.path, signal);
        }
    }

    pub(crate) fn take_signal_receiver(&self) -> Option<mpsc::Receiver<Signal>> {
        self.sig_rx.lock().unwrap().take()
    }

    pub(crate) fn drained_handle(&self) -> &Notify {
        &self.drained
    }

    /// True once a teardown has been requested; the I/O task checks this
    /// at every readiness wait.
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ---- PCM endpoints ----

    /// The endpoint serving the given client mode, if the profile has one.
    pub fn endpoint(&self, mode: PcmMode) -> Option<&PcmEndpoint> {
        match (&self.kind, mode) {
            (TransportKind::A2dp { pcm }, m) if pcm.mode() == m => Some(pcm),
            (TransportKind::Sco { spk, .. }, PcmMode::Source) => Some(spk),
            (TransportKind::Sco { mic, .. }, PcmMode::Sink) => Some(mic),
            _ => None,
        }
    }

    /// True when any PCM endpoint of this transport is client-opened.
    pub fn any_pcm_open(&self) -> bool {
        match &self.kind {
            TransportKind::A2dp { pcm } => pcm.is_open(),
            TransportKind::Sco { spk, mic, .. } => spk.is_open() || mic.is_open(),
            TransportKind::Rfcomm { .. } => false,
        }
    }

    /// Opens a PCM endpoint for a local client.
    ///
    /// Creates the FIFO pipe and the SEQPACKET control pair, signals the
    /// I/O task and, for the A2DP source profile, acquires the Bluetooth
    /// socket from the host stack. Returns the external descriptors plus
    /// the internal control end for the caller to serve.
    pub(crate) async fn open(self: &Arc<Self>, mode: PcmMode) -> Result<OpenedPcm> {
        let endpoint = self
            .endpoint(mode)
            .ok_or_else(|| Error::with_message(ErrorKind::NotSupported, "operation mode not supported"))?;

        if self.profile.is_sco() && self.codec() == Codec::Undefined {
            return Err(Error::with_message(ErrorKind::NotConnected, "HFP audio codec not selected"));
        }
        if endpoint.is_open() {
            return Err(Error::new(ErrorKind::Busy));
        }

        let (pipe_r, pipe_w) = sock::pipe().map_err(Error::from)?;
        let (ctrl_local, ctrl) = sock::seqpacket_pair().map_err(Error::from)?;
        // the FIFO is unidirectional: a producing client gets the write end
        let (internal, data) = match mode {
            PcmMode::Source => (pipe_r, pipe_w),
            PcmMode::Sink => (pipe_w, pipe_r),
        };
        endpoint.install(internal)?;

        self.set_state(State::Active);
        self.send_signal(Signal::PcmOpen);

        if self.profile == Profile::A2dpSource {
            if let Err(err) = self.acquire().await {
                endpoint.close();
                self.set_state(State::Idle);
                self.send_signal(Signal::PcmClose);
                return Err(Error::with_message(ErrorKind::Acquire, err.to_string()));
            }
        }

        Ok(OpenedPcm { data, ctrl, ctrl_local })
    }

    /// Releases a PCM endpoint: closes the internal descriptor and lets
    /// the I/O task know. The transport stays alive for a further open.
    pub fn release_pcm(&self, endpoint: &PcmEndpoint) {
        if endpoint.close() {
            log::debug!("{}: PCM endpoint closed", &self.path);
        }
        if !self.any_pcm_open() {
            self.set_state(State::Idle);
        }
        self.send_signal(Signal::PcmClose);
    }

    /// Pauses bulk transfer.
    pub fn pause(&self) {
        self.set_state(State::Paused);
        self.send_signal(Signal::PcmPause);
    }

    /// Resumes bulk transfer.
    pub fn resume(&self) {
        self.set_state(State::Active);
        self.send_signal(Signal::PcmResume);
    }

    /// Requests a drain and waits for the I/O task to report completion.
    ///
    /// Completion means the producer FIFO stayed empty for one full
    /// polling period. The wait is bounded by `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let notified = self.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        self.send_signal(Signal::PcmSync);
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Requests a flush of pending FIFO data.
    pub fn drop_pcm(&self) {
        self.send_signal(Signal::PcmDrop);
    }

    // ---- Bluetooth socket ----

    /// Stores the Bluetooth socket handed over by the host stack.
    pub(crate) fn set_bt_socket(&self, fd: OwnedFd, mtu_read: usize, mtu_write: usize) -> Result<()> {
        let baseline = sock::outq(&fd).unwrap_or(0).max(0) as u32;
        let fd = AsyncFd::new(fd).map_err(Error::from)?;
        self.coutq_init.store(baseline, Ordering::Relaxed);
        self.mtu_read.store(mtu_read, Ordering::Relaxed);
        self.mtu_write.store(mtu_write, Ordering::Relaxed);
        *self.bt.lock().unwrap() = Some(Arc::new(fd));
        Ok(())
    }

    /// A handle on the Bluetooth socket for one I/O cycle.
    pub(crate) fn bt_socket(&self) -> Option<Arc<AsyncFd<OwnedFd>>> {
        self.bt.lock().unwrap().clone()
    }

    /// Forgets the Bluetooth socket after the peer closed it; no release
    /// is sent to the host stack in that case.
    pub(crate) fn clear_bt_socket(&self) {
        *self.bt.lock().unwrap() = None;
    }

    /// Acquires the Bluetooth socket according to the transport profile.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<()> {
        if self.bt.lock().unwrap().is_some() {
            return Ok(());
        }
        match &self.backend {
            Backend::A2dp { connection } => {
                let try_only = self.profile == Profile::A2dpSource;
                let (fd, mtu_read, mtu_write) =
                    bluez::transport_acquire(connection, &self.bluez_path, try_only).await?;
                log::debug!(
                    "{}: acquired transport, MTU {mtu_read}/{mtu_write}",
                    &self.path
                );
                self.set_bt_socket(fd, mtu_read as usize, mtu_write as usize)
            }
            Backend::Sco { pending } => {
                let sock = pending
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| Error::with_message(ErrorKind::NotConnected, "no SCO link"))?;
                self.set_bt_socket(sock.fd, sock.mtu_read, sock.mtu_write)
            }
            Backend::Rfcomm => Ok(()),
        }
    }

    /// Releases the Bluetooth socket, notifying the host stack when the
    /// socket was still ours.
    pub(crate) async fn release(&self) {
        let had = self.bt.lock().unwrap().take();
        if had.is_none() {
            return;
        }
        if let Backend::A2dp { connection } = &self.backend {
            if let Err(err) = bluez::transport_release(connection, &self.bluez_path).await {
                log::warn!("{}: transport release failed: {err}", &self.path);
            }
        }
    }

    /// Deposits a SCO socket for a later acquire.
    pub(crate) fn deposit_sco_socket(&self, socket: ScoSocket) {
        if let Backend::Sco { pending } = &self.backend {
            *pending.lock().unwrap() = Some(socket);
        }
    }

    // ---- I/O task lifecycle ----

    /// Starts the transport I/O task. At most one task runs per transport.
    pub(crate) fn start_io(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.io_task.lock().unwrap();
        if slot.is_some() {
            return Err(Error::with_message(ErrorKind::Failed, "I/O task already running"));
        }
        *slot = Some(crate::io::spawn(self)?);
        Ok(())
    }

    /// Stops the I/O task cooperatively and waits for it to finish.
    pub(crate) async fn stop_io(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.sig_tx.try_send(Signal::Ping);
        let task = self.io_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::warn!("{}: I/O task join failed: {err}", &self.path);
            }
        }
    }

    /// True while the I/O task is running.
    pub fn io_running(&self) -> bool {
        self.io_task.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sco_transport;

    #[tokio::test]
    async fn open_is_exclusive_per_endpoint() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        let err = t.open(PcmMode::Source).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        // the other direction is independent
        t.open(PcmMode::Sink).await.unwrap();
        drop(opened);
    }

    #[tokio::test]
    async fn open_requires_selected_codec() {
        let (t, _dev, _adapter) = sco_transport(Codec::Undefined);
        let err = t.open(PcmMode::Source).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        assert_eq!(t.state(), State::Idle);

        let _opened = t.open(PcmMode::Source).await.unwrap();
        assert_eq!(t.state(), State::Active);

        t.pause();
        assert_eq!(t.state(), State::Paused);
        t.resume();
        assert_eq!(t.state(), State::Active);

        let endpoint = t.endpoint(PcmMode::Source).unwrap();
        t.release_pcm(endpoint);
        assert_eq!(t.state(), State::Idle);
    }

    #[tokio::test]
    async fn release_pcm_keeps_transport_reopenable() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let _first = t.open(PcmMode::Sink).await.unwrap();
        t.release_pcm(t.endpoint(PcmMode::Sink).unwrap());
        assert!(t.open(PcmMode::Sink).await.is_ok());
    }

    #[tokio::test]
    async fn drain_without_io_task_times_out_quietly() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let start = std::time::Instant::now();
        t.drain(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn signals_are_queued_in_order() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let mut rx = t.take_signal_receiver().unwrap();
        t.send_signal(Signal::PcmOpen);
        t.send_signal(Signal::PcmSync);
        t.send_signal(Signal::PcmDrop);
        assert_eq!(rx.recv().await, Some(Signal::PcmOpen));
        assert_eq!(rx.recv().await, Some(Signal::PcmSync));
        assert_eq!(rx.recv().await, Some(Signal::PcmDrop));
    }

    #[tokio::test]
    async fn volume_is_one_packed_word() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        assert_eq!(t.volume().pack(), 0x0f0f);
        assert!(t.set_volume_packed(0x8f0f));
        assert!(t.volume().ch1_muted);
        assert!(!t.set_volume_packed(0x8f0f));
    }

    #[tokio::test]
    async fn sco_codec_selection_updates_sampling() {
        let (t, _dev, _adapter) = sco_transport(Codec::Undefined);
        assert!(t.set_codec(Codec::Msbc));
        assert_eq!(t.sampling(), 16_000);
        assert!(!t.set_codec(Codec::Msbc));
        assert!(t.set_codec(Codec::Cvsd));
        assert_eq!(t.sampling(), 8_000);
    }
}
