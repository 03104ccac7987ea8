//! Per-transport I/O engine.
//!
//! One task runs per transport. It multiplexes the transport signal queue,
//! the Bluetooth socket and the PCM FIFO in a single readiness wait,
//! performs codec work in bounded batches and paces producing flows at the
//! nominal sample rate. Tasks suspend only in readiness waits and rate
//! sync sleeps; teardown is cooperative through the transport shutdown
//! flag, checked at every wait.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::{io::unix::AsyncFd, task::JoinHandle};

use crate::{
    codec::Codec,
    pcm::PcmMode,
    session::DaemonEvent,
    sock::{self, OwnedFd},
    transport::{Profile, Transport},
    volume::{scale_s16le, A2DP_VOLUME_MAX},
    Error, ErrorKind, Result,
};

mod aac;
mod aptx;
mod ldac;
mod rfcomm;
mod sbc;
mod sco;

/// Why an I/O task left its loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Exit {
    /// Teardown requested through the shutdown flag.
    Shutdown,
    /// The local client went away and keep-alive expired.
    Released,
    /// The remote device closed the Bluetooth link.
    PeerGone,
    /// Unrecoverable setup or I/O failure.
    Error,
}

/// Backlog value assumed while the socket rejects writes.
const COUTQ_BLOCKED: u32 = 16 * 1024;
/// Bytes discarded per FIFO flush.
const FLUSH_LEN: usize = 32 * 1024;

/// Starts the I/O task matching the transport profile and codec.
pub(crate) fn spawn(t: &Arc<Transport>) -> Result<JoinHandle<()>> {
    let codecs = &t.daemon_config().codecs;
    let flow: Pin<Box<dyn Future<Output = Exit> + Send>> = match (t.profile, t.codec()) {
        (Profile::A2dpSource, Codec::Sbc) => Box::pin(sbc::source(t.clone())),
        (Profile::A2dpSink, Codec::Sbc) => Box::pin(sbc::sink(t.clone())),
        (Profile::A2dpSource, Codec::Aac) if codecs.aac_encoder.is_some() => {
            Box::pin(aac::source(t.clone()))
        }
        (Profile::A2dpSink, Codec::Aac) if codecs.aac_decoder.is_some() => {
            Box::pin(aac::sink(t.clone()))
        }
        (Profile::A2dpSource, Codec::AptX) if codecs.aptx_encoder.is_some() => {
            Box::pin(aptx::source(t.clone()))
        }
        (Profile::A2dpSource, Codec::Ldac) if codecs.ldac_encoder.is_some() => {
            Box::pin(ldac::source(t.clone()))
        }
        (Profile::Rfcomm, _) => Box::pin(rfcomm::run(t.clone())),
        (profile, _) if profile.is_sco() => Box::pin(sco::run(t.clone())),
        (_, codec) => {
            return Err(Error::with_message(
                ErrorKind::NotSupported,
                format!("codec not supported: {codec}"),
            ))
        }
    };

    let t = t.clone();
    Ok(tokio::spawn(async move {
        log::debug!("Starting IO loop: {}", &t.path);
        let exit = flow.await;
        log::debug!("IO loop done: {} ({exit:?})", &t.path);

        // unwind: give the socket back and unblock any drain waiter
        t.release().await;
        t.drained_handle().notify_waiters();

        if exit == Exit::PeerGone {
            let _ = t.events.send(DaemonEvent::TransportLost(t.path.clone()));
        }
    }))
}

pub(crate) fn as_bytes(samples: &[i16]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(samples.as_ptr() as *const u8, samples.len() * 2) }
}

pub(crate) fn as_bytes_mut(samples: &mut [i16]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(samples.as_mut_ptr() as *mut u8, samples.len() * 2) }
}

/// Outcome of a FIFO read.
pub(crate) enum PcmRead {
    /// Samples stored in the buffer.
    Samples(usize),
    /// Client disconnected; the endpoint has been released.
    Closed,
    /// Nothing to read right now.
    Again,
}

/// Reads PCM samples from a transport FIFO.
///
/// A zero-length read or a stale descriptor counts as a client disconnect
/// and releases the endpoint.
pub(crate) async fn read_pcm(
    t: &Transport, mode: PcmMode, fifo: &AsyncFd<OwnedFd>, buf: &mut [i16],
) -> std::io::Result<PcmRead> {
    loop {
        let mut guard = fifo.readable().await?;
        match guard.try_io(|inner| sock::read(inner.get_ref(), as_bytes_mut(buf))) {
            Ok(Ok(0)) => {
                log::debug!("{}: PCM has been closed", &t.path);
                if let Some(endpoint) = t.endpoint(mode) {
                    t.release_pcm(endpoint);
                }
                return Ok(PcmRead::Closed);
            }
            Ok(Ok(n)) => return Ok(PcmRead::Samples(n / 2)),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) if err.raw_os_error() == Some(libc::EBADF) => {
                if let Some(endpoint) = t.endpoint(mode) {
                    t.release_pcm(endpoint);
                }
                return Ok(PcmRead::Closed);
            }
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => return Ok(PcmRead::Again),
        }
    }
}

/// Outcome of a FIFO write.
pub(crate) enum PcmWrite {
    /// All samples were written.
    Done,
    /// Client disconnected; the endpoint has been released.
    Closed,
}

/// Writes PCM samples to a transport FIFO, waiting for space as needed.
///
/// The write is atomic from the caller's point of view: either every
/// sample lands in the FIFO or the client is gone.
pub(crate) async fn write_pcm(
    t: &Transport, mode: PcmMode, fifo: &AsyncFd<OwnedFd>, samples: &[i16],
) -> std::io::Result<PcmWrite> {
    let mut buf = as_bytes(samples);
    while !buf.is_empty() {
        let mut guard = fifo.writable().await?;
        match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
            Ok(Ok(n)) => buf = &buf[n..],
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) if err.raw_os_error() == Some(libc::EPIPE) => {
                log::debug!("{}: PCM has been closed", &t.path);
                if let Some(endpoint) = t.endpoint(mode) {
                    t.release_pcm(endpoint);
                }
                return Ok(PcmWrite::Closed);
            }
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
    Ok(PcmWrite::Done)
}

/// Discards whatever is pending on the FIFO read side.
pub(crate) fn flush_pcm(fifo: &AsyncFd<OwnedFd>, null: &OwnedFd) {
    match sock::splice_to_null(fifo.get_ref(), null, FLUSH_LEN) {
        Ok(n) => log::debug!("PCM read buffer flushed: {} samples", n / 2),
        Err(err) => log::warn!("PCM flush failed: {err}"),
    }
}

/// Outcome of a Bluetooth socket write.
pub(crate) enum BtWrite {
    /// Bytes written together with the backlog observed beforehand.
    Written {
        /// Bytes accepted by the socket.
        len: usize,
        /// Outgoing-queue depth above the idle baseline, in bytes.
        backlog: u32,
    },
    /// The peer closed the link.
    Disconnected,
}

/// Writes a packet to the Bluetooth socket.
///
/// The kernel outgoing-queue depth is probed before the write; its excess
/// over the idle baseline feeds bitrate adaptation. A blocked socket is
/// waited out and reported with a saturated backlog.
pub(crate) async fn write_bt(
    t: &Transport, bt: &AsyncFd<OwnedFd>, buf: &[u8],
) -> std::io::Result<BtWrite> {
    let mut backlog = match sock::outq(bt.get_ref()) {
        Ok(queued) => (queued - t.coutq_init() as i32).unsigned_abs(),
        Err(err) => {
            log::warn!("Couldn't get BT queued bytes: {err}");
            0
        }
    };
    loop {
        let mut guard = bt.writable().await?;
        match guard.try_io(|inner| sock::write(inner.get_ref(), buf)) {
            Ok(Ok(n)) => return Ok(BtWrite::Written { len: n, backlog }),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(err))
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ECONNRESET) | Some(libc::ENOTCONN) | Some(libc::EPIPE)
                ) =>
            {
                return Ok(BtWrite::Disconnected);
            }
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => {
                backlog = COUTQ_BLOCKED;
                continue;
            }
        }
    }
}

/// What woke an I/O loop from its readiness wait.
pub(crate) enum Wake {
    /// A signal arrived on the transport queue; [None] means the
    /// controller is gone.
    Signal(Option<crate::transport::Signal>),
    /// The data descriptor became ready.
    Ready,
    /// The poll timeout elapsed.
    Timeout,
}

/// The single readiness wait of the A2DP flows: transport signals, one
/// optional data descriptor and an optional poll timeout.
pub(crate) async fn wait_data(
    sig_rx: &mut tokio::sync::mpsc::Receiver<crate::transport::Signal>,
    fd: Option<&Arc<AsyncFd<OwnedFd>>>, timeout: Option<std::time::Duration>,
) -> Wake {
    let data_ready = async {
        match fd {
            Some(fd) => {
                let _ = fd.readable().await;
            }
            None => std::future::pending().await,
        }
    };
    let timer = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        sig = sig_rx.recv() => Wake::Signal(sig),
        () = data_ready => Wake::Ready,
        () = timer => Wake::Timeout,
    }
}

/// Poll timeout while a drain is pending.
pub(crate) const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// Folds the pacer's busy interval into the transport delay estimate,
/// which uses units of 0.1 ms.
pub(crate) fn update_delay(t: &Transport, asrs: &crate::asrsync::RateSync) {
    t.set_delay((asrs.busy_usec() / 100).min(u16::MAX as u64) as u16);
}

/// Applies software volume to an A2DP sample batch, unless volume is
/// forwarded to the peer.
pub(crate) fn scale_a2dp(t: &Transport, samples: &mut [i16]) {
    if t.daemon_config().a2dp.volume {
        return;
    }
    let volume = t.volume();
    if volume.is_transparent(A2DP_VOLUME_MAX) {
        return;
    }
    let (ch1, ch2) = volume.scales(A2DP_VOLUME_MAX);
    scale_s16le(samples, t.channels() as usize, ch1, ch2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::Codec, pcm::PcmMode, test_util::sco_transport};

    #[tokio::test]
    async fn read_pcm_eof_releases_endpoint() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        let fifo = t.endpoint(PcmMode::Source).unwrap().handle().unwrap();

        // client writes a bit, then hangs up
        sock::write(&opened.data, &[1u8, 0, 2, 0]).unwrap();
        let mut buf = [0i16; 16];
        match read_pcm(&t, PcmMode::Source, &fifo, &mut buf).await.unwrap() {
            PcmRead::Samples(2) => (),
            _ => panic!("expected two samples"),
        }
        assert_eq!(&buf[..2], &[1, 2]);

        drop(opened);
        match read_pcm(&t, PcmMode::Source, &fifo, &mut buf).await.unwrap() {
            PcmRead::Closed => (),
            _ => panic!("expected client disconnect"),
        }
        assert!(!t.endpoint(PcmMode::Source).unwrap().is_open());
    }

    #[tokio::test]
    async fn write_pcm_is_atomic() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Sink).await.unwrap();
        let fifo = t.endpoint(PcmMode::Sink).unwrap().handle().unwrap();

        let samples: Vec<i16> = (0..256).collect();
        match write_pcm(&t, PcmMode::Sink, &fifo, &samples).await.unwrap() {
            PcmWrite::Done => (),
            _ => panic!("expected complete write"),
        }
        let mut buf = [0u8; 512];
        let n = sock::read(&opened.data, &mut buf).unwrap();
        assert_eq!(n, 512);
        drop(opened);
    }

    #[tokio::test]
    async fn write_pcm_detects_client_gone() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Sink).await.unwrap();
        let fifo = t.endpoint(PcmMode::Sink).unwrap().handle().unwrap();
        drop(opened);

        let samples = [0i16; 4];
        match write_pcm(&t, PcmMode::Sink, &fifo, &samples).await.unwrap() {
            PcmWrite::Closed => (),
            _ => panic!("expected client disconnect"),
        }
    }

    #[tokio::test]
    async fn flush_discards_fifo_content() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let opened = t.open(PcmMode::Source).await.unwrap();
        let fifo = t.endpoint(PcmMode::Source).unwrap().handle().unwrap();
        let null = sock::open_null().unwrap();

        sock::write(&opened.data, &[0u8; 1024]).unwrap();
        flush_pcm(&fifo, &null);
        let mut buf = [0i16; 16];
        match read_pcm(&t, PcmMode::Source, &fifo, &mut buf).await.unwrap() {
            PcmRead::Again => (),
            _ => panic!("expected empty FIFO"),
        }
        drop(opened);
    }

    #[tokio::test]
    async fn write_bt_reports_backlog_on_socketpair() {
        let (t, _dev, _adapter) = sco_transport(Codec::Cvsd);
        let (a, b) = sock::seqpacket_pair().unwrap();
        let bt = AsyncFd::new(a).unwrap();
        match write_bt(&t, &bt, b"frame").await.unwrap() {
            BtWrite::Written { len, .. } => assert_eq!(len, 5),
            _ => panic!("expected write"),
        }
        let mut buf = [0u8; 16];
        assert_eq!(sock::read(&b, &mut buf).unwrap(), 5);
    }
}
