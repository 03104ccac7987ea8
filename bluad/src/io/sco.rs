//! SCO telephony flow.
//!
//! One loop serves both directions of the synchronous link: speaker FIFO
//! to SCO socket and SCO socket to microphone FIFO. CVSD passes 16-bit
//! samples through verbatim at the socket MTUs; mSBC routes everything
//! through the H2 framer. The loop acquires the link when a client opens
//! either PCM and releases it when both are gone, since an idle SCO link
//! still burns Bluetooth bandwidth.

use std::{sync::Arc, time::Duration};
use tokio::io::unix::AsyncFd;

use crate::{
    asrsync::RateSync,
    codec::{msbc::Msbc, Codec},
    ffb::FrameBuffer,
    io::{as_bytes, as_bytes_mut, flush_pcm, read_pcm, update_delay, write_pcm, Exit, PcmRead, PcmWrite},
    pcm::PcmMode,
    sock::{self, OwnedFd},
    transport::{Signal, Transport},
    volume::scale_s16le,
};

enum Wake {
    Signal(Option<Signal>),
    BtRead,
    BtWrite,
    SpkRead,
    MicWrite,
    Timeout,
}

async fn readable_when(fd: Option<&Arc<AsyncFd<OwnedFd>>>, enabled: bool) {
    match fd {
        Some(fd) if enabled => {
            let _ = fd.readable().await;
        }
        _ => std::future::pending().await,
    }
}

async fn writable_when(fd: Option<&Arc<AsyncFd<OwnedFd>>>, enabled: bool) {
    match fd {
        Some(fd) if enabled => {
            let _ = fd.writable().await;
        }
        _ => std::future::pending().await,
    }
}

pub(super) async fn run(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let Ok(null) = sock::open_null() else {
        return Exit::Error;
    };

    // staging for CVSD pass-through, in samples
    let mut bt_in: FrameBuffer<i16> = FrameBuffer::new(64);
    let mut bt_out: FrameBuffer<i16> = FrameBuffer::new(64);
    let mut msbc: Option<Msbc> = None;
    let mut asrs: Option<RateSync> = None;
    let mut poll_timeout: Option<Duration> = None;

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        let codec = t.codec();
        if codec == Codec::Msbc && msbc.is_none() {
            msbc = Some(Msbc::new());
        }

        let bt_sock = t.bt_socket();
        let spk = t.endpoint(PcmMode::Source).and_then(|ep| ep.handle());
        let mic = t.endpoint(PcmMode::Sink).and_then(|ep| ep.handle());
        let mtu_read = t.mtu_read();
        let mtu_write = t.mtu_write();

        // run the codec over whatever is staged, then decide which
        // descriptors are worth waiting for
        let (want_bt_read, want_bt_write, want_spk, want_mic) = match msbc.as_mut() {
            Some(m) if codec == Codec::Msbc => {
                m.encode();
                m.decode();
                (
                    mtu_read > 0 && m.dec_data.blen_in() >= mtu_read,
                    mtu_write > 0 && m.enc_data.blen_out() >= mtu_write,
                    mtu_write > 0 && m.enc_pcm.blen_in() >= mtu_write,
                    m.dec_pcm.len_out() > 0,
                )
            }
            _ => {
                // keep some slack beyond one MTU worth of samples
                bt_in.grow(mtu_read);
                bt_out.grow(mtu_write);
                (
                    mtu_read > 0 && bt_in.blen_in() >= mtu_read,
                    mtu_write > 0 && bt_out.blen_out() >= mtu_write,
                    mtu_write > 0 && bt_out.blen_in() >= mtu_write,
                    bt_in.len_out() > 0,
                )
            }
        };
        // an unread microphone would stall the loop for nothing; whatever
        // was captured for it goes stale the moment it disconnects
        let want_bt_read = want_bt_read && mic.is_some();
        if mic.is_none() {
            bt_in.rewind();
            if let Some(m) = msbc.as_mut() {
                m.dec_pcm.rewind();
            }
        }

        let timer = async {
            match poll_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let wake = tokio::select! {
            sig = sig_rx.recv() => Wake::Signal(sig),
            () = readable_when(bt_sock.as_ref(), want_bt_read) => Wake::BtRead,
            () = writable_when(bt_sock.as_ref(), want_bt_write) => Wake::BtWrite,
            () = readable_when(spk.as_ref(), want_spk) => Wake::SpkRead,
            () = writable_when(mic.as_ref(), want_mic) => Wake::MicWrite,
            () = timer => Wake::Timeout,
        };

        match wake {
            Wake::Signal(None) => return Exit::Shutdown,
            Wake::Signal(Some(sig)) => {
                match sig {
                    Signal::Ping | Signal::PcmOpen | Signal::PcmResume => {
                        poll_timeout = None;
                        asrs = None;
                    }
                    Signal::PcmSync => {
                        // the microphone side keeps the poll busy, so a
                        // speaker drain is reported right away
                        t.drained_handle().notify_waiters();
                    }
                    Signal::PcmDrop => {
                        if let Some(spk) = &spk {
                            flush_pcm(spk, &null);
                        }
                        continue;
                    }
                    Signal::PcmClose | Signal::PcmPause => (),
                }

                // transferring no audio must free the link bandwidth
                let spk_open = t.endpoint(PcmMode::Source).map(|ep| ep.is_open()).unwrap_or(false);
                let mic_open = t.endpoint(PcmMode::Sink).map(|ep| ep.is_open()).unwrap_or(false);
                if !spk_open && !mic_open {
                    t.release().await;
                    asrs = None;
                } else if let Err(err) = t.acquire().await {
                    log::debug!("{}: SCO acquire failed: {err}", &t.path);
                }
                continue;
            }
            Wake::Timeout => {
                t.drained_handle().notify_waiters();
                poll_timeout = None;
                continue;
            }
            Wake::BtRead => {
                let Some(bt_sock) = bt_sock else { continue };
                let buf = match msbc.as_mut() {
                    Some(m) if codec == Codec::Msbc => m.dec_data.tail_mut(),
                    _ => as_bytes_mut(bt_in.tail_mut()),
                };
                let mut guard = match bt_sock.readable().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        log::error!("Transport poll error: {err}");
                        return Exit::Error;
                    }
                };
                match guard.try_io(|inner| sock::read(inner.get_ref(), buf)) {
                    Ok(Ok(0)) => {
                        t.release().await;
                    }
                    Ok(Ok(n)) => match msbc.as_mut() {
                        Some(m) if codec == Codec::Msbc => m.dec_data.seek(n),
                        _ => bt_in.seek(n / 2),
                    },
                    Ok(Err(err))
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::ECONNABORTED) | Some(libc::ECONNRESET)
                        ) =>
                    {
                        t.release().await;
                    }
                    Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => (),
                    Ok(Err(err)) => log::error!("SCO read error: {err}"),
                    Err(_would_block) => (),
                }
            }
            Wake::BtWrite => {
                let Some(bt_sock) = bt_sock else { continue };
                let buf: Vec<u8> = match msbc.as_mut() {
                    Some(m) if codec == Codec::Msbc => m.enc_data.filled()[..mtu_write].to_vec(),
                    _ => as_bytes(bt_out.filled())[..mtu_write].to_vec(),
                };
                let mut guard = match bt_sock.writable().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        log::error!("Transport poll error: {err}");
                        return Exit::Error;
                    }
                };
                match guard.try_io(|inner| sock::write(inner.get_ref(), &buf)) {
                    Ok(Ok(n)) => match msbc.as_mut() {
                        Some(m) if codec == Codec::Msbc => m.enc_data.shift(n),
                        _ => bt_out.shift(n / 2),
                    },
                    Ok(Err(err))
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::ECONNABORTED) | Some(libc::ECONNRESET)
                        ) =>
                    {
                        t.release().await;
                    }
                    Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => (),
                    Ok(Err(err)) => log::error!("SCO write error: {err}"),
                    Err(_would_block) => (),
                }
            }
            Wake::SpkRead => {
                let Some(spk) = spk else { continue };
                let volume = t.volume();
                let (buf, is_msbc) = match msbc.as_mut() {
                    Some(m) if codec == Codec::Msbc => (m.enc_pcm.tail_mut(), true),
                    _ => (bt_out.tail_mut(), false),
                };
                match read_pcm(&t, PcmMode::Source, &spk, buf).await {
                    Ok(PcmRead::Samples(n)) => {
                        if volume.ch1_muted {
                            scale_s16le(&mut buf[..n], 1, 0.0, 0.0);
                        }
                        if is_msbc {
                            if let Some(m) = msbc.as_mut() {
                                m.enc_pcm.seek(n);
                            }
                        } else {
                            bt_out.seek(n);
                        }
                    }
                    Ok(PcmRead::Closed) | Ok(PcmRead::Again) => (),
                    Err(err) => log::error!("PCM read error: {err}"),
                }
            }
            Wake::MicWrite => {
                let Some(mic) = mic else { continue };
                let volume = t.volume();
                let samples: Vec<i16> = match msbc.as_mut() {
                    Some(m) if codec == Codec::Msbc => m.dec_pcm.filled().to_vec(),
                    _ => bt_in.filled().to_vec(),
                };
                let mut samples = samples;
                if volume.ch2_muted {
                    scale_s16le(&mut samples, 1, 0.0, 0.0);
                }
                match write_pcm(&t, PcmMode::Sink, &mic, &samples).await {
                    Ok(PcmWrite::Done) => {
                        let n = samples.len();
                        match msbc.as_mut() {
                            Some(m) if codec == Codec::Msbc => m.dec_pcm.shift(n),
                            _ => bt_in.shift(n),
                        }
                    }
                    Ok(PcmWrite::Closed) => match msbc.as_mut() {
                        Some(m) if codec == Codec::Msbc => m.dec_pcm.rewind(),
                        _ => bt_in.rewind(),
                    },
                    Err(err) => log::error!("FIFO write error: {err}"),
                }
            }
        }

        // keep the transfer at a constant bit rate
        if t.bt_socket().is_some() && mtu_write > 0 {
            let asrs = asrs.get_or_insert_with(|| RateSync::new(t.sampling()));
            asrs.sync(mtu_write / 2).await;
            update_delay(&t, asrs);
        }
    }
}
