//! A2DP aptX source flow.
//!
//! aptX frames go on the wire raw, without any RTP framing: blocks of four
//! stereo samples become four bytes each, and the write buffer is filled
//! up to the socket MTU before it is flushed.

use std::{sync::Arc, time::Duration};

use crate::{
    asrsync::RateSync,
    codec::{CodecParams, FrameEncoder},
    ffb::FrameBuffer,
    io::{
        flush_pcm, read_pcm, scale_a2dp, update_delay, wait_data, write_bt, BtWrite, Exit, PcmRead, Wake,
        DRAIN_POLL,
    },
    pcm::PcmMode,
    sock,
    transport::{Signal, State, Transport},
};

pub(super) async fn source(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let Some(factory) = t.daemon_config().codecs.aptx_encoder.clone() else {
        return Exit::Error;
    };
    let Ok(null) = sock::open_null() else {
        return Exit::Error;
    };

    let channels = t.channels() as usize;
    let sampling = t.sampling();
    let keep_alive = Duration::from_secs(t.daemon_config().a2dp.keep_alive as u64);

    let mut enc: Option<Box<dyn FrameEncoder>> = None;
    let mut pcm: FrameBuffer<i16> = FrameBuffer::new(0);
    let mut bt: FrameBuffer<u8> = FrameBuffer::new(0);
    let mut asrs = RateSync::new(sampling);
    let mut poll_timeout: Option<Duration> = None;

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        let fifo = match t.state() {
            State::Active => t.endpoint(PcmMode::Source).and_then(|ep| ep.handle()),
            _ => None,
        };

        match wait_data(&mut sig_rx, fifo.as_ref(), poll_timeout).await {
            Wake::Signal(None) => return Exit::Shutdown,
            Wake::Signal(Some(sig)) => {
                match sig {
                    Signal::PcmOpen | Signal::PcmResume => {
                        poll_timeout = None;
                        asrs.reset();
                    }
                    Signal::PcmClose => poll_timeout = Some(keep_alive),
                    Signal::PcmSync => poll_timeout = Some(DRAIN_POLL),
                    Signal::PcmDrop => {
                        if let Some(fifo) = &fifo {
                            flush_pcm(fifo, &null);
                        }
                        pcm.rewind();
                    }
                    Signal::Ping | Signal::PcmPause => (),
                }
                continue;
            }
            Wake::Timeout => {
                t.drained_handle().notify_waiters();
                poll_timeout = None;
                let closed = t.endpoint(PcmMode::Source).map(|ep| !ep.is_open()).unwrap_or(true);
                if closed {
                    return Exit::Released;
                }
                continue;
            }
            Wake::Ready => (),
        }

        let Some(fifo) = fifo else { continue };
        let Some(bt_sock) = t.bt_socket() else { continue };

        if enc.is_none() {
            let params = CodecParams {
                channels: t.channels(),
                sampling,
                config: t.codec_config(),
                mtu_write: t.mtu_write(),
            };
            match factory(&params) {
                Ok(handle) => {
                    let mtu_write = t.mtu_write().max(handle.frame_len());
                    pcm.grow(handle.codesize() * (mtu_write / handle.frame_len()));
                    bt.grow(mtu_write);
                    enc = Some(handle);
                }
                Err(err) => {
                    log::error!("Couldn't initialize apt-X encoder: {err}");
                    return Exit::Error;
                }
            }
        }
        let Some(enc) = enc.as_mut() else { continue };
        let codesize = enc.codesize();
        let frame_len = enc.frame_len();

        let read_at = pcm.len_out();
        let samples = match read_pcm(&t, PcmMode::Source, &fifo, pcm.tail_mut()).await {
            Ok(PcmRead::Samples(n)) => n,
            Ok(PcmRead::Again) => continue,
            Ok(PcmRead::Closed) => {
                poll_timeout = Some(keep_alive);
                continue;
            }
            Err(err) => {
                log::error!("PCM read error: {err}");
                return Exit::Error;
            }
        };

        if asrs.is_reset() {
            asrs.reset();
        }

        pcm.seek(samples);
        scale_a2dp(&t, &mut pcm.filled_mut()[read_at..read_at + samples]);

        let mut consumed = 0;
        while pcm.len_out() - consumed >= codesize {
            // fill the write buffer up to the MTU, then flush
            let mut pcm_frames = 0;
            while pcm.len_out() - consumed >= codesize && bt.len_in() >= frame_len {
                match enc.encode(&pcm.filled()[consumed..], bt.tail_mut()) {
                    Ok(res) => {
                        consumed += res.consumed;
                        pcm_frames += res.consumed / channels;
                        bt.seek(res.written);
                    }
                    Err(err) => {
                        log::error!("apt-X encoding error: {err}");
                        consumed += codesize;
                        break;
                    }
                }
            }

            if bt.len_out() > 0 {
                match write_bt(&t, &bt_sock, bt.filled()).await {
                    Ok(BtWrite::Written { .. }) => (),
                    Ok(BtWrite::Disconnected) => {
                        log::debug!("{}: BT socket disconnected", &t.path);
                        t.clear_bt_socket();
                        return Exit::PeerGone;
                    }
                    Err(err) => log::error!("BT socket write error: {err}"),
                }
                bt.rewind();
            }

            asrs.sync(pcm_frames).await;
            update_delay(&t, &asrs);
        }
        pcm.shift(consumed);
    }
}
