//! A2DP LDAC source flow.
//!
//! LDAC packets carry an RTP header plus the one-byte media payload
//! header. The encoder buffers internally and emits a packet every few
//! calls; the socket backlog observed at each write drives the adaptive
//! bit rate stepping.

use std::{sync::Arc, time::Duration};

use crate::{
    asrsync::RateSync,
    codec::{ldac::Abr, CodecParams, QualityControl},
    ffb::FrameBuffer,
    io::{
        flush_pcm, read_pcm, scale_a2dp, update_delay, wait_data, write_bt, BtWrite, Exit, PcmRead, Wake,
        DRAIN_POLL,
    },
    pcm::PcmMode,
    rtp::{RtpState, RTP_HEADER_LEN, RTP_MEDIA_HEADER_LEN},
    sock,
    transport::{Signal, State, Transport},
};

pub(super) async fn source(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let Some(factory) = t.daemon_config().codecs.ldac_encoder.clone() else {
        return Exit::Error;
    };
    let Ok(null) = sock::open_null() else {
        return Exit::Error;
    };

    let channels = t.channels() as usize;
    let sampling = t.sampling();
    let keep_alive = Duration::from_secs(t.daemon_config().a2dp.keep_alive as u64);
    let abr_enabled = t.daemon_config().ldac.abr;

    let mut enc: Option<Box<dyn QualityControl>> = None;
    let mut abr: Option<Abr> = None;
    let mut pcm: FrameBuffer<i16> = FrameBuffer::new(0);
    let mut bt: FrameBuffer<u8> = FrameBuffer::new(0);
    let mut rtp = RtpState::new();
    let mut asrs = RateSync::new(sampling);
    let mut poll_timeout: Option<Duration> = None;
    // PCM frames consumed since the last emitted packet
    let mut ts_frames = 0usize;

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
        let mtu_write = t.mtu_write();

        if enc.is_none() {
            let params = CodecParams {
                channels: t.channels(),
                sampling,
                config: t.codec_config(),
                mtu_write: mtu_write.saturating_sub(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN),
            };
            match factory(&params) {
                Ok(mut handle) => {
                    handle.set_eqmid(t.daemon_config().ldac.eqmid);
                    // promote quality only after about one second of
                    // uncongested transfer
                    let batch_frames = (handle.codesize() / channels).max(1);
                    abr = Some(Abr::new(sampling / batch_frames as u32));
                    pcm.grow(handle.codesize());
                    bt.grow(mtu_write.max(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN + handle.frame_len()));
                    enc = Some(handle);
                }
                Err(err) => {
                    log::error!("Couldn't initialize LDAC encoder: {err}");
                    return Exit::Error;
                }
            }
        }
        let Some(enc) = enc.as_mut() else { continue };
        let Some(abr) = abr.as_mut() else { continue };
        let codesize = enc.codesize();

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
            bt.rewind();
            bt.seek(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN);
            let encoded = match enc.encode(&pcm.filled()[consumed..], bt.tail_mut()) {
                Ok(res) => res,
                Err(err) => {
                    log::error!("LDAC encoding error: {err}");
                    consumed += codesize;
                    continue;
                }
            };
            consumed += encoded.consumed;
            let batch_frames = encoded.consumed / channels;
            ts_frames += batch_frames;

            if encoded.written > 0 {
                bt.seek(encoded.written);
                let packet = bt.filled_mut();
                rtp.write_header(&mut packet[..RTP_HEADER_LEN], false);
                packet[RTP_HEADER_LEN] = encoded.frames as u8 & 0x0f;

                match write_bt(&t, &bt_sock, packet).await {
                    Ok(BtWrite::Written { backlog, .. }) => {
                        if abr_enabled && mtu_write > 0 {
                            abr.observe(enc.as_mut(), backlog / mtu_write as u32);
                        }
                    }
                    Ok(BtWrite::Disconnected) => {
                        log::debug!("{}: BT socket disconnected", &t.path);
                        t.clear_bt_socket();
                        return Exit::PeerGone;
                    }
                    Err(err) => log::error!("BT socket write error: {err}"),
                }

                rtp.advance_timestamp(ts_frames, sampling);
                ts_frames = 0;
            }

            asrs.sync(batch_frames).await;
            update_delay(&t, &asrs);
        }
        pcm.shift(consumed);
    }
}
