//! A2DP AAC source and sink flows.
//!
//! AAC travels as LATM inside plain RTP packets without a media payload
//! header. An encoded frame larger than the write MTU is fragmented across
//! several packets; only the final fragment carries the mark bit and all
//! fragments of one frame share a timestamp. Some peers never set the mark
//! bit at all, which is detected within the first few packets and turns
//! every packet into a terminal fragment.

use std::{sync::Arc, time::Duration};

use crate::{
    asrsync::RateSync,
    codec::{CodecParams, FrameDecoder, FrameEncoder},
    ffb::FrameBuffer,
    io::{
        flush_pcm, read_pcm, scale_a2dp, update_delay, wait_data, write_bt, write_pcm, BtWrite, Exit, PcmRead,
        PcmWrite, Wake, DRAIN_POLL,
    },
    pcm::PcmMode,
    rtp::{Header, RtpState, SeqTracker, RTP_HEADER_LEN},
    sock,
    transport::{Signal, State, Transport},
};

pub(super) async fn source(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let Some(factory) = t.daemon_config().codecs.aac_encoder.clone() else {
        return Exit::Error;
    };
    let Ok(null) = sock::open_null() else {
        return Exit::Error;
    };

    let channels = t.channels() as usize;
    let sampling = t.sampling();
    let keep_alive = Duration::from_secs(t.daemon_config().a2dp.keep_alive as u64);

    // the encoder handle is created once the socket MTU is known
    let mut enc: Option<Box<dyn FrameEncoder>> = None;
    let mut pcm: FrameBuffer<i16> = FrameBuffer::new(0);
    let mut bt: Vec<u8> = Vec::new();
    let mut rtp = RtpState::new();
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
                    pcm.grow(handle.codesize());
                    bt.resize(RTP_HEADER_LEN + handle.frame_len(), 0);
                    enc = Some(handle);
                }
                Err(err) => {
                    log::error!("Couldn't open AAC encoder: {err}");
                    return Exit::Error;
                }
            }
        }
        let Some(enc) = enc.as_mut() else { continue };
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

        while pcm.len_out() >= codesize {
            let encoded = match enc.encode(pcm.filled(), &mut bt[RTP_HEADER_LEN..]) {
                Ok(res) => res,
                Err(err) => {
                    log::error!("AAC encoding error: {err}");
                    pcm.shift(codesize);
                    continue;
                }
            };

            if encoded.written > 0 {
                // fragment the LATM payload across MTU-sized RTP packets;
                // the timestamp stays the same for every fragment
                let payload_max = t.mtu_write().saturating_sub(RTP_HEADER_LEN).max(1);
                let mut payload_len = encoded.written;
                loop {
                    let len = payload_len.min(payload_max);
                    let marker = payload_len <= payload_max;
                    rtp.write_header(&mut bt[..RTP_HEADER_LEN], marker);

                    match write_bt(&t, &bt_sock, &bt[..RTP_HEADER_LEN + len]).await {
                        Ok(BtWrite::Written { .. }) => (),
                        Ok(BtWrite::Disconnected) => {
                            log::debug!("{}: BT socket disconnected", &t.path);
                            t.clear_bt_socket();
                            return Exit::PeerGone;
                        }
                        Err(err) => {
                            log::error!("BT socket write error: {err}");
                            break;
                        }
                    }

                    payload_len -= len;
                    if payload_len == 0 {
                        break;
                    }
                    log::debug!("Payload fragmentation: extra {payload_len} bytes");
                    bt.copy_within(RTP_HEADER_LEN + len..RTP_HEADER_LEN + len + payload_len, RTP_HEADER_LEN);
                }
            }

            let frames = encoded.consumed / channels;
            asrs.sync(frames).await;
            rtp.advance_timestamp(frames, sampling);
            update_delay(&t, &asrs);

            pcm.shift(encoded.consumed);
        }
    }
}

pub(super) async fn sink(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let Some(factory) = t.daemon_config().codecs.aac_decoder.clone() else {
        return Exit::Error;
    };

    let channels = t.channels() as usize;
    let params = CodecParams {
        channels: t.channels(),
        sampling: t.sampling(),
        config: t.codec_config(),
        mtu_write: t.mtu_write(),
    };
    let mut dec: Box<dyn FrameDecoder> = match factory(&params) {
        Ok(handle) => handle,
        Err(err) => {
            log::error!("Couldn't open AAC decoder: {err}");
            return Exit::Error;
        }
    };

    let mut tracker = SeqTracker::new();
    let mut markbit_quirk: i32 = -3;
    let mut packet = vec![0u8; 16];
    let mut latm: FrameBuffer<u8> = FrameBuffer::new(16);
    let mut pcm = vec![0i16; 2048 * channels];

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        let bt_sock = match t.state() {
            State::Paused => None,
            _ => t.bt_socket(),
        };

        match wait_data(&mut sig_rx, bt_sock.as_ref(), None).await {
            Wake::Signal(None) => return Exit::Shutdown,
            Wake::Signal(Some(Signal::PcmSync)) => {
                t.drained_handle().notify_waiters();
                continue;
            }
            Wake::Signal(Some(_)) => continue,
            Wake::Timeout => continue,
            Wake::Ready => (),
        }

        let Some(bt_sock) = bt_sock else { continue };
        let mtu_read = t.mtu_read().max(16);
        if packet.len() < mtu_read {
            packet.resize(mtu_read, 0);
        }
        latm.grow(mtu_read);

        let len = {
            let mut guard = match bt_sock.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    log::error!("Transport poll error: {err}");
                    return Exit::Error;
                }
            };
            match guard.try_io(|inner| sock::read(inner.get_ref(), &mut packet)) {
                Ok(Ok(0)) => {
                    log::debug!("{}: BT socket has been closed", &t.path);
                    t.clear_bt_socket();
                    return Exit::PeerGone;
                }
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    log::debug!("BT read error: {err}");
                    continue;
                }
                Err(_would_block) => continue,
            }
        };

        let fifo = match t.endpoint(PcmMode::Sink).and_then(|ep| ep.handle()) {
            Some(fifo) => fifo,
            None => {
                tracker.reset();
                continue;
            }
        };

        let Some(header) = Header::parse(&packet[..len]) else {
            log::warn!("Invalid RTP packet: {len} bytes");
            continue;
        };

        // peers that never set the mark bit are detected within the first
        // packets; from then on every packet is terminal
        if markbit_quirk < 0 {
            if header.marker {
                markbit_quirk = 0;
            } else {
                markbit_quirk += 1;
                if markbit_quirk == 0 {
                    log::warn!("Activating RTP mark bit quirk workaround");
                    markbit_quirk = 1;
                }
            }
        }

        tracker.observe(header.seq_number);

        let payload = &packet[header.payload_offset..len];
        if latm.len_in() < payload.len() {
            let grown = latm.capacity() + mtu_read;
            log::debug!("Resizing LATM buffer: {} -> {}", latm.capacity(), grown);
            latm.grow(grown);
        }
        latm.extend_from_slice(payload);

        if markbit_quirk != 1 && !header.marker {
            log::debug!("Fragmented RTP packet [{}]: LATM len: {}", header.seq_number, latm.len_out());
            continue;
        }

        match dec.decode(latm.filled(), &mut pcm) {
            Ok(decoded) => {
                scale_a2dp(&t, &mut pcm[..decoded.samples]);
                match write_pcm(&t, PcmMode::Sink, &fifo, &pcm[..decoded.samples]).await {
                    Ok(PcmWrite::Done) | Ok(PcmWrite::Closed) => (),
                    Err(err) => log::error!("FIFO write error: {err}"),
                }
                latm.rewind();
            }
            Err(err) => log::error!("AAC decode frame error: {err}"),
        }
    }
}
