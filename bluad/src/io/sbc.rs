//! A2DP SBC source and sink flows.

use std::{sync::Arc, time::Duration};

use crate::{
    asrsync::RateSync,
    codec::sbc::{SbcDecoder, SbcEncoder},
    codec::{FrameDecoder, FrameEncoder},
    ffb::FrameBuffer,
    io::{
        flush_pcm, read_pcm, scale_a2dp, update_delay, wait_data, write_bt, write_pcm, BtWrite, Exit, PcmRead,
        PcmWrite, Wake, DRAIN_POLL,
    },
    pcm::PcmMode,
    rtp::{Header, RtpState, SeqTracker, RTP_HEADER_LEN, RTP_MEDIA_HEADER_LEN},
    sock,
    transport::{Signal, State, Transport},
};

/// Largest SBC frame count expressible in the media payload header.
const MAX_FRAMES_PER_PACKET: usize = 15;

/// A2DP source flow: FIFO samples are SBC-encoded, packed into RTP
/// packets up to the write MTU and paced at the nominal sample rate.
pub(super) async fn source(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let mut sbc = match SbcEncoder::from_a2dp(&t.codec_config()) {
        Ok(sbc) => sbc,
        Err(err) => {
            log::error!("Couldn't initialize SBC codec: {err}");
            return Exit::Error;
        }
    };
    let Ok(null) = sock::open_null() else {
        return Exit::Error;
    };

    let codesize = sbc.codesize();
    let frame_len = sbc.frame_len();
    let channels = t.channels() as usize;
    let sampling = t.sampling();
    let keep_alive = Duration::from_secs(t.daemon_config().a2dp.keep_alive as u64);

    let mut pcm: FrameBuffer<i16> = FrameBuffer::new(codesize);
    let mut bt: FrameBuffer<u8> = FrameBuffer::new(0);
    let mut rtp = RtpState::new();
    let mut asrs = RateSync::new(sampling);
    let mut poll_timeout: Option<Duration> = None;

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        // the FIFO joins the wait only while the transport is active
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
                    Signal::PcmClose => {
                        log::debug!("{}: keep-alive polling: {:?}", &t.path, keep_alive);
                        poll_timeout = Some(keep_alive);
                    }
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

        // size the staging buffers from the negotiated MTU: one RTP packet
        // filled with as many SBC frames as fit
        let mtu_write = t.mtu_write().max(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN + frame_len);
        let payload_max = mtu_write - RTP_HEADER_LEN - RTP_MEDIA_HEADER_LEN;
        let frames_per_packet = (payload_max / frame_len).clamp(1, MAX_FRAMES_PER_PACKET);
        pcm.grow(codesize * frames_per_packet);
        bt.grow(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN + frames_per_packet * frame_len);

        let read_at = pcm.len_out();
        let samples = match read_pcm(&t, PcmMode::Source, &fifo, pcm.tail_mut()).await {
            Ok(PcmRead::Samples(n)) => n,
            Ok(PcmRead::Again) => continue,
            Ok(PcmRead::Closed) => {
                log::debug!("{}: keep-alive polling: {:?}", &t.path, keep_alive);
                poll_timeout = Some(keep_alive);
                continue;
            }
            Err(err) => {
                log::error!("PCM read error: {err}");
                return Exit::Error;
            }
        };

        // anchor the pacer at the first sample after (re)start
        if asrs.is_reset() {
            asrs.reset();
        }

        pcm.seek(samples);
        scale_a2dp(&t, &mut pcm.filled_mut()[read_at..read_at + samples]);

        if pcm.len_out() < codesize {
            continue;
        }

        // fill one RTP packet
        bt.rewind();
        bt.seek(RTP_HEADER_LEN + RTP_MEDIA_HEADER_LEN);
        let mut consumed = 0;
        let mut frames = 0;
        let mut pcm_frames = 0;
        while pcm.len_out() - consumed >= codesize
            && bt.len_in() >= frame_len
            && frames < MAX_FRAMES_PER_PACKET
        {
            match sbc.encode(&pcm.filled()[consumed..], bt.tail_mut()) {
                Ok(res) => {
                    consumed += res.consumed;
                    pcm_frames += res.consumed / channels;
                    frames += res.frames;
                    bt.seek(res.written);
                }
                Err(err) => {
                    log::error!("SBC encoding error: {err}");
                    consumed += codesize;
                }
            }
        }

        if frames > 0 {
            let packet = bt.filled_mut();
            rtp.write_header(&mut packet[..RTP_HEADER_LEN], false);
            packet[RTP_HEADER_LEN] = frames as u8 & 0x0f;

            match write_bt(&t, &bt_sock, packet).await {
                Ok(BtWrite::Written { .. }) => (),
                Ok(BtWrite::Disconnected) => {
                    log::debug!("{}: BT socket disconnected", &t.path);
                    t.clear_bt_socket();
                    return Exit::PeerGone;
                }
                Err(err) => log::error!("BT socket write error: {err}"),
            }

            // keep the transfer at a constant bit rate and stamp the next packet
            asrs.sync(pcm_frames).await;
            rtp.advance_timestamp(pcm_frames, sampling);
            update_delay(&t, &asrs);
        }

        pcm.shift(consumed);
    }
}

/// A2DP sink flow: RTP packets from the Bluetooth socket are SBC-decoded
/// and written to the client FIFO.
pub(super) async fn sink(t: Arc<Transport>) -> Exit {
    let Some(mut sig_rx) = t.take_signal_receiver() else {
        return Exit::Error;
    };
    let mut sbc = match SbcDecoder::from_a2dp(&t.codec_config()) {
        Ok(sbc) => sbc,
        Err(err) => {
            log::error!("Couldn't initialize SBC codec: {err}");
            return Exit::Error;
        }
    };

    let codesize = sbc.config().codesize();
    let mut tracker = SeqTracker::new();
    let mut packet = vec![0u8; 16];
    let mut pcm = vec![0i16; codesize];

    loop {
        if t.shutting_down() {
            return Exit::Shutdown;
        }

        // the BT socket joins the wait only while the transport is active
        let bt_sock = match t.state() {
            State::Active | State::Idle => t.bt_socket(),
            State::Paused => None,
        };

        match wait_data(&mut sig_rx, bt_sock.as_ref(), None).await {
            Wake::Signal(None) => return Exit::Shutdown,
            Wake::Signal(Some(Signal::PcmSync)) => {
                // nothing to drain on the receiving side
                t.drained_handle().notify_waiters();
                continue;
            }
            Wake::Signal(Some(_)) => continue,
            Wake::Timeout => continue,
            Wake::Ready => (),
        }

        let Some(bt_sock) = bt_sock else { continue };
        if packet.len() < t.mtu_read() {
            packet.resize(t.mtu_read(), 0);
        }

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
                    // the host stack already saw the hangup, no release needed
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
        tracker.observe(header.seq_number);

        let media = &packet[header.payload_offset..len];
        if media.is_empty() {
            continue;
        }
        let mut frames = (media[0] & 0x0f) as usize;
        let mut payload = &media[RTP_MEDIA_HEADER_LEN..];

        while frames > 0 {
            frames -= 1;
            let decoded = match sbc.decode(payload, &mut pcm) {
                Ok(decoded) => decoded,
                Err(err) => {
                    log::error!("SBC decoding error: {err}");
                    break;
                }
            };
            payload = &payload[decoded.consumed..];

            scale_a2dp(&t, &mut pcm[..decoded.samples]);
            match write_pcm(&t, PcmMode::Sink, &fifo, &pcm[..decoded.samples]).await {
                Ok(PcmWrite::Done) => (),
                Ok(PcmWrite::Closed) => break,
                Err(err) => {
                    log::error!("FIFO write error: {err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::as_bytes,
        rtp,
        session::DaemonEvent,
        test_util::a2dp_source_rig,
    };
    use tokio::{io::unix::AsyncFd, time::timeout};

    const MTU: usize = 679;
    // frame geometry of the rig's configuration: 16 blocks of 8 subbands,
    // mono, bitpool 26
    const FRAME_LEN: usize = 60;
    const FRAME_SAMPLES: u32 = 128;

    async fn recv_packet(peer: &AsyncFd<sock::OwnedFd>) -> Vec<u8> {
        timeout(Duration::from_secs(3), async {
            let mut buf = [0u8; 2048];
            loop {
                let mut guard = peer.readable().await.unwrap();
                match guard.try_io(|inner| sock::read(inner.get_ref(), &mut buf)) {
                    Ok(Ok(n)) => return buf[..n].to_vec(),
                    Ok(Err(err)) => panic!("peer read failed: {err}"),
                    Err(_would_block) => continue,
                }
            }
        })
        .await
        .expect("no packet from the source flow")
    }

    #[tokio::test]
    async fn source_emits_mtu_bounded_rtp_packets() {
        let rig = a2dp_source_rig(MTU);
        let t = rig.transport.clone();
        let opened = t.open(PcmMode::Source).await.unwrap();
        let peer = AsyncFd::new(rig.peer).unwrap();

        let samples: Vec<i16> = (0..4096).map(|i| ((i % 64) * 100) as i16).collect();
        let written = sock::write(&opened.data, as_bytes(&samples)).unwrap();
        assert_eq!(written, samples.len() * 2);

        let first = recv_packet(&peer).await;
        let second = recv_packet(&peer).await;
        for packet in [&first, &second] {
            assert!(packet.len() <= MTU, "packet length {}", packet.len());
            let header = rtp::Header::parse(packet).unwrap();
            assert_eq!(header.version, 2);
            assert_eq!(header.payload_type, rtp::RTP_PAYLOAD_TYPE);
            let frames = (packet[rtp::RTP_HEADER_LEN] & 0x0f) as usize;
            assert!(frames > 0);
            // the media header frame count matches the packed payload
            assert_eq!(packet.len(), rtp::RTP_HEADER_LEN + 1 + frames * FRAME_LEN);
        }

        let h1 = rtp::Header::parse(&first).unwrap();
        let h2 = rtp::Header::parse(&second).unwrap();
        assert_eq!(h2.seq_number, h1.seq_number.wrapping_add(1));

        let pcm_frames = (first[rtp::RTP_HEADER_LEN] & 0x0f) as u32 * FRAME_SAMPLES;
        assert_eq!(h2.timestamp.wrapping_sub(h1.timestamp), pcm_frames * 10_000 / 16_000);
    }

    #[tokio::test]
    async fn drain_is_bounded_by_the_poll_period() {
        let rig = a2dp_source_rig(MTU);
        let t = rig.transport.clone();
        let opened = t.open(PcmMode::Source).await.unwrap();
        let peer = AsyncFd::new(rig.peer).unwrap();

        let samples = vec![0i16; 1408];
        sock::write(&opened.data, as_bytes(&samples)).unwrap();
        let _ = recv_packet(&peer).await;

        let start = std::time::Instant::now();
        t.drain(Duration::from_secs(2)).await;
        assert!(start.elapsed() < Duration::from_millis(600), "drain took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn peer_disconnect_ends_the_stream() {
        let mut rig = a2dp_source_rig(MTU);
        let t = rig.transport.clone();
        let opened = t.open(PcmMode::Source).await.unwrap();
        drop(rig.peer);

        let samples = vec![0i16; 2816];
        sock::write(&opened.data, as_bytes(&samples)).unwrap();

        let event = timeout(Duration::from_secs(3), rig.events.recv())
            .await
            .expect("no teardown event")
            .expect("event queue closed");
        match event {
            DaemonEvent::TransportLost(path) => assert_eq!(path, t.path),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
