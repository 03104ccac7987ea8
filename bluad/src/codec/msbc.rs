//! mSBC framing for wide-band telephony over eSCO.
//!
//! Every mSBC frame travels in a 60-byte H2 packet: a two-byte
//! synchronisation header carrying a 2-bit sequence number with duplicated
//! bits, the 57-byte SBC frame, and one byte of padding. The decoder scans
//! incoming bytes for a valid header before each decode, preserving partial
//! data when none is found yet.

use crate::{
    codec::sbc::{SbcConfig, SbcDecoder, SbcEncoder},
    codec::{FrameDecoder, FrameEncoder},
    ffb::FrameBuffer,
};

/// Total length of one H2-framed mSBC packet.
pub const PACKET_LEN: usize = 60;
/// Length of the H2 synchronisation header.
pub const H2_HEADER_LEN: usize = 2;
/// PCM samples carried by one packet.
pub const PACKET_SAMPLES: usize = 120;

/// The four valid H2 second bytes, indexed by sequence number.
///
/// Each sequence bit is duplicated for error detection.
const H2_SEQUENCES: [u8; 4] = [0x08, 0x38, 0xc8, 0xf8];

/// Scans `buf` for a valid H2 header.
///
/// Returns the header offset and the number of trailing bytes worth
/// keeping: everything from the header on when one is found, at most one
/// byte otherwise (a header could still start at the final byte).
pub fn find_h2_header(buf: &[u8]) -> (Option<usize>, usize) {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == 0x01 && H2_SEQUENCES.contains(&buf[i + 1]) {
            return (Some(i), buf.len() - i);
        }
    }
    (None, buf.len().min(1))
}

/// mSBC codec state with H2 framing and staging buffers.
///
/// The SCO I/O loop moves data between the four staging buffers and its
/// file descriptors; [encode](Self::encode) and [decode](Self::decode)
/// shuffle whole packets between them.
pub struct Msbc {
    encoder: SbcEncoder,
    decoder: SbcDecoder,
    seq: u8,
    /// PCM staged for encoding.
    pub enc_pcm: FrameBuffer<i16>,
    /// Encoded H2 packets ready for the SCO socket.
    pub enc_data: FrameBuffer<u8>,
    /// Raw bytes received from the SCO socket.
    pub dec_data: FrameBuffer<u8>,
    /// Decoded PCM ready for the microphone FIFO.
    pub dec_pcm: FrameBuffer<i16>,
}

impl Msbc {
    /// Creates an mSBC codec with empty staging buffers.
    pub fn new() -> Self {
        let config = SbcConfig::msbc();
        Self {
            encoder: SbcEncoder::new(config),
            decoder: SbcDecoder::new(config),
            seq: 0,
            enc_pcm: FrameBuffer::new(4 * PACKET_SAMPLES),
            enc_data: FrameBuffer::new(4 * PACKET_LEN),
            dec_data: FrameBuffer::new(4 * PACKET_LEN),
            dec_pcm: FrameBuffer::new(4 * PACKET_SAMPLES),
        }
    }

    /// Encodes as many staged PCM batches into H2 packets as fit.
    pub fn encode(&mut self) {
        while self.enc_pcm.len_out() >= PACKET_SAMPLES && self.enc_data.len_in() >= PACKET_LEN {
            let seq = self.seq;
            self.seq = (self.seq + 1) & 0x3;

            let pcm: Vec<i16> = self.enc_pcm.filled()[..PACKET_SAMPLES].to_vec();
            let out = self.enc_data.tail_mut();
            out[0] = 0x01;
            out[1] = H2_SEQUENCES[seq as usize];
            out[PACKET_LEN - 1] = 0;
            match self.encoder.encode(&pcm, &mut out[H2_HEADER_LEN..PACKET_LEN - 1]) {
                Ok(_) => {
                    self.enc_pcm.shift(PACKET_SAMPLES);
                    self.enc_data.seek(PACKET_LEN);
                }
                Err(err) => {
                    log::error!("mSBC encoding error: {err}");
                    self.enc_pcm.shift(PACKET_SAMPLES);
                }
            }
        }
    }

    /// Decodes as many complete received packets as are available.
    pub fn decode(&mut self) {
        loop {
            let (offset, keep) = find_h2_header(self.dec_data.filled());
            match offset {
                Some(0) => (),
                Some(skip) => {
                    log::debug!("mSBC stream out of sync, skipping {skip} bytes");
                    self.dec_data.shift(skip);
                }
                None => {
                    let drop = self.dec_data.len_out() - keep;
                    if drop > 0 {
                        self.dec_data.shift(drop);
                    }
                    return;
                }
            }
            if self.dec_data.len_out() < PACKET_LEN || self.dec_pcm.len_in() < PACKET_SAMPLES {
                return;
            }

            let frame: Vec<u8> = self.dec_data.filled()[H2_HEADER_LEN..PACKET_LEN - 1].to_vec();
            let out = self.dec_pcm.tail_mut();
            match self.decoder.decode(&frame, out) {
                Ok(res) => {
                    self.dec_pcm.seek(res.samples);
                    self.dec_data.shift(PACKET_LEN);
                }
                Err(err) => {
                    log::error!("mSBC decoding error: {err}");
                    // drop the bogus header and rescan
                    self.dec_data.shift(H2_HEADER_LEN);
                }
            }
        }
    }
}

impl Default for Msbc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2_header_at_start() {
        let raw = [0x01u8, 0x08, 0xad, 0x00, 0x00, 0xd5, 0x10, 0x00, 0x11, 0x10];
        assert_eq!(find_h2_header(&raw), (Some(0), 10));
    }

    #[test]
    fn h2_header_mid_buffer() {
        let raw = [0x00u8, 0xd5, 0x10, 0x00, 0x01, 0x38, 0xad, 0x00, 0x11, 0x10];
        assert_eq!(find_h2_header(&raw), (Some(4), 6));
    }

    #[test]
    fn h2_first_of_two_headers() {
        let raw = [0xd5u8, 0x01, 0xc8, 0xad, 0x00, 0x01, 0xf8, 0xad, 0x11, 0x10];
        assert_eq!(find_h2_header(&raw), (Some(1), 9));
    }

    #[test]
    fn h2_rejects_unduplicated_sequence_bits() {
        let raw = [0x01u8, 0x18, 0xad, 0x00, 0x00, 0xd5, 0x10, 0x00, 0x11, 0x10];
        assert_eq!(find_h2_header(&raw), (None, 1));
        let raw = [0x01u8, 0x58, 0xad, 0x00, 0x00, 0xd5, 0x10, 0x00, 0x11, 0x10];
        assert_eq!(find_h2_header(&raw), (None, 1));
    }

    #[test]
    fn h2_nothing_in_zeros() {
        assert_eq!(find_h2_header(&[0u8; 10]), (None, 1));
        assert_eq!(find_h2_header(&[]), (None, 0));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut msbc = Msbc::new();
        let sine: Vec<i16> = (0..1024)
            .map(|i| {
                (327.0 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 16_000.0).sin()) as i16
            })
            .collect();

        // feed the encoder in arbitrary chunk sizes
        let mut data = Vec::new();
        let mut fed = 0;
        while fed < sine.len() {
            let n = msbc.enc_pcm.extend_from_slice(&sine[fed..]);
            fed += n;
            msbc.encode();
            let len = msbc.enc_data.len_out();
            data.extend_from_slice(&msbc.enc_data.filled()[..len]);
            msbc.enc_data.shift(len);
        }
        // 1024 input samples make eight 60-byte packets; 64 samples stay buffered
        assert_eq!(data.len(), 480);

        // feed the decoder the produced stream, again in chunks
        let mut pcm = Vec::new();
        let mut fed = 0;
        while fed < data.len() {
            let n = msbc.dec_data.extend_from_slice(&data[fed..]);
            fed += n;
            msbc.decode();
            let len = msbc.dec_pcm.len_out();
            pcm.extend_from_slice(&msbc.dec_pcm.filled()[..len]);
            msbc.dec_pcm.shift(len);
        }
        assert_eq!(pcm.len(), 960);
    }

    #[test]
    fn sequence_numbers_cycle() {
        let mut msbc = Msbc::new();
        let silence = vec![0i16; PACKET_SAMPLES * 4];
        msbc.enc_pcm.extend_from_slice(&silence);
        msbc.encode();
        let data = msbc.enc_data.filled();
        assert_eq!(data.len(), 4 * PACKET_LEN);
        for (i, packet) in data.chunks_exact(PACKET_LEN).enumerate() {
            assert_eq!(packet[0], 0x01);
            assert_eq!(packet[1], H2_SEQUENCES[i % 4]);
        }
    }

    #[test]
    fn decoder_skips_leading_garbage() {
        let mut msbc = Msbc::new();
        let silence = vec![0i16; PACKET_SAMPLES];
        msbc.enc_pcm.extend_from_slice(&silence);
        msbc.encode();
        let packet: Vec<u8> = msbc.enc_data.filled().to_vec();
        msbc.enc_data.shift(packet.len());

        msbc.dec_data.extend_from_slice(&[0xd5, 0x10, 0x00]);
        msbc.dec_data.extend_from_slice(&packet);
        msbc.decode();
        assert_eq!(msbc.dec_pcm.len_out(), PACKET_SAMPLES);
    }
}
