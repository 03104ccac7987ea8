//! SBC subband codec.
//!
//! Implements the A2DP low-complexity subband codec: polyphase
//! analysis/synthesis filterbank, loudness and SNR bit allocation, and the
//! standard frame layout with CRC. The same machinery drives the fixed
//! configuration mSBC variant used for wide-band telephony, which differs
//! only in its frame header and locked parameters.

use crate::codec::{CodecError, Decoded, Encoded, FrameDecoder, FrameEncoder};

/// SBC frame sync word.
pub const SYNCWORD: u8 = 0x9c;
/// mSBC frame sync word.
pub const MSBC_SYNCWORD: u8 = 0xad;

const MAX_SUBBANDS: usize = 8;
const MAX_BLOCKS: usize = 16;
const MAX_CHANNELS: usize = 2;

/// Prototype filter for 8-subband analysis, 80 taps in fixed point.
const PROTO_8_80: [i32; 80] = [
    0, 131, -2877, 5705, -9735, 25068, -36987, 108726, -212481, 706833,
    1, -127, 2919, -5704, 9850, -15248, 40855, -107119, 229507, -664312,
    2, -238, 1440, -3217, 3229, -6530, 16167, -29167, 57181, -203322,
    1, -26, 272, -955, -15, -1322, -1722, 822, -10336, 11269,
    0, 0, -15, 48, -166, 349, -1252, 2385, -7316, 18150,
    0, 1, -11, 43, -130, 216, -417, 937, -2481, 5362,
    0, 0, -3, 10, -37, 45, -82, 105, -147, 153,
    0, 0, 0, 1, -4, 6, -7, 9, -3, 3,
];

/// Prototype filter for 4-subband analysis, 40 taps in fixed point.
const PROTO_4_40: [i32; 40] = [
    0, 358, -5779, 11413, -19470, 50137, -73976, 217410, -424964, 1413666,
    2, -253, 5812, -11408, 19669, -30496, 81743, -214238, 459015, -1328624,
    0, 0, -15, 97, -332, 698, -2504, 4770, -14631, 36300,
    0, 0, -3, 9, -43, 59, -104, 122, -67, 70,
];

/// Loudness allocation offsets per sampling frequency index.
const LOUDNESS_OFFSET_8: [[i8; 8]; 4] = [
    [-2, 0, 0, 0, 0, 0, 0, 1],
    [-3, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
];

const LOUDNESS_OFFSET_4: [[i8; 4]; 4] = [
    [-1, 0, 0, 0],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
];

/// SBC channel mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelMode {
    /// One channel.
    Mono,
    /// Two independently coded channels.
    DualChannel,
    /// Two channels with a shared bitpool.
    Stereo,
    /// Two channels with selective mid/side coding.
    JointStereo,
}

impl ChannelMode {
    /// Number of audio channels.
    pub const fn channels(self) -> usize {
        match self {
            Self::Mono => 1,
            _ => 2,
        }
    }

    const fn header_bits(self) -> u8 {
        match self {
            Self::Mono => 0,
            Self::DualChannel => 1,
            Self::Stereo => 2,
            Self::JointStereo => 3,
        }
    }
}

/// Bit allocation method.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Allocation {
    /// Psychoacoustic loudness allocation.
    Loudness,
    /// Signal-to-noise allocation.
    Snr,
}

/// SBC codec parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SbcConfig {
    /// Sample rate in Hz; one of 16000, 32000, 44100, 48000.
    pub frequency: u32,
    /// Channel mode.
    pub channel_mode: ChannelMode,
    /// Blocks per frame.
    pub blocks: u8,
    /// Subbands, 4 or 8.
    pub subbands: u8,
    /// Bit allocation method.
    pub allocation: Allocation,
    /// Bitpool controlling the bitrate.
    pub bitpool: u8,
    /// mSBC framing: 0xAD sync word, reserved header fields.
    pub msbc: bool,
}

impl SbcConfig {
    /// The fixed mSBC configuration: 16 kHz mono, 15 blocks, 8 subbands,
    /// loudness allocation, bitpool 26.
    pub const fn msbc() -> Self {
        Self {
            frequency: 16_000,
            channel_mode: ChannelMode::Mono,
            blocks: 15,
            subbands: 8,
            allocation: Allocation::Loudness,
            bitpool: 26,
            msbc: true,
        }
    }

    /// Parses a configured A2DP SBC capability blob.
    ///
    /// Expects exactly one bit set per capability field; the configured
    /// bitpool is taken from the maximum bitpool octet.
    pub fn from_a2dp(config: &[u8]) -> Result<Self, CodecError> {
        if config.len() < 4 {
            return Err(CodecError::new("SBC configuration blob too short"));
        }
        let frequency = match config[0] >> 4 {
            0x8 => 16_000,
            0x4 => 32_000,
            0x2 => 44_100,
            0x1 => 48_000,
            v => return Err(CodecError::new(format!("invalid SBC frequency: {v:#x}"))),
        };
        let channel_mode = match config[0] & 0x0f {
            0x8 => ChannelMode::Mono,
            0x4 => ChannelMode::DualChannel,
            0x2 => ChannelMode::Stereo,
            0x1 => ChannelMode::JointStereo,
            v => return Err(CodecError::new(format!("invalid SBC channel mode: {v:#x}"))),
        };
        let blocks = match config[1] >> 4 {
            0x8 => 4,
            0x4 => 8,
            0x2 => 12,
            0x1 => 16,
            v => return Err(CodecError::new(format!("invalid SBC block length: {v:#x}"))),
        };
        let subbands = match (config[1] >> 2) & 0x3 {
            0x2 => 4,
            0x1 => 8,
            v => return Err(CodecError::new(format!("invalid SBC subbands: {v:#x}"))),
        };
        let allocation = match config[1] & 0x3 {
            0x2 => Allocation::Snr,
            0x1 => Allocation::Loudness,
            v => return Err(CodecError::new(format!("invalid SBC allocation: {v:#x}"))),
        };
        let bitpool = config[3];
        let max_bitpool = 250.min(16 * subbands as usize * channel_mode.channels());
        if bitpool < 2 || bitpool as usize > max_bitpool {
            return Err(CodecError::new(format!("invalid SBC bitpool: {bitpool}")));
        }
        Ok(Self { frequency, channel_mode, blocks, subbands, allocation, bitpool, msbc: false })
    }

    /// Number of audio channels.
    pub const fn channels(&self) -> usize {
        self.channel_mode.channels()
    }

    /// Interleaved PCM samples consumed or produced per frame.
    pub const fn codesize(&self) -> usize {
        self.blocks as usize * self.subbands as usize * self.channels()
    }

    /// Encoded frame length in bytes, independent of frame content.
    pub const fn frame_len(&self) -> usize {
        let subbands = self.subbands as usize;
        let blocks = self.blocks as usize;
        let channels = self.channels();
        let bitpool = self.bitpool as usize;
        let head = 4 + (4 * subbands * channels) / 8;
        let audio = match self.channel_mode {
            ChannelMode::Mono | ChannelMode::DualChannel => blocks * channels * bitpool,
            ChannelMode::Stereo => blocks * bitpool,
            ChannelMode::JointStereo => subbands + blocks * bitpool,
        };
        head + (audio + 7) / 8
    }

    fn frequency_index(&self) -> usize {
        match self.frequency {
            16_000 => 0,
            32_000 => 1,
            44_100 => 2,
            _ => 3,
        }
    }

    fn blocks_header_bits(&self) -> u8 {
        match self.blocks {
            4 => 0,
            8 => 1,
            12 => 2,
            _ => 3,
        }
    }
}

// ---------- filterbank ----------

/// Cosine-modulated polyphase filterbank shared by encoder and decoder.
///
/// The layout follows the classic subband structure: an 80-tap (or 40-tap)
/// windowed history, partial sums folded to twice the subband count, and a
/// cosine modulation. Reconstruction gain of the analysis/synthesis pair is
/// normalised at construction from the DC response of the prototype window.
struct Filterbank {
    subbands: usize,
    window: Vec<f64>,
    analysis: Vec<f64>,
    synthesis: Vec<f64>,
    ana_scale: f64,
    syn_scale: f64,
    x: [Vec<f64>; MAX_CHANNELS],
    v: [Vec<f64>; MAX_CHANNELS],
}

impl Filterbank {
    fn new(subbands: usize) -> Self {
        let n = subbands;
        let window: Vec<f64> = match n {
            4 => PROTO_4_40.iter().map(|&c| c as f64).collect(),
            _ => PROTO_8_80.iter().map(|&c| c as f64).collect(),
        };

        let mut analysis = vec![0f64; n * 2 * n];
        for k in 0..n {
            for i in 0..2 * n {
                analysis[k * 2 * n + i] =
                    ((2 * k + 1) as f64 * (i as f64 - n as f64 / 2.0) * std::f64::consts::PI
                        / (2 * n) as f64)
                        .cos();
            }
        }
        let mut synthesis = vec![0f64; 2 * n * n];
        for i in 0..2 * n {
            for k in 0..n {
                synthesis[i * n + k] =
                    ((2 * k + 1) as f64 * (i as f64 + n as f64 / 2.0) * std::f64::consts::PI
                        / (2 * n) as f64)
                        .cos();
            }
        }

        // DC gain of the analysis path into subband zero
        let mut a_dc = 0f64;
        for i in 0..2 * n {
            let mut y = 0f64;
            for j in 0..5 {
                y += window[i + 2 * n * j];
            }
            a_dc += analysis[i] * y;
        }
        let ana_scale = 1.0 / a_dc;

        // DC gain of the synthesis path for a unit subband-zero input
        let mut g_dc = 0f64;
        for j in 0..n {
            for i in 0..10 {
                let u_idx = j + n * i;
                let seg = i / 2;
                let v_idx = match i % 2 {
                    0 => 4 * n * seg + j,
                    _ => 4 * n * seg + 3 * n + j,
                };
                g_dc += window[u_idx] * synthesis[(v_idx % (2 * n)) * n];
            }
        }
        let syn_scale = n as f64 / g_dc;

        Self {
            subbands: n,
            window,
            analysis,
            synthesis,
            ana_scale,
            syn_scale,
            x: [vec![0f64; 10 * n], vec![0f64; 10 * n]],
            v: [vec![0f64; 20 * n], vec![0f64; 20 * n]],
        }
    }

    fn reset(&mut self) {
        for x in &mut self.x {
            x.iter_mut().for_each(|v| *v = 0.0);
        }
        for v in &mut self.v {
            v.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Consumes one block of samples for a channel, producing one subband
    /// sample per subband.
    fn analyze(&mut self, channel: usize, samples: &[f64], out: &mut [f64]) {
        let n = self.subbands;
        let x = &mut self.x[channel];
        x.copy_within(0..9 * n, n);
        for i in 0..n {
            x[i] = samples[n - 1 - i];
        }

        let mut y = [0f64; 2 * MAX_SUBBANDS];
        for (i, y) in y.iter_mut().take(2 * n).enumerate() {
            let mut acc = 0f64;
            for j in 0..5 {
                acc += self.window[i + 2 * n * j] * x[i + 2 * n * j];
            }
            *y = acc;
        }
        for k in 0..n {
            let mut acc = 0f64;
            for (i, y) in y.iter().take(2 * n).enumerate() {
                acc += self.analysis[k * 2 * n + i] * y;
            }
            out[k] = acc * self.ana_scale;
        }
    }

    /// Produces one block of samples for a channel from subband samples.
    fn synthesize(&mut self, channel: usize, sb: &[f64], out: &mut [f64]) {
        let n = self.subbands;
        let v = &mut self.v[channel];
        v.copy_within(0..18 * n, 2 * n);
        for k in 0..2 * n {
            let mut acc = 0f64;
            for (i, s) in sb.iter().take(n).enumerate() {
                acc += self.synthesis[k * n + i] * s;
            }
            v[k] = acc;
        }

        for j in 0..n {
            let mut acc = 0f64;
            for i in 0..10 {
                let seg = i / 2;
                let v_idx = match i % 2 {
                    0 => 4 * n * seg + j,
                    _ => 4 * n * seg + 3 * n + j,
                };
                acc += self.window[j + n * i] * v[v_idx];
            }
            out[j] = acc * self.syn_scale;
        }
    }
}

// ---------- bit allocation ----------

type ScaleFactors = [[u8; MAX_SUBBANDS]; MAX_CHANNELS];
type Bits = [[u8; MAX_SUBBANDS]; MAX_CHANNELS];

/// Derives per-subband sample bit widths from the scale factors.
///
/// Encoder and decoder share this function; the decoder recomputes the
/// allocation from the transmitted scale factors.
fn bit_allocation(config: &SbcConfig, scale_factors: &ScaleFactors) -> Bits {
    let mut bits = Bits::default();
    match config.channel_mode {
        ChannelMode::Mono | ChannelMode::DualChannel => {
            for ch in 0..config.channels() {
                allocate(config, scale_factors, &mut bits, &[ch]);
            }
        }
        ChannelMode::Stereo | ChannelMode::JointStereo => {
            allocate(config, scale_factors, &mut bits, &[0, 1]);
        }
    }
    bits
}

fn bitneed_of(config: &SbcConfig, sf: u8, sb: usize) -> i32 {
    match config.allocation {
        Allocation::Snr => sf as i32,
        Allocation::Loudness => {
            if sf == 0 {
                -5
            } else {
                let offset = if config.subbands == 8 {
                    LOUDNESS_OFFSET_8[config.frequency_index()][sb] as i32
                } else {
                    LOUDNESS_OFFSET_4[config.frequency_index()][sb] as i32
                };
                let loudness = sf as i32 - offset;
                if loudness > 0 {
                    loudness / 2
                } else {
                    loudness
                }
            }
        }
    }
}

fn allocate(config: &SbcConfig, scale_factors: &ScaleFactors, bits: &mut Bits, channels: &[usize]) {
    let subbands = config.subbands as usize;
    let bitpool = config.bitpool as i32;

    let mut bitneed = [[0i32; MAX_SUBBANDS]; MAX_CHANNELS];
    let mut max_bitneed = i32::MIN;
    for &ch in channels {
        for sb in 0..subbands {
            let need = bitneed_of(config, scale_factors[ch][sb], sb);
            bitneed[ch][sb] = need;
            max_bitneed = max_bitneed.max(need);
        }
    }

    // find the bit slice level where the pool is exhausted
    let mut bitcount = 0i32;
    let mut slicecount = 0i32;
    let mut bitslice = max_bitneed + 1;
    loop {
        bitslice -= 1;
        bitcount += slicecount;
        slicecount = 0;
        for &ch in channels {
            for sb in 0..subbands {
                let need = bitneed[ch][sb];
                if need > bitslice + 1 && need < bitslice + 16 {
                    slicecount += 1;
                } else if need == bitslice + 1 {
                    slicecount += 2;
                }
            }
        }
        if bitcount + slicecount >= bitpool || bitslice <= max_bitneed.saturating_sub(64) {
            break;
        }
    }
    if bitcount + slicecount == bitpool {
        bitcount += slicecount;
        bitslice -= 1;
    }

    for &ch in channels {
        for sb in 0..subbands {
            let need = bitneed[ch][sb];
            bits[ch][sb] = if need < bitslice + 2 { 0 } else { (need - bitslice).min(16) as u8 };
        }
    }

    // hand out remaining bits, lower subbands first
    'grow: for &ch in channels {
        for sb in 0..subbands {
            if bitcount >= bitpool {
                break 'grow;
            }
            if bits[ch][sb] >= 2 && bits[ch][sb] < 16 {
                bits[ch][sb] += 1;
                bitcount += 1;
            } else if bitneed[ch][sb] == bitslice + 1 && bitpool > bitcount + 1 {
                bits[ch][sb] = 2;
                bitcount += 2;
            }
        }
    }
    'fill: for &ch in channels {
        for sb in 0..subbands {
            if bitcount >= bitpool {
                break 'fill;
            }
            if bits[ch][sb] < 16 {
                bits[ch][sb] += 1;
                bitcount += 1;
            }
        }
    }
}

// ---------- bitstream ----------

struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, value: u32, bits: u8) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            let byte = self.pos / 8;
            let shift = 7 - self.pos % 8;
            if bit != 0 {
                self.buf[byte] |= 1 << shift;
            }
            self.pos += 1;
        }
    }

    fn bytes(&self) -> usize {
        (self.pos + 7) / 8
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get(&mut self, bits: u8) -> u32 {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.pos / 8;
            let shift = 7 - self.pos % 8;
            let bit = if byte < self.buf.len() { (self.buf[byte] >> shift) & 1 } else { 0 };
            value = value << 1 | bit as u32;
            self.pos += 1;
        }
        value
    }
}

/// CRC-8 over the header fields, join flags and scale factors.
fn crc8(config: &SbcConfig, frame: &[u8]) -> u8 {
    const POLY: u8 = 0x1d;
    let mut crc = 0x0fu8;
    let mut feed = |byte: u8, bits: u8| {
        for i in (8 - bits..8).rev() {
            let bit = (byte >> i) & 1;
            let msb = crc >> 7;
            crc <<= 1;
            if bit ^ msb != 0 {
                crc ^= POLY;
            }
        }
    };
    feed(frame[1], 8);
    feed(frame[2], 8);
    let subbands = config.subbands as usize;
    let join_bits = match config.channel_mode {
        ChannelMode::JointStereo => subbands,
        _ => 0,
    };
    let mut remaining = join_bits + 4 * subbands * config.channels();
    let mut reader = BitReader::new(&frame[4..]);
    while remaining > 0 {
        let n = remaining.min(8) as u8;
        feed((reader.get(n) as u8) << (8 - n), n);
        remaining -= n as usize;
    }
    crc
}

// ---------- encoder ----------

/// SBC encoder handle.
pub struct SbcEncoder {
    config: SbcConfig,
    fb: Filterbank,
}

impl SbcEncoder {
    /// Creates an encoder for the given parameters.
    pub fn new(config: SbcConfig) -> Self {
        Self { config, fb: Filterbank::new(config.subbands as usize) }
    }

    /// Creates an encoder from a configured A2DP capability blob.
    pub fn from_a2dp(blob: &[u8]) -> Result<Self, CodecError> {
        Ok(Self::new(SbcConfig::from_a2dp(blob)?))
    }

    /// The codec parameters.
    pub fn config(&self) -> &SbcConfig {
        &self.config
    }
}

fn scale_factor(max_abs: f64) -> u8 {
    let mut sf = 0u8;
    while sf < 15 && max_abs >= (1u32 << (sf + 1)) as f64 {
        sf += 1;
    }
    sf
}

impl FrameEncoder for SbcEncoder {
    fn codesize(&self) -> usize {
        self.config.codesize()
    }

    fn frame_len(&self) -> usize {
        self.config.frame_len()
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<Encoded, CodecError> {
        let cfg = self.config;
        let subbands = cfg.subbands as usize;
        let blocks = cfg.blocks as usize;
        let channels = cfg.channels();
        let codesize = cfg.codesize();
        let frame_len = cfg.frame_len();

        if pcm.len() < codesize {
            return Err(CodecError::new("not enough PCM samples for one SBC frame"));
        }
        if out.len() < frame_len {
            return Err(CodecError::new("output buffer too small for one SBC frame"));
        }

        // analysis
        let mut sb_samples = [[[0f64; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];
        let mut block_in = [0f64; MAX_SUBBANDS];
        for blk in 0..blocks {
            for ch in 0..channels {
                for (i, s) in block_in.iter_mut().take(subbands).enumerate() {
                    *s = pcm[(blk * subbands + i) * channels + ch] as f64;
                }
                self.fb.analyze(ch, &block_in[..subbands], &mut sb_samples[ch][blk][..subbands]);
            }
        }

        // joint stereo decision per subband
        let mut join = 0u8;
        if cfg.channel_mode == ChannelMode::JointStereo {
            for sb in 0..subbands - 1 {
                let (mut max_l, mut max_r, mut max_m, mut max_s) = (0f64, 0f64, 0f64, 0f64);
                for blk in 0..blocks {
                    let l = sb_samples[0][blk][sb];
                    let r = sb_samples[1][blk][sb];
                    max_l = max_l.max(l.abs());
                    max_r = max_r.max(r.abs());
                    max_m = max_m.max(((l + r) / 2.0).abs());
                    max_s = max_s.max(((l - r) / 2.0).abs());
                }
                let plain = scale_factor(max_l) as u32 + scale_factor(max_r) as u32;
                let joint = scale_factor(max_m) as u32 + scale_factor(max_s) as u32;
                if joint < plain {
                    join |= 1 << (subbands - 1 - sb);
                    for blk in 0..blocks {
                        let l = sb_samples[0][blk][sb];
                        let r = sb_samples[1][blk][sb];
                        sb_samples[0][blk][sb] = (l + r) / 2.0;
                        sb_samples[1][blk][sb] = (l - r) / 2.0;
                    }
                }
            }
        }

        // scale factors
        let mut scale_factors = ScaleFactors::default();
        for ch in 0..channels {
            for sb in 0..subbands {
                let mut max_abs = 0f64;
                for blk in 0..blocks {
                    max_abs = max_abs.max(sb_samples[ch][blk][sb].abs());
                }
                scale_factors[ch][sb] = scale_factor(max_abs);
            }
        }

        let bits = bit_allocation(&cfg, &scale_factors);

        out[..frame_len].fill(0);
        if cfg.msbc {
            out[0] = MSBC_SYNCWORD;
        } else {
            let allocation_bit: u8 = match cfg.allocation {
                Allocation::Loudness => 0,
                Allocation::Snr => 1,
            };
            out[0] = SYNCWORD;
            out[1] = (cfg.frequency_index() as u8) << 6
                | cfg.blocks_header_bits() << 4
                | cfg.channel_mode.header_bits() << 2
                | allocation_bit << 1
                | (subbands == 8) as u8;
            out[2] = cfg.bitpool;
        }

        {
            let mut writer = BitWriter::new(&mut out[4..frame_len]);
            if cfg.channel_mode == ChannelMode::JointStereo {
                writer.put(join as u32, subbands as u8);
            }
            for ch in 0..channels {
                for sb in 0..subbands {
                    writer.put(scale_factors[ch][sb] as u32, 4);
                }
            }
            for blk in 0..blocks {
                for ch in 0..channels {
                    for sb in 0..subbands {
                        let nbits = bits[ch][sb];
                        if nbits == 0 {
                            continue;
                        }
                        let levels = ((1u32 << nbits) - 1) as f64;
                        let range = (1u32 << (scale_factors[ch][sb] + 1)) as f64;
                        let normalized = sb_samples[ch][blk][sb] / range;
                        let q = ((normalized + 1.0) * levels / 2.0).floor().clamp(0.0, levels);
                        writer.put(q as u32, nbits);
                    }
                }
            }
            debug_assert!(4 + writer.bytes() <= frame_len);
        }

        out[3] = crc8(&cfg, &out[..frame_len]);

        Ok(Encoded { consumed: codesize, written: frame_len, frames: 1 })
    }
}

// ---------- decoder ----------

/// SBC decoder handle.
pub struct SbcDecoder {
    config: SbcConfig,
    fb: Filterbank,
}

impl SbcDecoder {
    /// Creates a decoder for the given parameters.
    pub fn new(config: SbcConfig) -> Self {
        Self { config, fb: Filterbank::new(config.subbands as usize) }
    }

    /// Creates a decoder from a configured A2DP capability blob.
    pub fn from_a2dp(blob: &[u8]) -> Result<Self, CodecError> {
        Ok(Self::new(SbcConfig::from_a2dp(blob)?))
    }

    /// The codec parameters.
    pub fn config(&self) -> &SbcConfig {
        &self.config
    }

    /// Resets the synthesis filter history.
    pub fn reset(&mut self) {
        self.fb.reset();
    }
}

impl FrameDecoder for SbcDecoder {
    fn decode(&mut self, data: &[u8], pcm: &mut [i16]) -> Result<Decoded, CodecError> {
        let cfg = self.config;
        let subbands = cfg.subbands as usize;
        let blocks = cfg.blocks as usize;
        let channels = cfg.channels();
        let frame_len = cfg.frame_len();
        let codesize = cfg.codesize();

        if data.len() < frame_len {
            return Err(CodecError::new("truncated SBC frame"));
        }
        if pcm.len() < codesize {
            return Err(CodecError::new("PCM buffer too small for one SBC frame"));
        }
        let expected_sync = if cfg.msbc { MSBC_SYNCWORD } else { SYNCWORD };
        if data[0] != expected_sync {
            return Err(CodecError::new(format!("bad SBC sync word: {:#04x}", data[0])));
        }
        if data[3] != crc8(&cfg, &data[..frame_len]) {
            return Err(CodecError::new("SBC frame CRC mismatch"));
        }

        let mut reader = BitReader::new(&data[4..frame_len]);
        let join = match cfg.channel_mode {
            ChannelMode::JointStereo => reader.get(subbands as u8) as u8,
            _ => 0,
        };
        let mut scale_factors = ScaleFactors::default();
        for ch in 0..channels {
            for sb in 0..subbands {
                scale_factors[ch][sb] = reader.get(4) as u8;
            }
        }
        let bits = bit_allocation(&cfg, &scale_factors);

        let mut sb_samples = [[[0f64; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];
        for blk in 0..blocks {
            for ch in 0..channels {
                for sb in 0..subbands {
                    let nbits = bits[ch][sb];
                    if nbits == 0 {
                        continue;
                    }
                    let levels = ((1u32 << nbits) - 1) as f64;
                    let q = reader.get(nbits) as f64;
                    let range = (1u32 << (scale_factors[ch][sb] + 1)) as f64;
                    sb_samples[ch][blk][sb] = range * ((2.0 * q + 1.0) / levels - 1.0);
                }
            }
        }

        if join != 0 {
            for sb in 0..subbands - 1 {
                if join & 1 << (subbands - 1 - sb) != 0 {
                    for blk in 0..blocks {
                        let m = sb_samples[0][blk][sb];
                        let s = sb_samples[1][blk][sb];
                        sb_samples[0][blk][sb] = m + s;
                        sb_samples[1][blk][sb] = m - s;
                    }
                }
            }
        }

        let mut block_out = [0f64; MAX_SUBBANDS];
        for blk in 0..blocks {
            for ch in 0..channels {
                let sb_in = sb_samples[ch][blk];
                self.fb.synthesize(ch, &sb_in[..subbands], &mut block_out);
                for (i, s) in block_out.iter().take(subbands).enumerate() {
                    let sample = s.round().clamp(i16::MIN as f64, i16::MAX as f64);
                    pcm[(blk * subbands + i) * channels + ch] = sample as i16;
                }
            }
        }

        Ok(Decoded { consumed: frame_len, samples: codesize })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(samples: usize, amplitude: f64, freq: f64, rate: f64) -> Vec<i16> {
        (0..samples)
            .map(|i| (amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin()) as i16)
            .collect()
    }

    #[test]
    fn msbc_frame_geometry() {
        let cfg = SbcConfig::msbc();
        assert_eq!(cfg.codesize(), 120);
        assert_eq!(cfg.frame_len(), 57);
    }

    #[test]
    fn a2dp_blob_round_trip() {
        // 44.1 kHz, joint stereo, 16 blocks, 8 subbands, loudness, bitpool 53
        let blob = [0x21, 0x15, 0x02, 53];
        let cfg = SbcConfig::from_a2dp(&blob).unwrap();
        assert_eq!(cfg.frequency, 44_100);
        assert_eq!(cfg.channel_mode, ChannelMode::JointStereo);
        assert_eq!(cfg.blocks, 16);
        assert_eq!(cfg.subbands, 8);
        assert_eq!(cfg.allocation, Allocation::Loudness);
        assert_eq!(cfg.bitpool, 53);
        assert_eq!(cfg.codesize(), 256);
    }

    #[test]
    fn a2dp_blob_rejects_invalid_fields() {
        assert!(SbcConfig::from_a2dp(&[0x31, 0x15, 0x02, 53]).is_err());
        assert!(SbcConfig::from_a2dp(&[0x21, 0x15, 0x02, 0]).is_err());
        assert!(SbcConfig::from_a2dp(&[0x21, 0x15, 0x02, 255]).is_err());
        assert!(SbcConfig::from_a2dp(&[0x21]).is_err());
    }

    #[test]
    fn encode_produces_fixed_length_frames() {
        let mut enc = SbcEncoder::new(SbcConfig::msbc());
        let pcm = vec![0i16; 120];
        let mut out = vec![0u8; 64];
        let res = enc.encode(&pcm, &mut out).unwrap();
        assert_eq!(res.consumed, 120);
        assert_eq!(res.written, 57);
        assert_eq!(res.frames, 1);
        assert_eq!(out[0], MSBC_SYNCWORD);
    }

    #[test]
    fn encode_rejects_short_buffers() {
        let mut enc = SbcEncoder::new(SbcConfig::msbc());
        let mut out = vec![0u8; 64];
        assert!(enc.encode(&[0i16; 10], &mut out).is_err());
        assert!(enc.encode(&[0i16; 120], &mut [0u8; 8]).is_err());
    }

    #[test]
    fn decode_validates_sync_and_crc() {
        let cfg = SbcConfig::msbc();
        let mut enc = SbcEncoder::new(cfg);
        let mut dec = SbcDecoder::new(cfg);
        let pcm = sine(120, 1000.0, 440.0, 16_000.0);
        let mut frame = vec![0u8; 57];
        enc.encode(&pcm, &mut frame).unwrap();

        let mut out = vec![0i16; 120];
        assert!(dec.decode(&frame, &mut out).is_ok());

        let mut bad = frame.clone();
        bad[0] = SYNCWORD;
        assert!(dec.decode(&bad, &mut out).is_err());

        let mut bad = frame;
        bad[5] ^= 0x10;
        assert!(dec.decode(&bad, &mut out).is_err());
    }

    #[test]
    fn mono_round_trip_geometry() {
        let cfg = SbcConfig::msbc();
        let mut enc = SbcEncoder::new(cfg);
        let mut dec = SbcDecoder::new(cfg);

        let pcm = sine(120 * 8, 8000.0, 500.0, 16_000.0);
        let mut total = 0;
        let mut frame = vec![0u8; 57];
        let mut out = vec![0i16; 120];
        for chunk in pcm.chunks_exact(120) {
            enc.encode(chunk, &mut frame).unwrap();
            let res = dec.decode(&frame, &mut out).unwrap();
            assert_eq!(res.consumed, 57);
            assert_eq!(res.samples, 120);
            total += res.samples;
        }
        assert_eq!(total, 960);
    }

    #[test]
    fn encoder_is_deterministic() {
        let cfg = SbcConfig::msbc();
        let pcm = sine(120, 5000.0, 700.0, 16_000.0);
        let mut a = vec![0u8; 57];
        let mut b = vec![0u8; 57];
        SbcEncoder::new(cfg).encode(&pcm, &mut a).unwrap();
        SbcEncoder::new(cfg).encode(&pcm, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stereo_round_trip_geometry() {
        let blob = [0x21, 0x15, 0x02, 53];
        let mut enc = SbcEncoder::from_a2dp(&blob).unwrap();
        let mut dec = SbcDecoder::from_a2dp(&blob).unwrap();
        let codesize = enc.codesize();
        let frame_len = enc.frame_len();

        let pcm = sine(codesize, 4000.0, 1000.0, 44_100.0);
        let mut frame = vec![0u8; frame_len];
        let mut out = vec![0i16; codesize];
        let res = enc.encode(&pcm, &mut frame).unwrap();
        assert_eq!(res.written, frame_len);
        assert_eq!(frame[0], SYNCWORD);
        let res = dec.decode(&frame, &mut out).unwrap();
        assert_eq!(res.consumed, frame_len);
        assert_eq!(res.samples, codesize);
    }

    #[test]
    fn allocation_respects_the_bitpool() {
        let cfg = SbcConfig::msbc();
        for sf_value in [0u8, 3, 7, 15] {
            let sf = [[sf_value; MAX_SUBBANDS]; MAX_CHANNELS];
            let bits = bit_allocation(&cfg, &sf);
            let total: i32 = bits[0][..8].iter().map(|&b| b as i32).sum();
            assert!(total <= cfg.bitpool as i32, "sf {sf_value}: total {total}");
        }
    }

    #[test]
    fn allocation_is_deterministic_across_encode_and_decode() {
        let cfg = SbcConfig::msbc();
        let sf = [[5u8, 3, 0, 7, 2, 1, 0, 4], [0u8; 8]];
        assert_eq!(bit_allocation(&cfg, &sf), bit_allocation(&cfg, &sf));
    }
}
