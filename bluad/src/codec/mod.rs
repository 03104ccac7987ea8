//! Audio codec handles.
//!
//! The I/O engine drives every codec through the opaque [FrameEncoder] and
//! [FrameDecoder] handles defined here. SBC (and its mSBC telephony
//! variant) is implemented in-crate; vendor codecs (AAC, aptX, LDAC) are
//! injected by the embedding application through [VendorCodecs] factories,
//! keeping their libraries outside of this crate.

use std::{fmt, sync::Arc};

pub mod ldac;
pub mod msbc;
pub mod sbc;

/// Codec of a transport, together with its 16-bit bus identifier.
///
/// A2DP transports use the A2DP codec id namespace, SCO transports the HFP
/// one; the owning profile disambiguates.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, strum::Display)]
#[non_exhaustive]
pub enum Codec {
    /// A2DP mandatory subband codec.
    #[strum(serialize = "SBC")]
    Sbc,
    /// MPEG-1 audio (layer III).
    #[strum(serialize = "MP3")]
    Mpeg12,
    /// MPEG-2/4 AAC.
    #[strum(serialize = "AAC")]
    Aac,
    /// Qualcomm aptX.
    #[strum(serialize = "aptX")]
    AptX,
    /// Sony LDAC.
    #[strum(serialize = "LDAC")]
    Ldac,
    /// HFP/HSP narrow-band telephony codec; pass-through on the SCO link.
    #[strum(serialize = "CVSD")]
    Cvsd,
    /// HFP wide-band telephony codec.
    #[strum(serialize = "mSBC")]
    Msbc,
    /// SCO transport before HFP codec selection finished.
    #[strum(serialize = "undefined")]
    Undefined,
}

impl Codec {
    /// The 16-bit codec identifier exposed on the bus.
    pub fn id(self) -> u16 {
        match self {
            Self::Sbc => 0x00,
            Self::Mpeg12 => 0x01,
            Self::Aac => 0x02,
            Self::AptX => 0xff01,
            Self::Ldac => 0xff02,
            Self::Cvsd => 0x01,
            Self::Msbc => 0x02,
            Self::Undefined => 0xffff,
        }
    }
}

/// Codec operation failure.
///
/// Codec errors never tear a stream down; the I/O loop logs them, drops the
/// offending frame and continues.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodecError(pub String);

impl CodecError {
    /// Creates a codec error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for crate::Error {
    fn from(err: CodecError) -> Self {
        Self::with_message(crate::ErrorKind::Codec(err.0.clone()), err.0)
    }
}

/// Outcome of one encode call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Encoded {
    /// PCM samples consumed from the input.
    pub consumed: usize,
    /// Bytes written to the output.
    pub written: usize,
    /// Codec frames contained in the written bytes.
    pub frames: usize,
}

/// Outcome of one decode call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Decoded {
    /// Encoded bytes consumed from the input.
    pub consumed: usize,
    /// PCM samples written to the output.
    pub samples: usize,
}

/// An opaque PCM encoder handle.
///
/// One call consumes at least [codesize](Self::codesize) samples and
/// produces at most [frame_len](Self::frame_len) bytes.
pub trait FrameEncoder: Send {
    /// Minimum number of interleaved PCM samples consumed per encode call.
    fn codesize(&self) -> usize;
    /// Maximum number of bytes produced per encode call.
    fn frame_len(&self) -> usize;
    /// Encodes one batch from `pcm` into `out`.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<Encoded, CodecError>;
}

/// An opaque PCM decoder handle.
pub trait FrameDecoder: Send {
    /// Decodes one frame from `data` into `pcm`.
    fn decode(&mut self, data: &[u8], pcm: &mut [i16]) -> Result<Decoded, CodecError>;
}

/// An LDAC encoder handle with adjustable encode quality.
pub trait QualityControl: FrameEncoder {
    /// Current encode quality index, 0 (high) to 2 (mobile).
    fn eqmid(&self) -> u8;
    /// Selects a new encode quality index.
    fn set_eqmid(&mut self, eqmid: u8);
}

/// Stream parameters handed to a vendor codec factory.
#[derive(Clone, Debug)]
pub struct CodecParams {
    /// Number of interleaved channels.
    pub channels: u8,
    /// Sample rate in Hz.
    pub sampling: u32,
    /// Codec-specific configuration blob negotiated with the peer.
    pub config: Vec<u8>,
    /// Write MTU of the Bluetooth socket.
    pub mtu_write: usize,
}

/// Factory producing an encoder handle for a configured stream.
pub type EncoderFactory =
    Arc<dyn Fn(&CodecParams) -> Result<Box<dyn FrameEncoder>, CodecError> + Send + Sync>;
/// Factory producing a decoder handle for a configured stream.
pub type DecoderFactory =
    Arc<dyn Fn(&CodecParams) -> Result<Box<dyn FrameDecoder>, CodecError> + Send + Sync>;
/// Factory producing a quality-controllable encoder handle.
pub type QualityEncoderFactory =
    Arc<dyn Fn(&CodecParams) -> Result<Box<dyn QualityControl>, CodecError> + Send + Sync>;

/// Vendor codec handles injected by the embedding application.
///
/// A transport whose codec has no registered handle is announced but its
/// I/O task refuses to start, mirroring an unsupported codec.
#[derive(Clone, Default)]
pub struct VendorCodecs {
    /// AAC encoder factory (A2DP source).
    pub aac_encoder: Option<EncoderFactory>,
    /// AAC decoder factory (A2DP sink).
    pub aac_decoder: Option<DecoderFactory>,
    /// aptX encoder factory (A2DP source).
    pub aptx_encoder: Option<EncoderFactory>,
    /// LDAC encoder factory (A2DP source).
    pub ldac_encoder: Option<QualityEncoderFactory>,
}

impl fmt::Debug for VendorCodecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VendorCodecs")
            .field("aac_encoder", &self.aac_encoder.is_some())
            .field("aac_decoder", &self.aac_decoder.is_some())
            .field("aptx_encoder", &self.aptx_encoder.is_some())
            .field("ldac_encoder", &self.ldac_encoder.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_ids_follow_profile_namespaces() {
        assert_eq!(Codec::Sbc.id(), 0x00);
        assert_eq!(Codec::Aac.id(), 0x02);
        assert_eq!(Codec::Cvsd.id(), 0x01);
        assert_eq!(Codec::Msbc.id(), 0x02);
        assert_eq!(Codec::Ldac.id(), 0xff02);
    }

    #[test]
    fn codec_display_names() {
        assert_eq!(Codec::Sbc.to_string(), "SBC");
        assert_eq!(Codec::Msbc.to_string(), "mSBC");
        assert_eq!(Codec::AptX.to_string(), "aptX");
    }
}
