//! LDAC adaptive bit rate.
//!
//! Watches the Bluetooth socket backlog (queued bytes divided by the write
//! MTU) after every encode call and tunes the encoder quality index. The
//! backlog thresholds `(6, 4, 2)` are taken over from the reference
//! implementation; treat them as tunables.

use crate::codec::QualityControl;

/// Lowest encode quality index (mobile use quality).
pub const EQMID_MIN_QUALITY: u8 = 2;

/// Adaptive bit rate state for one LDAC stream.
#[derive(Debug)]
pub struct Abr {
    critical: u32,
    dangerous: u32,
    safe: u32,
    /// Number of consecutive safe observations required for an upstep.
    interval: u32,
    safe_streak: u32,
}

impl Abr {
    /// Creates an ABR tracker that promotes quality after `interval`
    /// consecutive safe observations.
    pub fn new(interval: u32) -> Self {
        Self { critical: 6, dangerous: 4, safe: 2, interval: interval.max(1), safe_streak: 0 }
    }

    /// Overrides the backlog thresholds `(critical, dangerous, safe)`.
    pub fn set_thresholds(&mut self, critical: u32, dangerous: u32, safe: u32) {
        self.critical = critical;
        self.dangerous = dangerous;
        self.safe = safe;
    }

    /// Observes the current backlog, in packets, and adjusts the encoder.
    ///
    /// A backlog at or above the critical threshold drops straight to the
    /// lowest quality; above the dangerous threshold quality steps down by
    /// one. Quality steps back up only after a full interval of safe
    /// observations.
    pub fn observe(&mut self, encoder: &mut dyn QualityControl, backlog_packets: u32) {
        let eqmid = encoder.eqmid();

        if backlog_packets >= self.critical {
            self.safe_streak = 0;
            if eqmid < EQMID_MIN_QUALITY {
                log::debug!("LDAC ABR: backlog {backlog_packets}, dropping to lowest quality");
                encoder.set_eqmid(EQMID_MIN_QUALITY);
            }
            return;
        }

        if backlog_packets >= self.dangerous {
            self.safe_streak = 0;
            if eqmid < EQMID_MIN_QUALITY {
                log::debug!("LDAC ABR: backlog {backlog_packets}, stepping quality down");
                encoder.set_eqmid(eqmid + 1);
            }
            return;
        }

        if backlog_packets <= self.safe {
            self.safe_streak += 1;
            if self.safe_streak >= self.interval {
                self.safe_streak = 0;
                if eqmid > 0 {
                    log::debug!("LDAC ABR: backlog {backlog_packets}, stepping quality up");
                    encoder.set_eqmid(eqmid - 1);
                }
            }
        } else {
            self.safe_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, Encoded, FrameEncoder};

    struct FakeLdac {
        eqmid: u8,
    }

    impl FrameEncoder for FakeLdac {
        fn codesize(&self) -> usize {
            256
        }
        fn frame_len(&self) -> usize {
            660
        }
        fn encode(&mut self, _pcm: &[i16], _out: &mut [u8]) -> Result<Encoded, CodecError> {
            Ok(Encoded::default())
        }
    }

    impl QualityControl for FakeLdac {
        fn eqmid(&self) -> u8 {
            self.eqmid
        }
        fn set_eqmid(&mut self, eqmid: u8) {
            self.eqmid = eqmid;
        }
    }

    #[test]
    fn critical_backlog_drops_to_lowest_quality() {
        let mut abr = Abr::new(8);
        let mut enc = FakeLdac { eqmid: 0 };
        abr.observe(&mut enc, 6);
        assert_eq!(enc.eqmid, 2);
    }

    #[test]
    fn dangerous_backlog_steps_down_once() {
        let mut abr = Abr::new(8);
        let mut enc = FakeLdac { eqmid: 0 };
        abr.observe(&mut enc, 4);
        assert_eq!(enc.eqmid, 1);
        abr.observe(&mut enc, 5);
        assert_eq!(enc.eqmid, 2);
        // already at the floor
        abr.observe(&mut enc, 5);
        assert_eq!(enc.eqmid, 2);
    }

    #[test]
    fn sustained_safe_backlog_steps_up() {
        let mut abr = Abr::new(4);
        let mut enc = FakeLdac { eqmid: 2 };
        for _ in 0..3 {
            abr.observe(&mut enc, 0);
        }
        assert_eq!(enc.eqmid, 2, "upstep needs a full safe interval");
        abr.observe(&mut enc, 0);
        assert_eq!(enc.eqmid, 1);
    }

    #[test]
    fn middling_backlog_resets_the_streak() {
        let mut abr = Abr::new(2);
        let mut enc = FakeLdac { eqmid: 1 };
        abr.observe(&mut enc, 0);
        abr.observe(&mut enc, 3); // between safe and dangerous
        abr.observe(&mut enc, 0);
        assert_eq!(enc.eqmid, 1);
        abr.observe(&mut enc, 0);
        assert_eq!(enc.eqmid, 0);
    }
}
