//! Audio stream rate synchronisation.
//!
//! Throttles the producing side of a stream to the nominal sample rate and
//! reports the fraction of wall time spent on codec work. The busy interval
//! feeds the transport delay estimate exposed on the bus.

use std::time::Duration;
use tokio::time::Instant;

/// Monotonic-clock pacer for a stream at a fixed sample rate.
#[derive(Debug)]
pub struct RateSync {
    rate: u32,
    anchor: Instant,
    /// End of the previous synchronised slice.
    slice: Instant,
    frames: u64,
    busy: Duration,
}

impl RateSync {
    /// Creates a pacer anchored at the current instant.
    pub fn new(rate: u32) -> Self {
        let now = Instant::now();
        Self { rate, anchor: now, slice: now, frames: 0, busy: Duration::ZERO }
    }

    /// Total number of synchronised frames since the anchor.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Re-anchors the pacer at the current instant.
    ///
    /// Called when a stream (re)starts, so that time drift is measured from
    /// the first actual sample and not from task creation.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.anchor = now;
        self.slice = now;
        self.frames = 0;
        self.busy = Duration::ZERO;
    }

    /// True when no frames have been synchronised since the last reset.
    pub fn is_reset(&self) -> bool {
        self.frames == 0
    }

    /// Accounts for `frames` just produced and sleeps until their ideal
    /// wall-clock time.
    ///
    /// The interval between the end of the previous slice and the entry to
    /// this call is recorded as the busy (codec) time of this slice. If the
    /// clock has already run more than one slice period past the ideal
    /// time, sleeping is skipped and the anchor moves forward; lost time is
    /// never compensated by bursting.
    pub async fn sync(&mut self, frames: usize) {
        let entry = Instant::now();
        self.busy = entry.saturating_duration_since(self.slice);

        let period = Duration::from_nanos(frames as u64 * 1_000_000_000 / self.rate as u64);
        self.frames += frames as u64;
        let ideal = self.anchor + Duration::from_nanos(self.frames * 1_000_000_000 / self.rate as u64);

        if entry > ideal + period {
            // clock jump or prolonged stall
            self.anchor += entry.duration_since(ideal);
            self.slice = entry;
            return;
        }

        tokio::time::sleep_until(ideal).await;
        self.slice = ideal.max(entry);
    }

    /// The busy interval of the most recent slice, in microseconds.
    pub fn busy_usec(&self) -> u64 {
        self.busy.as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paces_at_nominal_rate() {
        let mut asrs = RateSync::new(48_000);
        let start = Instant::now();
        // 10 batches of 4800 frames = 1 s of audio
        for _ in 0..10 {
            asrs.sync(4800).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(999), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "elapsed {elapsed:?}");
        assert_eq!(asrs.frames(), 48_000);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_skips_sleep_without_burst() {
        let mut asrs = RateSync::new(16_000);
        asrs.sync(1600).await; // 100 ms slice

        // Simulate a stall far beyond one period.
        tokio::time::advance(Duration::from_secs(2)).await;

        let before = Instant::now();
        asrs.sync(1600).await;
        // No sleep: the pacer re-anchors instead of letting the producer rush.
        assert!(before.elapsed() < Duration::from_millis(1));

        // The following slice is paced normally again.
        let before = Instant::now();
        asrs.sync(1600).await;
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_millis(99), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_reflects_time_between_slices() {
        let mut asrs = RateSync::new(8_000);
        asrs.sync(800).await;
        tokio::time::advance(Duration::from_millis(30)).await;
        asrs.sync(800).await;
        // 30 ms of "codec work" between slice end and sync entry
        let busy = asrs.busy_usec();
        assert!((29_000..=31_000).contains(&busy), "busy {busy}");
    }
}
