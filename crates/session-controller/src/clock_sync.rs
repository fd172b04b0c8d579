//! Per-connection clock offset and latency estimation.
//!
//! A participant sends `clock_probe{t1}`; the server stamps `t2` on receipt and
//! `t3` when replying; the participant records `t4` when the reply arrives.
//!
//! ```text
//! rtt    = (t4 - t1) - (t3 - t2)
//! offset = ((t2 - t1) + (t3 - t4)) / 2      // host clock minus local clock
//! ```
//!
//! The engine keeps the most recent N accepted samples and smooths offset and
//! RTT with an exponential moving average over them. A sample whose RTT exceeds
//! three times the median of recently observed RTTs (accepted or not, and never
//! less than [`OUTLIER_FLOOR_MS`]) is an outlier and is dropped. Because
//! rejected RTTs still enter the median, a lasting latency change is accepted
//! after a few rounds instead of being filtered forever.
//!
//! Fewer than two samples is not an error: [`ClockSyncEngine::corrected_host_time`]
//! falls back to the raw local timestamp and flags the result as degraded.
//!
//! The same engine runs on both ends: the server uses it to order commands, the
//! participant uses it to map host-time broadcasts onto its local clock.

use std::collections::VecDeque;

/// Default number of retained samples.
pub const DEFAULT_SAMPLE_WINDOW: usize = 8;

/// EMA smoothing factor. Higher weights recent samples more.
pub const EMA_ALPHA: f64 = 0.3;

/// Outlier threshold as a multiple of the median RTT.
const OUTLIER_FACTOR: i64 = 3;

/// The outlier rule needs a meaningful median.
const OUTLIER_MIN_SAMPLES: usize = 3;

/// RTTs at or below this are never outliers, whatever the median.
pub const OUTLIER_FLOOR_MS: i64 = 50;

/// Current time on the host clock (Unix epoch milliseconds).
#[must_use]
pub fn host_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One completed probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Participant send time (local clock).
    pub t1: i64,
    /// Server receive time (host clock).
    pub t2: i64,
    /// Server reply time (host clock).
    pub t3: i64,
    /// Participant receive time (local clock).
    pub t4: i64,
}

impl ClockSample {
    #[must_use]
    pub fn rtt_ms(&self) -> i64 {
        self.t4
            .saturating_sub(self.t1)
            .saturating_sub(self.t3.saturating_sub(self.t2))
    }

    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.t2
            .saturating_sub(self.t1)
            .saturating_add(self.t3.saturating_sub(self.t4))
            / 2
    }

    /// Server processing cannot take negative time and the round trip cannot be
    /// shorter than zero.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.t3 >= self.t2 && self.rtt_ms() >= 0
    }
}

/// How much the engine's estimate can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncQuality {
    /// No samples yet.
    Unknown,
    /// One sample: usable for display, not for ordering.
    Degraded,
    /// Two or more samples.
    Good,
}

impl SyncQuality {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncQuality::Unknown => "unknown",
            SyncQuality::Degraded => "degraded",
            SyncQuality::Good => "good",
        }
    }
}

/// Result of feeding a sample to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    Invalid,
    Outlier,
}

/// A local timestamp translated to the host clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectedTime {
    pub host_time_ms: i64,
    /// True when the raw local timestamp was used because the estimate is not
    /// yet good enough.
    pub degraded: bool,
}

/// Copy of an engine's estimate, sent from a connection to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub offset_ms: i64,
    pub rtt_ms: i64,
    pub quality: SyncQuality,
}

impl ClockSnapshot {
    /// Snapshot of an engine with no samples.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            offset_ms: 0,
            rtt_ms: 0,
            quality: SyncQuality::Unknown,
        }
    }

    /// Translate a local timestamp using this snapshot.
    #[must_use]
    pub fn corrected_host_time(&self, local_ms: i64) -> CorrectedTime {
        if self.quality == SyncQuality::Good {
            CorrectedTime {
                host_time_ms: local_ms.saturating_add(self.offset_ms),
                degraded: false,
            }
        } else {
            CorrectedTime {
                host_time_ms: local_ms,
                degraded: true,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetainedSample {
    offset_ms: i64,
    rtt_ms: i64,
}

/// Offset/latency estimator for one connection.
#[derive(Debug, Clone)]
pub struct ClockSyncEngine {
    window: usize,
    samples: VecDeque<RetainedSample>,
    /// RTTs of recent valid samples, outliers included.
    observed_rtts: VecDeque<i64>,
    offset_ema: f64,
    rtt_ema: f64,
}

impl Default for ClockSyncEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

impl ClockSyncEngine {
    /// Create an engine retaining at most `window` samples (minimum 2).
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            observed_rtts: VecDeque::with_capacity(window),
            offset_ema: 0.0,
            rtt_ema: 0.0,
        }
    }

    /// Feed one completed probe round.
    pub fn record(&mut self, sample: ClockSample) -> SampleOutcome {
        if !sample.is_valid() {
            tracing::debug!(
                target: "sc.clock_sync",
                t1 = sample.t1,
                t2 = sample.t2,
                t3 = sample.t3,
                t4 = sample.t4,
                "Rejected invalid clock sample"
            );
            return SampleOutcome::Invalid;
        }

        let rtt_ms = sample.rtt_ms();
        let outlier = self.observed_rtts.len() >= OUTLIER_MIN_SAMPLES && {
            let median = self.median_observed_rtt();
            let threshold = median.saturating_mul(OUTLIER_FACTOR).max(OUTLIER_FLOOR_MS);
            if rtt_ms > threshold {
                tracing::debug!(
                    target: "sc.clock_sync",
                    rtt_ms,
                    median_rtt_ms = median,
                    "Discarded outlier clock sample"
                );
            }
            rtt_ms > threshold
        };

        if self.observed_rtts.len() == self.window {
            self.observed_rtts.pop_front();
        }
        self.observed_rtts.push_back(rtt_ms);
        if outlier {
            return SampleOutcome::Outlier;
        }

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(RetainedSample {
            offset_ms: sample.offset_ms(),
            rtt_ms,
        });
        self.recompute();

        SampleOutcome::Accepted
    }

    #[allow(clippy::cast_precision_loss)]
    fn recompute(&mut self) {
        let mut iter = self.samples.iter();
        let Some(first) = iter.next() else {
            self.offset_ema = 0.0;
            self.rtt_ema = 0.0;
            return;
        };

        let mut offset = first.offset_ms as f64;
        let mut rtt = first.rtt_ms as f64;
        for s in iter {
            offset = EMA_ALPHA * s.offset_ms as f64 + (1.0 - EMA_ALPHA) * offset;
            rtt = EMA_ALPHA * s.rtt_ms as f64 + (1.0 - EMA_ALPHA) * rtt;
        }
        self.offset_ema = offset;
        self.rtt_ema = rtt;
    }

    fn median_observed_rtt(&self) -> i64 {
        let mut rtts: Vec<i64> = self.observed_rtts.iter().copied().collect();
        rtts.sort_unstable();
        rtts.get(rtts.len() / 2).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn quality(&self) -> SyncQuality {
        match self.samples.len() {
            0 => SyncQuality::Unknown,
            1 => SyncQuality::Degraded,
            _ => SyncQuality::Good,
        }
    }

    /// Smoothed offset (host minus local), `None` before the first sample.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn offset_ms(&self) -> Option<i64> {
        (!self.samples.is_empty()).then(|| self.offset_ema.round() as i64)
    }

    /// Smoothed round trip time, `None` before the first sample.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn rtt_ms(&self) -> Option<i64> {
        (!self.samples.is_empty()).then(|| self.rtt_ema.round() as i64)
    }

    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            offset_ms: self.offset_ms().unwrap_or(0),
            rtt_ms: self.rtt_ms().unwrap_or(0),
            quality: self.quality(),
        }
    }

    /// Translate a participant-local timestamp to host time.
    ///
    /// With fewer than two samples the local timestamp is returned unchanged and
    /// flagged as degraded.
    #[must_use]
    pub fn corrected_host_time(&self, local_ms: i64) -> CorrectedTime {
        self.snapshot().corrected_host_time(local_ms)
    }

    /// Translate a host timestamp to the participant's local clock.
    #[must_use]
    pub fn local_time_for_host(&self, host_ms: i64) -> i64 {
        if self.quality() == SyncQuality::Good {
            host_ms.saturating_sub(self.offset_ms().unwrap_or(0))
        } else {
            host_ms
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Build a sample for a participant whose clock reads `host - offset`.
    fn sample(host_send: i64, offset: i64, up_ms: i64, server_ms: i64, down_ms: i64) -> ClockSample {
        let t1 = host_send - offset;
        let t2 = host_send + up_ms;
        let t3 = t2 + server_ms;
        let t4 = t3 + down_ms - offset;
        ClockSample { t1, t2, t3, t4 }
    }

    #[test]
    fn test_sample_math() {
        let s = sample(10_000, 200, 20, 2, 20);
        assert_eq!(s.rtt_ms(), 40);
        assert_eq!(s.offset_ms(), 200);
        assert!(s.is_valid());
    }

    #[test]
    fn test_invalid_samples_are_rejected() {
        let mut engine = ClockSyncEngine::default();

        // Server replied before it received
        let s = ClockSample { t1: 0, t2: 100, t3: 90, t4: 50 };
        assert_eq!(engine.record(s), SampleOutcome::Invalid);

        // Negative round trip
        let s = ClockSample { t1: 100, t2: 100, t3: 150, t4: 120 };
        assert_eq!(engine.record(s), SampleOutcome::Invalid);

        assert_eq!(engine.sample_count(), 0);
    }

    #[test]
    fn test_quality_progression() {
        let mut engine = ClockSyncEngine::default();
        assert_eq!(engine.quality(), SyncQuality::Unknown);
        assert_eq!(engine.offset_ms(), None);

        engine.record(sample(1_000, 50, 10, 1, 10));
        assert_eq!(engine.quality(), SyncQuality::Degraded);

        engine.record(sample(6_000, 50, 10, 1, 10));
        assert_eq!(engine.quality(), SyncQuality::Good);
    }

    #[test]
    fn test_degraded_falls_back_to_local_time() {
        let mut engine = ClockSyncEngine::default();
        let corrected = engine.corrected_host_time(5_000);
        assert_eq!(corrected, CorrectedTime { host_time_ms: 5_000, degraded: true });

        engine.record(sample(1_000, 300, 10, 1, 10));
        let corrected = engine.corrected_host_time(5_000);
        assert!(corrected.degraded, "One sample is not enough to correct");
        assert_eq!(corrected.host_time_ms, 5_000);
        assert_eq!(engine.local_time_for_host(5_000), 5_000);
    }

    #[test]
    fn test_offset_converges_with_stable_rtt() {
        let mut engine = ClockSyncEngine::default();
        // Stable RTT well below 100ms, small asymmetric jitter
        let legs = [(20, 24), (23, 19), (21, 22), (25, 20), (19, 23), (22, 21)];
        for (i, (up, down)) in legs.iter().enumerate() {
            let host_send = 1_000 + i64::try_from(i).unwrap() * 5_000;
            assert_eq!(
                engine.record(sample(host_send, 200, *up, 1, *down)),
                SampleOutcome::Accepted
            );
        }

        let offset = engine.offset_ms().unwrap();
        assert!((offset - 200).abs() <= 20, "offset {offset} not within 20ms of 200");

        let corrected = engine.corrected_host_time(10_000);
        assert!(!corrected.degraded);
        assert!((corrected.host_time_ms - 10_200).abs() <= 20);
        assert!((engine.local_time_for_host(10_200) - 10_000).abs() <= 20);
    }

    #[test]
    fn test_outlier_is_discarded() {
        let mut engine = ClockSyncEngine::default();
        for i in 0..3 {
            engine.record(sample(i * 5_000, 100, 15, 1, 15));
        }
        let before = engine.offset_ms();

        // 400ms round trip with a wildly skewed leg
        let outcome = engine.record(sample(20_000, 100, 390, 1, 10));
        assert_eq!(outcome, SampleOutcome::Outlier);
        assert_eq!(engine.sample_count(), 3);
        assert_eq!(engine.offset_ms(), before);
    }

    #[test]
    fn test_lasting_rtt_increase_is_adopted() {
        let mut engine = ClockSyncEngine::default();
        for i in 0..3 {
            engine.record(sample(i * 5_000, 100, 15, 1, 15));
        }

        // Route change: every later round trip takes 200ms
        let outcomes: Vec<SampleOutcome> = (3..8)
            .map(|i| engine.record(sample(i * 5_000, 100, 100, 1, 100)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                SampleOutcome::Outlier,
                SampleOutcome::Outlier,
                SampleOutcome::Outlier,
                SampleOutcome::Accepted,
                SampleOutcome::Accepted,
            ]
        );
        assert_eq!(engine.sample_count(), 5);
        assert!(engine.rtt_ms().unwrap() > 60);
        assert_eq!(engine.offset_ms(), Some(100));
    }

    #[test]
    fn test_low_rtt_jitter_stays_under_floor() {
        let mut engine = ClockSyncEngine::default();
        for i in 0..4 {
            engine.record(sample(i * 5_000, 0, 1, 0, 1));
        }
        // 20x the median, but still a fast round trip
        assert_eq!(
            engine.record(sample(20_000, 0, 20, 0, 20)),
            SampleOutcome::Accepted
        );
        assert_eq!(
            engine.record(sample(25_000, 0, 40, 0, 40)),
            SampleOutcome::Outlier
        );
    }

    #[test]
    fn test_outlier_rule_needs_three_samples() {
        let mut engine = ClockSyncEngine::default();
        engine.record(sample(0, 0, 10, 1, 10));
        engine.record(sample(5_000, 0, 10, 1, 10));
        assert_eq!(
            engine.record(sample(10_000, 0, 200, 1, 200)),
            SampleOutcome::Accepted
        );
    }

    #[test]
    fn test_window_is_bounded() {
        let mut engine = ClockSyncEngine::new(4);
        for i in 0..10 {
            engine.record(sample(i * 5_000, 0, 10, 1, 10));
        }
        assert_eq!(engine.sample_count(), 4);
    }

    #[test]
    fn test_old_offset_ages_out_of_window() {
        let mut engine = ClockSyncEngine::new(3);
        engine.record(sample(0, 1_000, 10, 1, 10));
        for i in 1..=3 {
            engine.record(sample(i * 5_000, 0, 10, 1, 10));
        }
        assert_eq!(engine.offset_ms(), Some(0));
    }

    #[test]
    fn test_snapshot_matches_engine() {
        let mut engine = ClockSyncEngine::default();
        assert_eq!(engine.snapshot(), ClockSnapshot::unknown());

        engine.record(sample(0, -40, 5, 1, 5));
        engine.record(sample(5_000, -40, 5, 1, 5));
        let snap = engine.snapshot();
        assert_eq!(snap.quality, SyncQuality::Good);
        assert_eq!(snap.offset_ms, -40);
        assert_eq!(snap.rtt_ms, 10);
        assert_eq!(snap.corrected_host_time(1_000).host_time_ms, 960);
    }
}
