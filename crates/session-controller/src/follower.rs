//! Rendering state broadcasts on a local audio engine.
//!
//! A follower never decides playback; it converts each admitted broadcast into
//! transport calls so that its local position matches the host-predicted one.
//! The host device uses the same renderer for its embedded engine, with an
//! identity clock.

use crate::audio::{AudioEngine, TrackEndNotifier};
use crate::clock_sync::ClockSyncEngine;
use sync_protocol::{PlaybackState, RevisionGate, TransportState};

/// Drift tolerated before the renderer seeks.
pub const DEFAULT_DRIFT_TOLERANCE_MS: u64 = 40;

/// Result of [`PlaybackRenderer::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Revision not newer than the last applied one; nothing was touched.
    Stale,
    Applied {
        /// Whether drift exceeded the tolerance and the engine was repositioned.
        seeked: bool,
    },
}

/// Drives a local [`AudioEngine`] from state broadcasts.
pub struct PlaybackRenderer {
    gate: RevisionGate,
    drift_tolerance_ms: u64,
    engine: Box<dyn AudioEngine>,
}

impl std::fmt::Debug for PlaybackRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackRenderer")
            .field("last_applied", &self.gate.last_applied())
            .field("drift_tolerance_ms", &self.drift_tolerance_ms)
            .finish_non_exhaustive()
    }
}

impl PlaybackRenderer {
    #[must_use]
    pub fn new(engine: Box<dyn AudioEngine>) -> Self {
        Self {
            gate: RevisionGate::new(),
            drift_tolerance_ms: DEFAULT_DRIFT_TOLERANCE_MS,
            engine,
        }
    }

    #[must_use]
    pub fn with_drift_tolerance(mut self, drift_tolerance_ms: u64) -> Self {
        self.drift_tolerance_ms = drift_tolerance_ms;
        self
    }

    /// Route the engine's end-of-track reports to `notifier`.
    pub fn set_track_end_notifier(&mut self, notifier: TrackEndNotifier) {
        self.engine.set_track_end_notifier(notifier);
    }

    /// Apply `state` as of host time `host_now_ms`.
    pub fn apply(&mut self, state: &PlaybackState, host_now_ms: i64) -> RenderOutcome {
        if !self.gate.admit(state.revision) {
            return RenderOutcome::Stale;
        }

        if let Some(track_id) = state.track_id.as_deref() {
            if self.engine.current_track() != Some(track_id) {
                self.engine.load(track_id);
            }
        }

        let target = state.position_at(host_now_ms);
        let drift = target.abs_diff(self.engine.current_position_ms());
        let seeked = drift > self.drift_tolerance_ms;
        if seeked {
            tracing::debug!(
                target: "sc.follower",
                revision = state.revision,
                drift_ms = drift,
                "Correcting local position"
            );
            self.engine.seek(target);
        }

        match state.transport {
            TransportState::Playing if !self.engine.is_playing() => self.engine.play(),
            TransportState::Paused if self.engine.is_playing() => self.engine.pause(),
            _ => {}
        }

        RenderOutcome::Applied { seeked }
    }

    /// Apply `state` on a participant whose clock is `local_now_ms`, mapped to
    /// host time through the participant's own clock estimate.
    pub fn apply_local(
        &mut self,
        state: &PlaybackState,
        clock: &ClockSyncEngine,
        local_now_ms: i64,
    ) -> RenderOutcome {
        let host_now = clock.corrected_host_time(local_now_ms).host_time_ms;
        self.apply(state, host_now)
    }

    /// Signed drift of the local engine against `state` at `host_now_ms`.
    /// Positive means the local engine is ahead.
    #[must_use]
    pub fn drift_ms(&self, state: &PlaybackState, host_now_ms: i64) -> i64 {
        let target = i64::try_from(state.position_at(host_now_ms)).unwrap_or(i64::MAX);
        let actual = i64::try_from(self.engine.current_position_ms()).unwrap_or(i64::MAX);
        actual.saturating_sub(target)
    }

    #[must_use]
    pub fn last_revision(&self) -> Option<u64> {
        self.gate.last_applied()
    }

    #[must_use]
    pub fn engine(&self) -> &dyn AudioEngine {
        self.engine.as_ref()
    }
}
