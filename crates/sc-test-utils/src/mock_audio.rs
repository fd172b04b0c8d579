//! Recording audio engine.
//!
//! Behaves like `SoftwareTransport` and logs every transport call, so tests
//! can assert what the renderer did. An optional skew makes the reported
//! position run ahead of (or behind) the true one, as a drifting device would.
//! [`MockAudioEngine::end_track`] plays the part of the player reaching the end
//! of a track.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = MockAudioEngine::new();
//! let calls = engine.calls();
//! let mut renderer = PlaybackRenderer::new(Box::new(engine));
//! renderer.apply(&state, now);
//! assert_eq!(calls.lock().unwrap().first(), Some(&AudioCall::Load("a".into())));
//! ```

use session_controller::audio::{AudioEngine, SoftwareTransport, TrackEndNotifier};
use std::sync::{Arc, Mutex};

/// One transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCall {
    Load(String),
    Play,
    Pause,
    Seek(u64),
}

/// Audio engine that records its calls.
#[derive(Debug, Clone, Default)]
pub struct MockAudioEngine {
    transport: SoftwareTransport,
    skew_ms: i64,
    calls: Arc<Mutex<Vec<AudioCall>>>,
    notifier: Arc<Mutex<Option<TrackEndNotifier>>>,
}

impl MockAudioEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report positions `skew_ms` away from the true one.
    #[must_use]
    pub fn with_skew(mut self, skew_ms: i64) -> Self {
        self.skew_ms = skew_ms;
        self
    }

    /// Shared call log; stays valid after the engine is boxed.
    #[must_use]
    pub fn calls(&self) -> Arc<Mutex<Vec<AudioCall>>> {
        Arc::clone(&self.calls)
    }

    /// Seeks recorded so far.
    #[must_use]
    pub fn seeks(calls: &Arc<Mutex<Vec<AudioCall>>>) -> Vec<u64> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                AudioCall::Seek(position) => Some(*position),
                _ => None,
            })
            .collect()
    }

    /// Report that `track_id` played out. Clones share the report channel, so
    /// a clone kept by the test can fire after the engine is boxed.
    ///
    /// Returns `false` until a session installed its notifier, or once the
    /// session is gone.
    pub fn end_track(&self, track_id: &str) -> bool {
        self.notifier
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|notifier| notifier.notify(track_id))
    }

    fn record(&self, call: AudioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl AudioEngine for MockAudioEngine {
    fn load(&mut self, track_id: &str) {
        self.record(AudioCall::Load(track_id.to_string()));
        self.transport.load(track_id);
    }

    fn play(&mut self) {
        self.record(AudioCall::Play);
        self.transport.play();
    }

    fn pause(&mut self) {
        self.record(AudioCall::Pause);
        self.transport.pause();
    }

    fn seek(&mut self, position_ms: u64) {
        self.record(AudioCall::Seek(position_ms));
        // The skew is a property of the device, it survives a seek
        let true_position = i64::try_from(position_ms).unwrap() - self.skew_ms;
        self.transport.seek(u64::try_from(true_position.max(0)).unwrap());
    }

    fn current_position_ms(&self) -> u64 {
        let position = i64::try_from(self.transport.current_position_ms()).unwrap() + self.skew_ms;
        u64::try_from(position.max(0)).unwrap()
    }

    fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    fn current_track(&self) -> Option<&str> {
        self.transport.current_track()
    }

    fn set_track_end_notifier(&mut self, notifier: TrackEndNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }
}
