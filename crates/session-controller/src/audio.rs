//! Boundary to the local audio engine.
//!
//! Decoding and output live outside this crate. The session engine only
//! actuates the transport and reads the position back. Track-end notifications
//! flow the other way: the session hands each embedded engine a
//! [`TrackEndNotifier`], and the engine fires it from its end-of-stream callback.

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Track ends buffered before further reports are dropped.
const TRACK_END_BUFFER: usize = 8;

/// Sending half an engine uses to report that a track played to its end.
#[derive(Debug, Clone)]
pub struct TrackEndNotifier {
    sender: mpsc::Sender<String>,
}

impl TrackEndNotifier {
    /// Create a notifier and the receiver the session actor listens on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(TRACK_END_BUFFER);
        (Self { sender }, receiver)
    }

    /// Report the end of `track_id`. Safe to call from a non-async callback.
    ///
    /// Returns `false` if the report was dropped (session gone or backlog full).
    pub fn notify(&self, track_id: &str) -> bool {
        match self.sender.try_send(track_id.to_string()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    target: "sc.audio",
                    track_id,
                    error = %e,
                    "Track end report dropped"
                );
                false
            }
        }
    }
}

/// Transport controls of a local player.
pub trait AudioEngine: Send {
    /// Switch to `track_id` at position zero, keeping the transport state.
    fn load(&mut self, track_id: &str);

    fn play(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, position_ms: u64);

    /// Current playback position of the loaded track.
    fn current_position_ms(&self) -> u64;

    fn is_playing(&self) -> bool;

    /// Identifier of the loaded track, if any.
    fn current_track(&self) -> Option<&str>;

    /// Install the notifier to fire when the loaded track plays out.
    ///
    /// Engines without a notion of track length keep the default, which never
    /// reports.
    fn set_track_end_notifier(&mut self, notifier: TrackEndNotifier) {
        let _ = notifier;
    }
}

/// An engine with no audio output whose position follows the monotonic clock.
///
/// Used when the controller runs headless. It keeps a believable position
/// for host migration seeding and for the follower renderer.
#[derive(Debug, Clone)]
pub struct SoftwareTransport {
    track_id: Option<String>,
    position_ms: u64,
    anchored_at: Instant,
    playing: bool,
}

impl Default for SoftwareTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            track_id: None,
            position_ms: 0,
            anchored_at: Instant::now(),
            playing: false,
        }
    }

    fn reanchor(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
        self.anchored_at = Instant::now();
    }
}

impl AudioEngine for SoftwareTransport {
    fn load(&mut self, track_id: &str) {
        self.track_id = Some(track_id.to_string());
        self.reanchor(0);
    }

    fn play(&mut self) {
        if !self.playing {
            let position = self.current_position_ms();
            self.reanchor(position);
            self.playing = true;
        }
    }

    fn pause(&mut self) {
        if self.playing {
            let position = self.current_position_ms();
            self.reanchor(position);
            self.playing = false;
        }
    }

    fn seek(&mut self, position_ms: u64) {
        self.reanchor(position_ms);
    }

    fn current_position_ms(&self) -> u64 {
        if !self.playing {
            return self.position_ms;
        }
        let elapsed = u64::try_from(self.anchored_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.position_ms.saturating_add(elapsed)
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn current_track(&self) -> Option<&str> {
        self.track_id.as_deref()
    }
}
