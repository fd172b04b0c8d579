//! Applying reconciled commands to a session's playback state.
//!
//! Every function here is a pure transition on [`PlaybackState`]; the session
//! actor is the only caller and therefore the only writer.

use sync_protocol::{
    is_valid_track_id, PlaybackCommand, PlaybackState, TransportState, MAX_QUEUE_LEN,
};

/// Host time at which a command takes effect.
///
/// The corrected command time, clamped so it never precedes the state's
/// reference (positions do not rewind) and never lies in the future.
#[must_use]
pub fn effective_time(state: &PlaybackState, corrected_time_ms: i64, now_ms: i64) -> i64 {
    let floor = state.reference_host_time_ms;
    corrected_time_ms.min(now_ms).max(floor)
}

/// Apply `command` at host time `at_ms`.
///
/// Returns `true` if the state changed; the revision is incremented exactly
/// when it does. `Start` and `VoteSkip` are session-level commands and never
/// change playback state here. `AddTrack` is a no-op once the queue holds
/// [`MAX_QUEUE_LEN`] entries or when the id is malformed; callers reject those
/// up front with [`queue_has_room`] and [`is_valid_track_id`].
pub fn apply_command(state: &mut PlaybackState, command: &PlaybackCommand, at_ms: i64) -> bool {
    let changed = match command {
        PlaybackCommand::Start | PlaybackCommand::VoteSkip => false,
        PlaybackCommand::Play => set_transport(state, TransportState::Playing, at_ms),
        PlaybackCommand::Pause => set_transport(state, TransportState::Paused, at_ms),
        PlaybackCommand::Seek { position_ms } => {
            state.position_ms = *position_ms;
            state.reference_host_time_ms = at_ms;
            true
        }
        PlaybackCommand::NextTrack => next_track(state, at_ms),
        PlaybackCommand::PrevTrack => prev_track(state, at_ms),
        PlaybackCommand::AddTrack { track_id } => add_track(state, track_id, at_ms),
        PlaybackCommand::RemoveTrack { index } => remove_track(state, *index, at_ms),
    };

    if changed {
        state.revision = state.revision.saturating_add(1);
    }
    changed
}

/// Re-anchor the state at `at_ms` without changing what is audible.
///
/// Used when a newly elected host seeds the session: the position it reported
/// becomes authoritative at `at_ms`. Always increments the revision so every
/// participant re-synchronizes.
pub fn reseed(state: &mut PlaybackState, position_ms: u64, playing: bool, at_ms: i64) {
    state.position_ms = position_ms;
    state.reference_host_time_ms = at_ms;
    state.transport = if playing {
        TransportState::Playing
    } else {
        TransportState::Paused
    };
    state.revision = state.revision.saturating_add(1);
}

fn set_transport(state: &mut PlaybackState, transport: TransportState, at_ms: i64) -> bool {
    if state.transport == transport {
        return false;
    }
    state.position_ms = state.position_at(at_ms);
    state.reference_host_time_ms = at_ms;
    state.transport = transport;
    true
}

fn select_track(state: &mut PlaybackState, index: usize, at_ms: i64) {
    state.current_index = Some(index);
    state.track_id = state.queue.get(index).cloned();
    state.position_ms = 0;
    state.reference_host_time_ms = at_ms;
}

fn next_track(state: &mut PlaybackState, at_ms: i64) -> bool {
    let next = state.current_index.map_or(0, |i| i.saturating_add(1));
    if next >= state.queue.len() {
        return false;
    }
    select_track(state, next, at_ms);
    true
}

fn prev_track(state: &mut PlaybackState, at_ms: i64) -> bool {
    match state.current_index {
        Some(i) if i > 0 => {
            select_track(state, i - 1, at_ms);
            true
        }
        Some(i) => {
            // First track: restart it
            if state.position_at(at_ms) == 0 {
                return false;
            }
            select_track(state, i, at_ms);
            true
        }
        None => false,
    }
}

/// Whether another track may be appended.
#[must_use]
pub fn queue_has_room(state: &PlaybackState) -> bool {
    state.queue.len() < MAX_QUEUE_LEN
}

fn add_track(state: &mut PlaybackState, track_id: &str, at_ms: i64) -> bool {
    if !queue_has_room(state) || !is_valid_track_id(track_id) {
        return false;
    }
    state.queue.push(track_id.to_string());
    if state.current_index.is_none() {
        select_track(state, state.queue.len() - 1, at_ms);
    }
    true
}

fn remove_track(state: &mut PlaybackState, index: usize, at_ms: i64) -> bool {
    if index >= state.queue.len() {
        return false;
    }
    state.queue.remove(index);

    match state.current_index {
        Some(current) if index < current => {
            state.current_index = Some(current - 1);
        }
        Some(current) if index == current => {
            if current < state.queue.len() {
                // The following entry slid into place
                select_track(state, current, at_ms);
            } else {
                // Removed the last entry: stop
                state.current_index = None;
                state.track_id = None;
                state.position_ms = 0;
                state.reference_host_time_ms = at_ms;
                state.transport = TransportState::Paused;
            }
        }
        _ => {}
    }
    true
}
