//! Total ordering of concurrent playback commands.
//!
//! Commands from all participants are buffered for a short window after the
//! first command of a batch arrives. When the window elapses the batch is
//! released sorted by `(corrected_time_ms, join_order, local_seq)`, so the
//! resulting apply order depends only on the commands themselves and never on
//! arrival order.
//!
//! The queue is a plain data structure. The session actor owns it, sleeps until
//! [`ReconciliationQueue::deadline`] and then calls
//! [`ReconciliationQueue::drain_ready`].

use common::types::ParticipantId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use sync_protocol::PlaybackCommand;
use tokio::time::Instant;

/// Sequence numbers further than this below a participant's highest seen
/// sequence are treated as already applied.
pub const SEQ_LEDGER_SPAN: u64 = 1024;

/// Sort key: corrected host time, then join order, then the sender's sequence.
pub type OrderKey = (i64, u64, u64);

/// A command waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub participant_id: ParticipantId,
    /// Position of the sender in the session's join order.
    pub join_order: u64,
    pub local_seq: u64,
    /// Sender's local timestamp translated to host time.
    pub corrected_time_ms: i64,
    pub command: PlaybackCommand,
    /// Sender held the host role when the command arrived.
    pub from_host: bool,
    /// Sender's clock estimate was not good enough to correct the timestamp.
    pub degraded: bool,
}

impl PendingCommand {
    #[must_use]
    pub fn order_key(&self) -> OrderKey {
        (self.corrected_time_ms, self.join_order, self.local_seq)
    }
}

/// Result of [`ReconciliationQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Held until the window elapses.
    Buffered,
    /// Same participant and sequence number was already accepted.
    Duplicate,
    /// Host bypass: apply these now, in order.
    Immediate(Vec<PendingCommand>),
}

#[derive(Debug, Default)]
struct SeqLedger {
    max_seq: Option<u64>,
    seen: BTreeSet<u64>,
}

impl SeqLedger {
    fn floor(&self) -> u64 {
        self.max_seq
            .map_or(0, |max| max.saturating_sub(SEQ_LEDGER_SPAN))
    }

    /// Returns `false` if `seq` was seen before.
    fn insert(&mut self, seq: u64) -> bool {
        if self.max_seq.is_some() && seq < self.floor() {
            return false;
        }
        if !self.seen.insert(seq) {
            return false;
        }
        if self.max_seq.map_or(true, |max| seq > max) {
            self.max_seq = Some(seq);
            let floor = self.floor();
            self.seen = self.seen.split_off(&floor);
        }
        true
    }
}

/// Reconciliation buffer for one session.
#[derive(Debug)]
pub struct ReconciliationQueue {
    window: Duration,
    host_bypass: bool,
    buffer: BTreeMap<OrderKey, PendingCommand>,
    deadline: Option<Instant>,
    ledgers: HashMap<ParticipantId, SeqLedger>,
}

impl ReconciliationQueue {
    #[must_use]
    pub fn new(window: Duration, host_bypass: bool) -> Self {
        Self {
            window,
            host_bypass,
            buffer: BTreeMap::new(),
            deadline: None,
            ledgers: HashMap::new(),
        }
    }

    /// Accept a command arriving at `now`.
    pub fn push(&mut self, command: PendingCommand, now: Instant) -> PushOutcome {
        let ledger = self.ledgers.entry(command.participant_id).or_default();
        if !ledger.insert(command.local_seq) {
            tracing::debug!(
                target: "sc.reconciliation",
                participant_id = %command.participant_id,
                local_seq = command.local_seq,
                "Dropped duplicate command"
            );
            return PushOutcome::Duplicate;
        }

        if command.from_host && self.host_bypass {
            let key = command.order_key();
            let later = self.buffer.split_off(&key);
            let earlier = std::mem::replace(&mut self.buffer, later);

            let mut ready: Vec<PendingCommand> = earlier.into_values().collect();
            ready.push(command);
            if self.buffer.is_empty() {
                self.deadline = None;
            }
            return PushOutcome::Immediate(ready);
        }

        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
        self.buffer.insert(command.order_key(), command);
        PushOutcome::Buffered
    }

    /// When the current batch is due, if one is open.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release the batch in order if its window has elapsed at `now`.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PendingCommand> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.drain_all(),
            _ => Vec::new(),
        }
    }

    /// Release everything buffered regardless of the window.
    pub fn drain_all(&mut self) -> Vec<PendingCommand> {
        self.deadline = None;
        std::mem::take(&mut self.buffer).into_values().collect()
    }

    /// Drop the duplicate ledger of a removed participant.
    ///
    /// Commands it already sent stay buffered.
    pub fn forget_participant(&mut self, participant_id: &ParticipantId) {
        self.ledgers.remove(participant_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
