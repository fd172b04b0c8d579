//! Receiver-side filter for state broadcasts.

/// Admits only broadcasts newer than the last applied one.
///
/// A broadcast whose revision is lower than or equal to the last applied revision
/// is stale (duplicate or reordered delivery) and is silently discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RevisionGate {
    last_applied: Option<u64>,
}

impl RevisionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `revision` if it is newer than anything applied.
    pub fn admit(&mut self, revision: u64) -> bool {
        match self.last_applied {
            Some(last) if revision <= last => {
                tracing::trace!(
                    target: "sync.revision",
                    revision,
                    last_applied = last,
                    "Discarding stale broadcast"
                );
                false
            }
            _ => {
                self.last_applied = Some(revision);
                true
            }
        }
    }

    /// Last applied revision, if any.
    #[must_use]
    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    /// Forget history, e.g. after joining a different session.
    pub fn reset(&mut self) {
        self.last_applied = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_broadcast_is_admitted() {
        let mut gate = RevisionGate::new();
        assert!(gate.admit(0));
        assert_eq!(gate.last_applied(), Some(0));
    }

    #[test]
    fn test_duplicate_and_older_revisions_are_discarded() {
        let mut gate = RevisionGate::new();
        assert!(gate.admit(5));
        assert!(!gate.admit(5));
        assert!(!gate.admit(3));
        assert!(gate.admit(6));
        assert_eq!(gate.last_applied(), Some(6));
    }

    #[test]
    fn test_gap_is_admitted() {
        let mut gate = RevisionGate::new();
        assert!(gate.admit(1));
        assert!(gate.admit(9));
        assert!(!gate.admit(2));
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut gate = RevisionGate::new();
        assert!(gate.admit(10));
        gate.reset();
        assert!(gate.admit(1));
    }
}
