//! Raft node options.

use quill_core::ServerId;

/// Tick-based options for a Raft node.
///
/// The runtime calls [`crate::RaftNode::tick`] at a fixed interval; these
/// options are expressed in ticks of that interval. The actual election
/// timeout is randomized in `[election_ticks, 2 * election_ticks)` each
/// time the timer is armed.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// This node's id.
    pub local_id: ServerId,
    /// Ticks between leader heartbeats.
    pub heartbeat_ticks: u32,
    /// Base ticks before a follower starts an election.
    pub election_ticks: u32,
}

impl RaftOptions {
    /// Creates options with the default tick thresholds: heartbeat every
    /// tick, election after ten quiet ticks.
    #[must_use]
    pub fn new(local_id: ServerId) -> Self {
        Self {
            local_id,
            heartbeat_ticks: 1,
            election_ticks: 10,
        }
    }

    /// Sets the election threshold.
    ///
    /// # Panics
    /// Panics if `ticks` is not greater than `heartbeat_ticks`.
    #[must_use]
    pub fn with_election_ticks(mut self, ticks: u32) -> Self {
        assert!(
            ticks > self.heartbeat_ticks,
            "election timeout must exceed heartbeat interval"
        );
        self.election_ticks = ticks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RaftOptions::new(ServerId::new("a"));
        assert_eq!(opts.heartbeat_ticks, 1);
        assert_eq!(opts.election_ticks, 10);
    }

    #[test]
    #[should_panic(expected = "election timeout must exceed heartbeat interval")]
    fn test_election_must_exceed_heartbeat() {
        let _ = RaftOptions::new(ServerId::new("a")).with_election_ticks(1);
    }
}
