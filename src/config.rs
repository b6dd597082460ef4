//! Session configuration: timing thresholds and protocol policy knobs.

use web_time::Duration;

use crate::{MAX_FRAMES_AHEAD, MIN_RUNAHEAD};

/// Tunable timing and policy knobs for a lockstep session.
///
/// Every threshold that drives retransmission, liveness or resend behavior
/// lives here so tests can shrink them and LAN setups can relax them. The
/// defaults target internet play at typical RTS tick rates.
///
/// # Example
///
/// ```
/// use rampart_lockstep::ProtocolConfig;
/// use web_time::Duration;
///
/// let config = ProtocolConfig {
///     retry_timeout: Duration::from_millis(100),
///     ..ProtocolConfig::default()
/// };
/// assert!(config.retry_timeout < config.liveness_timeout);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How long an unacknowledged send may age before it is retransmitted.
    pub retry_timeout: Duration,
    /// Retransmissions per command before the peer is escalated to the
    /// connection state machine as lagging. The ack engine never declares
    /// a disconnect itself.
    pub max_retries: u32,
    /// Idle interval after which a keepalive is sent to each peer.
    pub keepalive_interval: Duration,
    /// Silence beyond this moves a peer `Active -> TimeoutPending`.
    /// Renewed traffic reverts the transition.
    pub liveness_timeout: Duration,
    /// Silence beyond this (measured from the same last-seen instant) moves
    /// a peer `TimeoutPending -> DisconnectVotePending` and broadcasts
    /// `TimeoutStart` directly to every peer, bypassing the relay.
    pub vote_timeout: Duration,
    /// How long a retained-but-unfilled frame bucket may sit at the head of
    /// the window before a `FrameResendRequest` is sent to the owing peer.
    pub resend_grace: Duration,
    /// Minimum spacing between repeated resend requests for the same
    /// (frame, peer) pair.
    pub resend_request_interval: Duration,
    /// How many packets with an unknown command kind a peer may send before
    /// it is flagged `TimeoutPending` (likely version mismatch).
    pub unknown_kind_tolerance: u32,
    /// Initial run-ahead distance in frames. Clamped to
    /// `[MIN_RUNAHEAD, MAX_FRAMES_AHEAD]`; `RunAhead` control commands
    /// adjust it mid-match within the same bounds.
    pub runahead: u32,
    /// Optional seed for the session's protocol randomness (header magic).
    /// When set, two sessions constructed with the same seed produce
    /// identical magic values, enabling fully reproducible tests.
    pub session_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_millis(200),
            max_retries: 5,
            keepalive_interval: Duration::from_millis(1000),
            liveness_timeout: Duration::from_millis(5000),
            vote_timeout: Duration::from_millis(15000),
            resend_grace: Duration::from_millis(500),
            resend_request_interval: Duration::from_millis(1000),
            unknown_kind_tolerance: 3,
            runahead: MIN_RUNAHEAD,
            session_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for LAN play.
    ///
    /// Tight retry and liveness timers; LAN round trips are sub-millisecond
    /// and losses are rare, so waiting internet-scale intervals only adds
    /// latency to recovery.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            retry_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(500),
            liveness_timeout: Duration::from_millis(2000),
            vote_timeout: Duration::from_millis(6000),
            resend_grace: Duration::from_millis(150),
            ..Self::default()
        }
    }

    /// Configuration preset for high-latency connections.
    ///
    /// Generous timers to avoid spurious retransmissions and timeout churn
    /// on links with several hundred milliseconds of round trip.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            retry_timeout: Duration::from_millis(600),
            max_retries: 8,
            liveness_timeout: Duration::from_millis(10000),
            vote_timeout: Duration::from_millis(30000),
            resend_grace: Duration::from_millis(1500),
            ..Self::default()
        }
    }

    /// The configured run-ahead clamped to the legal range.
    #[must_use]
    pub fn clamped_runahead(&self) -> u32 {
        self.runahead.clamp(MIN_RUNAHEAD, MAX_FRAMES_AHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_are_ordered() {
        let c = ProtocolConfig::default();
        assert!(c.retry_timeout < c.liveness_timeout);
        assert!(c.liveness_timeout < c.vote_timeout);
        assert!(c.resend_grace < c.vote_timeout);
    }

    #[test]
    fn presets_keep_threshold_ordering() {
        for c in [ProtocolConfig::lan(), ProtocolConfig::high_latency()] {
            assert!(c.retry_timeout < c.liveness_timeout);
            assert!(c.liveness_timeout < c.vote_timeout);
        }
    }

    #[test]
    fn runahead_is_clamped_to_policy_bounds() {
        let low = ProtocolConfig {
            runahead: 0,
            ..ProtocolConfig::default()
        };
        assert_eq!(low.clamped_runahead(), MIN_RUNAHEAD);

        let high = ProtocolConfig {
            runahead: 10_000,
            ..ProtocolConfig::default()
        };
        assert_eq!(high.clamped_runahead(), MAX_FRAMES_AHEAD);
    }
}
