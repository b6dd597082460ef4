//! Per-peer liveness tracking and the disconnect state machine.
//!
//! Each remote peer walks a one-way escalation ladder driven by silence:
//! `Connecting -> Active <-> TimeoutPending -> DisconnectVotePending ->
//! Disconnected`. Only the final state is terminal; every earlier stage is
//! reverted by renewed traffic from the peer. Removal of an unresponsive
//! peer requires a quorum vote so that a single peer with a broken link
//! cannot eject a healthy one.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;

use smallvec::SmallVec;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::{LockstepError, PeerId, ProtocolConfig};

/// Where a peer currently sits on the disconnect escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Known from match setup but no traffic observed yet.
    Connecting,
    /// Traffic within the liveness window; the normal steady state.
    Active,
    /// Silent past the liveness timeout, or flagged by the ack engine as
    /// lagging. Reverts to [`Active`](PeerState::Active) on any traffic.
    TimeoutPending,
    /// Silent past the vote timeout. A disconnect vote is in progress; the
    /// peer can still save itself by resuming traffic before quorum.
    DisconnectVotePending,
    /// Removed from the match. Terminal: no traffic revives this peer.
    Disconnected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Active => "active",
            PeerState::TimeoutPending => "timeout pending",
            PeerState::DisconnectVotePending => "disconnect vote pending",
            PeerState::Disconnected => "disconnected",
        };
        write!(f, "{name}")
    }
}

/// The result of registering one disconnect vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The vote was counted but quorum has not been reached.
    Pending,
    /// This vote reached quorum; the target is now
    /// [`Disconnected`](PeerState::Disconnected).
    Quorum,
    /// The target was already disconnected; the vote is a no-op.
    AlreadyDisconnected,
}

/// Liveness bookkeeping for a single remote peer.
#[derive(Debug, Clone)]
pub struct PeerConnection<A> {
    /// Transport address the peer sends from and is reached at.
    pub addr: A,
    /// Current position on the escalation ladder.
    pub state: PeerState,
    /// When traffic from this peer was last observed.
    pub last_seen: Instant,
    /// When a keepalive was last sent to this peer.
    last_keepalive: Instant,
    /// Packets with an unrecognized command kind received from this peer.
    unknown_kind_strikes: u32,
    /// Peers that have voted to disconnect this peer.
    votes: BTreeSet<PeerId>,
}

/// One tick's worth of connection decisions for the session to act on.
#[derive(Debug, Default)]
pub struct ConnectionTick {
    /// Peers that changed state this tick, with their new state.
    pub state_changes: Vec<(PeerId, PeerState)>,
    /// Peers idle long enough that a keepalive should be sent to them.
    pub keepalive_due: SmallVec<[PeerId; 8]>,
    /// Peers that just entered
    /// [`DisconnectVotePending`](PeerState::DisconnectVotePending); a
    /// `TimeoutStart` naming each must be broadcast directly to every peer.
    pub vote_started: SmallVec<[PeerId; 4]>,
}

/// Tracks every remote peer of the match and drives their state machines.
///
/// Generic over the transport address `A` with the same bounds as
/// [`NonBlockingSocket`](crate::NonBlockingSocket).
#[derive(Debug)]
pub struct ConnectionTable<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    local: PeerId,
    config: ProtocolConfig,
    peers: BTreeMap<PeerId, PeerConnection<A>>,
}

impl<A> ConnectionTable<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Creates a table for the given local peer. Remote peers are added with
    /// [`add_peer`](Self::add_peer) before the match starts.
    #[must_use]
    pub fn new(local: PeerId, config: ProtocolConfig) -> Self {
        Self {
            local,
            config,
            peers: BTreeMap::new(),
        }
    }

    /// Registers a remote peer in [`Connecting`](PeerState::Connecting)
    /// state.
    pub fn add_peer(&mut self, peer: PeerId, addr: A, now: Instant) {
        self.peers.insert(
            peer,
            PeerConnection {
                addr,
                state: PeerState::Connecting,
                last_seen: now,
                last_keepalive: now,
                unknown_kind_strikes: 0,
                votes: BTreeSet::new(),
            },
        );
    }

    /// The local peer id this table was built for.
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Current state of `peer`, if known.
    #[must_use]
    pub fn state(&self, peer: PeerId) -> Option<PeerState> {
        self.peers.get(&peer).map(|c| c.state)
    }

    /// Transport address of `peer`, if known.
    #[must_use]
    pub fn addr(&self, peer: PeerId) -> Option<&A> {
        self.peers.get(&peer).map(|c| &c.addr)
    }

    /// Reverse lookup: which peer sends from `addr`.
    #[must_use]
    pub fn peer_by_addr(&self, addr: &A) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, c)| c.addr == *addr)
            .map(|(&peer, _)| peer)
    }

    /// All peers that have not reached
    /// [`Disconnected`](PeerState::Disconnected), in ascending id order.
    pub fn connected_peers(&self) -> impl Iterator<Item = (PeerId, &A)> {
        self.peers
            .iter()
            .filter(|(_, c)| c.state != PeerState::Disconnected)
            .map(|(&peer, c)| (peer, &c.addr))
    }

    /// Notes traffic from `peer` and de-escalates its state. Returns the
    /// resulting state change, if any.
    pub fn record_traffic(
        &mut self,
        peer: PeerId,
        now: Instant,
    ) -> Result<Option<PeerState>, LockstepError> {
        let conn = self
            .peers
            .get_mut(&peer)
            .ok_or(LockstepError::UnknownPeer { peer })?;
        conn.last_seen = now;
        match conn.state {
            PeerState::Connecting => {
                conn.state = PeerState::Active;
                info!("{peer} completed connection");
                Ok(Some(PeerState::Active))
            }
            PeerState::TimeoutPending => {
                conn.state = PeerState::Active;
                debug!("{peer} resumed traffic, timeout withdrawn");
                Ok(Some(PeerState::Active))
            }
            PeerState::DisconnectVotePending => {
                conn.state = PeerState::Active;
                conn.votes.clear();
                info!("{peer} resumed traffic mid-vote, vote abandoned");
                Ok(Some(PeerState::Active))
            }
            PeerState::Active | PeerState::Disconnected => Ok(None),
        }
    }

    /// Counts one packet with an unknown command kind from `peer`. Past the
    /// configured tolerance the peer is flagged
    /// [`TimeoutPending`](PeerState::TimeoutPending), since a stream of
    /// unknown kinds usually means a protocol version mismatch.
    pub fn record_unknown_kind(&mut self, peer: PeerId) -> Option<PeerState> {
        let conn = self.peers.get_mut(&peer)?;
        conn.unknown_kind_strikes += 1;
        if conn.unknown_kind_strikes >= self.config.unknown_kind_tolerance
            && matches!(conn.state, PeerState::Connecting | PeerState::Active)
        {
            warn!(
                "{peer} sent {} packets with unknown command kinds, flagging",
                conn.unknown_kind_strikes
            );
            conn.state = PeerState::TimeoutPending;
            return Some(PeerState::TimeoutPending);
        }
        None
    }

    /// Escalates `peer` to [`TimeoutPending`](PeerState::TimeoutPending)
    /// after the ack engine exhausted its retries. Returns the state change,
    /// if any.
    pub fn mark_lagging(&mut self, peer: PeerId) -> Option<PeerState> {
        let conn = self.peers.get_mut(&peer)?;
        if matches!(conn.state, PeerState::Connecting | PeerState::Active) {
            warn!("{peer} exhausted retransmissions, starting timeout");
            conn.state = PeerState::TimeoutPending;
            return Some(PeerState::TimeoutPending);
        }
        None
    }

    /// Advances every peer's state machine by one tick.
    ///
    /// The silence thresholds count from [`Active`](PeerState::Active): a
    /// peer that never produced traffic stays
    /// [`Connecting`](PeerState::Connecting) and is escalated through
    /// [`mark_lagging`](Self::mark_lagging) by the ack engine instead, once
    /// reliable sends to it exhaust their retries.
    pub fn tick(&mut self, now: Instant) -> ConnectionTick {
        let mut outcome = ConnectionTick::default();
        for (&peer, conn) in &mut self.peers {
            let silence = now.duration_since(conn.last_seen);
            match conn.state {
                PeerState::Active if silence >= self.config.liveness_timeout => {
                    warn!("{peer} silent for {silence:?}, starting timeout");
                    conn.state = PeerState::TimeoutPending;
                    outcome.state_changes.push((peer, PeerState::TimeoutPending));
                }
                PeerState::TimeoutPending if silence >= self.config.vote_timeout => {
                    warn!("{peer} silent past vote timeout, opening disconnect vote");
                    conn.state = PeerState::DisconnectVotePending;
                    outcome
                        .state_changes
                        .push((peer, PeerState::DisconnectVotePending));
                    outcome.vote_started.push(peer);
                }
                PeerState::Disconnected => continue,
                _ => {}
            }
            if now.duration_since(conn.last_keepalive) >= self.config.keepalive_interval {
                conn.last_keepalive = now;
                outcome.keepalive_due.push(peer);
            }
        }
        outcome
    }

    /// Registers `voter`'s vote to disconnect `target`. Quorum is a strict
    /// majority of the electorate: every non-disconnected peer except the
    /// target, the local peer included. Duplicate votes from one peer count
    /// once.
    pub fn on_disconnect_vote(
        &mut self,
        target: PeerId,
        voter: PeerId,
    ) -> Result<VoteOutcome, LockstepError> {
        let electorate = 1 + self
            .peers
            .iter()
            .filter(|(&peer, c)| peer != target && c.state != PeerState::Disconnected)
            .count();
        let conn = self
            .peers
            .get_mut(&target)
            .ok_or(LockstepError::UnknownPeer { peer: target })?;
        if conn.state == PeerState::Disconnected {
            return Ok(VoteOutcome::AlreadyDisconnected);
        }
        conn.votes.insert(voter);
        let votes = conn.votes.len();
        debug!("{votes} of {electorate} votes to disconnect {target}");
        if votes * 2 > electorate {
            info!("{target} voted out ({votes}/{electorate})");
            conn.state = PeerState::Disconnected;
            conn.votes.clear();
            return Ok(VoteOutcome::Quorum);
        }
        Ok(VoteOutcome::Pending)
    }

    /// Handles a graceful departure announced by the peer itself. No vote is
    /// needed; the peer moves straight to
    /// [`Disconnected`](PeerState::Disconnected).
    pub fn on_player_leave(&mut self, peer: PeerId) -> Result<Option<PeerState>, LockstepError> {
        let conn = self
            .peers
            .get_mut(&peer)
            .ok_or(LockstepError::UnknownPeer { peer })?;
        if conn.state == PeerState::Disconnected {
            return Ok(None);
        }
        info!("{peer} left the match");
        conn.state = PeerState::Disconnected;
        conn.votes.clear();
        Ok(Some(PeerState::Disconnected))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use web_time::Duration;

    const LOCAL: PeerId = PeerId::new(0);
    const P1: PeerId = PeerId::new(1);
    const P2: PeerId = PeerId::new(2);
    const P3: PeerId = PeerId::new(3);

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            liveness_timeout: Duration::from_millis(100),
            vote_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::from_millis(50),
            unknown_kind_tolerance: 3,
            ..ProtocolConfig::default()
        }
    }

    fn table(now: Instant) -> ConnectionTable<u32> {
        let mut table = ConnectionTable::new(LOCAL, config());
        table.add_peer(P1, 101, now);
        table.add_peer(P2, 102, now);
        table.add_peer(P3, 103, now);
        table
    }

    #[test]
    fn traffic_activates_a_connecting_peer() {
        let now = Instant::now();
        let mut table = table(now);
        assert_eq!(table.state(P1), Some(PeerState::Connecting));
        let change = table.record_traffic(P1, now).unwrap();
        assert_eq!(change, Some(PeerState::Active));
        // Steady-state traffic is not a state change.
        assert_eq!(table.record_traffic(P1, now).unwrap(), None);
    }

    #[test]
    fn silence_escalates_and_traffic_reverts() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();

        let tick = table.tick(now + Duration::from_millis(150));
        assert!(tick
            .state_changes
            .contains(&(P1, PeerState::TimeoutPending)));
        assert!(tick.vote_started.is_empty());

        let change = table
            .record_traffic(P1, now + Duration::from_millis(200))
            .unwrap();
        assert_eq!(change, Some(PeerState::Active));
        assert_eq!(table.state(P1), Some(PeerState::Active));
    }

    #[test]
    fn prolonged_silence_opens_a_vote() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();

        table.tick(now + Duration::from_millis(150));
        let tick = table.tick(now + Duration::from_millis(400));
        assert!(tick
            .state_changes
            .contains(&(P1, PeerState::DisconnectVotePending)));
        assert_eq!(tick.vote_started.as_slice(), &[P1]);
    }

    #[test]
    fn connecting_peers_do_not_escalate_on_silence() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();

        // Far past every threshold: only the once-active peer walks the
        // ladder. P2 and P3 never produced traffic and stay Connecting;
        // their escalation path is mark_lagging, not the silence clock.
        table.tick(now + Duration::from_millis(150));
        let tick = table.tick(now + Duration::from_millis(400));
        assert_eq!(tick.vote_started.as_slice(), &[P1]);
        assert_eq!(table.state(P2), Some(PeerState::Connecting));
        assert_eq!(table.state(P3), Some(PeerState::Connecting));

        // mark_lagging still escalates a Connecting peer.
        assert_eq!(table.mark_lagging(P2), Some(PeerState::TimeoutPending));
    }

    #[test]
    fn quorum_is_strict_majority_of_electorate() {
        let now = Instant::now();
        let mut table = table(now);
        // Electorate for P1: local, P2, P3 => 3 voters; quorum needs 2.
        assert_eq!(table.on_disconnect_vote(P1, LOCAL).unwrap(), VoteOutcome::Pending);
        // Duplicate vote counts once.
        assert_eq!(table.on_disconnect_vote(P1, LOCAL).unwrap(), VoteOutcome::Pending);
        assert_eq!(table.on_disconnect_vote(P1, P2).unwrap(), VoteOutcome::Quorum);
        assert_eq!(table.state(P1), Some(PeerState::Disconnected));
        // Further votes are no-ops.
        assert_eq!(
            table.on_disconnect_vote(P1, P3).unwrap(),
            VoteOutcome::AlreadyDisconnected
        );
    }

    #[test]
    fn disconnected_peers_shrink_the_electorate() {
        let now = Instant::now();
        let mut table = table(now);
        table.on_player_leave(P3).unwrap();
        // Electorate for P1 is now local + P2 = 2; a single vote is not a
        // strict majority, two are.
        assert_eq!(table.on_disconnect_vote(P1, LOCAL).unwrap(), VoteOutcome::Pending);
        assert_eq!(table.on_disconnect_vote(P1, P2).unwrap(), VoteOutcome::Quorum);
    }

    #[test]
    fn traffic_mid_vote_abandons_the_vote() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();
        table.tick(now + Duration::from_millis(150));
        table.tick(now + Duration::from_millis(400));
        table.on_disconnect_vote(P1, P2).unwrap();

        table
            .record_traffic(P1, now + Duration::from_millis(450))
            .unwrap();
        assert_eq!(table.state(P1), Some(PeerState::Active));

        // The abandoned vote's tally is gone; a fresh vote starts from zero.
        table.tick(now + Duration::from_millis(600));
        table.tick(now + Duration::from_millis(800));
        assert_eq!(table.on_disconnect_vote(P1, P2).unwrap(), VoteOutcome::Pending);
    }

    #[test]
    fn disconnect_is_terminal() {
        let now = Instant::now();
        let mut table = table(now);
        table.on_player_leave(P1).unwrap();
        assert_eq!(table.record_traffic(P1, now).unwrap(), None);
        assert_eq!(table.state(P1), Some(PeerState::Disconnected));
        assert_eq!(table.on_player_leave(P1).unwrap(), None);
    }

    #[test]
    fn lagging_escalates_to_timeout_pending() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();
        assert_eq!(table.mark_lagging(P1), Some(PeerState::TimeoutPending));
        // Already pending: no further change.
        assert_eq!(table.mark_lagging(P1), None);
    }

    #[test]
    fn unknown_kind_strikes_flag_after_tolerance() {
        let now = Instant::now();
        let mut table = table(now);
        table.record_traffic(P1, now).unwrap();
        assert_eq!(table.record_unknown_kind(P1), None);
        assert_eq!(table.record_unknown_kind(P1), None);
        assert_eq!(table.record_unknown_kind(P1), Some(PeerState::TimeoutPending));
    }

    #[test]
    fn keepalives_fire_on_the_configured_interval() {
        let now = Instant::now();
        let mut table = table(now);
        let tick = table.tick(now + Duration::from_millis(60));
        assert_eq!(tick.keepalive_due.len(), 3);
        // Immediately after, nothing is due.
        let tick = table.tick(now + Duration::from_millis(70));
        assert!(tick.keepalive_due.is_empty());
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let now = Instant::now();
        let mut table = table(now);
        let ghost = PeerId::new(9);
        assert!(matches!(
            table.record_traffic(ghost, now),
            Err(LockstepError::UnknownPeer { peer }) if peer == ghost
        ));
        assert!(table.on_disconnect_vote(ghost, LOCAL).is_err());
    }

    #[test]
    fn addr_lookups_work_both_ways() {
        let now = Instant::now();
        let table = table(now);
        assert_eq!(table.addr(P2), Some(&102));
        assert_eq!(table.peer_by_addr(&102), Some(P2));
        assert_eq!(table.peer_by_addr(&999), None);
        let connected: Vec<PeerId> = table.connected_peers().map(|(p, _)| p).collect();
        assert_eq!(connected, vec![P1, P2, P3]);
    }
}
