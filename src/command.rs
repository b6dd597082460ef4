//! Command kinds, their protocol requirements, and id allocation.
//!
//! Every packet that moves through a match is one of the [`CommandKind`]s
//! below. The [`classify`] table decides, per kind, whether the command
//! carries a unique sequence id, must be acknowledged, participates in
//! cross-peer frame synchronization, and whether it may bypass the packet
//! router. The enumeration is closed: adding a variant without updating the
//! table is a compile-time error, because [`classify`] is an exhaustive
//! `match`.

use std::sync::atomic::{AtomicU16, Ordering};

use serde::{Deserialize, Serialize};

use crate::{CommandId, Frame, LockstepError, PeerId, COMMAND_ID_START};

/// Every kind of command the protocol knows about. Fixed at design time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    /// Acknowledges both receipt and application of a command.
    AckBoth = 0,
    /// Acknowledges receipt of a command (stage 1).
    AckStage1 = 1,
    /// Acknowledges downstream application of a command (stage 2).
    AckStage2 = 2,
    /// Per-frame metadata: marks a peer's command bucket for a frame as
    /// complete, even when the peer issued no commands that frame.
    FrameInfo = 3,
    /// An ordinary game command (move, attack, build, ...). Opaque payload.
    GameCommand = 4,
    /// Voluntary departure of a player, retired on an identical frame by
    /// every peer without requiring a vote.
    PlayerLeave = 5,
    /// Latency/run-ahead measurement data.
    RunAheadMetrics = 6,
    /// Run-ahead adjustment: all peers change their run-ahead distance on
    /// the same frame.
    RunAhead = 7,
    /// Retires a disconnected player on an identical frame on every peer.
    DestroyPlayer = 8,
    /// Liveness traffic. Never buffered, never acked.
    KeepAlive = 9,
    /// Chat shown on the disconnect screen. Not frame-synchronized.
    DisconnectChat = 10,
    /// In-game chat. Frame-synchronized so logs match across peers.
    Chat = 11,
    /// NAT-probe query (handled by external match infrastructure).
    ManglerQuery = 12,
    /// NAT-probe response.
    ManglerResponse = 13,
    /// Load-progress report during match startup.
    Progress = 14,
    /// Signals that this peer finished loading the map.
    LoadComplete = 15,
    /// Broadcast when a peer starts its disconnect-timeout countdown.
    TimeoutStart = 16,
    /// Wraps an oversized command split across several packets.
    Wrapper = 17,
    /// File-transfer data chunk.
    File = 18,
    /// Announces an upcoming file transfer.
    FileAnnounce = 19,
    /// File-transfer progress report.
    FileProgress = 20,
    /// Keepalive variant used while the disconnect screen is up.
    DisconnectKeepAlive = 21,
    /// Declares a player disconnected after a successful vote.
    DisconnectPlayer = 22,
    /// Relay envelope: asks the packet router to re-deliver the inner
    /// packet to another peer.
    PacketRouterQuery = 23,
    /// Relay confirmation for a previously forwarded packet.
    PacketRouterAck = 24,
    /// A vote to declare an unresponsive peer disconnected.
    DisconnectVote = 25,
    /// Frame-progress report exchanged on the disconnect screen.
    DisconnectFrame = 26,
    /// Signals that the disconnect screen was dismissed.
    DisconnectScreenOff = 27,
    /// Asks a peer to retransmit its commands for a buffered frame.
    FrameResendRequest = 28,
}

impl CommandKind {
    /// All kinds, in wire order. Handy for table-driven tests.
    pub const ALL: [CommandKind; 29] = [
        CommandKind::AckBoth,
        CommandKind::AckStage1,
        CommandKind::AckStage2,
        CommandKind::FrameInfo,
        CommandKind::GameCommand,
        CommandKind::PlayerLeave,
        CommandKind::RunAheadMetrics,
        CommandKind::RunAhead,
        CommandKind::DestroyPlayer,
        CommandKind::KeepAlive,
        CommandKind::DisconnectChat,
        CommandKind::Chat,
        CommandKind::ManglerQuery,
        CommandKind::ManglerResponse,
        CommandKind::Progress,
        CommandKind::LoadComplete,
        CommandKind::TimeoutStart,
        CommandKind::Wrapper,
        CommandKind::File,
        CommandKind::FileAnnounce,
        CommandKind::FileProgress,
        CommandKind::DisconnectKeepAlive,
        CommandKind::DisconnectPlayer,
        CommandKind::PacketRouterQuery,
        CommandKind::PacketRouterAck,
        CommandKind::DisconnectVote,
        CommandKind::DisconnectFrame,
        CommandKind::DisconnectScreenOff,
        CommandKind::FrameResendRequest,
    ];

    /// The wire byte for this kind.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this kind is one of the three acknowledgment kinds.
    #[inline]
    #[must_use]
    pub const fn is_ack(self) -> bool {
        matches!(
            self,
            CommandKind::AckBoth | CommandKind::AckStage1 | CommandKind::AckStage2
        )
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = LockstepError;

    /// Converts a raw wire byte into a kind. An out-of-enumeration byte
    /// fails with [`LockstepError::UnknownCommandKind`] before the packet
    /// reaches classification.
    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        CommandKind::ALL
            .get(raw as usize)
            .copied()
            .ok_or(LockstepError::UnknownCommandKind { raw })
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Protocol requirements derived from a command's kind.
///
/// `needs_ack` is design-equivalent to `needs_id`: every id-bearing command
/// is also ack-required. Retransmission bookkeeping is keyed by id, so an
/// ack without an id would have nothing to clear and an id without an ack
/// would never stop retransmitting. This equivalence is load-bearing and is
/// pinned by tests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandRequirements {
    /// The command is stamped with a unique sequence id at creation.
    pub needs_id: bool,
    /// Every recipient must acknowledge the command; unacknowledged sends
    /// are retransmitted.
    pub needs_ack: bool,
    /// The command must be applied identically, on the same frame, by every
    /// peer. Sync-critical commands are buffered in the frame window.
    pub sync_critical: bool,
    /// The command is sent directly to the peer's address instead of
    /// through the packet router, so it keeps working when the relay is
    /// unreachable. Only the post-disconnect subset qualifies.
    pub direct_send: bool,
}

const fn requirements(
    needs_id: bool,
    sync_critical: bool,
    direct_send: bool,
) -> CommandRequirements {
    CommandRequirements {
        needs_id,
        // needs_ack mirrors needs_id by design; see the struct docs.
        needs_ack: needs_id,
        sync_critical,
        direct_send,
    }
}

/// Maps a command kind to its protocol requirements.
///
/// Total and pure: every kind has an entry and the result depends on
/// nothing but the kind. The policy, kind by kind:
///
/// * id + ack + sync for everything that affects ordering or game state;
/// * direct send only for the narrower post-disconnect subset, which must
///   keep working when the relay itself is the stalled peer;
/// * ack kinds carry no id and are never acked, preventing unbounded
///   ack-of-ack loops.
#[must_use]
pub const fn classify(kind: CommandKind) -> CommandRequirements {
    match kind {
        // Acks acknowledge; they are never themselves acknowledged.
        CommandKind::AckBoth | CommandKind::AckStage1 | CommandKind::AckStage2 => {
            requirements(false, false, false)
        }

        // The ordered, relay-routed backbone of the simulation.
        CommandKind::GameCommand
        | CommandKind::FrameInfo
        | CommandKind::PlayerLeave
        | CommandKind::DestroyPlayer
        | CommandKind::RunAheadMetrics
        | CommandKind::RunAhead
        | CommandKind::Chat
        | CommandKind::LoadComplete
        | CommandKind::Wrapper => requirements(true, true, false),

        // Sync-critical traffic that must survive a dead relay: the peer
        // being voted out may *be* the relay.
        CommandKind::DisconnectVote
        | CommandKind::DisconnectPlayer
        | CommandKind::TimeoutStart
        | CommandKind::File
        | CommandKind::FileAnnounce
        | CommandKind::FileProgress
        | CommandKind::DisconnectFrame
        | CommandKind::DisconnectScreenOff
        | CommandKind::FrameResendRequest => requirements(true, true, true),

        // Fire-and-forget: liveness, probes, progress and relay plumbing.
        CommandKind::KeepAlive
        | CommandKind::DisconnectKeepAlive
        | CommandKind::DisconnectChat
        | CommandKind::ManglerQuery
        | CommandKind::ManglerResponse
        | CommandKind::Progress
        | CommandKind::PacketRouterQuery
        | CommandKind::PacketRouterAck => requirements(false, false, false),
    }
}

/// One command as it moves through the protocol: created on a local action
/// or protocol event, owned by the frame window until acknowledged or
/// frame-retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCommand {
    /// What this command is.
    pub kind: CommandKind,
    /// Sequence id, present iff `classify(kind).needs_id`.
    pub id: Option<CommandId>,
    /// The peer that created the command.
    pub origin: PeerId,
    /// The simulation frame the command executes on.
    pub target_frame: Frame,
    /// Opaque payload; the simulation layer owns its meaning.
    pub payload: Vec<u8>,
}

impl NetCommand {
    /// Creates a command without an id. Use
    /// [`CommandIdAllocator::stamp`] to assign one where required.
    #[must_use]
    pub fn new(kind: CommandKind, origin: PeerId, target_frame: Frame, payload: Vec<u8>) -> Self {
        Self {
            kind,
            id: None,
            origin,
            target_frame,
            payload,
        }
    }

    /// The protocol requirements for this command's kind.
    #[inline]
    #[must_use]
    pub fn requirements(&self) -> CommandRequirements {
        classify(self.kind)
    }
}

/// Monotonic 16-bit sequence generator for commands that require identity.
///
/// The counter starts at [`COMMAND_ID_START`] and wraps modulo 65536 (the
/// successor of 65535 is 0, not the start value). State is owned by one
/// match session rather than being process-global, so multiple concurrent
/// matches on one host do not share a sequence. The atomic serializes
/// concurrent callers.
#[derive(Debug)]
pub struct CommandIdAllocator {
    next: AtomicU16,
}

impl Default for CommandIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandIdAllocator {
    /// Creates a fresh allocator whose first id is [`COMMAND_ID_START`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(COMMAND_ID_START),
        }
    }

    /// Returns the next command id.
    #[must_use]
    pub fn next_id(&self) -> CommandId {
        // fetch_add on u16 wraps on overflow, which is exactly the
        // documented id behavior.
        CommandId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Stamps `command` with a fresh id iff its kind requires one.
    pub fn stamp(&self, command: &mut NetCommand) {
        if command.requirements().needs_id && command.id.is_none() {
            command.id = Some(self.next_id());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ack_required_iff_id_required() {
        for kind in CommandKind::ALL {
            let req = classify(kind);
            assert_eq!(
                req.needs_ack, req.needs_id,
                "needs_ack must equal needs_id for {kind}"
            );
        }
    }

    #[test]
    fn id_bearing_set_matches_policy() {
        let expected = [
            CommandKind::GameCommand,
            CommandKind::FrameInfo,
            CommandKind::PlayerLeave,
            CommandKind::DestroyPlayer,
            CommandKind::RunAheadMetrics,
            CommandKind::RunAhead,
            CommandKind::Chat,
            CommandKind::DisconnectVote,
            CommandKind::LoadComplete,
            CommandKind::TimeoutStart,
            CommandKind::Wrapper,
            CommandKind::File,
            CommandKind::FileAnnounce,
            CommandKind::FileProgress,
            CommandKind::DisconnectPlayer,
            CommandKind::DisconnectFrame,
            CommandKind::DisconnectScreenOff,
            CommandKind::FrameResendRequest,
        ];
        for kind in CommandKind::ALL {
            assert_eq!(
                classify(kind).needs_id,
                expected.contains(&kind),
                "needs_id wrong for {kind}"
            );
        }
    }

    #[test]
    fn direct_send_is_the_post_disconnect_subset() {
        let expected = [
            CommandKind::DisconnectVote,
            CommandKind::DisconnectPlayer,
            CommandKind::TimeoutStart,
            CommandKind::File,
            CommandKind::FileAnnounce,
            CommandKind::FileProgress,
            CommandKind::DisconnectFrame,
            CommandKind::DisconnectScreenOff,
            CommandKind::FrameResendRequest,
        ];
        for kind in CommandKind::ALL {
            assert_eq!(
                classify(kind).direct_send,
                expected.contains(&kind),
                "direct_send wrong for {kind}"
            );
        }
        // No ordinary game command bypasses the router.
        assert!(!classify(CommandKind::GameCommand).direct_send);
        assert!(!classify(CommandKind::Chat).direct_send);
    }

    #[test]
    fn acks_are_exempt_from_acking() {
        for kind in [
            CommandKind::AckBoth,
            CommandKind::AckStage1,
            CommandKind::AckStage2,
        ] {
            let req = classify(kind);
            assert!(kind.is_ack());
            assert!(!req.needs_ack, "{kind} must not require an ack");
            assert!(!req.needs_id);
            assert!(!req.sync_critical);
        }
    }

    #[test]
    fn wire_bytes_round_trip() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::try_from(kind.as_u8()).unwrap(), kind);
        }
        assert!(matches!(
            CommandKind::try_from(29),
            Err(LockstepError::UnknownCommandKind { raw: 29 })
        ));
        assert!(matches!(
            CommandKind::try_from(255),
            Err(LockstepError::UnknownCommandKind { raw: 255 })
        ));
    }

    #[test]
    fn allocator_starts_at_reserved_offset() {
        let alloc = CommandIdAllocator::new();
        assert_eq!(alloc.next_id(), CommandId::new(64000));
        assert_eq!(alloc.next_id(), CommandId::new(64001));
        assert_eq!(alloc.next_id(), CommandId::new(64002));
    }

    #[test]
    fn allocator_wraps_to_zero() {
        let alloc = CommandIdAllocator::new();
        // Burn through the remainder of the id space.
        for _ in 0..(65536 - u32::from(COMMAND_ID_START)) {
            let _ = alloc.next_id();
        }
        assert_eq!(alloc.next_id(), CommandId::new(0));
        assert_eq!(alloc.next_id(), CommandId::new(1));
    }

    #[test]
    fn stamp_respects_requirements() {
        let alloc = CommandIdAllocator::new();

        let mut game = NetCommand::new(
            CommandKind::GameCommand,
            PeerId::new(0),
            Frame::new(20),
            vec![1, 2, 3],
        );
        alloc.stamp(&mut game);
        assert_eq!(game.id, Some(CommandId::new(64000)));

        // Stamping twice must not burn a second id.
        alloc.stamp(&mut game);
        assert_eq!(game.id, Some(CommandId::new(64000)));

        let mut keepalive =
            NetCommand::new(CommandKind::KeepAlive, PeerId::new(0), Frame::new(0), vec![]);
        alloc.stamp(&mut keepalive);
        assert_eq!(keepalive.id, None);
    }

    proptest! {
        /// No repeats within one unwrapped run: the first 1536 ids
        /// (64000..=65535) are pairwise distinct, and the sequence is the
        /// wrapping successor chain regardless of how many ids are drawn.
        #[test]
        fn allocator_sequence_is_successor_chain(count in 1usize..4096) {
            let alloc = CommandIdAllocator::new();
            let mut prev = alloc.next_id();
            for _ in 1..count {
                let next = alloc.next_id();
                prop_assert_eq!(next, prev.wrapping_next());
                prev = next;
            }
        }
    }
}
