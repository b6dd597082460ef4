//! # Rampart Lockstep
//!
//! Rampart Lockstep is a deterministic lockstep command-synchronization layer
//! for peer-to-peer real-time-strategy matches, written in 100% safe Rust.
//! It distributes player commands to every peer in a match and guarantees
//! that all peers consume the identical ordered command stream on the
//! identical simulation frame, despite network jitter, packet loss,
//! duplication and peer disconnects.
//!
//! The crate deliberately does **not** simulate anything. It hands completed
//! frames to the caller through a request-driven event drain: instead of
//! registering callbacks, [`LockstepSession::tick`] returns a list of
//! [`SessionEvent`]s for the caller to act on.
//!
//! The transport is abstracted as an unreliable, unordered datagram socket
//! via the [`NonBlockingSocket`] trait; a ready-made UDP implementation is
//! provided in [`UdpNonBlockingSocket`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::hash::Hash;

pub use ack_engine::{AckEngine, PendingSend};
pub use command::{classify, CommandIdAllocator, CommandKind, CommandRequirements, NetCommand};
pub use config::ProtocolConfig;
pub use connection::{ConnectionTable, PeerConnection, PeerState, VoteOutcome};
pub use error::LockstepError;
pub use frame_window::{BufferOutcome, FrameWindow};
pub use network::messages::Message;
pub use network::resolve::{resolve_host, resolve_host_u32};
pub use network::udp_socket::UdpNonBlockingSocket;
pub use resend::ResendCoordinator;
pub use router::{PacketRouter, RouteDecision};
pub use session::{LockstepSession, SessionEvent};

pub mod ack_engine;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame_window;
pub mod resend;
pub mod rng;
pub mod router;
pub mod session;

/// Wire-level types and transport plumbing.
pub mod network {
    /// Binary codec for network message serialization.
    pub mod codec;
    /// Wire message and packet definitions.
    pub mod messages;
    /// Hostname and dotted-quad address resolution.
    pub mod resolve;
    /// Non-blocking UDP socket implementation.
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// The furthest a peer's commands may target ahead of the last confirmed
/// frame. Submissions beyond this bound are rejected with
/// [`LockstepError::FrameTooFarAhead`] as back-pressure.
pub const MAX_FRAMES_AHEAD: u32 = 128;

/// The minimum run-ahead distance between the confirmed frame and the frame
/// local commands target. Run-ahead below this would stall the simulation on
/// every round trip.
pub const MIN_RUNAHEAD: u32 = 10;

/// Number of slots in the circular frame window: enough for the full
/// run-ahead range plus the retained history, with slack so a slot is never
/// reused while still live.
pub const FRAME_DATA_LENGTH: usize = (MAX_FRAMES_AHEAD as usize + 1) * 2;

/// How many delivered frames stay resident in the window so that lagging
/// peers can request a resend before escalation toward disconnect.
pub const FRAMES_TO_KEEP: u32 = MAX_FRAMES_AHEAD / 2 + 1;

/// First value handed out by the command id allocator. Ids below this are
/// reserved as sentinels distinguishable from real allocations until the
/// 16-bit counter wraps.
pub const COMMAND_ID_START: u16 = 64000;

/// A frame is a single step of lockstep execution.
///
/// Frames start at 0 and increment sequentially. Commands are keyed by the
/// frame they must execute on (`target_frame`), never by arrival time.
///
/// `Frame` is a newtype around `u32` so frame numbers cannot be accidentally
/// mixed with other integers.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// Creates a new `Frame` from a `u32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The next frame.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Frame {
        Frame(self.0 + 1)
    }

    /// Frame distance to `other`, saturating at zero when `other` is ahead.
    #[inline]
    #[must_use]
    pub const fn distance_from(self, other: Frame) -> u32 {
        self.0.saturating_sub(other.0)
    }

    /// Frames this many steps back, saturating at frame 0.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u32) -> Frame {
        Frame(self.0.saturating_sub(rhs))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// Identifies one peer in a match.
///
/// Peer ids are assigned at match setup and are stable for the lifetime of
/// the match. Their numeric order is the deterministic tie-break used
/// whenever per-peer data for a frame is combined: peers are always iterated
/// in ascending `PeerId` order, never in packet arrival order.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PeerId(u8);

impl PeerId {
    /// Creates a new `PeerId`.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        PeerId(id)
    }

    /// Returns the underlying `u8` value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

/// A 16-bit command sequence id.
///
/// Ids are unique only within a bounded recency window: the counter wraps
/// modulo 65536, so equality checks between ids issued far apart are
/// meaningless. All duplicate detection in this crate happens inside the
/// frame window, whose retention is far smaller than half the id space.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct CommandId(u16);

impl CommandId {
    /// Creates a new `CommandId` from a raw `u16`.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        CommandId(id)
    }

    /// Returns the underlying `u16` value.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// The wrapping successor of this id.
    #[inline]
    #[must_use]
    pub const fn wrapping_next(self) -> CommandId {
        CommandId(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// This [`NonBlockingSocket`] trait is used when you want to use Rampart
/// Lockstep with your own transport. However you wish to send and receive
/// messages, it should be implemented through these two methods. Messages
/// should be sent in a UDP-like fashion: unordered, unreliable, possibly
/// duplicated. Rampart Lockstep runs its own acknowledgment protocol on top
/// to make sure every sync-critical command arrives exactly once.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Takes a [`Message`] and sends it to the given address.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns all messages received since the last call. The pairs
    /// `(A, Message)` indicate from which address each packet was received.
    /// Must never block: an empty `Vec` means nothing is pending.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}

// #########
// # TESTS #
// #########
