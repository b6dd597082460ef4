//! The run-ahead frame window: flow control and reassembly core.
//!
//! A bounded circular buffer of per-frame command buckets. Commands are
//! inserted under their target frame; a frame is *complete* once every
//! currently-connected peer has a bucket for it (possibly empty, via
//! `FrameInfo`), and complete frames are released to the consumer in
//! strictly ascending order. Released frames stay resident for
//! [`FRAMES_TO_KEEP`] rotations so late duplicates are recognized and
//! resend requests can be answered.

use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;
use tracing::trace;

use crate::{
    CommandId, CommandKind, Frame, LockstepError, NetCommand, PeerId, FRAMES_TO_KEEP,
    FRAME_DATA_LENGTH, MAX_FRAMES_AHEAD,
};

/// What happened to a buffered command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferOutcome {
    /// The command was inserted into its frame's bucket.
    Buffered,
    /// A command with the same id was already buffered for this frame. The
    /// duplicate is discarded; simulation effect stays exactly-once. The
    /// sender most likely lost our ack, so re-acking is appropriate.
    Duplicate,
}

/// One slot of the circular window: command buckets for a single frame.
#[derive(Debug, Default)]
struct FrameSlot {
    /// The frame this slot currently represents. Slots are lazily recycled:
    /// a stale `frame` value means the slot still holds rotated-out data.
    frame: Frame,
    /// Whether this slot was ever claimed for `frame` (frame 0 shares the
    /// default value, so a flag is needed to tell "empty" apart).
    claimed: bool,
    /// Whether this frame was already released to the consumer.
    delivered: bool,
    /// Commands per peer. Presence of a key means the peer's bucket for
    /// this frame is populated, even when the Vec is empty.
    buckets: BTreeMap<PeerId, Vec<NetCommand>>,
    /// Ids seen in this slot, keyed by origin so that independently
    /// allocated ids from different peers never collide. Duplicate-safe
    /// exactly-once delivery.
    seen_ids: BTreeSet<(PeerId, CommandId)>,
}

impl FrameSlot {
    fn reset_for(&mut self, frame: Frame) {
        self.frame = frame;
        self.claimed = true;
        self.delivered = false;
        self.buckets.clear();
        self.seen_ids.clear();
    }
}

/// Bounded run-ahead window of per-frame command buckets.
///
/// Flow control: insertions more than [`MAX_FRAMES_AHEAD`] past the last
/// confirmed frame fail with [`LockstepError::FrameTooFarAhead`]; that is
/// back-pressure on the submitter, not a peer fault. Insertions older than
/// the retained history fail with [`LockstepError::FrameExpired`], and
/// frames already handed to the consumer report
/// [`LockstepError::AlreadyDelivered`]; both are informational no-ops.
#[derive(Debug)]
pub struct FrameWindow {
    slots: Vec<FrameSlot>,
    /// The lowest frame not yet released to the consumer.
    next_release: Frame,
    /// Peers whose buckets gate frame completeness, including the local
    /// peer.
    peers: BTreeSet<PeerId>,
    /// Retired peers and the first frame released without them. Frames
    /// below the cutoff still gate on the retired peer's bucket; its
    /// commands at or past the cutoff are discarded. Entries are kept for
    /// the rest of the match so late strays from the dead peer stay
    /// blocked.
    retired: BTreeMap<PeerId, Frame>,
}

impl FrameWindow {
    /// Creates a window gated on the given set of connected peers.
    #[must_use]
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        let mut slots = Vec::with_capacity(FRAME_DATA_LENGTH);
        slots.resize_with(FRAME_DATA_LENGTH, FrameSlot::default);
        Self {
            slots,
            next_release: Frame::new(0),
            peers: peers.into_iter().collect(),
            retired: BTreeMap::new(),
        }
    }

    /// The lowest frame not yet released.
    #[inline]
    #[must_use]
    pub fn next_release(&self) -> Frame {
        self.next_release
    }

    /// The last frame released to the consumer, if any.
    #[inline]
    #[must_use]
    pub fn confirmed(&self) -> Option<Frame> {
        (self.next_release.as_u32() > 0).then(|| self.next_release.saturating_sub(1))
    }

    /// The oldest frame still retained for duplicate detection and resend.
    #[inline]
    #[must_use]
    pub fn oldest_retained(&self) -> Frame {
        self.next_release.saturating_sub(FRAMES_TO_KEEP)
    }

    /// Adds a peer whose bucket now gates completeness.
    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    /// Removes a peer from the completeness gate. Frames previously stuck
    /// on this peer's missing buckets may complete on the next drain;
    /// commands the peer did deliver remain buffered and are still
    /// released.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        self.retired.remove(&peer);
    }

    /// Retires a peer at an agreed cutoff: frames below `cutoff` still wait
    /// for the peer's buckets (so every survivor releases the identical
    /// stream up to the peer's last included frame), frames at or past it
    /// release without the peer. Buffered data the peer targeted at or past
    /// the cutoff is discarded, and later arrivals from it are dropped.
    pub fn retire_peer_after(&mut self, peer: PeerId, cutoff: Frame) {
        self.peers.remove(&peer);
        for slot in &mut self.slots {
            if slot.claimed && !slot.delivered && slot.frame >= cutoff {
                slot.buckets.remove(&peer);
            }
        }
        self.retired.insert(peer, cutoff);
    }

    /// Whether `peer` has a buffered bucket for `frame`, released or not.
    #[must_use]
    pub fn covered(&self, peer: PeerId, frame: Frame) -> bool {
        let slot = self.slot(frame);
        slot.claimed && slot.frame == frame && slot.buckets.contains_key(&peer)
    }

    /// The retained bucket of `peer` for `frame`, including the empty-frame
    /// marker, so the stream can be forwarded verbatim to a peer that never
    /// received it. Works for already-released frames still in retention.
    #[must_use]
    pub fn peer_frame_commands(&self, peer: PeerId, frame: Frame) -> Option<&[NetCommand]> {
        let slot = self.slot(frame);
        if !slot.claimed || slot.frame != frame {
            return None;
        }
        slot.buckets.get(&peer).map(Vec::as_slice)
    }

    /// The peers currently gating completeness.
    #[must_use]
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    fn slot_index(frame: Frame) -> usize {
        frame.as_u32() as usize % FRAME_DATA_LENGTH
    }

    fn slot(&self, frame: Frame) -> &FrameSlot {
        // Index is always in range by construction of slot_index.
        &self.slots[Self::slot_index(frame)]
    }

    fn check_frame_bounds(&self, frame: Frame) -> Result<(), LockstepError> {
        if frame.as_u32() >= self.next_release.as_u32() + MAX_FRAMES_AHEAD {
            return Err(LockstepError::FrameTooFarAhead {
                frame,
                confirmed: self.next_release.saturating_sub(1),
            });
        }
        if frame < self.oldest_retained() {
            return Err(LockstepError::FrameExpired {
                frame,
                oldest_retained: self.oldest_retained(),
            });
        }
        if frame < self.next_release {
            return Err(LockstepError::AlreadyDelivered { frame });
        }
        Ok(())
    }

    /// Inserts a command into the bucket of its target frame.
    ///
    /// A `FrameInfo` command completes the peer's bucket for a frame with
    /// no commands. The marker is stored in the bucket like any other
    /// command (retired streams are forwarded verbatim) but is filtered out
    /// of released output.
    pub fn buffer(&mut self, command: NetCommand) -> Result<BufferOutcome, LockstepError> {
        let frame = command.target_frame;
        if let Some(&cutoff) = self.retired.get(&command.origin) {
            if frame >= cutoff {
                trace!("Dropping command past the cutoff of retired {}", command.origin);
                return Ok(BufferOutcome::Duplicate);
            }
        }
        self.check_frame_bounds(frame)?;

        let idx = Self::slot_index(frame);
        let slot = &mut self.slots[idx];
        if !slot.claimed || slot.frame != frame {
            slot.reset_for(frame);
        }

        if let Some(id) = command.id {
            if !slot.seen_ids.insert((command.origin, id)) {
                trace!("Dropping duplicate command {id} from {} for frame {frame}", command.origin);
                return Ok(BufferOutcome::Duplicate);
            }
        }

        slot.buckets.entry(command.origin).or_default().push(command);
        Ok(BufferOutcome::Buffered)
    }

    /// Whether every currently-connected peer has a (possibly empty) bucket
    /// for `frame`. Retired peers still gate frames below their cutoff.
    #[must_use]
    pub fn is_complete(&self, frame: Frame) -> bool {
        let slot = self.slot(frame);
        if !slot.claimed || slot.frame != frame || self.peers.is_empty() {
            return false;
        }
        self.peers.iter().all(|p| slot.buckets.contains_key(p))
            && self
                .retired
                .iter()
                .all(|(p, &cutoff)| frame >= cutoff || slot.buckets.contains_key(p))
    }

    /// Peers whose bucket for `frame` is still missing, including retired
    /// peers whose cutoff is past `frame`. Used by the resend coordinator
    /// to identify the owing peer for the head frame.
    #[must_use]
    pub fn missing_peers(&self, frame: Frame) -> SmallVec<[PeerId; 8]> {
        let slot = self.slot(frame);
        let slot_live = slot.claimed && slot.frame == frame;
        self.peers
            .iter()
            .copied()
            .chain(
                self.retired
                    .iter()
                    .filter(|(_, &cutoff)| frame < cutoff)
                    .map(|(&p, _)| p),
            )
            .filter(|p| !slot_live || !slot.buckets.contains_key(p))
            .collect()
    }

    /// Releases every newly completed frame, in strictly ascending frame
    /// order. A later frame that completed first is never released before
    /// all earlier frames: release always advances one frame at a time from
    /// the window head.
    ///
    /// Each released tuple lists the buckets of every connected peer in
    /// ascending [`PeerId`] order (never in arrival order), which keeps
    /// cross-peer command ordering deterministic. Empty-frame markers are
    /// filtered out of the released buckets. The buckets themselves stay
    /// resident for the retention period so resend requests can be served
    /// from them.
    pub fn drain_complete(&mut self) -> Vec<(Frame, Vec<(PeerId, Vec<NetCommand>)>)> {
        let mut released = Vec::new();
        while self.is_complete(self.next_release) {
            let frame = self.next_release;
            let idx = Self::slot_index(frame);
            let slot = &mut self.slots[idx];
            slot.delivered = true;

            // BTreeMap iteration gives ascending PeerId order.
            let commands: Vec<(PeerId, Vec<NetCommand>)> = slot
                .buckets
                .iter()
                .map(|(peer, bucket)| {
                    let visible: Vec<NetCommand> = bucket
                        .iter()
                        .filter(|c| c.kind != CommandKind::FrameInfo)
                        .cloned()
                        .collect();
                    (*peer, visible)
                })
                .collect();

            trace!("Releasing frame {frame} with {} peer buckets", commands.len());
            released.push((frame, commands));
            self.next_release = frame.next();
        }
        released
    }
}
