//! Errors this library can return.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PeerId};

/// This enum contains all error messages this library can return. Most API
/// functions will generally return a [`Result<(), LockstepError>`].
///
/// No condition in this layer terminates the process: a peer reaching
/// [`PeerState::Disconnected`](crate::PeerState::Disconnected) is a normal
/// terminal outcome, not an engine failure.
///
/// [`Result<(), LockstepError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockstepError {
    /// A packet carried a command kind byte outside the known enumeration.
    /// The packet is dropped; a peer that keeps sending unknown kinds is
    /// most likely running a different protocol version and gets flagged.
    UnknownCommandKind {
        /// The raw kind byte from the wire.
        raw: u8,
    },
    /// The target frame exceeds the last confirmed frame by more than
    /// [`MAX_FRAMES_AHEAD`](crate::MAX_FRAMES_AHEAD). This is local
    /// back-pressure: the submitter must stall, it is not a peer fault.
    FrameTooFarAhead {
        /// The frame that was requested.
        frame: Frame,
        /// The last confirmed (fully released) frame.
        confirmed: Frame,
    },
    /// The frame rotated out of the retained window; whatever was buffered
    /// for it is gone. Informational no-op for inbound traffic.
    FrameExpired {
        /// The frame that was requested.
        frame: Frame,
        /// The oldest frame still retained.
        oldest_retained: Frame,
    },
    /// The frame was already released to the consumer. Late duplicates land
    /// here; informational no-op.
    AlreadyDelivered {
        /// The frame that was requested.
        frame: Frame,
    },
    /// A peer requested a resend for a frame older than the retained
    /// history. This bounds how far a peer may lag before escalation
    /// toward disconnect.
    RetentionExceeded {
        /// The frame the peer asked for.
        frame: Frame,
        /// The oldest frame still retained.
        oldest_retained: Frame,
    },
    /// A peer id was used that this session does not know about.
    UnknownPeer {
        /// The offending peer id.
        peer: PeerId,
    },
    /// You made an invalid request, usually by using wrong parameters for
    /// function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
}

impl Display for LockstepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockstepError::UnknownCommandKind { raw } => {
                write!(f, "Unknown command kind {raw:#04x}; peer version mismatch?")
            }
            LockstepError::FrameTooFarAhead { frame, confirmed } => {
                write!(
                    f,
                    "Frame {frame} is too far ahead of confirmed frame {confirmed}; \
                     stall submissions until peers catch up."
                )
            }
            LockstepError::FrameExpired {
                frame,
                oldest_retained,
            } => {
                write!(
                    f,
                    "Frame {frame} expired from the window (oldest retained: {oldest_retained})."
                )
            }
            LockstepError::AlreadyDelivered { frame } => {
                write!(f, "Frame {frame} was already delivered to the consumer.")
            }
            LockstepError::RetentionExceeded {
                frame,
                oldest_retained,
            } => {
                write!(
                    f,
                    "Resend of frame {frame} exceeds retention (oldest retained: {oldest_retained})."
                )
            }
            LockstepError::UnknownPeer { peer } => {
                write!(f, "{peer} is not part of this match.")
            }
            LockstepError::InvalidRequest { info } => {
                write!(f, "Invalid request: {info}")
            }
        }
    }
}

impl Error for LockstepError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_frames() {
        let err = LockstepError::FrameTooFarAhead {
            frame: Frame::new(200),
            confirmed: Frame::new(10),
        };
        let text = err.to_string();
        assert!(text.contains("200"));
        assert!(text.contains("10"));

        let err = LockstepError::RetentionExceeded {
            frame: Frame::new(1),
            oldest_retained: Frame::new(80),
        };
        assert!(err.to_string().contains("retention"));
    }

    #[test]
    fn unknown_kind_shows_raw_byte() {
        let err = LockstepError::UnknownCommandKind { raw: 0xAB };
        assert!(err.to_string().contains("0xab"));
    }

    #[test]
    fn errors_are_cloneable_and_hashable() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(LockstepError::AlreadyDelivered {
            frame: Frame::new(4),
        });
        set.insert(LockstepError::AlreadyDelivered {
            frame: Frame::new(4),
        });
        assert_eq!(set.len(), 1);
    }
}
