//! Frame resend: recovery path for gaps the ack layer did not close.
//!
//! Two halves live here. The requesting half watches the head of the frame
//! window: when the next frame to release stays incomplete past a grace
//! period, a `FrameResendRequest` is issued to each peer whose bucket is
//! missing, rate-limited per (frame, peer) pair. The serving half retains
//! the local command history for the last [`FRAMES_TO_KEEP`] frames and
//! answers peers' resend requests from it.

use std::collections::{BTreeMap, VecDeque};

use smallvec::SmallVec;
use tracing::{debug, warn};
use web_time::{Duration, Instant};

use crate::{Frame, LockstepError, NetCommand, PeerId, ProtocolConfig, FRAMES_TO_KEEP};

/// Tracks head-of-window stalls and serves resend requests from history.
#[derive(Debug)]
pub struct ResendCoordinator {
    grace: Duration,
    request_interval: Duration,
    /// When the current head frame was first observed stalled.
    stalled_head: Option<(Frame, Instant)>,
    /// Last request instant per (frame, peer), for rate limiting.
    requested: BTreeMap<(Frame, PeerId), Instant>,
    /// Local outbound commands per finished frame, oldest first.
    history: VecDeque<(Frame, Vec<NetCommand>)>,
}

impl ResendCoordinator {
    /// Creates a coordinator with the given grace and rate-limit intervals.
    #[must_use]
    pub fn new(grace: Duration, request_interval: Duration) -> Self {
        Self {
            grace,
            request_interval,
            stalled_head: None,
            requested: BTreeMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Creates a coordinator from a [`ProtocolConfig`].
    #[must_use]
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.resend_grace, config.resend_request_interval)
    }

    /// Records the local commands sent for a finished frame so they can be
    /// served to peers that missed them. History is capped at
    /// [`FRAMES_TO_KEEP`] frames; older entries rotate out.
    pub fn record_frame(&mut self, frame: Frame, commands: Vec<NetCommand>) {
        self.history.push_back((frame, commands));
        while self.history.len() > FRAMES_TO_KEEP as usize {
            self.history.pop_front();
        }
    }

    /// The oldest frame still answerable from history.
    #[must_use]
    pub fn oldest_retained(&self) -> Option<Frame> {
        self.history.front().map(|(frame, _)| *frame)
    }

    /// Watches the head of the frame window. `head` is the next frame the
    /// window wants to release and `missing` the peers whose bucket for it
    /// is still empty. Returns the (frame, peer) pairs to send a
    /// `FrameResendRequest` for this tick.
    pub fn scan(
        &mut self,
        head: Frame,
        missing: &[PeerId],
        now: Instant,
    ) -> SmallVec<[(Frame, PeerId); 4]> {
        let mut requests = SmallVec::new();
        if missing.is_empty() {
            self.stalled_head = None;
            self.requested.retain(|(frame, _), _| *frame >= head);
            return requests;
        }
        let since = match self.stalled_head {
            Some((frame, since)) if frame == head => since,
            _ => {
                self.stalled_head = Some((head, now));
                now
            }
        };
        if now.duration_since(since) < self.grace {
            return requests;
        }
        for &peer in missing {
            let due = self
                .requested
                .get(&(head, peer))
                .map_or(true, |last| {
                    now.duration_since(*last) >= self.request_interval
                });
            if due {
                debug!("Requesting resend of frame {head} from {peer}");
                self.requested.insert((head, peer), now);
                requests.push((head, peer));
            }
        }
        requests
    }

    /// Serves a peer's resend request for `frame` from local history. An
    /// empty slice means the frame was finished with no commands; the caller
    /// re-sends the frame marker in that case.
    pub fn on_resend_request(&self, frame: Frame) -> Result<&[NetCommand], LockstepError> {
        let Some(oldest_retained) = self.oldest_retained() else {
            return Err(LockstepError::InvalidRequest {
                info: format!("Resend of frame {frame} requested before any frame was finished"),
            });
        };
        if frame < oldest_retained {
            warn!("Resend of frame {frame} is beyond retention ({oldest_retained} is oldest)");
            return Err(LockstepError::RetentionExceeded {
                frame,
                oldest_retained,
            });
        }
        self.history
            .iter()
            .find(|(f, _)| *f == frame)
            .map(|(_, commands)| commands.as_slice())
            .ok_or(LockstepError::InvalidRequest {
                info: format!("Frame {frame} has not been finished yet"),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::CommandKind;

    const P1: PeerId = PeerId::new(1);
    const P2: PeerId = PeerId::new(2);
    const GRACE: Duration = Duration::from_millis(100);
    const INTERVAL: Duration = Duration::from_millis(250);

    fn coordinator() -> ResendCoordinator {
        ResendCoordinator::new(GRACE, INTERVAL)
    }

    fn command(frame: u32) -> NetCommand {
        NetCommand::new(
            CommandKind::GameCommand,
            PeerId::new(0),
            Frame::new(frame),
            vec![7],
        )
    }

    #[test]
    fn no_request_inside_the_grace_period() {
        let mut coord = coordinator();
        let now = Instant::now();
        assert!(coord.scan(Frame::new(5), &[P1], now).is_empty());
        assert!(coord
            .scan(Frame::new(5), &[P1], now + GRACE / 2)
            .is_empty());
    }

    #[test]
    fn stalled_head_requests_from_each_missing_peer() {
        let mut coord = coordinator();
        let now = Instant::now();
        coord.scan(Frame::new(5), &[P1, P2], now);
        let requests = coord.scan(Frame::new(5), &[P1, P2], now + GRACE);
        assert_eq!(
            requests.as_slice(),
            &[(Frame::new(5), P1), (Frame::new(5), P2)]
        );
    }

    #[test]
    fn repeat_requests_are_rate_limited() {
        let mut coord = coordinator();
        let now = Instant::now();
        coord.scan(Frame::new(5), &[P1], now);
        assert_eq!(coord.scan(Frame::new(5), &[P1], now + GRACE).len(), 1);
        // Still stalled, but inside the request interval.
        assert!(coord
            .scan(Frame::new(5), &[P1], now + GRACE + INTERVAL / 2)
            .is_empty());
        // Past the interval the request repeats.
        assert_eq!(
            coord
                .scan(Frame::new(5), &[P1], now + GRACE + INTERVAL)
                .len(),
            1
        );
    }

    #[test]
    fn head_advance_resets_the_stall_clock() {
        let mut coord = coordinator();
        let now = Instant::now();
        coord.scan(Frame::new(5), &[P1], now);
        // Frame 5 completed; frame 6 stalls afresh and gets its own grace.
        assert!(coord
            .scan(Frame::new(6), &[P1], now + GRACE)
            .is_empty());
        assert_eq!(
            coord
                .scan(Frame::new(6), &[P1], now + GRACE * 2)
                .len(),
            1
        );
    }

    #[test]
    fn completion_clears_the_stall() {
        let mut coord = coordinator();
        let now = Instant::now();
        coord.scan(Frame::new(5), &[P1], now);
        assert!(coord.scan(Frame::new(5), &[], now + GRACE).is_empty());
        // A later stall of the same frame number starts a new grace period.
        assert!(coord
            .scan(Frame::new(5), &[P1], now + GRACE * 2)
            .is_empty());
    }

    #[test]
    fn serves_recorded_frames_from_history() {
        let mut coord = coordinator();
        coord.record_frame(Frame::new(3), vec![command(3)]);
        coord.record_frame(Frame::new(4), vec![]);

        let served = coord.on_resend_request(Frame::new(3)).unwrap();
        assert_eq!(served.len(), 1);
        // An empty frame is a valid answer: the frame marker gets re-sent.
        assert!(coord.on_resend_request(Frame::new(4)).unwrap().is_empty());
    }

    #[test]
    fn history_is_bounded_and_old_frames_error() {
        let mut coord = coordinator();
        for f in 0..(FRAMES_TO_KEEP + 10) {
            coord.record_frame(Frame::new(f), vec![]);
        }
        assert_eq!(coord.oldest_retained(), Some(Frame::new(10)));
        assert!(matches!(
            coord.on_resend_request(Frame::new(2)),
            Err(LockstepError::RetentionExceeded { frame, oldest_retained })
                if frame == Frame::new(2) && oldest_retained == Frame::new(10)
        ));
    }

    #[test]
    fn unfinished_frames_are_invalid_requests() {
        let mut coord = coordinator();
        assert!(matches!(
            coord.on_resend_request(Frame::new(0)),
            Err(LockstepError::InvalidRequest { .. })
        ));
        coord.record_frame(Frame::new(0), vec![]);
        assert!(matches!(
            coord.on_resend_request(Frame::new(99)),
            Err(LockstepError::InvalidRequest { .. })
        ));
    }
}
