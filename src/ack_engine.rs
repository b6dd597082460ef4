//! Ack/retry bookkeeping: reliable delivery over the unreliable transport.
//!
//! Every ack-required send is recorded per peer, keyed by command id. An
//! entry is cleared by any acknowledgment stage; entries older than the
//! retry timeout are retransmitted unchanged; entries that exhaust their
//! retries escalate the peer to the connection state machine as lagging.
//! The engine itself never declares a disconnect.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{trace, warn};
use web_time::{Duration, Instant};

use crate::{CommandId, NetCommand, PeerId, ProtocolConfig};

/// One unacknowledged send awaiting a peer's acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// The command as originally sent. Retransmissions send it unchanged,
    /// same id included, so the receiver's duplicate detection holds.
    pub command: NetCommand,
    /// When the command was first transmitted.
    pub first_sent: Instant,
    /// When the command was last (re)transmitted.
    pub last_sent: Instant,
    /// How many times the command has been retransmitted.
    pub retry_count: u32,
    /// Whether this entry already escalated its peer as lagging. Escalation
    /// fires once per entry, not once per tick.
    escalated: bool,
}

/// The outcome of one retry tick.
#[derive(Debug, Default)]
pub struct RetryTick {
    /// Commands to retransmit, with their destination peer.
    pub retransmit: Vec<(PeerId, NetCommand)>,
    /// Peers that exhausted the retry budget this tick. The connection
    /// state machine decides what happens to them.
    pub lagging: SmallVec<[PeerId; 8]>,
}

/// Tracks unacknowledged sends per peer and drives retransmission.
#[derive(Debug)]
pub struct AckEngine {
    retry_timeout: Duration,
    max_retries: u32,
    unacked: BTreeMap<PeerId, BTreeMap<CommandId, PendingSend>>,
    last_acked: BTreeMap<PeerId, CommandId>,
}

impl AckEngine {
    /// Creates an engine with the given retry policy.
    #[must_use]
    pub fn new(retry_timeout: Duration, max_retries: u32) -> Self {
        Self {
            retry_timeout,
            max_retries,
            unacked: BTreeMap::new(),
            last_acked: BTreeMap::new(),
        }
    }

    /// Creates an engine from a [`ProtocolConfig`].
    #[must_use]
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.retry_timeout, config.max_retries)
    }

    /// Records an ack-required send to `peer`. Commands without an id are
    /// ignored: nothing could ever clear them.
    pub fn record_send(&mut self, peer: PeerId, command: &NetCommand, now: Instant) {
        if !command.requirements().needs_ack {
            return;
        }
        let Some(id) = command.id else {
            warn!(
                "Ack-required {} command has no id; cannot track it",
                command.kind
            );
            return;
        };
        self.unacked.entry(peer).or_default().insert(
            id,
            PendingSend {
                command: command.clone(),
                first_sent: now,
                last_sent: now,
                retry_count: 0,
                escalated: false,
            },
        );
    }

    /// Clears the pending entry for `id`. Duplicate or out-of-order acks
    /// are idempotent no-ops; returns whether an entry was actually
    /// cleared.
    pub fn on_ack(&mut self, peer: PeerId, id: CommandId) -> bool {
        let cleared = self
            .unacked
            .get_mut(&peer)
            .is_some_and(|pending| pending.remove(&id).is_some());
        if cleared {
            trace!("{peer} acked {id}");
            self.last_acked.insert(peer, id);
        }
        cleared
    }

    /// Retransmits every entry older than the retry timeout and reports
    /// peers whose entries exhausted the retry budget. Call once per
    /// simulation tick; a readiness-wait timeout still counts as a tick.
    pub fn tick(&mut self, now: Instant) -> RetryTick {
        let mut outcome = RetryTick::default();
        for (&peer, pending) in &mut self.unacked {
            for entry in pending.values_mut() {
                if now.duration_since(entry.last_sent) < self.retry_timeout {
                    continue;
                }
                if entry.retry_count >= self.max_retries {
                    if !entry.escalated {
                        entry.escalated = true;
                        warn!(
                            "{peer} ignored {} retransmissions of {}; escalating as lagging",
                            entry.retry_count, entry.command.kind
                        );
                        if !outcome.lagging.contains(&peer) {
                            outcome.lagging.push(peer);
                        }
                    }
                    continue;
                }
                entry.retry_count += 1;
                entry.last_sent = now;
                outcome.retransmit.push((peer, entry.command.clone()));
            }
        }
        outcome
    }

    /// Discards all bookkeeping for `peer`, e.g. after disconnect.
    pub fn drop_peer(&mut self, peer: PeerId) {
        self.unacked.remove(&peer);
        self.last_acked.remove(&peer);
    }

    /// Number of sends to `peer` still awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self, peer: PeerId) -> usize {
        self.unacked.get(&peer).map_or(0, BTreeMap::len)
    }

    /// The most recently acknowledged command id for `peer`, if any.
    #[must_use]
    pub fn last_acked(&self, peer: PeerId) -> Option<CommandId> {
        self.last_acked.get(&peer).copied()
    }
}
