//! Outbound routing through the packet-router relay.
//!
//! A match may designate one peer as the relay: commands to other peers are
//! wrapped and sent to the relay, which unwraps and forwards them. This cuts
//! the sender's upstream fan-out on asymmetric links. Commands whose kind is
//! classified `direct_send` bypass the relay always, because they exist to
//! handle the case where the relay itself is the unresponsive peer.

use std::hash::Hash;

use tracing::debug;

use crate::command::classify;
use crate::{CommandKind, PeerId};

/// How one outbound command should reach its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision<A> {
    /// Send straight to the destination address.
    Direct(A),
    /// Wrap the command and send it to the relay for forwarding.
    Relay {
        /// The relay's transport address.
        relay_addr: A,
        /// The peer the relay must forward to.
        dest: PeerId,
    },
}

/// Decides, per outbound command, whether to send direct or via the relay.
#[derive(Debug, Clone)]
pub struct PacketRouter<A> {
    local: PeerId,
    relay: Option<PeerId>,
    /// The relay's address; `None` when the local peer is the relay (its own
    /// address is never needed, it forwards inbound wraps itself).
    relay_addr: Option<A>,
}

impl<A> PacketRouter<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Creates a router with no relay; every command goes direct.
    #[must_use]
    pub fn direct_only(local: PeerId) -> Self {
        Self {
            local,
            relay: None,
            relay_addr: None,
        }
    }

    /// Creates a router that forwards through `relay` where permitted.
    #[must_use]
    pub fn with_relay(local: PeerId, relay: PeerId, relay_addr: A) -> Self {
        Self {
            local,
            relay: Some(relay),
            relay_addr: Some(relay_addr),
        }
    }

    /// The current relay peer, if one is designated.
    #[must_use]
    pub fn relay(&self) -> Option<PeerId> {
        self.relay
    }

    /// Whether this session is itself the relay for the match.
    #[must_use]
    pub fn is_local_relay(&self) -> bool {
        self.relay == Some(self.local)
    }

    /// Installs or replaces a remote relay, e.g. after a router migration.
    pub fn set_relay(&mut self, relay: PeerId, relay_addr: A) {
        debug!("Packet router is now {relay}");
        self.relay = Some(relay);
        self.relay_addr = Some(relay_addr);
    }

    /// Designates the local peer as the match's relay. Outbound traffic goes
    /// direct; inbound wraps get forwarded.
    pub fn set_local_relay(&mut self) {
        debug!("Packet router is now the local peer");
        self.relay = Some(self.local);
        self.relay_addr = None;
    }

    /// Drops the relay; all traffic goes direct from now on. Called when the
    /// relay peer disconnects.
    pub fn clear_relay(&mut self) {
        debug!("Packet router cleared, sending direct");
        self.relay = None;
        self.relay_addr = None;
    }

    /// Routes one command of `kind` headed for `dest` at `dest_addr`.
    ///
    /// Direct when the kind is classified `direct_send`, when no relay is
    /// designated, when the local peer is the relay, or when the destination
    /// is the relay itself (wrapping would be a pointless indirection).
    #[must_use]
    pub fn route(&self, kind: CommandKind, dest: PeerId, dest_addr: &A) -> RouteDecision<A> {
        match (self.relay, &self.relay_addr) {
            (Some(relay), Some(relay_addr))
                if !classify(kind).direct_send && relay != dest && relay != self.local =>
            {
                RouteDecision::Relay {
                    relay_addr: relay_addr.clone(),
                    dest,
                }
            }
            _ => RouteDecision::Direct(dest_addr.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: PeerId = PeerId::new(0);
    const RELAY: PeerId = PeerId::new(1);
    const DEST: PeerId = PeerId::new(2);

    #[test]
    fn no_relay_means_direct() {
        let router: PacketRouter<u32> = PacketRouter::direct_only(LOCAL);
        assert_eq!(
            router.route(CommandKind::GameCommand, DEST, &200),
            RouteDecision::Direct(200)
        );
    }

    #[test]
    fn relayable_kinds_go_through_the_relay() {
        let router = PacketRouter::with_relay(LOCAL, RELAY, 100u32);
        assert_eq!(
            router.route(CommandKind::GameCommand, DEST, &200),
            RouteDecision::Relay {
                relay_addr: 100,
                dest: DEST
            }
        );
        assert_eq!(
            router.route(CommandKind::Chat, DEST, &200),
            RouteDecision::Relay {
                relay_addr: 100,
                dest: DEST
            }
        );
    }

    #[test]
    fn direct_send_kinds_bypass_the_relay() {
        let router = PacketRouter::with_relay(LOCAL, RELAY, 100u32);
        for kind in [
            CommandKind::DisconnectVote,
            CommandKind::TimeoutStart,
            CommandKind::DisconnectPlayer,
            CommandKind::FrameResendRequest,
            CommandKind::DisconnectFrame,
        ] {
            assert_eq!(
                router.route(kind, DEST, &200),
                RouteDecision::Direct(200),
                "{kind} must bypass the relay"
            );
        }
    }

    #[test]
    fn traffic_to_the_relay_itself_is_direct() {
        let router = PacketRouter::with_relay(LOCAL, RELAY, 100u32);
        assert_eq!(
            router.route(CommandKind::GameCommand, RELAY, &100),
            RouteDecision::Direct(100)
        );
    }

    #[test]
    fn the_relay_peer_sends_everything_direct() {
        let mut router: PacketRouter<u32> = PacketRouter::direct_only(RELAY);
        router.set_local_relay();
        assert!(router.is_local_relay());
        assert_eq!(
            router.route(CommandKind::GameCommand, DEST, &200),
            RouteDecision::Direct(200)
        );
    }

    #[test]
    fn relay_can_be_replaced_or_cleared() {
        let mut router = PacketRouter::with_relay(LOCAL, RELAY, 100u32);
        router.set_relay(DEST, 200);
        assert_eq!(router.relay(), Some(DEST));

        router.clear_relay();
        assert_eq!(router.relay(), None);
        assert_eq!(
            router.route(CommandKind::GameCommand, DEST, &200),
            RouteDecision::Direct(200)
        );
    }
}
