//! The session: one peer's complete view of a lockstep match.
//!
//! [`LockstepSession`] wires the frame window, ack engine, connection table,
//! packet router and resend coordinator together behind a request-driven
//! event drain. The caller submits commands, finishes frames, and calls
//! [`tick`](LockstepSession::tick) once per simulation step; every protocol
//! outcome comes back as a [`SessionEvent`] rather than through callbacks.
//!
//! One tick performs, in order: drain the socket once, apply inbound
//! packets, advance peer liveness, retransmit unacknowledged sends, scan for
//! head-of-window gaps, and release completed frames.

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;

use tracing::{debug, info, trace, warn};
use web_time::Instant;

use crate::command::classify;
use crate::network::messages::{
    AckPacket, AckStage, CommandPacket, Message, MessageBody, MessageHeader, RelayForward,
};
use crate::rng::Pcg32;
use crate::{
    AckEngine, BufferOutcome, CommandId, CommandIdAllocator, CommandKind, ConnectionTable, Frame,
    FrameWindow, LockstepError, NetCommand, NonBlockingSocket, PacketRouter, PeerId, PeerState,
    ProtocolConfig, ResendCoordinator, RouteDecision, VoteOutcome, MAX_FRAMES_AHEAD, MIN_RUNAHEAD,
};

/// Seed for the header magic when [`ProtocolConfig::session_seed`] is unset.
/// All peers of one match must agree on the seed; set one per match to keep
/// concurrent matches on a shared port from cross-talking.
const DEFAULT_SESSION_SEED: u64 = 0x6c6f_636b_7374_6570;

/// Everything a tick can tell the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A frame completed: every connected peer's commands for it are here,
    /// in ascending [`PeerId`] order. Frames arrive strictly in order.
    FrameReady {
        /// The completed frame.
        frame: Frame,
        /// Each connected peer's command bucket for the frame. An empty
        /// bucket means the peer issued no commands that frame.
        commands: Vec<(PeerId, Vec<NetCommand>)>,
    },
    /// A peer moved on the disconnect escalation ladder.
    PeerStateChanged {
        /// The peer that changed state.
        peer: PeerId,
        /// Its new state.
        state: PeerState,
    },
    /// A peer exhausted the retransmission budget for at least one command.
    PeerLagging {
        /// The unresponsive peer.
        peer: PeerId,
    },
    /// A peer requested a resend of a frame we no longer retain. The peer
    /// is too far behind to recover and has been flagged.
    RetentionExceeded {
        /// The peer that asked.
        peer: PeerId,
        /// The frame it asked for.
        frame: Frame,
    },
    /// A non-frame-synchronized command arrived: load progress, disconnect
    /// screen traffic, file transfer chunks, NAT probes. The payload is
    /// opaque to this layer.
    Control {
        /// The peer the command originated from.
        peer: PeerId,
        /// What kind of command it is.
        kind: CommandKind,
        /// Its opaque payload.
        payload: Vec<u8>,
    },
}

/// Coverage agreement for one retiring peer. Survivors can hold different
/// amounts of the dead peer's traffic, so each reports the first frame it has
/// no bucket for; the retirement settles on the maximum once every survivor
/// has reported, and the best-covered survivor forwards what the others lack.
#[derive(Debug, Default)]
struct Retirement {
    /// First uncovered frame per reporting survivor, ourselves included.
    reports: BTreeMap<PeerId, Frame>,
    /// The agreed cutoff, once every survivor has reported.
    cutoff: Option<Frame>,
}

/// One peer's lockstep session for a match.
///
/// Generic over the transport address `A` and the socket `S`; the session
/// owns its socket. For UDP play use
/// [`UdpNonBlockingSocket`](crate::UdpNonBlockingSocket) with
/// `A = SocketAddr`.
#[derive(Debug)]
pub struct LockstepSession<A, S>
where
    A: Clone + PartialEq + Eq + Hash,
    S: NonBlockingSocket<A>,
{
    local: PeerId,
    magic: u16,
    socket: S,
    window: FrameWindow,
    acks: AckEngine,
    connections: ConnectionTable<A>,
    router: PacketRouter<A>,
    resend: ResendCoordinator,
    allocator: CommandIdAllocator,
    /// Current run-ahead distance; adjusted mid-match by `RunAhead`.
    runahead: u32,
    /// The next local simulation frame to be finished.
    current_frame: Frame,
    /// Sync-critical commands sent since the last finished frame; they
    /// become that frame's resend history.
    pending_local: VecDeque<NetCommand>,
    /// Open and settled coverage agreements for retiring peers.
    retirements: BTreeMap<PeerId, Retirement>,
}

impl<A, S> LockstepSession<A, S>
where
    A: Clone + PartialEq + Eq + Hash,
    S: NonBlockingSocket<A>,
{
    /// Creates a session for `local`, with every remote peer and its
    /// transport address known up front from match setup.
    #[must_use]
    pub fn new(
        local: PeerId,
        peers: impl IntoIterator<Item = (PeerId, A)>,
        config: ProtocolConfig,
        socket: S,
    ) -> Self {
        let now = Instant::now();
        let mut connections = ConnectionTable::new(local, config);
        let mut gate = vec![local];
        for (peer, addr) in peers {
            connections.add_peer(peer, addr, now);
            gate.push(peer);
        }

        let runahead = config.clamped_runahead();
        let mut window = FrameWindow::new(gate.iter().copied());
        // Submissions always target at least `runahead` frames ahead, so the
        // frames below it are empty by protocol on every peer. Seed them as
        // complete locally; no wire traffic is needed for them.
        for f in 0..runahead {
            for &peer in &gate {
                let info =
                    NetCommand::new(CommandKind::FrameInfo, peer, Frame::new(f), Vec::new());
                let _ = window.buffer(info);
            }
        }

        let seed = config.session_seed.unwrap_or(DEFAULT_SESSION_SEED);
        let magic = Pcg32::seed_from_u64(seed).next_u16();

        Self {
            local,
            magic,
            socket,
            window,
            acks: AckEngine::from_config(&config),
            connections,
            router: PacketRouter::direct_only(local),
            resend: ResendCoordinator::from_config(&config),
            allocator: CommandIdAllocator::new(),
            runahead,
            current_frame: Frame::new(0),
            pending_local: VecDeque::new(),
            retirements: BTreeMap::new(),
        }
    }

    /// The local peer id.
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// The next local simulation frame to be finished.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The last frame released through
    /// [`SessionEvent::FrameReady`], if any.
    #[must_use]
    pub fn confirmed_frame(&self) -> Option<Frame> {
        self.window.confirmed()
    }

    /// The current run-ahead distance in frames.
    #[must_use]
    pub fn runahead(&self) -> u32 {
        self.runahead
    }

    /// Where `peer` sits on the disconnect escalation ladder.
    #[must_use]
    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.connections.state(peer)
    }

    /// Commands sent to `peer` still awaiting acknowledgment.
    #[must_use]
    pub fn pending_acks(&self, peer: PeerId) -> usize {
        self.acks.pending_count(peer)
    }

    /// Designates `relay` as the match's packet router. Pass the local peer
    /// id to make this session the relay.
    pub fn set_relay(&mut self, relay: PeerId) -> Result<(), LockstepError> {
        if relay == self.local {
            self.router.set_local_relay();
            return Ok(());
        }
        let addr = self
            .connections
            .addr(relay)
            .cloned()
            .ok_or(LockstepError::UnknownPeer { peer: relay })?;
        self.router.set_relay(relay, addr);
        Ok(())
    }

    /// Submits a local command. It targets `current_frame + runahead`, is
    /// stamped with an id where its kind requires one, buffered locally and
    /// broadcast to every connected peer. Returns the target frame.
    ///
    /// # Errors
    ///
    /// [`LockstepError::FrameTooFarAhead`] is back-pressure: the local
    /// simulation has outrun its peers and must stall before resubmitting.
    /// Internal kinds (acks, `FrameInfo`, keepalives, resend requests) are
    /// rejected with [`LockstepError::InvalidRequest`].
    pub fn submit_command(
        &mut self,
        kind: CommandKind,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<Frame, LockstepError> {
        if kind.is_ack()
            || matches!(
                kind,
                CommandKind::FrameInfo
                    | CommandKind::KeepAlive
                    | CommandKind::DisconnectKeepAlive
                    | CommandKind::FrameResendRequest
            )
        {
            return Err(LockstepError::InvalidRequest {
                info: format!("{kind} is generated by the session, not submitted"),
            });
        }

        let target = self.current_frame + self.runahead;
        let mut command = NetCommand::new(kind, self.local, target, payload);
        self.allocator.stamp(&mut command);

        let req = classify(kind);
        if req.sync_critical && !req.direct_send {
            self.window.buffer(command.clone())?;
            self.pending_local.push_back(command.clone());
        }
        self.broadcast(&command, now);
        Ok(target)
    }

    /// Finishes the current local simulation frame: a `FrameInfo` marks the
    /// frame's bucket complete on every peer (even when no commands were
    /// submitted), the frame's commands are recorded as resend history, and
    /// the session advances to the next frame. Returns the finished frame's
    /// target frame.
    ///
    /// # Errors
    ///
    /// [`LockstepError::FrameTooFarAhead`] is back-pressure: the local
    /// simulation has outrun its peers by the full window. The frame is NOT
    /// finished and the session does not advance; stall until frames release
    /// and retry.
    pub fn finish_frame(&mut self, now: Instant) -> Result<Frame, LockstepError> {
        let target = self.current_frame + self.runahead;
        let mut info = NetCommand::new(CommandKind::FrameInfo, self.local, target, Vec::new());
        self.allocator.stamp(&mut info);
        match self.window.buffer(info.clone()) {
            Ok(_) => {}
            Err(e @ LockstepError::FrameTooFarAhead { .. }) => return Err(e),
            Err(e) => debug!("Own frame marker for {target} not buffered: {e}"),
        }
        self.broadcast(&info, now);

        let mut history: Vec<NetCommand> = self.pending_local.drain(..).collect();
        history.push(info);
        self.resend.record_frame(target, history);

        self.current_frame = self.current_frame.next();
        Ok(target)
    }

    /// Advances the session by one step and returns everything that
    /// happened. Call once per simulation tick; a tick spent waiting for a
    /// stalled frame still counts.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        // Drain the socket exactly once per tick.
        let inbound = self.socket.receive_all_messages();
        for (_addr, message) in inbound {
            self.handle_message(message, now, &mut events);
        }

        // Peer liveness.
        let conn_tick = self.connections.tick(now);
        for (peer, state) in conn_tick.state_changes {
            events.push(SessionEvent::PeerStateChanged { peer, state });
        }
        for peer in conn_tick.keepalive_due {
            let keepalive = NetCommand::new(
                CommandKind::KeepAlive,
                self.local,
                self.current_frame,
                Vec::new(),
            );
            self.dispatch(&keepalive, peer, now);
        }
        for target in conn_tick.vote_started {
            self.start_disconnect_vote(target, now, &mut events);
        }

        // Retransmissions and retry exhaustion.
        let retry = self.acks.tick(now);
        for (peer, command) in retry.retransmit {
            self.transmit(&command, peer);
        }
        for peer in retry.lagging {
            events.push(SessionEvent::PeerLagging { peer });
            if let Some(state) = self.connections.mark_lagging(peer) {
                events.push(SessionEvent::PeerStateChanged { peer, state });
            }
        }

        // Settle coverage agreements whose reporters have all arrived.
        self.settle_open_retirements();

        // Head-of-window gap recovery. Gaps owed by a retired peer are
        // requested from the best-covered survivor instead.
        let head = self.window.next_release();
        let missing: Vec<PeerId> = self
            .window
            .missing_peers(head)
            .into_iter()
            .filter(|&p| p != self.local)
            .collect();
        for (frame, peer) in self.resend.scan(head, &missing, now) {
            let server = if self.connections.state(peer) == Some(PeerState::Disconnected) {
                self.coverage_server(peer, frame)
            } else {
                Some(peer)
            };
            let Some(server) = server else {
                continue;
            };
            let mut request = NetCommand::new(
                CommandKind::FrameResendRequest,
                self.local,
                frame,
                frame.as_u32().to_le_bytes().to_vec(),
            );
            self.allocator.stamp(&mut request);
            self.dispatch(&request, server, now);
        }

        // Release completed frames, in order.
        let released = self.window.drain_complete();
        for (frame, buckets) in released {
            self.process_released(frame, &buckets, now, &mut events);
            events.push(SessionEvent::FrameReady {
                frame,
                commands: buckets,
            });
        }
        events
    }

    fn header(&self) -> MessageHeader {
        MessageHeader {
            magic: self.magic,
            sender: self.local,
        }
    }

    /// Routes and sends one command without touching ack bookkeeping.
    fn transmit(&mut self, command: &NetCommand, dest: PeerId) {
        let Some(addr) = self.connections.addr(dest).cloned() else {
            warn!("No address for {dest}, dropping {} send", command.kind);
            return;
        };
        let packet = CommandPacket::from_command(command);
        let (send_addr, body) = match self.router.route(command.kind, dest, &addr) {
            RouteDecision::Direct(a) => (a, MessageBody::Command(packet)),
            RouteDecision::Relay { relay_addr, dest } => (
                relay_addr,
                MessageBody::RelayForward(RelayForward {
                    dest,
                    inner: Box::new(packet),
                }),
            ),
        };
        let msg = Message {
            header: self.header(),
            body,
        };
        self.socket.send_to(&msg, &send_addr);
    }

    /// Sends one command to `dest` and records it for retransmission where
    /// its kind requires an ack.
    fn dispatch(&mut self, command: &NetCommand, dest: PeerId, now: Instant) {
        self.transmit(command, dest);
        self.acks.record_send(dest, command, now);
    }

    fn broadcast(&mut self, command: &NetCommand, now: Instant) {
        let peers: Vec<PeerId> = self.connections.connected_peers().map(|(p, _)| p).collect();
        for dest in peers {
            self.dispatch(command, dest, now);
        }
    }

    /// Acks go direct to the origin: they are tiny, latency-sensitive, and
    /// pointless to relay. Commands of a retired peer arriving via a
    /// surviving forwarder are not acked; the forwarder does not wait for
    /// acks and the origin is gone.
    fn send_ack(&mut self, dest: PeerId, stage: AckStage, id: CommandId) {
        if self.connections.state(dest) == Some(PeerState::Disconnected) {
            return;
        }
        let Some(addr) = self.connections.addr(dest).cloned() else {
            return;
        };
        let msg = Message {
            header: self.header(),
            body: MessageBody::Ack(AckPacket {
                stage,
                acked_id: id,
            }),
        };
        trace!("Acking {id} to {dest} ({})", stage.kind());
        self.socket.send_to(&msg, &addr);
    }

    fn handle_message(&mut self, message: Message, now: Instant, events: &mut Vec<SessionEvent>) {
        if message.header.magic != self.magic {
            trace!(
                "Dropping packet with foreign magic {:#06x}",
                message.header.magic
            );
            return;
        }
        let sender = message.header.sender;
        match self.connections.record_traffic(sender, now) {
            Ok(Some(state)) => events.push(SessionEvent::PeerStateChanged {
                peer: sender,
                state,
            }),
            Ok(None) => {}
            Err(_) => {
                warn!("Dropping packet from unknown {sender}");
                return;
            }
        }
        match message.body {
            MessageBody::Ack(ack) => {
                self.acks.on_ack(sender, ack.acked_id);
            }
            MessageBody::Command(packet) => self.handle_command(sender, &packet, now, events),
            MessageBody::RelayForward(forward) => {
                if forward.dest == self.local {
                    self.handle_command(sender, &forward.inner, now, events);
                } else if self.router.is_local_relay() {
                    if let Some(dest_addr) = self.connections.addr(forward.dest).cloned() {
                        let forwarded_id = forward.inner.id;
                        let msg = Message {
                            header: self.header(),
                            body: MessageBody::Command(*forward.inner),
                        };
                        self.socket.send_to(&msg, &dest_addr);
                        // Receipt to the origin: the relay took custody of
                        // the packet. Delivery acks still come end-to-end
                        // from the destination.
                        if let Some(id) = forwarded_id {
                            let receipt = NetCommand::new(
                                CommandKind::PacketRouterAck,
                                self.local,
                                self.current_frame,
                                id.as_u16().to_le_bytes().to_vec(),
                            );
                            self.dispatch(&receipt, sender, now);
                        }
                    } else {
                        warn!("Cannot forward to unknown {}", forward.dest);
                    }
                } else {
                    warn!("{sender} asked us to forward but we are not the relay");
                }
            }
        }
    }

    fn handle_command(
        &mut self,
        sender: PeerId,
        packet: &CommandPacket,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        let command = match packet.to_command() {
            Ok(command) => command,
            Err(e) => {
                debug!("{e}");
                if let Some(state) = self.connections.record_unknown_kind(sender) {
                    events.push(SessionEvent::PeerStateChanged {
                        peer: sender,
                        state,
                    });
                }
                return;
            }
        };

        let req = command.requirements();
        if req.direct_send {
            self.handle_control(sender, command, now, events);
            return;
        }
        if req.sync_critical {
            let origin = command.origin;
            let id = command.id;
            match self.window.buffer(command) {
                Ok(BufferOutcome::Buffered) => {
                    if let Some(id) = id {
                        self.send_ack(origin, AckStage::Stage1, id);
                    }
                }
                // A duplicate means our ack got lost; re-ack so the sender
                // stops retransmitting. Same for frames already retired.
                Ok(BufferOutcome::Duplicate)
                | Err(LockstepError::AlreadyDelivered { .. })
                | Err(LockstepError::FrameExpired { .. }) => {
                    if let Some(id) = id {
                        self.send_ack(origin, AckStage::Both, id);
                    }
                }
                Err(e) => warn!("Dropping command from {origin}: {e}"),
            }
            return;
        }

        match command.kind {
            CommandKind::KeepAlive | CommandKind::DisconnectKeepAlive => {}
            // Answer relay liveness probes immediately.
            CommandKind::PacketRouterQuery => {
                let reply = NetCommand::new(
                    CommandKind::PacketRouterAck,
                    self.local,
                    self.current_frame,
                    command.payload,
                );
                self.dispatch(&reply, sender, now);
            }
            // Router receipts and the remaining fire-and-forget kinds
            // surface to the caller.
            _ => events.push(SessionEvent::Control {
                peer: command.origin,
                kind: command.kind,
                payload: command.payload,
            }),
        }
    }

    /// Handles the direct-send control set. These act immediately on
    /// receipt: they exist for situations where the frame stream is stalled
    /// (a dead peer, possibly the relay itself), so buffering them in the
    /// window would deadlock.
    fn handle_control(
        &mut self,
        sender: PeerId,
        command: NetCommand,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        // Every direct-send kind is ack-required; combined ack, since these
        // are applied the moment they arrive.
        if let Some(id) = command.id {
            self.send_ack(command.origin, AckStage::Both, id);
        }

        match command.kind {
            CommandKind::TimeoutStart => {
                let Some(target) = command.payload.first().map(|&b| PeerId::new(b)) else {
                    return;
                };
                if let Some(state) = self.connections.mark_lagging(target) {
                    events.push(SessionEvent::PeerStateChanged {
                        peer: target,
                        state,
                    });
                }
            }
            CommandKind::DisconnectVote => {
                let Some(target) = command.payload.first().map(|&b| PeerId::new(b)) else {
                    return;
                };
                match self.connections.on_disconnect_vote(target, command.origin) {
                    Ok(VoteOutcome::Quorum) => {
                        self.complete_disconnect_vote(target, now, events);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Ignoring vote from {sender}: {e}"),
                }
            }
            CommandKind::DisconnectPlayer => {
                let Some(target) = command.payload.first().map(|&b| PeerId::new(b)) else {
                    return;
                };
                if let Ok(Some(state)) = self.connections.on_player_leave(target) {
                    events.push(SessionEvent::PeerStateChanged {
                        peer: target,
                        state,
                    });
                }
                self.begin_retirement(target, now);
            }
            CommandKind::DisconnectFrame => {
                self.handle_coverage_report(&command, now, events);
            }
            CommandKind::FrameResendRequest => {
                let frame = command
                    .payload
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .map(|b: [u8; 4]| Frame::new(u32::from_le_bytes(b)));
                let Some(frame) = frame else {
                    debug!("Malformed resend request from {sender}");
                    return;
                };
                // Streams of retired peers are served from the window's
                // retained buckets; their origins can no longer answer.
                let mut relayed: Vec<NetCommand> = Vec::new();
                for &dead in self.retirements.keys() {
                    if let Some(commands) = self.window.peer_frame_commands(dead, frame) {
                        relayed.extend_from_slice(commands);
                    }
                }
                for resend in &relayed {
                    self.transmit(resend, sender);
                }
                match self.resend.on_resend_request(frame) {
                    Ok(commands) => {
                        info!("Resending frame {frame} to {sender}");
                        let commands = commands.to_vec();
                        for resend in &commands {
                            self.transmit(resend, sender);
                        }
                    }
                    Err(LockstepError::RetentionExceeded { frame, .. }) => {
                        events.push(SessionEvent::RetentionExceeded {
                            peer: sender,
                            frame,
                        });
                        if let Some(state) = self.connections.mark_lagging(sender) {
                            events.push(SessionEvent::PeerStateChanged {
                                peer: sender,
                                state,
                            });
                        }
                    }
                    Err(e) => debug!("Cannot serve resend for {sender}: {e}"),
                }
            }
            CommandKind::File
            | CommandKind::FileAnnounce
            | CommandKind::FileProgress
            | CommandKind::DisconnectScreenOff => events.push(SessionEvent::Control {
                peer: command.origin,
                kind: command.kind,
                payload: command.payload,
            }),
            other => debug!("Unexpected control kind {other} from {sender}"),
        }
    }

    /// Opens a disconnect vote against `target`: announce the timeout
    /// directly to every peer, cast our own vote, and count it.
    fn start_disconnect_vote(
        &mut self,
        target: PeerId,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        let mut timeout = NetCommand::new(
            CommandKind::TimeoutStart,
            self.local,
            self.current_frame,
            vec![target.as_u8()],
        );
        self.allocator.stamp(&mut timeout);
        self.broadcast(&timeout, now);

        let mut vote = NetCommand::new(
            CommandKind::DisconnectVote,
            self.local,
            self.current_frame,
            vec![target.as_u8()],
        );
        self.allocator.stamp(&mut vote);
        self.broadcast(&vote, now);

        if let Ok(VoteOutcome::Quorum) = self.connections.on_disconnect_vote(target, self.local) {
            self.complete_disconnect_vote(target, now, events);
        }
    }

    /// A disconnect vote reached quorum: retire the peer, announce the
    /// outcome directly (peers whose votes were lost still converge), and
    /// schedule the simulation-level retirement on a common frame.
    fn complete_disconnect_vote(
        &mut self,
        target: PeerId,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        events.push(SessionEvent::PeerStateChanged {
            peer: target,
            state: PeerState::Disconnected,
        });
        self.begin_retirement(target, now);

        let mut announce = NetCommand::new(
            CommandKind::DisconnectPlayer,
            self.local,
            self.current_frame,
            vec![target.as_u8()],
        );
        self.allocator.stamp(&mut announce);
        self.broadcast(&announce, now);

        // Every surviving peer schedules this; the simulation must retire a
        // player idempotently, regardless of which copy arrives first.
        let mut destroy = NetCommand::new(
            CommandKind::DestroyPlayer,
            self.local,
            self.current_frame + self.runahead,
            vec![target.as_u8()],
        );
        self.allocator.stamp(&mut destroy);
        if self.window.buffer(destroy.clone()).is_ok() {
            self.pending_local.push_back(destroy.clone());
        }
        self.broadcast(&destroy, now);
    }

    /// Starts retiring a dead peer: drop its pending acks, stop relaying
    /// through it, and open a coverage agreement by broadcasting how far
    /// our buffered copy of its command stream reaches. The completeness
    /// gate stays in place until every survivor has reported; see
    /// [`try_settle_retirement`](Self::try_settle_retirement).
    fn begin_retirement(&mut self, target: PeerId, now: Instant) {
        self.acks.drop_peer(target);
        if self.router.relay() == Some(target) {
            self.router.clear_relay();
        }
        if self.retirements.contains_key(&target) {
            return;
        }

        let mut first_uncovered = self.window.next_release();
        while self.window.covered(target, first_uncovered) {
            first_uncovered = first_uncovered.next();
        }

        let mut payload = vec![target.as_u8()];
        payload.extend_from_slice(&first_uncovered.as_u32().to_le_bytes());
        let mut report = NetCommand::new(
            CommandKind::DisconnectFrame,
            self.local,
            self.current_frame,
            payload,
        );
        self.allocator.stamp(&mut report);
        self.broadcast(&report, now);

        let mut reports = BTreeMap::new();
        reports.insert(self.local, first_uncovered);
        self.retirements.insert(
            target,
            Retirement {
                reports,
                cutoff: None,
            },
        );
        self.try_settle_retirement(target);
    }

    /// Settles a coverage agreement once every survivor has reported: the
    /// cutoff is the maximum reported first-uncovered frame, so the dead
    /// peer's last included frame is identical on every survivor.
    fn try_settle_retirement(&mut self, target: PeerId) {
        let expected: Vec<PeerId> = std::iter::once(self.local)
            .chain(self.connections.connected_peers().map(|(p, _)| p))
            .collect();
        let Some(retirement) = self.retirements.get_mut(&target) else {
            return;
        };
        if retirement.cutoff.is_some() {
            return;
        }
        if !expected.iter().all(|p| retirement.reports.contains_key(p)) {
            return;
        }
        let Some(&cutoff) = retirement.reports.values().max() else {
            return;
        };
        retirement.cutoff = Some(cutoff);
        info!("{target} retires; its stream is included up to frame {cutoff}");
        self.window.retire_peer_after(target, cutoff);
    }

    /// Re-checks open coverage agreements. A survivor disconnecting
    /// mid-agreement shrinks the expected reporter set, which can settle a
    /// retirement without further traffic.
    fn settle_open_retirements(&mut self) {
        let open: Vec<PeerId> = self
            .retirements
            .iter()
            .filter(|(_, r)| r.cutoff.is_none())
            .map(|(&p, _)| p)
            .collect();
        for target in open {
            self.try_settle_retirement(target);
        }
    }

    /// The survivor best placed to serve `retired`'s bucket for `frame`,
    /// judged by the coverage reports.
    fn coverage_server(&self, retired: PeerId, frame: Frame) -> Option<PeerId> {
        let retirement = self.retirements.get(&retired)?;
        retirement
            .reports
            .iter()
            .filter(|(&reporter, &covered_until)| reporter != self.local && covered_until > frame)
            .max_by_key(|(_, &covered_until)| covered_until)
            .map(|(&reporter, _)| reporter)
    }

    /// A survivor reported how far its copy of a dead peer's stream
    /// reaches. Record the report, and forward the part of our own copy
    /// the reporter lacks so its gate can fill.
    fn handle_coverage_report(
        &mut self,
        command: &NetCommand,
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        let Some(target) = command.payload.first().map(|&b| PeerId::new(b)) else {
            return;
        };
        let reported = command
            .payload
            .get(1..5)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(|b| Frame::new(u32::from_le_bytes(b)));
        let Some(reported) = reported else {
            debug!("Malformed coverage report from {}", command.origin);
            return;
        };

        // The report may be the first we hear of the disconnect.
        if self.connections.state(target) != Some(PeerState::Disconnected) {
            if let Ok(Some(state)) = self.connections.on_player_leave(target) {
                events.push(SessionEvent::PeerStateChanged {
                    peer: target,
                    state,
                });
            }
        }
        self.begin_retirement(target, now);
        if let Some(retirement) = self.retirements.get_mut(&target) {
            retirement.reports.insert(command.origin, reported);
        }
        self.try_settle_retirement(target);
        self.forward_coverage(target, reported, command.origin);
    }

    /// Forwards our retained copy of `retired`'s stream, starting at the
    /// first frame `dest` reported missing, until our own copy runs out.
    /// Commands keep their original origin and ids, so duplicates collapse
    /// in the receiver's window.
    fn forward_coverage(&mut self, retired: PeerId, from: Frame, dest: PeerId) {
        let mut frame = from;
        loop {
            let Some(commands) = self.window.peer_frame_commands(retired, frame) else {
                break;
            };
            let commands = commands.to_vec();
            for command in &commands {
                self.transmit(command, dest);
            }
            frame = frame.next();
        }
    }

    /// Applies protocol-relevant commands of a released frame and sends
    /// stage-2 acks: the commands are now executed, not merely buffered.
    fn process_released(
        &mut self,
        frame: Frame,
        buckets: &[(PeerId, Vec<NetCommand>)],
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        for (origin, commands) in buckets {
            for command in commands {
                if *origin != self.local {
                    if let Some(id) = command.id {
                        self.send_ack(*origin, AckStage::Stage2, id);
                    }
                }
                match command.kind {
                    CommandKind::PlayerLeave => self.handle_departure(*origin, frame, events),
                    CommandKind::DestroyPlayer => {
                        if let Some(&b) = command.payload.first() {
                            self.handle_departure(PeerId::new(b), frame, events);
                        }
                    }
                    CommandKind::RunAhead => {
                        if let Some(&b) = command.payload.first() {
                            self.apply_runahead(b, now);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// A departure released inside the frame stream itself. The released
    /// frame is a common boundary on every peer, so the cutoff is its
    /// successor; no coverage agreement is needed.
    fn handle_departure(&mut self, target: PeerId, frame: Frame, events: &mut Vec<SessionEvent>) {
        if let Ok(Some(state)) = self.connections.on_player_leave(target) {
            events.push(SessionEvent::PeerStateChanged {
                peer: target,
                state,
            });
        }
        self.acks.drop_peer(target);
        if self.router.relay() == Some(target) {
            self.router.clear_relay();
        }
        if !self.retirements.contains_key(&target) {
            self.window.retire_peer_after(target, frame.next());
            self.retirements.insert(
                target,
                Retirement {
                    reports: BTreeMap::new(),
                    cutoff: Some(frame.next()),
                },
            );
        }
    }

    /// Changes the run-ahead distance. All peers apply the same `RunAhead`
    /// command on the same released frame, so the adjustment is identical
    /// everywhere. Growing the distance leaves a range of target frames no
    /// `finish_frame` will ever mark; those are filled here. Shrinking it
    /// would make targets jump backwards over frames already marked, so the
    /// local frame counter jumps forward by the difference instead: the next
    /// finish target is always the successor of the last one.
    fn apply_runahead(&mut self, new_raw: u8, now: Instant) {
        let new = u32::from(new_raw).clamp(MIN_RUNAHEAD, MAX_FRAMES_AHEAD);
        let old = self.runahead;
        if new == old {
            return;
        }
        info!("Run-ahead adjusted {old} -> {new}");
        self.runahead = new;
        if new > old {
            for offset in old..new {
                let frame = self.current_frame + offset;
                let mut info =
                    NetCommand::new(CommandKind::FrameInfo, self.local, frame, Vec::new());
                self.allocator.stamp(&mut info);
                let _ = self.window.buffer(info.clone());
                self.broadcast(&info, now);
                self.resend.record_frame(frame, vec![info]);
            }
        } else {
            self.current_frame = self.current_frame + (old - new);
        }
    }
}
