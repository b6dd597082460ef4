use serde::{Deserialize, Serialize};

use crate::{CommandId, CommandKind, Frame, LockstepError, NetCommand, PeerId};

/// Header carried by every datagram.
///
/// The magic value is chosen per session at startup; packets whose magic does
/// not match the expected value of the sending peer are discarded before any
/// further parsing. This filters stray traffic from earlier matches on the
/// same port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
    pub sender: PeerId,
}

/// One command on the wire.
///
/// The kind travels as a raw byte rather than as [`CommandKind`] so that a
/// packet from a newer protocol version decodes cleanly and the unknown kind
/// can be counted against the sender instead of poisoning the whole datagram.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandPacket {
    pub kind: u8,
    pub id: Option<CommandId>,
    pub origin: PeerId,
    pub target_frame: Frame,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    /// Builds the wire form of a command.
    pub fn from_command(command: &NetCommand) -> Self {
        Self {
            kind: command.kind.as_u8(),
            id: command.id,
            origin: command.origin,
            target_frame: command.target_frame,
            payload: command.payload.clone(),
        }
    }

    /// Parses the wire form back into a command. Fails with
    /// [`LockstepError::UnknownCommandKind`] when the kind byte is not part
    /// of the known enumeration.
    pub fn to_command(&self) -> Result<NetCommand, LockstepError> {
        let kind = CommandKind::try_from(self.kind)?;
        Ok(NetCommand {
            kind,
            id: self.id,
            origin: self.origin,
            target_frame: self.target_frame,
            payload: self.payload.clone(),
        })
    }
}

impl std::fmt::Debug for CommandPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            kind,
            id,
            origin,
            target_frame,
            payload,
        } = self;

        f.debug_struct("CommandPacket")
            .field("kind", kind)
            .field("id", id)
            .field("origin", origin)
            .field("target_frame", target_frame)
            .field("payload", &BytesDebug(payload))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Which half of the two-stage acknowledgment a packet confirms. Either
/// stage (or the combined form) clears the sender's pending entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum AckStage {
    /// Received and buffered.
    Stage1,
    /// Executed on its target frame.
    Stage2,
    /// Both stages at once; the common case when a command is buffered and
    /// its frame is already due.
    Both,
}

impl AckStage {
    /// The command kind this stage is reported as in logs and statistics.
    pub fn kind(self) -> CommandKind {
        match self {
            AckStage::Stage1 => CommandKind::AckStage1,
            AckStage::Stage2 => CommandKind::AckStage2,
            AckStage::Both => CommandKind::AckBoth,
        }
    }
}

/// Acknowledges one command id back to its sender.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AckPacket {
    pub stage: AckStage,
    pub acked_id: CommandId,
}

/// A command wrapped for delivery through the packet-router relay. The relay
/// unwraps it and forwards the inner packet to `dest` unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RelayForward {
    pub dest: PeerId,
    pub inner: Box<CommandPacket>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    Command(CommandPacket),
    Ack(AckPacket),
    RelayForward(RelayForward),
}

/// A message that [`NonBlockingSocket`] sends and receives. When implementing
/// [`NonBlockingSocket`], you should deserialize received packets into this
/// `Message` type and pass them.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::network::codec;

    fn packet() -> CommandPacket {
        CommandPacket {
            kind: CommandKind::GameCommand.as_u8(),
            id: Some(CommandId::new(64000)),
            origin: PeerId::new(2),
            target_frame: Frame::new(20),
            payload: vec![0xDE, 0xAD],
        }
    }

    #[test]
    fn command_survives_the_wire_form() {
        let command = NetCommand {
            kind: CommandKind::Chat,
            id: Some(CommandId::new(64007)),
            origin: PeerId::new(1),
            target_frame: Frame::new(33),
            payload: vec![104, 105],
        };
        let wire = CommandPacket::from_command(&command);
        assert_eq!(wire.to_command().unwrap(), command);
    }

    #[test]
    fn unknown_kind_byte_is_reported_not_dropped_silently() {
        let wire = CommandPacket {
            kind: 0xEE,
            ..packet()
        };
        assert!(matches!(
            wire.to_command(),
            Err(LockstepError::UnknownCommandKind { raw: 0xEE })
        ));
    }

    #[test]
    fn message_serialization_roundtrips() {
        let msg = Message {
            header: MessageHeader {
                magic: 0xABCD,
                sender: PeerId::new(3),
            },
            body: MessageBody::Command(packet()),
        };
        let bytes = codec::encode(&msg).unwrap();
        let (decoded, _): (Message, _) = codec::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn relay_forward_carries_the_inner_packet_unchanged() {
        let inner = packet();
        let msg = Message {
            header: MessageHeader {
                magic: 0x1234,
                sender: PeerId::new(0),
            },
            body: MessageBody::RelayForward(RelayForward {
                dest: PeerId::new(2),
                inner: Box::new(inner.clone()),
            }),
        };
        let bytes = codec::encode(&msg).unwrap();
        let (decoded, _): (Message, _) = codec::decode(&bytes).unwrap();
        match decoded.body {
            MessageBody::RelayForward(forward) => {
                assert_eq!(forward.dest, PeerId::new(2));
                assert_eq!(*forward.inner, inner);
            }
            other => panic!("expected RelayForward, got {other:?}"),
        }
    }

    #[test]
    fn ack_stages_map_to_their_command_kinds() {
        assert_eq!(AckStage::Stage1.kind(), CommandKind::AckStage1);
        assert_eq!(AckStage::Stage2.kind(), CommandKind::AckStage2);
        assert_eq!(AckStage::Both.kind(), CommandKind::AckBoth);
    }

    #[test]
    fn packet_debug_prints_payload_as_hex() {
        let debug = format!("{:?}", packet());
        assert!(debug.contains("0xdead"));
    }
}
