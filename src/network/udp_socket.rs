use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use tracing::{error, warn};

use crate::network::codec;
use crate::{network::messages::Message, NonBlockingSocket};

const RECV_BUFFER_SIZE: usize = 4096;
/// Size of the pre-allocated send buffer. This should be large enough to hold
/// any message we might send. 1KB is generous for typical wire messages.
const SEND_BUFFER_SIZE: usize = 1024;
/// A packet larger than this may be fragmented, so ideally we wouldn't send
/// packets larger than this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A simple non-blocking UDP socket to use with lockstep sessions. Listens
/// to 0.0.0.0 on a given port.
///
/// # Performance
///
/// This socket maintains internal buffers for both sending and receiving to
/// minimize allocations in the hot path. The send buffer is reused across
/// calls to [`send_to`], and the receive buffer is sized to handle typical
/// UDP MTU sizes.
///
/// [`send_to`]: NonBlockingSocket::send_to
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    /// Receive buffer, reused across recv_from calls.
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    /// Send buffer, reused across send_to calls to avoid allocation.
    send_buffer: [u8; SEND_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds an UDP socket to 0.0.0.0:port and sets it to non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: [0; SEND_BUFFER_SIZE],
        })
    }

    /// Sends an already-encoded packet to the given address.
    fn send_encoded_packet(&self, buf: &[u8], addr: &SocketAddr) {
        // Fragmented packets multiply the effective loss rate: losing any
        // fragment loses the whole datagram. A command batch this large
        // usually means oversized payloads, so surface it.
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            warn!(
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        // UDP is best-effort; a failed send is logged, never fatal. The ack
        // layer treats it like any other lost packet.
        if let Err(e) = self.socket.send_to(buf, addr) {
            warn!("Failed to send UDP packet to {addr}: {e}");
        }
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        // Serialize into the pre-allocated send buffer to avoid allocation.
        let len = match codec::encode_into(msg, &mut self.send_buffer) {
            Ok(len) => len,
            Err(codec::CodecError::BufferTooSmall { provided }) => {
                // Unusual but recoverable: fall back to an allocating encode.
                warn!(
                    "Message too large for send buffer ({provided} bytes), \
                     falling back to allocation"
                );
                match codec::encode(msg) {
                    Ok(buf) => {
                        self.send_encoded_packet(&buf, addr);
                        return;
                    }
                    Err(e) => {
                        error!("Failed to serialize message: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Failed to serialize message: {e}");
                return;
            }
        };

        let buf_slice = self.send_buffer.get(..len).unwrap_or_else(|| {
            error!(
                "send_buffer slice [..{len}] out of bounds (buffer size: {})",
                self.send_buffer.len()
            );
            &[]
        });
        self.send_encoded_packet(buf_slice, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        // Pre-allocate for the typical case of 1-4 messages per poll.
        let mut received_messages = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    if let Some(buf_slice) = self.recv_buffer.get(0..number_of_bytes) {
                        // Undecodable datagrams are stray or corrupt
                        // traffic; drop them without ceremony.
                        if let Ok(msg) = codec::decode_value(buf_slice) {
                            received_messages.push((src_addr, msg));
                        }
                    }
                }
                // There are no more messages.
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // Datagram sockets sometimes report this as a result of an
                // earlier send_to; keep draining.
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    error!("Unexpected socket error: {:?}: {err}", err.kind());
                    return received_messages;
                }
            }
        }
    }
}
