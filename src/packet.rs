//! Packet framing and validation.
//!
//! A received packet is kept as raw bytes, including the sync byte, the
//! way the receiver produced it. The functions here check a packet
//! against the shape expected at each point of a transaction.

use crate::crc::{crc16, crc5_token, TOKEN_BITS};

/// Sync pattern `KJKJKJKK` as a byte, LSB first.
pub const SYNC: u8 = 0x80;

/// Maximum data payload of a low-speed packet.
pub const LOW_SPEED_PACKET_SIZE: usize = 8;

/// Receive buffer size: sync, PID, 8 data bytes and CRC16.
pub const MAX_PACKET_SIZE: usize = 2 + LOW_SPEED_PACKET_SIZE + 2;

/// Highest address a host may assign.
pub const MAX_ADDRESS: u8 = 127;

/// Packet identifiers as they appear on the wire, check nibble included.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pid {
    /// Host to device token.
    Out = 0xe1,
    /// Device to host token.
    In = 0x69,
    /// Control transfer setup token.
    Setup = 0x2d,
    /// Even data packet.
    Data0 = 0xc3,
    /// Odd data packet.
    Data1 = 0x4b,
    /// Positive handshake.
    Ack = 0xd2,
    /// Negative handshake.
    Nak = 0x5a,
    /// Endpoint halted or request not supported.
    Stall = 0x1e,
}

impl Pid {
    /// Decode a PID byte. Fails if the check nibble is not the complement
    /// of the type nibble, or for types this device never handles.
    pub fn from_byte(byte: u8) -> Option<Pid> {
        if byte >> 4 != !byte & 0x0f {
            return None;
        }
        match byte {
            0xe1 => Some(Pid::Out),
            0x69 => Some(Pid::In),
            0x2d => Some(Pid::Setup),
            0xc3 => Some(Pid::Data0),
            0x4b => Some(Pid::Data1),
            0xd2 => Some(Pid::Ack),
            0x5a => Some(Pid::Nak),
            0x1e => Some(Pid::Stall),
            _ => None,
        }
    }

    /// Whether packets with this PID carry a payload and CRC16.
    pub fn has_data(self) -> bool {
        matches!(self, Pid::Data0 | Pid::Data1)
    }
}

/// Bytes of one packet as received from the bus.
#[derive(Clone, Copy)]
pub struct RawPacket {
    buf: [u8; MAX_PACKET_SIZE],
    len: usize,
}

impl Default for RawPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawPacket {
    /// An empty packet.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_PACKET_SIZE],
            len: 0,
        }
    }

    /// Packet with the given bytes. Panics if `bytes` is longer than
    /// [`MAX_PACKET_SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut p = Self::new();
        p.buf[..bytes.len()].copy_from_slice(bytes);
        p.len = bytes.len();
        p
    }

    /// Received bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of received bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if no bytes were received.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }

    fn header(&self) -> Option<Pid> {
        if self.len < 2 || self.buf[0] != SYNC {
            return None;
        }
        Pid::from_byte(self.buf[1])
    }
}

/// A validated SETUP, OUT or IN token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    /// Token type.
    pub pid: Pid,
    /// Device address.
    pub address: u8,
    /// Endpoint number.
    pub endpoint: u8,
}

/// A validated DATA0 or DATA1 packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Data<'a> {
    /// `Pid::Data0` or `Pid::Data1`.
    pub pid: Pid,
    /// Payload without CRC.
    pub payload: &'a [u8],
}

/// Pack address and endpoint into the 11 token bits and append CRC5.
pub fn token_bits(address: u8, endpoint: u8) -> u16 {
    let token = (address as u16 & 0x7f) | ((endpoint as u16 & 0x0f) << 7);
    token | (crc5_token(token) << TOKEN_BITS)
}

/// Accept a token addressed to `address` with a valid CRC5.
pub fn check_token(packet: &RawPacket, address: u8) -> Option<Token> {
    if packet.len() != 4 {
        return None;
    }
    let pid = packet.header()?;
    if !matches!(pid, Pid::Setup | Pid::Out | Pid::In) {
        return None;
    }

    let raw = u16::from_le_bytes([packet.buf[2], packet.buf[3]]);
    let token = raw & ((1 << TOKEN_BITS) - 1);
    let crc = raw >> TOKEN_BITS;

    let token_address = (token & 0x7f) as u8;
    if token_address != address || crc5_token(token) != crc {
        return None;
    }

    Some(Token {
        pid,
        address: token_address,
        endpoint: (token >> 7) as u8,
    })
}

/// Accept an ACK handshake.
pub fn check_ack(packet: &RawPacket) -> bool {
    packet.len() == 2 && packet.header() == Some(Pid::Ack)
}

/// Accept a DATA0/DATA1 packet with 0 to 8 payload bytes and a matching
/// CRC16.
pub fn check_data(packet: &RawPacket) -> Option<Data<'_>> {
    let len = packet.len();
    if !(4..=MAX_PACKET_SIZE).contains(&len) {
        return None;
    }
    let pid = packet.header()?;
    if !pid.has_data() {
        return None;
    }

    let payload = &packet.buf[2..len - 2];
    let crc = u16::from_le_bytes([packet.buf[len - 2], packet.buf[len - 1]]);
    if crc16(payload) != crc {
        return None;
    }

    Some(Data { pid, payload })
}
