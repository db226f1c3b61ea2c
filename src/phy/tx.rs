//! Transmitter: NRZI encoding, bit stuffing and end of packet.

use super::rx::MAX_RUN;
use super::{BusIo, LineState, Phy};
use crate::crc::crc16;
use crate::packet::{Pid, LOW_SPEED_PACKET_SIZE, MAX_PACKET_SIZE, SYNC};

/// Handshake packets the device sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    /// Packet accepted.
    Ack,
    /// Request not supported or out of sequence.
    Stall,
}

impl From<Handshake> for Pid {
    fn from(h: Handshake) -> Pid {
        match h {
            Handshake::Ack => Pid::Ack,
            Handshake::Stall => Pid::Stall,
        }
    }
}

/// Data packet PIDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataPid {
    /// DATA0
    Data0,
    /// DATA1
    Data1,
}

impl DataPid {
    /// PID of the `counter`-th packet of a data stage. The first packet
    /// after SETUP is DATA1.
    pub fn for_packet(counter: usize) -> Self {
        if counter % 2 == 0 {
            DataPid::Data1
        } else {
            DataPid::Data0
        }
    }
}

impl From<DataPid> for Pid {
    fn from(d: DataPid) -> Pid {
        match d {
            DataPid::Data0 => Pid::Data0,
            DataPid::Data1 => Pid::Data1,
        }
    }
}

impl<H: BusIo> Phy<H> {
    /// Drive `state` at the next bit boundary.
    #[inline(always)]
    fn drive(&mut self, bit_time: &mut u32, state: LineState) {
        let per_bit = self.timing.cycles_per_bit;
        self.wait_until(*bit_time, per_bit);
        *bit_time = bit_time.wrapping_add(per_bit);
        self.io.write(state);
    }

    fn tx_bytes(&mut self, bit_time: &mut u32, bytes: &[u8]) {
        let mut level = LineState::J;
        let mut run = 0u8;

        for &byte in bytes {
            let mut bits = byte;
            let mut sent = 0;
            while sent < 8 {
                if bits & 1 == 0 {
                    level = level.toggled();
                    run = 0;
                } else {
                    run += 1;
                }
                self.drive(bit_time, level);

                if run >= MAX_RUN {
                    // next round sends a stuffed 0 in place of this bit
                    bits &= !1;
                } else {
                    bits >>= 1;
                    sent += 1;
                }
            }
        }
    }

    /// Send raw packet bytes, sync included, followed by end of packet.
    ///
    /// The line is driven to J one bit before the first sync bit. Returns
    /// the cycle count at which the final J was driven, which is where
    /// the wait for the host's next packet starts.
    pub fn transmit(&mut self, bytes: &[u8]) -> u32 {
        let mut bit_time = self.io.now();

        self.drive(&mut bit_time, LineState::J);
        self.io.set_output_enabled(true);

        self.tx_bytes(&mut bit_time, bytes);

        for state in [LineState::Se0, LineState::Se0, LineState::J] {
            self.drive(&mut bit_time, state);
        }
        self.io.set_output_enabled(false);

        bit_time
    }

    /// Send an ACK or STALL.
    pub fn send_handshake(&mut self, handshake: Handshake) -> u32 {
        self.transmit(&[SYNC, Pid::from(handshake) as u8])
    }

    /// Send a data packet with CRC16.
    ///
    /// # Panics
    ///
    /// If `data` is longer than the low-speed maximum of 8 bytes.
    pub fn send_data(&mut self, pid: DataPid, data: &[u8]) -> u32 {
        assert!(
            data.len() <= LOW_SPEED_PACKET_SIZE,
            "data packet exceeds low-speed maximum"
        );

        let mut packet = [0u8; MAX_PACKET_SIZE];
        let end = 2 + data.len();
        packet[0] = SYNC;
        packet[1] = Pid::from(pid) as u8;
        packet[2..end].copy_from_slice(data);
        packet[end..end + 2].copy_from_slice(&crc16(data).to_le_bytes());

        self.transmit(&packet[..end + 2])
    }
}
