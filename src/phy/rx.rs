//! Receiver: sampling, NRZI decoding and bit unstuffing.

use super::{BusIo, BusState, LineState, Phy};
use crate::packet::{RawPacket, MAX_PACKET_SIZE};

/// Number of bit periods without a transition after which the sender
/// inserts a stuffed transition.
pub(crate) const MAX_RUN: u8 = 6;

impl<H: BusIo> Phy<H> {
    /// Spin until the line leaves `from`, or `timeout` cycles after
    /// `bit_time` have passed. On a transition, `bit_time` is moved to the
    /// time it was observed.
    fn wait_transition(&mut self, from: LineState, bit_time: &mut u32, timeout: u32) -> bool {
        loop {
            let now = self.io.now();
            if now.wrapping_sub(*bit_time) > timeout {
                return false;
            }
            if self.io.read() != from {
                *bit_time = now;
                return true;
            }
        }
    }

    /// Returns `true` when SE0 persists for at least the reset time
    /// counted from `bit_time`.
    ///
    /// If the line is not SE0, `bit_time` is moved to the time that was
    /// observed.
    pub fn check_reset(&mut self, bit_time: &mut u32) -> bool {
        let reset = self.timing.reset;
        !self.wait_transition(LineState::Se0, bit_time, reset)
    }

    /// Validate the SE0 and J that end a packet.
    ///
    /// `bit_time` is when SE0 was first sampled. Returns:
    ///
    /// * [`BusState::Reset`] if SE0 lasts long enough to be a bus reset,
    /// * [`BusState::Desynced`] if the line does not settle to J,
    /// * [`BusState::Synced`] if SE0 was shorter than one bit,
    /// * [`BusState::Ok`] for a valid end of packet.
    pub fn check_eop(&mut self, bit_time: &mut u32) -> BusState {
        let se0_start = *bit_time;

        if self.check_reset(bit_time) {
            return BusState::Reset;
        }

        let settle = self.timing.eop_settle;
        self.wait_until(*bit_time, settle);
        if self.io.read() != LineState::J {
            return BusState::Desynced;
        }

        if bit_time.wrapping_sub(se0_start) < self.timing.cycles_per_bit {
            BusState::Synced
        } else {
            BusState::Ok
        }
    }

    /// Wait for the line to leave idle J. `bit_time` is moved to the time
    /// of the transition.
    pub fn wait_for_start_of_packet(&mut self, bit_time: &mut u32, timeout: u32) -> bool {
        self.wait_transition(LineState::J, bit_time, timeout)
    }

    /// Decode one byte.
    ///
    /// The sample taken in each iteration is processed only after the bit
    /// period has elapsed, which leaves the bus time to settle. A run of
    /// six bits without a transition forces one more sample even after the
    /// eighth bit so that a stuffed transition is never left pending.
    fn rx_byte(
        &mut self,
        bit_time: &mut u32,
        previous: &mut LineState,
        run: &mut u8,
    ) -> Result<u8, BusState> {
        let per_bit = self.timing.cycles_per_bit;
        let mut byte = 0u8;
        let mut bit = 0;

        while bit < 8 || *run == MAX_RUN {
            let line = self.io.read();
            self.wait_until(*bit_time, per_bit);

            match line {
                LineState::J | LineState::K => {
                    if line != *previous {
                        *previous = line;
                        if *run < MAX_RUN {
                            byte >>= 1;
                            bit += 1;
                        }
                        *run = 0;
                    } else {
                        *run += 1;
                        if *run > MAX_RUN {
                            return Err(BusState::Desynced);
                        }
                        byte = (byte >> 1) | 0x80;
                        bit += 1;
                    }
                }
                LineState::Se0 if bit == 0 => return Err(BusState::Synced),
                _ => return Err(BusState::Desynced),
            }

            *bit_time = bit_time.wrapping_add(per_bit);
        }

        Ok(byte)
    }

    /// Receive bytes of a packet whose start was observed at `bit_time`.
    ///
    /// Stops at SE0 on a byte boundary or when the buffer is full. On
    /// return `bit_time` points at the first SE0 sample.
    pub fn receive(&mut self, bit_time: &mut u32, packet: &mut RawPacket) -> Result<usize, BusState> {
        let mut previous = LineState::J;
        let mut run = 0;

        packet.clear();
        while packet.len() < MAX_PACKET_SIZE {
            match self.rx_byte(bit_time, &mut previous, &mut run) {
                Ok(byte) => packet.push(byte),
                Err(BusState::Synced) => break,
                Err(_) => return Err(BusState::Desynced),
            }
        }

        Ok(packet.len())
    }

    /// Wait for, receive and delimit the next packet.
    ///
    /// Gives up with [`BusState::Synced`] after the packet timeout. The
    /// byte count is returned only when the packet ended with a valid
    /// end of packet.
    pub fn next_packet(&mut self, bit_time: &mut u32, packet: &mut RawPacket) -> Result<usize, BusState> {
        let timeout = self.timing.packet_timeout;
        if !self.wait_for_start_of_packet(bit_time, timeout) {
            return Err(BusState::Synced);
        }

        let len = self.receive(bit_time, packet)?;
        match self.check_eop(bit_time) {
            BusState::Ok => Ok(len),
            other => Err(other),
        }
    }
}
