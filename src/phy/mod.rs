//! Software USB low-speed PHY.
//!
//! The receiver and transmitter are busy-wait loops timed against a
//! free-running cycle counter supplied by [`BusIo`]. Every elapsed time
//! comparison uses wrapping subtraction, so the counter may overflow at
//! any point, including in the middle of a packet.

use crate::config::Timing;

pub mod rx;
pub mod tx;

pub use tx::{DataPid, Handshake};

/// Logical state of the D+/D- pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineState {
    /// Idle state, differential 1. For low speed D- is high.
    J,
    /// Differential 0. For low speed D+ is high.
    K,
    /// Single-ended zero, both lines low. End of packet or reset.
    Se0,
    /// Both lines high. Never valid on the bus.
    Se1,
}

impl LineState {
    /// Map raw pin levels of a low-speed bus to a line state.
    pub fn from_pins(dp: bool, dm: bool) -> Self {
        match (dp, dm) {
            (false, true) => LineState::J,
            (true, false) => LineState::K,
            (false, false) => LineState::Se0,
            (true, true) => LineState::Se1,
        }
    }

    /// Pin levels `(D+, D-)` that drive this state.
    pub fn pins(self) -> (bool, bool) {
        match self {
            LineState::J => (false, true),
            LineState::K => (true, false),
            LineState::Se0 => (false, false),
            LineState::Se1 => (true, true),
        }
    }

    /// The opposite differential state. Single-ended states stay as they are.
    pub fn toggled(self) -> Self {
        match self {
            LineState::J => LineState::K,
            LineState::K => LineState::J,
            other => other,
        }
    }
}

/// Condition of the bus as seen by the receiver, and the state of the
/// top-level bus state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    /// Waiting for the first bus reset after attach.
    Init,
    /// Reset signalling observed.
    Reset,
    /// Framing was lost. Waiting for a clean end of packet.
    Desynced,
    /// Bus idle or a packet was cleanly delimited. Not an error.
    Synced,
    /// Valid end of packet observed.
    Ok,
}

/// Hardware access needed by the PHY.
///
/// Implementations must be fast: `now`, `read` and `write` are called in
/// the bit-timed loops, a few hundred CPU cycles apart at most.
pub trait BusIo {
    /// Free-running cycle counter. Expected to wrap at `u32::MAX`.
    fn now(&mut self) -> u32;

    /// Sample the D+/D- pair.
    fn read(&mut self) -> LineState;

    /// Set the level driven on D+/D-. Takes effect on the bus only while
    /// output is enabled.
    fn write(&mut self, state: LineState);

    /// Switch D+/D- between driven outputs and high-impedance inputs.
    fn set_output_enabled(&mut self, enabled: bool);

    /// Connect the D- pull-up so the host detects a low-speed device.
    fn attach(&mut self) {}

    /// Release the D- pull-up.
    fn detach(&mut self) {}
}

/// Bit-level USB transceiver over a [`BusIo`].
pub struct Phy<H: BusIo> {
    io: H,
    timing: Timing,
}

impl<H: BusIo> Phy<H> {
    /// Creates a PHY driving `io` with the given bit timing.
    pub fn new(io: H, timing: Timing) -> Self {
        Self { io, timing }
    }

    /// Bit timing in use.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Current cycle counter value.
    #[inline(always)]
    pub fn now(&mut self) -> u32 {
        self.io.now()
    }

    /// Shared access to the bus I/O.
    pub fn io(&self) -> &H {
        &self.io
    }

    /// Exclusive access to the bus I/O.
    pub fn io_mut(&mut self) -> &mut H {
        &mut self.io
    }

    /// Consumes the PHY, returning the bus I/O.
    pub fn release(self) -> H {
        self.io
    }

    /// Spin until `cycles` have passed since `since`.
    #[inline(always)]
    fn wait_until(&mut self, since: u32, cycles: u32) {
        while self.io.now().wrapping_sub(since) < cycles {}
    }
}
