//! Bus-level state machine.

use crate::class::{BlockProgrammer, DFUClass, DFUState};
use crate::config::Config;
use crate::descriptor::Descriptors;
use crate::fmt::debug;
use crate::phy::{BusIo, BusState, Phy};
use crate::transfer::Transfer;

/// A bit-banged low-speed DFU device.
///
/// [`poll`](DFUDevice::poll) must be called in a tight loop: each call
/// waits at most a few bit-times for bus traffic, and a packet the host
/// sends while the loop is busy elsewhere is lost.
pub struct DFUDevice<'d, H: BusIo, P: BlockProgrammer> {
    pub(crate) phy: Phy<H>,
    pub(crate) descriptors: &'d Descriptors,
    pub(crate) bus_state: BusState,
    pub(crate) address: u8,
    pub(crate) configuration: u8,
    pub(crate) transfer: Option<Transfer<'d>>,
    pub(crate) dfu: DFUClass<P>,
}

impl<'d, H: BusIo, P: BlockProgrammer> DFUDevice<'d, H, P> {
    /// Creates a device on `io`, writing downloaded blocks to
    /// `programmer`. The device waits for the first bus reset.
    pub fn new(io: H, config: &Config, descriptors: &'d Descriptors, programmer: P) -> Self {
        Self {
            phy: Phy::new(io, config.timing()),
            descriptors,
            bus_state: BusState::Init,
            address: 0,
            configuration: 0,
            transfer: None,
            dfu: DFUClass::new(programmer),
        }
    }

    /// Connect to the bus.
    pub fn attach(&mut self) {
        self.phy.io_mut().attach();
    }

    /// Disconnect from the bus.
    pub fn detach(&mut self) {
        self.phy.io_mut().detach();
    }

    /// Run one step of the bus state machine and return the new state.
    pub fn poll(&mut self) -> BusState {
        let mut state = self.bus_state;

        if state == BusState::Init {
            let mut bit_time = self.phy.now();
            if !self.phy.check_reset(&mut bit_time) {
                return state;
            }
            debug!("bus: initial reset");
            state = BusState::Reset;
        }

        if state == BusState::Reset {
            self.reset();
            state = BusState::Desynced;
        }

        if state == BusState::Desynced {
            let mut bit_time = self.phy.now();
            let eop = self.phy.check_eop(&mut bit_time);
            if eop != BusState::Ok {
                self.bus_state = eop;
                return eop;
            }
        }

        self.bus_state = self.transaction_next();
        self.bus_state
    }

    fn reset(&mut self) {
        debug!("bus: reset");
        self.address = 0;
        self.configuration = 0;
        self.transfer = None;
        self.dfu.bus_reset();
    }

    /// Current bus state.
    pub fn bus_state(&self) -> BusState {
        self.bus_state
    }

    /// Current DFU state.
    pub fn dfu_state(&self) -> DFUState {
        self.dfu.state()
    }

    /// Address assigned by the host, 0 before enumeration.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Selected configuration, 0 when unconfigured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Whether the firmware update finished.
    pub fn is_complete(&self) -> bool {
        self.dfu.is_complete()
    }

    /// Current cycle counter value.
    pub fn now(&mut self) -> u32 {
        self.phy.now()
    }

    /// Counter ticks per millisecond.
    pub fn cycles_per_ms(&self) -> u32 {
        self.phy.timing().cycles_per_ms()
    }

    /// The block programmer.
    pub fn programmer(&self) -> &P {
        self.dfu.programmer()
    }

    /// The block programmer, mutably.
    pub fn programmer_mut(&mut self) -> &mut P {
        self.dfu.programmer_mut()
    }

    /// The bus I/O.
    pub fn io(&self) -> &H {
        self.phy.io()
    }

    /// The bus I/O, mutably.
    pub fn io_mut(&mut self) -> &mut H {
        self.phy.io_mut()
    }
}
