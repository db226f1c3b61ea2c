#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Implements a USB 1.1 low-speed DFU device on two GPIO pins.
//!
//! ## About
//!
//! Some microcontrollers have no USB peripheral, yet a firmware update over
//! USB is still desirable. This crate drives the D+/D- lines directly: a
//! software PHY samples and drives the bus at 1.5 Mbit/s against a
//! free-running cycle counter, and a minimal device stack on top of it
//! enumerates as a DFU-mode device and accepts firmware downloads.
//!
//! Protocol implementation follows the download part of the
//! USB Device Firmware Upgrade Specification, Revision 1.1.
//! Downloaded firmware is written to flash by a [`BlockProgrammer`].
//! [`OtaProgrammer`] is the provided one: it writes ESP application
//! images to the next of a set of OTA partitions and activates the image
//! once it is verified.
//!
//! ### Supported operations
//!
//! * Write (host to device) - download command
//! * Status, state, clear status and abort requests
//!
//! ### Limitations
//!
//! * Only endpoint 0 exists, low-speed packets carry at most 8 bytes.
//!
//! * Every download block must be exactly `4096` bytes, the flash sector
//! size, except for the last one. Hosts normally use the `wTransferSize`
//! advertised in the functional descriptor, which is `4096`.
//!
//! * Upload is not supported.
//!
//! * iString field in `DFU_GETSTATUS` is always `0`.
//!
//! * Bus timing is done by busy-waiting. Interrupts must be disabled
//! while [`DFUDevice::poll`] runs, and the CPU should run at 24 MHz or
//! more.
//!
//! ## DFU utilities
//!
//! Any DFU 1.1 host tool works, for example:
//!
//! * [dfu-util](http://dfu-util.sourceforge.net/)
//! * [dfu](https://crates.io/crates/dfu)
//!
//! ## Example
//!
//! Platform code provides pin access and the cycle counter through
//! [`BusIo`], and flash access through [`Flash`].
//!
//! ```no_run
//! use core::ops::ControlFlow;
//! use usbd_dfu_bitbang::*;
//!
//! struct Pins;
//!
//! impl BusIo for Pins {
//!     fn now(&mut self) -> u32 {
//!         // read the CPU cycle counter
//!         0
//!     }
//!     fn read(&mut self) -> LineState {
//!         LineState::from_pins(false, true)
//!     }
//!     fn write(&mut self, _state: LineState) {}
//!     fn set_output_enabled(&mut self, _enabled: bool) {}
//! }
//!
//! struct SpiFlash;
//!
//! impl Flash for SpiFlash {
//!     fn read(&mut self, _offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
//!         buf.fill(0xff);
//!         Ok(())
//!     }
//!     fn erase(&mut self, _offset: u32, _len: u32) -> Result<(), FlashError> {
//!         Ok(())
//!     }
//!     fn write(&mut self, _offset: u32, _data: &[u8]) -> Result<(), FlashError> {
//!         Ok(())
//!     }
//! }
//!
//! let config = Config::default();
//! let chip = ChipIdentity {
//!     mac: [0x24, 0x0a, 0xc4, 0x01, 0x02, 0x03],
//!     revision_major: 3,
//!     revision_minor: 0,
//! };
//! let descriptors = Descriptors::new(&config, &chip);
//!
//! let apps = [
//!     Partition { offset: 0x10000, size: 0x100000 },
//!     Partition { offset: 0x110000, size: 0x100000 },
//! ];
//! let layout = OtaLayout {
//!     otadata: Partition { offset: 0xd000, size: 0x2000 },
//!     apps: &apps,
//! };
//! let requirements = ImageRequirements {
//!     chip_id: 0,
//!     revision_full: chip.revision_full(),
//! };
//! let programmer = OtaProgrammer::new(SpiFlash, &layout, &requirements).unwrap();
//!
//! let mut device = DFUDevice::new(Pins, &config, &descriptors, programmer);
//! device.attach();
//!
//! let session = Session::new(SessionConfig {
//!     connect_timeout_ms: Some(5000),
//!     ..Default::default()
//! });
//! let outcome = session.run(&mut device, |_device| {
//!     // feed the watchdog here
//!     ControlFlow::Continue(())
//! });
//! device.detach();
//!
//! if outcome == Outcome::Updated {
//!     // reset into the new firmware
//! }
//! ```

mod fmt;

pub mod class;
pub mod config;
pub mod crc;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod ota;
pub mod packet;
pub mod phy;
pub mod session;
pub mod transfer;

#[doc(inline)]
pub use crate::class::{
    Block, BlockError, BlockProgrammer, DFUState, DFUStatus, DFUStatusCode, ProtocolState,
    BLOCK_SIZE,
};
#[doc(inline)]
pub use crate::config::{ChipIdentity, Config, Timing};
#[doc(inline)]
pub use crate::descriptor::Descriptors;
#[doc(inline)]
pub use crate::device::DFUDevice;
#[doc(inline)]
pub use crate::image::ImageRequirements;
#[doc(inline)]
pub use crate::ota::{Flash, FlashError, OtaError, OtaLayout, OtaProgrammer, Partition};
#[doc(inline)]
pub use crate::phy::{BusIo, BusState, LineState};
#[doc(inline)]
pub use crate::session::{Outcome, Session, SessionConfig};
