//! Startup configuration.
//!
//! Everything here is built once before the bus state machine starts and
//! passed by reference afterwards.

/// Low-speed USB bit rate.
pub const LOW_SPEED_BIT_RATE: u32 = 1_500_000;

/// Number of bit-times to wait for the next packet before giving up.
pub const PACKET_TIMEOUT_BITS: u32 = 16;

/// Duration of SE0 that is interpreted as bus reset, in nanoseconds.
pub const RESET_SIGNAL_NS: u32 = 2500;

/// Device configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Frequency of the free-running cycle counter returned by
    /// [`BusIo::now`](crate::phy::BusIo::now), usually the CPU clock.
    pub cpu_freq_hz: u32,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Manufacturer string descriptor.
    pub manufacturer: &'static str,
    /// Product string descriptor.
    pub product: &'static str,
    /// DFU interface string descriptor.
    pub interface: &'static str,
    /// `bcdDevice` override. When `None`, chip revision is reported.
    pub bcd_device: Option<u16>,
    /// Maximum bus current in mA, capped at 500.
    pub max_power_ma: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu_freq_hz: 240_000_000,
            vendor_id: 0x303a,
            product_id: 0x8000,
            manufacturer: "Espressif",
            product: "Bootloader DFU",
            interface: "Firmware",
            bcd_device: None,
            max_power_ma: 100,
        }
    }
}

impl Config {
    /// Bit timing derived from [`cpu_freq_hz`](Config::cpu_freq_hz).
    pub fn timing(&self) -> Timing {
        Timing::from_cpu_freq(self.cpu_freq_hz)
    }
}

/// Cycle counts used by the PHY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Cycles per low-speed bit.
    pub cycles_per_bit: u32,
    /// Delay after the SE0 to J transition before the line is sampled
    /// to confirm end of packet.
    pub eop_settle: u32,
    /// Minimum SE0 duration recognized as bus reset.
    pub reset: u32,
    /// Maximum idle time while waiting for the next packet.
    pub packet_timeout: u32,
}

impl Timing {
    /// Derive timing for a counter running at `cpu_freq_hz`.
    pub const fn from_cpu_freq(cpu_freq_hz: u32) -> Self {
        let cycles_per_bit = cpu_freq_hz / LOW_SPEED_BIT_RATE;
        let mhz = cpu_freq_hz / 1_000_000;
        Self {
            cycles_per_bit,
            eop_settle: cycles_per_bit / 32,
            reset: RESET_SIGNAL_NS * mhz / 1000,
            packet_timeout: PACKET_TIMEOUT_BITS * cycles_per_bit,
        }
    }

    /// Counter ticks per millisecond.
    pub const fn cycles_per_ms(&self) -> u32 {
        self.cycles_per_bit * (LOW_SPEED_BIT_RATE / 1000)
    }
}

/// Per-chip values read from efuses at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChipIdentity {
    /// Factory MAC address, used as the USB serial number.
    pub mac: [u8; 6],
    /// Major chip revision.
    pub revision_major: u8,
    /// Minor chip revision.
    pub revision_minor: u8,
}

impl ChipIdentity {
    /// Revision in `major * 100 + minor` form, as stored in image headers.
    pub fn revision_full(&self) -> u16 {
        self.revision_major as u16 * 100 + self.revision_minor as u16
    }
}
