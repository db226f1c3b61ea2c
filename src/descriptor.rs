//! Standard and DFU descriptors.
//!
//! Built once from [`Config`] and [`ChipIdentity`] and served from
//! memory afterwards.

use static_assertions::const_assert;
use usb_device::descriptor::descriptor_type;

use crate::class::BLOCK_SIZE;
use crate::config::{ChipIdentity, Config};
use crate::fmt::warn;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// English (United States).
pub const LANGID_EN_US: u16 = 0x0409;

/// String descriptor indexes.
pub mod string_index {
    /// Supported languages.
    pub const LANGID: u8 = 0;
    /// Manufacturer.
    pub const MANUFACTURER: u8 = 1;
    /// Product.
    pub const PRODUCT: u8 = 2;
    /// Serial number.
    pub const SERIAL: u8 = 3;
    /// DFU interface.
    pub const INTERFACE: u8 = 4;
}

const STRING_COUNT: usize = 5;

/// Longest string, in UTF-16 code units.
pub const MAX_STRING_UNITS: usize = 31;

const STRING_DESCRIPTOR_SIZE: usize = 2 + 2 * MAX_STRING_UNITS;

/// Size of the device descriptor.
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

const CONFIGURATION_DESCRIPTOR_SIZE: usize = 9;
const INTERFACE_DESCRIPTOR_SIZE: usize = 9;
const DFU_FUNCTIONAL_DESCRIPTOR_SIZE: usize = 9;

/// `wTotalLength` of the configuration descriptor set.
pub const CONFIGURATION_TOTAL_SIZE: usize =
    CONFIGURATION_DESCRIPTOR_SIZE + INTERFACE_DESCRIPTOR_SIZE + DFU_FUNCTIONAL_DESCRIPTOR_SIZE;

const_assert!(CONFIGURATION_TOTAL_SIZE == 27);
const_assert!(STRING_DESCRIPTOR_SIZE <= u8::MAX as usize);

#[derive(Clone, Copy)]
struct StringDescriptor {
    buf: [u8; STRING_DESCRIPTOR_SIZE],
}

impl StringDescriptor {
    fn from_units(units: impl Iterator<Item = u16>) -> Self {
        let mut buf = [0u8; STRING_DESCRIPTOR_SIZE];
        let mut len = 2;
        for unit in units {
            if len == STRING_DESCRIPTOR_SIZE {
                break;
            }
            buf[len..len + 2].copy_from_slice(&unit.to_le_bytes());
            len += 2;
        }
        buf[0] = len as u8;
        buf[1] = descriptor_type::STRING;
        Self { buf }
    }

    fn from_str(s: &str) -> Self {
        let desc = Self::from_units(s.encode_utf16());
        if s.encode_utf16().count() > MAX_STRING_UNITS {
            warn!("descriptor: string truncated to {} units", MAX_STRING_UNITS);
        }
        desc
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.buf[0] as usize]
    }
}

fn hex_digit(nibble: u8) -> u16 {
    let c = if nibble < 10 {
        b'0' + nibble
    } else {
        b'a' + nibble - 10
    };
    c as u16
}

/// All descriptors the device serves.
pub struct Descriptors {
    device: [u8; DEVICE_DESCRIPTOR_SIZE],
    configuration: [u8; CONFIGURATION_TOTAL_SIZE],
    strings: [StringDescriptor; STRING_COUNT],
}

impl Descriptors {
    /// Build descriptors for the given configuration and chip.
    ///
    /// The serial number is the MAC address in lowercase hex.
    /// `bcdDevice` is the chip revision as `major.minor` unless the
    /// configuration overrides it.
    pub fn new(config: &Config, chip: &ChipIdentity) -> Self {
        let bcd_device = config
            .bcd_device
            .unwrap_or(((chip.revision_major as u16) << 8) | chip.revision_minor as u16);
        let vid = config.vendor_id.to_le_bytes();
        let pid = config.product_id.to_le_bytes();
        let bcd = bcd_device.to_le_bytes();

        let device = [
            DEVICE_DESCRIPTOR_SIZE as u8,
            descriptor_type::DEVICE,
            // bcdUSB
            0x00,
            0x01,
            // bDeviceClass, bDeviceSubClass, bDeviceProtocol
            0x00,
            0x00,
            0x00,
            // bMaxPacketSize0
            crate::packet::LOW_SPEED_PACKET_SIZE as u8,
            vid[0],
            vid[1],
            pid[0],
            pid[1],
            bcd[0],
            bcd[1],
            string_index::MANUFACTURER,
            string_index::PRODUCT,
            string_index::SERIAL,
            // bNumConfigurations
            0x01,
        ];

        let total = (CONFIGURATION_TOTAL_SIZE as u16).to_le_bytes();
        let transfer_size = (BLOCK_SIZE as u16).to_le_bytes();
        let max_power = (config.max_power_ma.min(500) / 2) as u8;

        let configuration = [
            CONFIGURATION_DESCRIPTOR_SIZE as u8,
            descriptor_type::CONFIGURATION,
            total[0],
            total[1],
            // bNumInterfaces
            0x01,
            // bConfigurationValue
            0x01,
            // iConfiguration
            0x00,
            // bmAttributes: bus powered
            0x80,
            max_power,
            // interface 0
            INTERFACE_DESCRIPTOR_SIZE as u8,
            descriptor_type::INTERFACE,
            // bInterfaceNumber, bAlternateSetting, bNumEndpoints
            0x00,
            0x00,
            0x00,
            USB_CLASS_APPLICATION_SPECIFIC,
            USB_SUBCLASS_DFU,
            USB_PROTOCOL_DFU_MODE,
            string_index::INTERFACE,
            // DFU Functional descriptor
            DFU_FUNCTIONAL_DESCRIPTOR_SIZE as u8,
            DESC_DESCTYPE_DFU,
            // bmAttributes
            // Bit 2: bitManifestationTolerant
            // Bit 0: bitCanDnload
            0x04 | 0x01,
            // wDetachTimeOut
            0x00,
            0x00,
            // wTransferSize
            transfer_size[0],
            transfer_size[1],
            // bcdDFUVersion
            0x00,
            0x01,
        ];

        let mac = chip.mac;
        let serial = mac
            .iter()
            .flat_map(|b| [hex_digit(b >> 4), hex_digit(b & 0x0f)]);

        Self {
            device,
            configuration,
            strings: [
                StringDescriptor::from_units([LANGID_EN_US].into_iter()),
                StringDescriptor::from_str(config.manufacturer),
                StringDescriptor::from_str(config.product),
                StringDescriptor::from_units(serial),
                StringDescriptor::from_str(config.interface),
            ],
        }
    }

    /// Device descriptor.
    pub fn device(&self) -> &[u8] {
        &self.device
    }

    /// Configuration, interface and DFU functional descriptors.
    pub fn configuration(&self) -> &[u8] {
        &self.configuration
    }

    /// String descriptor `index`, if it exists.
    pub fn string(&self, index: u8) -> Option<&[u8]> {
        self.strings.get(index as usize).map(StringDescriptor::as_bytes)
    }

    /// Descriptor selected by the `wValue` of a GET_DESCRIPTOR request.
    pub fn lookup(&self, kind: u8, index: u8) -> Option<&[u8]> {
        match (kind, index) {
            (descriptor_type::DEVICE, 0) => Some(self.device()),
            (descriptor_type::CONFIGURATION, 0) => Some(self.configuration()),
            (descriptor_type::STRING, i) => self.string(i),
            _ => None,
        }
    }
}
