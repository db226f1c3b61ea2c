//! Two-slot OTA selection and the flash-backed [`BlockProgrammer`].
//!
//! The selector partition holds two sectors, each starting with an
//! [`OtaSelectEntry`]. The valid entry with the higher sequence number
//! names the running application; an update writes to the next
//! application partition and, once verified, records it in the other
//! selector sector.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::class::{Block, BlockError, BlockProgrammer, BLOCK_SIZE};
use crate::crc::crc32_le;
use crate::fmt::{debug, info, warn};
use crate::image::{self, ImageRequirements};

/// Flash sector size.
pub const SECTOR_SIZE: u32 = BLOCK_SIZE as u32;

const OTA_SELECT_SLOTS: u32 = 2;

/// Errors reported by a [`Flash`] implementation.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// Access past the end of the flash.
    OutOfBounds,
    /// Erase not on sector boundaries.
    NotAligned,
    /// The flash controller reported a failure.
    Io,
}

/// Raw flash access.
pub trait Flash {
    /// Read `buf.len()` bytes at `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes at `offset`. Both are multiples of
    /// [`SECTOR_SIZE`].
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Program `data` at `offset`. The range must have been erased.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

/// State of an OTA image as recorded in its selector entry.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaImageState {
    /// Freshly selected, not yet booted.
    New = 0,
    /// Booted once, waiting for the application to confirm.
    PendingVerify = 1,
    /// Confirmed working.
    Valid = 2,
    /// Rejected by the application.
    Invalid = 3,
    /// Rolled back by the bootloader.
    Aborted = 4,
    /// Not set.
    Undefined = u32::MAX,
}

/// One OTA selector record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct OtaSelectEntry {
    /// Sequence number, counts completed updates.
    pub ota_seq: u32,
    /// Unused label, kept erased.
    pub seq_label: [u8; 20],
    /// One of [`OtaImageState`].
    pub ota_state: u32,
    /// CRC32 over `ota_seq`.
    pub crc: u32,
}

const_assert_eq!(core::mem::size_of::<OtaSelectEntry>(), 32);

impl OtaSelectEntry {
    /// A valid entry for sequence `seq`.
    pub fn new(seq: u32) -> Self {
        Self {
            ota_seq: seq,
            seq_label: [0xff; 20],
            ota_state: OtaImageState::Valid as u32,
            crc: Self::seq_crc(seq),
        }
    }

    fn seq_crc(seq: u32) -> u32 {
        crc32_le(u32::MAX, &seq.to_le_bytes())
    }

    /// Whether the entry is set, intact and not rejected.
    pub fn is_valid(&self) -> bool {
        self.ota_seq != u32::MAX
            && self.crc == Self::seq_crc(self.ota_seq)
            && self.ota_state != OtaImageState::Invalid as u32
            && self.ota_state != OtaImageState::Aborted as u32
    }
}

/// A flash region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Start address.
    pub offset: u32,
    /// Length in bytes.
    pub size: u32,
}

/// Partitions the programmer works with.
#[derive(Clone, Copy, Debug)]
pub struct OtaLayout<'a> {
    /// Selector partition, two sectors.
    pub otadata: Partition,
    /// Application partitions in OTA order.
    pub apps: &'a [Partition],
}

/// Errors creating an [`OtaProgrammer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtaError {
    /// No application partition to write to.
    NoAppPartitions,
    /// Selector partition missing, smaller than two sectors or past the
    /// end of the address space.
    BadLayout,
    /// Reading the selector failed.
    Flash(FlashError),
}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        OtaError::Flash(e)
    }
}

/// Writes downloaded blocks to the next OTA application partition.
pub struct OtaProgrammer<F: Flash> {
    flash: F,
    target: Partition,
    entry: OtaSelectEntry,
    entry_address: u32,
    requirements: ImageRequirements,
}

impl<F: Flash> OtaProgrammer<F> {
    /// Read the selector and prepare an update of the next partition.
    pub fn new(
        mut flash: F,
        layout: &OtaLayout,
        requirements: &ImageRequirements,
    ) -> Result<Self, OtaError> {
        let otadata = layout.otadata;
        if otadata.offset == 0
            || otadata.size < OTA_SELECT_SLOTS * SECTOR_SIZE
            || otadata.offset.checked_add(otadata.size).is_none()
        {
            return Err(OtaError::BadLayout);
        }
        if layout.apps.is_empty() {
            return Err(OtaError::NoAppPartitions);
        }

        let mut active: Option<(u32, OtaSelectEntry)> = None;
        for slot in 0..OTA_SELECT_SLOTS {
            let mut raw = [0u8; core::mem::size_of::<OtaSelectEntry>()];
            flash.read(otadata.offset + slot * SECTOR_SIZE, &mut raw)?;
            let entry: OtaSelectEntry = bytemuck::pod_read_unaligned(&raw);

            if !entry.is_valid() {
                continue;
            }
            if active.map_or(true, |(_, a)| entry.ota_seq > a.ota_seq) {
                active = Some((slot, entry));
            }
        }

        let (slot, seq) = match active {
            Some((slot, entry)) => {
                debug!("ota: active slot {} seq {}", slot, entry.ota_seq);
                ((slot + 1) % OTA_SELECT_SLOTS, entry.ota_seq.wrapping_add(1))
            }
            None => {
                debug!("ota: no valid selector entry");
                (0, 1)
            }
        };

        let index = ((seq - 1) % layout.apps.len() as u32) as usize;
        let target = layout.apps[index];
        info!(
            "ota: updating partition {} at {} as seq {}",
            index,
            target.offset,
            seq
        );

        Ok(Self {
            flash,
            target,
            entry: OtaSelectEntry::new(seq),
            entry_address: otadata.offset + slot * SECTOR_SIZE,
            requirements: *requirements,
        })
    }

    /// Partition being written.
    pub fn target(&self) -> Partition {
        self.target
    }

    /// Selector entry written on finalize.
    pub fn entry(&self) -> &OtaSelectEntry {
        &self.entry
    }

    /// Flash address the selector entry is written to.
    pub fn entry_address(&self) -> u32 {
        self.entry_address
    }

    /// The flash.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Consumes the programmer, returning the flash.
    pub fn release(self) -> F {
        self.flash
    }
}

impl<F: Flash> BlockProgrammer for OtaProgrammer<F> {
    fn write_block(&mut self, block_index: u32, block: &Block) -> Result<(), BlockError> {
        let offset = block_index
            .checked_mul(SECTOR_SIZE)
            .filter(|o| o.checked_add(SECTOR_SIZE).map_or(false, |end| end <= self.target.size))
            .ok_or_else(|| {
                warn!("ota: block {} past end of partition", block_index);
                BlockError::Address
            })?;

        if block_index == 0 {
            image::check_header(&block.0, &self.requirements).map_err(|_| BlockError::Target)?;
        }

        let address = self.target.offset.checked_add(offset).ok_or_else(|| {
            warn!("ota: block {} past end of address space", block_index);
            BlockError::Address
        })?;
        self.flash
            .erase(address, SECTOR_SIZE)
            .map_err(|_| BlockError::Erase)?;
        self.flash
            .write(address, &block.0)
            .map_err(|_| BlockError::Prog)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BlockError> {
        image::verify(&mut self.flash, &self.target, &self.requirements)
            .map_err(|_| BlockError::Verify)?;

        self.flash
            .erase(self.entry_address, SECTOR_SIZE)
            .map_err(|_| BlockError::Erase)?;
        self.flash
            .write(self.entry_address, bytemuck::bytes_of(&self.entry))
            .map_err(|_| BlockError::Write)?;

        info!("ota: selected seq {}", self.entry.ota_seq);
        Ok(())
    }
}
