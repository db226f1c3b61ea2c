//! ESP application image checks.
//!
//! An image starts with a 24-byte header followed by segments, each a
//! load address and length followed by data. The first segment starts
//! with the application descriptor. After the last segment the image is
//! padded so that one checksum byte ends a 16-byte aligned block.

use bytemuck::{Pod, Zeroable};
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;

use crate::fmt::warn;
use crate::ota::{Flash, Partition};

/// First byte of every image.
pub const ESP_IMAGE_HEADER_MAGIC: u8 = 0xE9;

/// Magic word at the start of the application descriptor.
pub const ESP_APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Maximum number of segments in an image.
pub const ESP_IMAGE_MAX_SEGMENTS: u8 = 16;

/// Initial value of the XOR checksum over segment data.
pub const ESP_CHECKSUM_MAGIC: u8 = 0xEF;

/// Length of the digest that follows the checksum when
/// [`ImageHeader::hash_appended`] is set.
pub const SHA256_DIGEST_SIZE: usize = 32;

const APP_DESC_OFFSET: usize = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE;

/// Bytes needed by [`check_header`].
pub const IMAGE_PREFIX_SIZE: usize = APP_DESC_OFFSET + 4;

const IMAGE_HEADER_SIZE: usize = core::mem::size_of::<ImageHeader>();
const SEGMENT_HEADER_SIZE: usize = core::mem::size_of::<SegmentHeader>();

/// Image file header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ImageHeader {
    /// [`ESP_IMAGE_HEADER_MAGIC`]
    pub magic: u8,
    /// Number of segments.
    pub segment_count: u8,
    /// Flash read mode.
    pub spi_mode: u8,
    /// Flash frequency and size.
    pub spi_speed_size: u8,
    /// Entry point address.
    pub entry_addr: [u8; 4],
    /// WP pin when SPI pins are set via efuse.
    pub wp_pin: u8,
    /// Drive settings for the SPI flash pins.
    pub spi_pin_drv: [u8; 3],
    /// Chip the image is built for.
    pub chip_id: [u8; 2],
    /// Deprecated minimal revision.
    pub min_chip_rev: u8,
    /// Minimal chip revision, `major * 100 + minor`.
    pub min_chip_rev_full: [u8; 2],
    /// Maximal chip revision, `major * 100 + minor`.
    pub max_chip_rev_full: [u8; 2],
    /// Reserved.
    pub reserved: [u8; 4],
    /// Whether a SHA-256 digest follows the checksum.
    pub hash_appended: u8,
}

const_assert_eq!(core::mem::size_of::<ImageHeader>(), 24);

impl ImageHeader {
    /// Chip id.
    pub fn chip_id(&self) -> u16 {
        u16::from_le_bytes(self.chip_id)
    }

    /// Lowest supported revision.
    pub fn min_chip_rev_full(&self) -> u16 {
        u16::from_le_bytes(self.min_chip_rev_full)
    }

    /// Highest supported revision.
    pub fn max_chip_rev_full(&self) -> u16 {
        u16::from_le_bytes(self.max_chip_rev_full)
    }
}

/// Segment header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SegmentHeader {
    /// Load address.
    pub load_addr: u32,
    /// Data length following this header.
    pub data_len: u32,
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), 8);

/// Chip an image must be built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageRequirements {
    /// Chip id from the image header.
    pub chip_id: u16,
    /// Running chip revision, `major * 100 + minor`.
    pub revision_full: u16,
}

/// Reasons an image is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// Fewer bytes than a header.
    Truncated,
    /// Header magic mismatch.
    BadMagic,
    /// More than [`ESP_IMAGE_MAX_SEGMENTS`] segments.
    TooManySegments,
    /// Image is for another chip.
    WrongChip,
    /// Image does not support this chip revision.
    UnsupportedRevision,
    /// Application descriptor magic mismatch.
    BadAppDesc,
    /// A segment or the checksum lies outside the partition.
    OutOfRange,
    /// Checksum mismatch.
    Checksum,
    /// Appended SHA-256 digest mismatch.
    Digest,
    /// Flash read failed.
    Flash,
}

/// Check the header and application descriptor magic at the start of
/// an image.
pub fn check_header(
    bytes: &[u8],
    requirements: &ImageRequirements,
) -> Result<ImageHeader, ImageError> {
    if bytes.len() < IMAGE_PREFIX_SIZE {
        return Err(ImageError::Truncated);
    }

    let header: ImageHeader = bytemuck::pod_read_unaligned(&bytes[..IMAGE_HEADER_SIZE]);

    if header.magic != ESP_IMAGE_HEADER_MAGIC {
        return Err(ImageError::BadMagic);
    }
    if header.segment_count > ESP_IMAGE_MAX_SEGMENTS {
        return Err(ImageError::TooManySegments);
    }
    if header.chip_id() != requirements.chip_id {
        warn!(
            "image: built for chip {}, running on {}",
            header.chip_id(),
            requirements.chip_id
        );
        return Err(ImageError::WrongChip);
    }

    let rev = requirements.revision_full;
    if rev < header.min_chip_rev_full() || rev / 100 > header.max_chip_rev_full() / 100 {
        warn!(
            "image: revision {} outside {}..{}",
            rev,
            header.min_chip_rev_full(),
            header.max_chip_rev_full()
        );
        return Err(ImageError::UnsupportedRevision);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[APP_DESC_OFFSET..IMAGE_PREFIX_SIZE]);
    if u32::from_le_bytes(magic) != ESP_APP_DESC_MAGIC {
        return Err(ImageError::BadAppDesc);
    }

    Ok(header)
}

fn read<F: Flash>(
    flash: &mut F,
    partition: &Partition,
    pos: u32,
    buf: &mut [u8],
) -> Result<(), ImageError> {
    let end = pos
        .checked_add(buf.len() as u32)
        .ok_or(ImageError::OutOfRange)?;
    if end > partition.size {
        return Err(ImageError::OutOfRange);
    }
    let address = partition
        .offset
        .checked_add(pos)
        .ok_or(ImageError::OutOfRange)?;
    flash.read(address, buf).map_err(|_| ImageError::Flash)
}

/// Feed `len` bytes of `partition` starting at `pos` to `hasher`.
fn hash_range<F: Flash>(
    flash: &mut F,
    partition: &Partition,
    hasher: &mut Sha256,
    mut pos: u32,
    mut len: u32,
) -> Result<(), ImageError> {
    let mut chunk = [0u8; 64];
    while len > 0 {
        let n = len.min(chunk.len() as u32) as usize;
        read(flash, partition, pos, &mut chunk[..n])?;
        hasher.update(&chunk[..n]);
        pos += n as u32;
        len -= n as u32;
    }
    Ok(())
}

/// Walk the image written to `partition` and check its checksum.
///
/// When the header says a SHA-256 digest is appended, the digest over
/// everything up to and including the checksum byte is checked too.
pub fn verify<F: Flash>(
    flash: &mut F,
    partition: &Partition,
    requirements: &ImageRequirements,
) -> Result<(), ImageError> {
    let mut prefix = [0u8; IMAGE_PREFIX_SIZE];
    read(flash, partition, 0, &mut prefix)?;
    let header = check_header(&prefix, requirements)?;

    let mut checksum = ESP_CHECKSUM_MAGIC;
    let mut pos = IMAGE_HEADER_SIZE as u32;
    let mut chunk = [0u8; 64];

    for _ in 0..header.segment_count {
        let mut raw = [0u8; SEGMENT_HEADER_SIZE];
        read(flash, partition, pos, &mut raw)?;
        let segment: SegmentHeader = bytemuck::pod_read_unaligned(&raw);
        pos = pos
            .checked_add(SEGMENT_HEADER_SIZE as u32)
            .ok_or(ImageError::OutOfRange)?;

        let mut remaining = u32::from_le(segment.data_len);
        if pos.checked_add(remaining).map_or(true, |end| end > partition.size) {
            return Err(ImageError::OutOfRange);
        }

        while remaining > 0 {
            let n = remaining.min(chunk.len() as u32) as usize;
            read(flash, partition, pos, &mut chunk[..n])?;
            checksum = chunk[..n].iter().fold(checksum, |acc, b| acc ^ b);
            pos += n as u32;
            remaining -= n as u32;
        }
    }

    // checksum byte ends the next 16-byte boundary
    let image_len = pos
        .checked_add(1 + 15)
        .ok_or(ImageError::OutOfRange)?
        & !15;
    let checksum_pos = image_len - 1;
    let mut stored = [0u8; 1];
    read(flash, partition, checksum_pos, &mut stored)?;

    if stored[0] != checksum {
        warn!("image: checksum {} expected {}", stored[0], checksum);
        return Err(ImageError::Checksum);
    }

    if header.hash_appended == 1 {
        let mut hasher = Sha256::new();
        hash_range(flash, partition, &mut hasher, 0, image_len)?;
        let mut digest = [0u8; SHA256_DIGEST_SIZE];
        read(flash, partition, image_len, &mut digest)?;

        if hasher.finalize()[..] != digest[..] {
            warn!("image: SHA-256 digest mismatch");
            return Err(ImageError::Digest);
        }
    }
    Ok(())
}
