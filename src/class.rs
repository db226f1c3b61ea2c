//! DFU class protocol state machine.
//!
//! Only the download half of DFU 1.1 is implemented. Each block is
//! exactly one flash sector; it is collected from 8-byte OUT packets into
//! [`Block`] and handed to a [`BlockProgrammer`] when the host polls
//! `DFU_GETSTATUS`.

use static_assertions::const_assert_eq;
use usb_device::control::Request;

use crate::fmt::{info, warn};

pub(crate) const DFU_DNLOAD: u8 = 0x01;
pub(crate) const DFU_GETSTATUS: u8 = 0x03;
pub(crate) const DFU_CLRSTATUS: u8 = 0x04;
pub(crate) const DFU_GETSTATE: u8 = 0x05;
pub(crate) const DFU_ABORT: u8 = 0x06;

/// Size of one download block and of one flash sector.
pub const BLOCK_SIZE: usize = 0x1000;

/// Value of erased flash, used to pad a short final block.
pub const ERASED: u8 = 0xff;

/// Poll timeout reported while a block write is pending.
pub const BLOCK_PROGRAM_TIME_MS: u32 = 250;

/// Poll timeout reported while image verification is pending.
pub const MANIFESTATION_TIME_MS: u32 = 1000;

/// Status codes reported in `bStatus` of the `DFU_GETSTATUS` reply.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DFUStatusCode {
    /// No error condition is present.
    OK = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// State codes from the DFU specification, as sent to the host.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device is operating in the DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DfuDnBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DfuDnloadIdle = 5,
    /// Device has received the final block of firmware from the host and is waiting for receipt of DFU_GETSTATUS.
    DfuManifestSync = 6,
    /// Device is in the Manifestation phase.
    DfuManifest = 7,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    DfuError = 10,
}

/// Download progress.
///
/// Variants are ordered. Everything from [`DFUState::ManifestSyncDone`] on
/// is complete and the state never moves back below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DFUState {
    /// Waiting for the first `DFU_DNLOAD`.
    Idle,
    /// A block was written, waiting for the next `DFU_DNLOAD`.
    DnloadIdle,
    /// A block was received, it is written on the next `DFU_GETSTATUS`.
    DnloadSyncReady,
    /// The empty final `DFU_DNLOAD` was received, the image is verified on
    /// the next `DFU_GETSTATUS`.
    ManifestSyncReady,
    /// A block was written, the next `DFU_GETSTATUS` moves to
    /// [`DFUState::DnloadIdle`].
    DnloadSyncDone,
    /// Download failed with the given status, waiting for `DFU_CLRSTATUS`.
    Error(DFUStatusCode),
    /// The image was verified and activated.
    ManifestSyncDone,
    /// Update finished; the device should detach and boot the new image.
    Complete,
}

impl DFUState {
    fn ordinal(self) -> u8 {
        match self {
            DFUState::Idle => 0,
            DFUState::DnloadIdle => 1,
            DFUState::DnloadSyncReady => 2,
            DFUState::ManifestSyncReady => 3,
            DFUState::DnloadSyncDone => 4,
            DFUState::Error(_) => 5,
            DFUState::ManifestSyncDone => 6,
            DFUState::Complete => 7,
        }
    }

    /// Whether the ratchet threshold has been reached.
    pub fn is_complete(self) -> bool {
        self.ordinal() >= DFUState::ManifestSyncDone.ordinal()
    }

    /// Record returned by `DFU_GETSTATUS` in this state.
    pub fn status(self) -> DFUStatus {
        let (status, poll_timeout, state) = match self {
            DFUState::Idle => (DFUStatusCode::OK, 0, ProtocolState::DfuIdle),
            DFUState::DnloadIdle => (DFUStatusCode::OK, 0, ProtocolState::DfuDnloadIdle),
            DFUState::DnloadSyncReady => (
                DFUStatusCode::OK,
                BLOCK_PROGRAM_TIME_MS,
                ProtocolState::DfuDnBusy,
            ),
            DFUState::ManifestSyncReady => (
                DFUStatusCode::OK,
                MANIFESTATION_TIME_MS,
                ProtocolState::DfuManifest,
            ),
            DFUState::DnloadSyncDone => (DFUStatusCode::OK, 0, ProtocolState::DfuDnloadIdle),
            DFUState::Error(code) => (code, 0, ProtocolState::DfuError),
            DFUState::ManifestSyncDone => (DFUStatusCode::OK, 0, ProtocolState::AppIdle),
            DFUState::Complete => (DFUStatusCode::OK, 0, ProtocolState::AppIdle),
        };
        DFUStatus {
            status,
            poll_timeout,
            state,
        }
    }

    /// State code returned by `DFU_GETSTATE`.
    pub fn protocol_state(self) -> ProtocolState {
        match self {
            DFUState::Idle => ProtocolState::DfuIdle,
            DFUState::DnloadIdle => ProtocolState::DfuDnloadIdle,
            DFUState::DnloadSyncReady | DFUState::DnloadSyncDone => ProtocolState::DfuDnloadSync,
            DFUState::ManifestSyncReady | DFUState::ManifestSyncDone => {
                ProtocolState::DfuManifestSync
            }
            DFUState::Error(_) => ProtocolState::DfuError,
            DFUState::Complete => ProtocolState::AppIdle,
        }
    }
}

/// Contents of a `DFU_GETSTATUS` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DFUStatus {
    /// `bStatus`
    pub status: DFUStatusCode,
    /// `bwPollTimeout` in milliseconds, 24 bits.
    pub poll_timeout: u32,
    /// `bState`
    pub state: ProtocolState,
}

impl From<DFUStatus> for [u8; 6] {
    fn from(dfu: DFUStatus) -> Self {
        [
            // bStatus
            dfu.status as u8,
            // bwPollTimeout
            (dfu.poll_timeout & 0xff) as u8,
            ((dfu.poll_timeout >> 8) & 0xff) as u8,
            ((dfu.poll_timeout >> 16) & 0xff) as u8,
            // bState
            dfu.state as u8,
            // iString
            0,
        ]
    }
}

/// Errors a [`BlockProgrammer`] may report. These are translated
/// to the corresponding DFU status codes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// File is not targeted for use by this device.
    Target = DFUStatusCode::ErrTarget as u8,
    /// Device is unable to write memory.
    Write = DFUStatusCode::ErrWrite as u8,
    /// Memory erase function failed.
    Erase = DFUStatusCode::ErrErase as u8,
    /// Program memory function failed.
    Prog = DFUStatusCode::ErrProg as u8,
    /// Programmed memory failed verification.
    Verify = DFUStatusCode::ErrVerify as u8,
    /// Block does not fit the target region.
    Address = DFUStatusCode::ErrAddress as u8,
}

impl From<BlockError> for DFUStatusCode {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Target => DFUStatusCode::ErrTarget,
            BlockError::Write => DFUStatusCode::ErrWrite,
            BlockError::Erase => DFUStatusCode::ErrErase,
            BlockError::Prog => DFUStatusCode::ErrProg,
            BlockError::Verify => DFUStatusCode::ErrVerify,
            BlockError::Address => DFUStatusCode::ErrAddress,
        }
    }
}

/// One sector of firmware, 32-bit aligned for flash writes.
#[repr(C, align(4))]
pub struct Block(pub [u8; BLOCK_SIZE]);

const_assert_eq!(core::mem::align_of::<Block>(), 4);
const_assert_eq!(core::mem::size_of::<Block>(), BLOCK_SIZE);

impl Block {
    /// Block filled with the erased value.
    pub const fn erased() -> Self {
        Block([ERASED; BLOCK_SIZE])
    }
}

/// Storage that receives downloaded firmware.
///
/// Both calls happen from within [`DFUDevice::poll`](crate::DFUDevice::poll)
/// right after the host's `DFU_GETSTATUS` is acknowledged. The host waits
/// the reported poll timeout before its next request, so these may take
/// that long without missing bus traffic.
pub trait BlockProgrammer {
    /// Erase and program sector `block_index` of the target.
    ///
    /// Block 0 is expected to start with a firmware image header; a
    /// header that is not for this device is reported as
    /// [`BlockError::Target`]. A block that does not fit the target is
    /// [`BlockError::Address`] and must not touch the flash.
    fn write_block(&mut self, block_index: u32, block: &Block) -> Result<(), BlockError>;

    /// Verify the complete image and make it the one to boot.
    fn finalize(&mut self) -> Result<(), BlockError>;
}

/// DFU protocol state and the block being collected.
pub struct DFUClass<P: BlockProgrammer> {
    state: DFUState,
    block_num: u32,
    final_block: bool,
    buffer: Block,
    programmer: P,
}

impl<P: BlockProgrammer> DFUClass<P> {
    /// Creates a DFUClass writing blocks to `programmer`.
    pub fn new(programmer: P) -> Self {
        Self {
            state: DFUState::Idle,
            block_num: 0,
            final_block: false,
            buffer: Block::erased(),
            programmer,
        }
    }

    /// Current state.
    pub fn state(&self) -> DFUState {
        self.state
    }

    /// Index of the block expected next.
    pub fn block_num(&self) -> u32 {
        self.block_num
    }

    /// Whether the update finished.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// The block programmer.
    pub fn programmer(&self) -> &P {
        &self.programmer
    }

    /// The block programmer, mutably.
    pub fn programmer_mut(&mut self) -> &mut P {
        &mut self.programmer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.buffer.0
    }

    /// Move to `new`, keeping a completed download complete.
    ///
    /// An error reported after completion turns into
    /// [`DFUState::Complete`]; any other backwards move is dropped.
    pub(crate) fn set_state(&mut self, new: DFUState) {
        if self.state.is_complete() {
            if let DFUState::Error(_) = new {
                self.state = DFUState::Complete;
                return;
            }
            if new.ordinal() < self.state.ordinal() {
                warn!(
                    "dfu: ignoring state regression {} -> {}",
                    self.state.ordinal(),
                    new.ordinal()
                );
                return;
            }
        }
        self.state = new;
    }

    /// Report a request the device stalled.
    pub(crate) fn stalled(&mut self) {
        self.set_state(DFUState::Error(DFUStatusCode::ErrStalledPkt));
    }

    /// Forget download progress after a bus reset.
    pub(crate) fn bus_reset(&mut self) {
        self.block_num = 0;
        self.final_block = false;
        if !self.state.is_complete() {
            self.state = DFUState::Idle;
        }
    }

    /// Whether a `DFU_DNLOAD` with these fields continues the download.
    ///
    /// The first block must be a full sector. Later blocks may be shorter,
    /// which marks them final; after a final block only the empty request
    /// that starts manifestation is allowed.
    pub(crate) fn accepts_download(&self, req: &Request) -> bool {
        if req.index != 0 {
            return false;
        }

        let ok = match self.state {
            DFUState::Idle => req.value == 0 && req.length as usize == BLOCK_SIZE,
            DFUState::DnloadIdle if !self.final_block => {
                req.value as u32 == self.block_num && req.length as usize <= BLOCK_SIZE
            }
            DFUState::DnloadIdle => req.value as u32 == self.block_num && req.length == 0,
            _ => false,
        };

        if !ok {
            warn!(
                "dfu: invalid dnload ({} {} {} {} {})",
                self.state.ordinal(),
                req.value,
                self.block_num,
                req.index,
                req.length
            );
        }
        ok
    }

    /// Whether `DFU_CLRSTATUS` is allowed now.
    pub(crate) fn accepts_clear_status(&self) -> bool {
        matches!(self.state, DFUState::Error(_))
    }

    /// Whether `DFU_ABORT` is allowed now.
    pub(crate) fn accepts_abort(&self) -> bool {
        matches!(self.state, DFUState::Idle | DFUState::DnloadIdle)
    }

    /// `DFU_DNLOAD` of `len` bytes was acknowledged.
    pub(crate) fn download_done(&mut self, len: usize) {
        if self.state == DFUState::Idle {
            self.block_num = 0;
            self.final_block = false;
        }

        if len < BLOCK_SIZE {
            self.final_block = true;
            if len > 0 {
                self.buffer.0[len..].fill(ERASED);
            }
        }

        if len == 0 {
            self.set_state(DFUState::ManifestSyncReady);
        } else {
            self.set_state(DFUState::DnloadSyncReady);
        }
    }

    /// `DFU_CLRSTATUS` or `DFU_ABORT` was acknowledged.
    pub(crate) fn return_to_idle(&mut self) {
        self.set_state(DFUState::Idle);
    }

    /// `DFU_GETSTATUS` was acknowledged; run the pending step.
    pub(crate) fn status_polled(&mut self) {
        match self.state {
            DFUState::DnloadSyncReady => {
                info!("dfu: writing block {}", self.block_num);
                match self.programmer.write_block(self.block_num, &self.buffer) {
                    Ok(()) => self.set_state(DFUState::DnloadSyncDone),
                    Err(e) => self.set_state(DFUState::Error(e.into())),
                }
            }
            DFUState::DnloadSyncDone => {
                self.block_num += 1;
                self.set_state(DFUState::DnloadIdle);
            }
            DFUState::ManifestSyncReady => {
                info!("dfu: verifying firmware");
                match self.programmer.finalize() {
                    Ok(()) => {
                        info!("dfu: firmware verified");
                        self.set_state(DFUState::ManifestSyncDone);
                    }
                    Err(e) => self.set_state(DFUState::Error(e.into())),
                }
            }
            DFUState::ManifestSyncDone => {
                info!("dfu: update complete");
                self.set_state(DFUState::Complete);
            }
            _ => {}
        }
    }
}
