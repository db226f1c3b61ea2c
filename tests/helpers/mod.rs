#![allow(dead_code)]
use usbd_dfu_bitbang::class::BlockProgrammer;
use usbd_dfu_bitbang::crc::crc16;
use usbd_dfu_bitbang::image::{ESP_APP_DESC_MAGIC, ESP_CHECKSUM_MAGIC, ESP_IMAGE_HEADER_MAGIC};
use usbd_dfu_bitbang::packet::{token_bits, Pid, SYNC};
use usbd_dfu_bitbang::*;

use crate::mockbus::{MockBus, Start, CPU_FREQ_HZ};

// State
pub const APP_IDLE: u8 = 0;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_ERROR: u8 = 10;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_TARGET: u8 = 0x01;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_VERIFY: u8 = 0x07;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_STALLED_PKT: u8 = 0x0F;

// DFU requests
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

pub fn status(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    [
        status,
        (poll_timeout & 0xff) as u8,
        ((poll_timeout >> 8) & 0xff) as u8,
        ((poll_timeout >> 16) & 0xff) as u8,
        state,
        0,
    ]
}

/// Polls allowed for one host operation before it is abandoned.
const MAX_POLLS: usize = 200;

pub const CHIP_ID: u16 = 9;
pub const FLASH_SIZE: usize = 0x20000;
pub const OTADATA: Partition = Partition {
    offset: 0x9000,
    size: 0x2000,
};
pub static APPS: [Partition; 2] = [
    Partition {
        offset: 0x10000,
        size: 0x8000,
    },
    Partition {
        offset: 0x18000,
        size: 0x8000,
    },
];

pub type TestDevice<'d> = DFUDevice<'d, MockBus, OtaProgrammer<MemFlash>>;

pub fn config() -> Config {
    Config {
        cpu_freq_hz: CPU_FREQ_HZ,
        ..Default::default()
    }
}

pub fn chip() -> ChipIdentity {
    ChipIdentity {
        mac: [0x24, 0x0a, 0xc4, 0x00, 0xbe, 0xef],
        revision_major: 0,
        revision_minor: 3,
    }
}

pub fn layout() -> OtaLayout<'static> {
    OtaLayout {
        otadata: OTADATA,
        apps: &APPS,
    }
}

pub fn requirements() -> ImageRequirements {
    ImageRequirements {
        chip_id: CHIP_ID,
        revision_full: chip().revision_full(),
    }
}

pub fn programmer(flash: MemFlash) -> OtaProgrammer<MemFlash> {
    OtaProgrammer::new(flash, &layout(), &requirements()).unwrap()
}

pub fn descriptors() -> Descriptors {
    Descriptors::new(&config(), &chip())
}

/// Device on `bus` writing to a blank flash.
pub fn device<'d>(bus: &MockBus, descriptors: &'d Descriptors) -> TestDevice<'d> {
    DFUDevice::new(
        bus.clone(),
        &config(),
        descriptors,
        programmer(MemFlash::new()),
    )
}

/// NOR-like flash: erase sets bytes to 0xff, writes can only clear bits.
pub struct MemFlash {
    pub data: Vec<u8>,
    pub erases: usize,
    pub writes: usize,
    pub fail_erase: bool,
    pub fail_write: bool,
}

impl MemFlash {
    pub fn new() -> Self {
        Self {
            data: vec![0xff; FLASH_SIZE],
            erases: 0,
            writes: 0,
            fail_erase: false,
            fail_write: false,
        }
    }

    pub fn slice(&self, offset: u32, len: usize) -> &[u8] {
        &self.data[offset as usize..offset as usize + len]
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl Flash for MemFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let r = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        if self.fail_erase {
            return Err(FlashError::Io);
        }
        if offset % ota::SECTOR_SIZE != 0 || len % ota::SECTOR_SIZE != 0 {
            return Err(FlashError::NotAligned);
        }
        let r = self.range(offset, len as usize)?;
        self.data[r].fill(0xff);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_write {
            return Err(FlashError::Io);
        }
        let r = self.range(offset, data.len())?;
        for (dst, src) in self.data[r].iter_mut().zip(data) {
            *dst &= *src;
        }
        self.writes += 1;
        Ok(())
    }
}

/// Single-segment application image for [`CHIP_ID`], revisions 0.0 to 0.99.
///
/// `body_len` must be a multiple of 4 and at least 4.
pub fn image(body_len: usize) -> Vec<u8> {
    let mut img = vec![0u8; 24];
    img[0] = ESP_IMAGE_HEADER_MAGIC;
    img[1] = 1;
    img[2] = 0x02;
    img[3] = 0x20;
    img[4..8].copy_from_slice(&0x4037_8000u32.to_le_bytes());
    img[8] = 0xee;
    img[12..14].copy_from_slice(&CHIP_ID.to_le_bytes());
    img[15..17].copy_from_slice(&0u16.to_le_bytes());
    img[17..19].copy_from_slice(&99u16.to_le_bytes());

    img.extend(0x3fc8_0000u32.to_le_bytes());
    img.extend((body_len as u32).to_le_bytes());

    let mut body: Vec<u8> = (0..body_len).map(|i| (i * 7 + 3) as u8).collect();
    body[..4].copy_from_slice(&ESP_APP_DESC_MAGIC.to_le_bytes());
    let checksum = body.iter().fold(ESP_CHECKSUM_MAGIC, |acc, b| acc ^ b);
    img.extend(body);

    while (img.len() + 1) % 16 != 0 {
        img.push(0);
    }
    img.push(checksum);
    img
}

pub fn token(pid: Pid, address: u8, endpoint: u8) -> Vec<u8> {
    let [lo, hi] = token_bits(address, endpoint).to_le_bytes();
    vec![SYNC, pid as u8, lo, hi]
}

pub fn data(pid: Pid, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![SYNC, pid as u8];
    p.extend_from_slice(payload);
    p.extend(crc16(payload).to_le_bytes());
    p
}

pub fn handshake(pid: Pid) -> Vec<u8> {
    vec![SYNC, pid as u8]
}

pub fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [v0, v1] = value.to_le_bytes();
    let [i0, i1] = index.to_le_bytes();
    let [l0, l1] = length.to_le_bytes();
    [request_type, request, v0, v1, i0, i1, l0, l1]
}

/// What the device sent back in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Stall,
    Data(Pid, Vec<u8>),
    Nothing,
    Garbled(Vec<u8>),
}

impl Response {
    fn from_wire(sent: Option<Vec<u8>>) -> Self {
        let Some(bytes) = sent else {
            return Response::Nothing;
        };
        if bytes.len() < 2 || bytes[0] != SYNC {
            return Response::Garbled(bytes);
        }

        match Pid::from_byte(bytes[1]) {
            Some(Pid::Ack) if bytes.len() == 2 => Response::Ack,
            Some(Pid::Stall) if bytes.len() == 2 => Response::Stall,
            Some(pid @ (Pid::Data0 | Pid::Data1)) if bytes.len() >= 4 => {
                let payload = &bytes[2..bytes.len() - 2];
                let crc = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
                if crc16(payload) == crc {
                    Response::Data(pid, payload.to_vec())
                } else {
                    Response::Garbled(bytes)
                }
            }
            _ => Response::Garbled(bytes),
        }
    }
}

fn toggle(pid: Pid) -> Pid {
    if pid == Pid::Data0 {
        Pid::Data1
    } else {
        Pid::Data0
    }
}

/// Host side of the simulated bus.
pub struct Host {
    pub bus: MockBus,
    pub address: u8,
}

impl Host {
    pub fn new(bus: MockBus) -> Self {
        Self { bus, address: 0 }
    }

    /// Poll `dev` until everything queued was played.
    pub fn run<P: BlockProgrammer>(&self, dev: &mut DFUDevice<'_, MockBus, P>) {
        for _ in 0..MAX_POLLS {
            let idle = self.bus.wire().idle();
            if idle {
                return;
            }
            dev.poll();
        }
        self.bus.wire().abandon();
    }

    /// Play `packets` and return the device's first reply.
    pub fn exchange<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        packets: &[(Vec<u8>, Start)],
    ) -> Response {
        {
            let mut w = self.bus.wire();
            w.sent.clear();
            for (p, start) in packets {
                w.queue(p, *start);
            }
        }
        self.run(dev);
        let sent = self.bus.wire().sent.pop_front();
        Response::from_wire(sent)
    }

    pub fn reset<P: BlockProgrammer>(&mut self, dev: &mut DFUDevice<'_, MockBus, P>) {
        self.bus.wire().queue_reset(12);
        self.run(dev);
        self.address = 0;
    }

    pub fn setup<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        setup: [u8; 8],
    ) -> Response {
        self.exchange(
            dev,
            &[
                (token(Pid::Setup, self.address, 0), Start::Idle),
                (data(Pid::Data0, &setup), Start::AfterHost),
            ],
        )
    }

    pub fn in_packet<P: BlockProgrammer>(&self, dev: &mut DFUDevice<'_, MockBus, P>) -> Response {
        self.exchange(
            dev,
            &[
                (token(Pid::In, self.address, 0), Start::Idle),
                (handshake(Pid::Ack), Start::AfterDeviceData),
            ],
        )
    }

    pub fn out_packet<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        pid: Pid,
        payload: &[u8],
    ) -> Response {
        self.exchange(
            dev,
            &[
                (token(Pid::Out, self.address, 0), Start::Idle),
                (data(pid, payload), Start::AfterHost),
            ],
        )
    }

    /// SETUP, IN data stage, OUT status stage.
    pub fn control_read<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        setup: [u8; 8],
    ) -> Result<Vec<u8>, Response> {
        match self.setup(dev, setup) {
            Response::Ack => {}
            other => return Err(other),
        }

        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        let mut buf = Vec::new();
        let mut expected = Pid::Data1;
        loop {
            match self.in_packet(dev) {
                Response::Data(pid, payload) if pid == expected => {
                    let short = payload.len() < 8;
                    buf.extend(payload);
                    expected = toggle(expected);
                    if short || buf.len() >= length {
                        break;
                    }
                }
                other => return Err(other),
            }
        }

        match self.out_packet(dev, Pid::Data1, &[]) {
            Response::Ack => Ok(buf),
            other => Err(other),
        }
    }

    /// SETUP, OUT data stage, IN status stage.
    pub fn control_write<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        setup: [u8; 8],
        payload: &[u8],
    ) -> Result<(), Response> {
        match self.setup(dev, setup) {
            Response::Ack => {}
            other => return Err(other),
        }

        let mut pid = Pid::Data1;
        for chunk in payload.chunks(8) {
            match self.out_packet(dev, pid, chunk) {
                Response::Ack => pid = toggle(pid),
                other => return Err(other),
            }
        }

        match self.in_packet(dev) {
            Response::Data(Pid::Data1, d) if d.is_empty() => Ok(()),
            other => Err(other),
        }
    }

    pub fn get_descriptor<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        kind: u8,
        index: u8,
        lang: u16,
        length: u16,
    ) -> Result<Vec<u8>, Response> {
        let value = ((kind as u16) << 8) | index as u16;
        self.control_read(dev, setup(0x80, 0x06, value, lang, length))
    }

    pub fn set_address<P: BlockProgrammer>(
        &mut self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        address: u8,
    ) -> Result<(), Response> {
        self.control_write(dev, setup(0x00, 0x05, address as u16, 0, 0), &[])?;
        self.address = address;
        Ok(())
    }

    pub fn set_configuration<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        value: u8,
    ) -> Result<(), Response> {
        self.control_write(dev, setup(0x00, 0x09, value as u16, 0, 0), &[])
    }

    /// Reset, read descriptors, assign address 5 and select configuration 1.
    pub fn enumerate<P: BlockProgrammer>(&mut self, dev: &mut DFUDevice<'_, MockBus, P>) {
        self.reset(dev);
        self.get_descriptor(dev, 1, 0, 0, 64).unwrap();
        self.set_address(dev, 5).unwrap();
        self.get_descriptor(dev, 1, 0, 0, 18).unwrap();
        self.get_descriptor(dev, 2, 0, 0, 255).unwrap();
        self.set_configuration(dev, 1).unwrap();
    }

    pub fn get_status<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
    ) -> Result<Vec<u8>, Response> {
        self.control_read(dev, setup(0xa1, DFU_GETSTATUS, 0, 0, 6))
    }

    pub fn get_state<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
    ) -> Result<Vec<u8>, Response> {
        self.control_read(dev, setup(0xa1, DFU_GETSTATE, 0, 0, 1))
    }

    pub fn clear_status<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
    ) -> Result<(), Response> {
        self.control_write(dev, setup(0x21, DFU_CLRSTATUS, 0, 0, 0), &[])
    }

    pub fn abort<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
    ) -> Result<(), Response> {
        self.control_write(dev, setup(0x21, DFU_ABORT, 0, 0, 0), &[])
    }

    pub fn download<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        block_num: u16,
        payload: &[u8],
    ) -> Result<(), Response> {
        let setup = setup(0x21, DFU_DNLOAD, block_num, 0, payload.len() as u16);
        self.control_write(dev, setup, payload)
    }

    /// Download `image` in 4096 byte blocks, checking every status reply,
    /// and return the number of blocks sent.
    pub fn download_blocks<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        image: &[u8],
    ) -> u16 {
        let mut count = 0;
        for (i, block) in image.chunks(BLOCK_SIZE).enumerate() {
            self.download(dev, i as u16, block).unwrap();
            assert_eq!(
                self.get_status(dev).unwrap(),
                status(STATUS_OK, 250, DFU_DN_BUSY)
            );
            assert_eq!(
                self.get_status(dev).unwrap(),
                status(STATUS_OK, 0, DFU_DNLOAD_IDLE)
            );
            count += 1;
        }
        count
    }

    /// Whole download followed by manifestation.
    pub fn download_image<P: BlockProgrammer>(
        &self,
        dev: &mut DFUDevice<'_, MockBus, P>,
        image: &[u8],
    ) {
        let blocks = self.download_blocks(dev, image);
        self.download(dev, blocks, &[]).unwrap();
        assert_eq!(
            self.get_status(dev).unwrap(),
            status(STATUS_OK, 1000, DFU_MANIFEST)
        );
        assert_eq!(
            self.get_status(dev).unwrap(),
            status(STATUS_OK, 0, APP_IDLE)
        );
    }
}
