//! Control transfers on endpoint 0.
//!
//! One call of [`DFUDevice::transaction_next`] handles one token and the
//! packets that follow it in the same transaction. Control transfer
//! progress across transactions is kept in [`Transfer`].

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::descriptor::descriptor_type;
use usb_device::UsbDirection;

use crate::class::{
    BlockProgrammer, DFUClass, DFU_ABORT, DFU_CLRSTATUS, DFU_DNLOAD, DFU_GETSTATE,
    DFU_GETSTATUS,
};
use crate::descriptor::Descriptors;
use crate::device::DFUDevice;
use crate::fmt::{debug, info, trace};
use crate::packet::{
    check_ack, check_data, check_token, Pid, RawPacket, LOW_SPEED_PACKET_SIZE, MAX_ADDRESS,
};
use crate::phy::{BusIo, BusState, DataPid, Handshake};

/// Size of a SETUP data packet.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Data returned in the data stage of a control read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reply<'d> {
    /// No data stage, or a control write.
    None,
    /// Short reply produced when the request was accepted.
    Inline([u8; 6]),
    /// A descriptor.
    Descriptor(&'d [u8]),
}

impl Reply<'_> {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Reply::None => &[],
            Reply::Inline(buf) => &buf[..],
            Reply::Descriptor(d) => *d,
        }
    }
}

fn inline(bytes: &[u8]) -> Reply<'static> {
    let mut buf = [0u8; 6];
    buf[..bytes.len()].copy_from_slice(bytes);
    Reply::Inline(buf)
}

/// An accepted control request waiting for its data and status stages.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Transfer<'d> {
    pub request: Request,
    reply: Reply<'d>,
    /// Bytes in the data stage.
    pub len: usize,
    /// Data packets transferred so far.
    pub counter: usize,
}

impl<'d> Transfer<'d> {
    fn new(request: Request, reply: Reply<'d>, data_len: usize) -> Self {
        Self {
            request,
            reply,
            len: data_len.min(request.length as usize),
            counter: 0,
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request.direction == UsbDirection::In
    }

    /// Offset of the next data packet.
    fn offset(&self) -> usize {
        self.counter * LOW_SPEED_PACKET_SIZE
    }

    /// Next chunk of a control read. Empty once everything was sent.
    fn chunk(&self) -> &[u8] {
        let start = self.offset().min(self.len);
        let end = (start + LOW_SPEED_PACKET_SIZE).min(self.len);
        &self.reply.as_bytes()[start..end]
    }
}

/// Decode the 8 bytes of a SETUP data packet.
pub fn parse_setup(buf: &[u8]) -> Option<Request> {
    if buf.len() != SETUP_PACKET_SIZE {
        return None;
    }

    let rt = buf[0];
    let direction = if rt & 0x80 != 0 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    let request_type = match (rt >> 5) & 0b11 {
        0 => RequestType::Standard,
        1 => RequestType::Class,
        2 => RequestType::Vendor,
        _ => RequestType::Reserved,
    };
    let recipient = match rt & 0b1_1111 {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Reserved,
    };

    Some(Request {
        direction,
        request_type,
        recipient,
        request: buf[1],
        value: u16::from_le_bytes([buf[2], buf[3]]),
        index: u16::from_le_bytes([buf[4], buf[5]]),
        length: u16::from_le_bytes([buf[6], buf[7]]),
    })
}

/// Decide whether `req` is accepted in the current device state.
///
/// Returns the reply and the length of the data stage, before it is
/// limited by `wLength`.
pub(crate) fn check_setup<'d, P: BlockProgrammer>(
    req: &Request,
    address: u8,
    configuration: u8,
    descriptors: &'d Descriptors,
    dfu: &DFUClass<P>,
) -> Option<(Reply<'d>, usize)> {
    use RequestType::{Class, Standard};
    use UsbDirection::{In, Out};

    let addressed = address != 0 || configuration != 0;
    let configured = configuration != 0;
    let no_value = req.value == 0 && req.index == 0;

    let reply = match (req.request_type, req.recipient, req.direction, req.request) {
        (Standard, Recipient::Device, In, Request::GET_DESCRIPTOR) => {
            let [index, kind] = req.value.to_le_bytes();
            let fixed = matches!(
                kind,
                descriptor_type::DEVICE | descriptor_type::CONFIGURATION
            );
            if fixed && req.index != 0 {
                return None;
            }
            let d = descriptors.lookup(kind, index)?;
            return Some((Reply::Descriptor(d), d.len()));
        }
        (Standard, Recipient::Device, Out, Request::SET_ADDRESS)
            if req.value <= MAX_ADDRESS as u16 && req.index == 0 && req.length == 0 =>
        {
            Reply::None
        }
        (Standard, Recipient::Device, In, Request::GET_CONFIGURATION)
            if addressed && no_value && req.length == 1 =>
        {
            inline(&[configuration])
        }
        (
            Standard,
            Recipient::Device | Recipient::Interface | Recipient::Endpoint,
            In,
            Request::GET_STATUS,
        ) if addressed && no_value && req.length == 2 => inline(&[0, 0]),
        (Standard, Recipient::Device, Out, Request::SET_CONFIGURATION)
            if addressed && req.value <= 1 && req.index == 0 && req.length == 0 =>
        {
            Reply::None
        }
        (Standard, Recipient::Interface, In, Request::GET_INTERFACE)
            if configured && no_value && req.length == 1 =>
        {
            inline(&[0])
        }
        (Standard, Recipient::Interface, Out, Request::SET_INTERFACE)
            if configured && req.index == 0 && req.length == 0 =>
        {
            Reply::None
        }
        (
            Class,
            Recipient::Device | Recipient::Interface | Recipient::Endpoint,
            In,
            DFU_GETSTATUS,
        ) if configured && no_value && req.length == 6 => {
            let status: [u8; 6] = dfu.state().status().into();
            Reply::Inline(status)
        }
        (Class, Recipient::Interface, Out, DFU_DNLOAD)
            if configured && dfu.accepts_download(req) =>
        {
            return Some((Reply::None, req.length as usize));
        }
        (Class, Recipient::Interface, Out, DFU_CLRSTATUS)
            if configured && dfu.accepts_clear_status() && no_value && req.length == 0 =>
        {
            Reply::None
        }
        (Class, Recipient::Interface, Out, DFU_ABORT)
            if configured && dfu.accepts_abort() && no_value && req.length == 0 =>
        {
            Reply::None
        }
        (Class, Recipient::Interface, In, DFU_GETSTATE)
            if configured && no_value && req.length == 1 =>
        {
            inline(&[dfu.state().protocol_state() as u8])
        }
        _ => return None,
    };

    let len = match reply {
        Reply::None => 0,
        Reply::Inline(_) => req.length as usize,
        Reply::Descriptor(d) => d.len(),
    };
    Some((reply, len))
}

enum Stage {
    Token,
    WaitingAck,
    SetupData,
    OutData,
}

impl<'d, H: BusIo, P: BlockProgrammer> DFUDevice<'d, H, P> {
    fn stall(&mut self) {
        self.dfu.stalled();
        self.phy.send_handshake(Handshake::Stall);
    }

    /// Handle one transaction.
    ///
    /// Returns the bus state to continue with. Anything unexpected ends
    /// the transaction with [`BusState::Synced`] so the next call waits
    /// for a fresh token.
    pub(crate) fn transaction_next(&mut self) -> BusState {
        let mut stage = Stage::Token;
        let mut bit_time = self.phy.now();
        let mut packet = RawPacket::new();

        loop {
            if let Err(state) = self.phy.next_packet(&mut bit_time, &mut packet) {
                return state;
            }

            match stage {
                Stage::Token => {
                    let Some(token) = check_token(&packet, self.address) else {
                        return BusState::Synced;
                    };
                    if token.endpoint != 0 {
                        self.phy.send_handshake(Handshake::Stall);
                        trace!("usb: stall endpoint {}", token.endpoint);
                        return BusState::Synced;
                    }
                    match token.pid {
                        Pid::Setup => stage = Stage::SetupData,
                        Pid::Out => stage = Stage::OutData,
                        _ => match self.in_token() {
                            Some(sent) => {
                                bit_time = sent;
                                stage = Stage::WaitingAck;
                            }
                            None => return BusState::Synced,
                        },
                    }
                }
                Stage::WaitingAck => {
                    if check_ack(&packet) {
                        self.data_acked();
                    }
                    return BusState::Synced;
                }
                Stage::SetupData => {
                    let Some(data) = check_data(&packet) else {
                        return BusState::Synced;
                    };
                    let Some(req) = parse_setup(data.payload) else {
                        return BusState::Synced;
                    };
                    self.setup(req);
                    return BusState::Synced;
                }
                Stage::OutData => {
                    let Some(data) = check_data(&packet) else {
                        return BusState::Synced;
                    };
                    self.out_data(data.pid, data.payload);
                    return BusState::Synced;
                }
            }
        }
    }

    /// IN token: send the next chunk of a control read, or the empty
    /// status packet of a control write. Returns when the packet ended.
    fn in_token(&mut self) -> Option<u32> {
        let Some(transfer) = &self.transfer else {
            self.stall();
            debug!("usb: IN without request");
            return None;
        };

        if transfer.is_device_to_host() {
            let pid = DataPid::for_packet(transfer.counter);
            return Some(self.phy.send_data(pid, transfer.chunk()));
        }

        if transfer.offset() >= transfer.len {
            return Some(self.phy.send_data(DataPid::Data1, &[]));
        }

        self.transfer = None;
        self.stall();
        debug!("usb: status stage before data stage ended");
        None
    }

    /// The host acknowledged the packet sent for its IN token.
    fn data_acked(&mut self) {
        match self.transfer.take() {
            Some(mut t) if t.is_device_to_host() => {
                t.counter += 1;
                self.transfer = Some(t);
            }
            Some(t) => self.complete(&t.request),
            None => {}
        }
    }

    fn setup(&mut self, req: Request) {
        let accepted = check_setup(
            &req,
            self.address,
            self.configuration,
            self.descriptors,
            &self.dfu,
        );

        match accepted {
            Some((reply, data_len)) => {
                self.transfer = Some(Transfer::new(req, reply, data_len));
                self.phy.send_handshake(Handshake::Ack);
            }
            None => {
                self.transfer = None;
                self.stall();
                debug!(
                    "usb: stall request {} value {} length {}",
                    req.request,
                    req.value,
                    req.length
                );
            }
        }
    }

    fn out_data(&mut self, pid: Pid, payload: &[u8]) {
        let Some(mut t) = self.transfer.take() else {
            self.stall();
            debug!("usb: OUT without request");
            return;
        };

        if t.is_device_to_host() {
            // status stage of a control read
            if pid == Pid::Data1 {
                self.phy.send_handshake(Handshake::Ack);
                self.complete(&t.request);
            } else {
                self.stall();
            }
            return;
        }

        if pid == Pid::from(DataPid::for_packet(t.counter)) {
            let offset = t.offset();
            let n = payload.len();
            let full = n == LOW_SPEED_PACKET_SIZE || (t.len == 0 && n == 0);
            if !full || offset + n > t.len {
                self.stall();
                debug!("usb: bad OUT data at {} length {}", offset, n);
                return;
            }
            self.dfu.buffer_mut()[offset..offset + n].copy_from_slice(payload);
            t.counter += 1;
        }

        // a repeated packet is acknowledged again without storing it
        self.transfer = Some(t);
        self.phy.send_handshake(Handshake::Ack);
    }

    /// Apply the effect of a request after its status stage.
    fn complete(&mut self, req: &Request) {
        match (req.request_type, req.request) {
            (RequestType::Standard, Request::SET_ADDRESS) => {
                self.address = req.value as u8;
                self.configuration = 0;
                info!("usb: address {}", self.address);
            }
            (RequestType::Standard, Request::SET_CONFIGURATION) => {
                self.configuration = req.value as u8;
                info!("usb: configuration {}", self.configuration);
            }
            (RequestType::Class, DFU_DNLOAD) => self.dfu.download_done(req.length as usize),
            (RequestType::Class, DFU_CLRSTATUS) | (RequestType::Class, DFU_ABORT) => {
                self.dfu.return_to_idle()
            }
            (RequestType::Class, DFU_GETSTATUS) => self.dfu.status_polled(),
            _ => {}
        }
    }
}
