#![allow(dead_code)]
//! Simulated D+/D- pair with a host on the other end.
//!
//! Time is a virtual cycle counter that advances by one on every
//! `now()` call. Host packets are queued as line-level waveforms, one
//! level per bit-time, and start at a bit-exact time decided by their
//! [`Start`] rule. Everything the device drives is decoded back into
//! packet bytes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use usbd_dfu_bitbang::phy::{BusIo, LineState};

/// Counter frequency used by tests. Gives 16 cycles per bit.
pub const CPU_FREQ_HZ: u32 = 24_000_000;

/// Cycles per low-speed bit at [`CPU_FREQ_HZ`].
pub const BIT: u32 = 16;

/// Bit-times between the end of one packet and the start of the next.
const GAP_BITS: u32 = 2;

/// When a queued host waveform starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Start {
    /// Once the bus is idle and the device samples it.
    Idle,
    /// Right after the previous host waveform.
    AfterHost,
    /// After the device sent a data packet. Dropped if the device sent
    /// anything else.
    AfterDeviceData,
}

struct Waveform {
    levels: Vec<LineState>,
    start: Start,
}

struct Playing {
    levels: Vec<LineState>,
    start: u32,
}

impl Playing {
    fn end(&self) -> u32 {
        self.start
            .wrapping_add(self.levels.len() as u32 * BIT)
    }
}

/// Signed distance from `t` to `now` on the wrapping counter.
fn since(now: u32, t: u32) -> i64 {
    now.wrapping_sub(t) as i32 as i64
}

/// NRZI encode `bytes` starting from idle J, stuffing after six ones,
/// and append the end of packet.
pub fn encode(bytes: &[u8]) -> Vec<LineState> {
    let mut levels = encode_bits(bytes, true);
    levels.extend([LineState::Se0, LineState::Se0, LineState::J]);
    levels
}

/// Like [`encode`] but without bit stuffing.
pub fn encode_unstuffed(bytes: &[u8]) -> Vec<LineState> {
    let mut levels = encode_bits(bytes, false);
    levels.extend([LineState::Se0, LineState::Se0, LineState::J]);
    levels
}

fn encode_bits(bytes: &[u8], stuff: bool) -> Vec<LineState> {
    let mut levels = Vec::new();
    let mut level = LineState::J;
    let mut run = 0;

    for &byte in bytes {
        for i in 0..8 {
            if (byte >> i) & 1 == 0 {
                level = level.toggled();
                run = 0;
            } else {
                run += 1;
            }
            levels.push(level);

            if stuff && run == 6 {
                level = level.toggled();
                levels.push(level);
                run = 0;
            }
        }
    }
    levels
}

/// Decode levels driven by the device, starting from J, up to SE0.
pub fn decode(levels: &[LineState]) -> Vec<u8> {
    let mut previous = LineState::J;
    let mut run = 0;
    let mut bits = Vec::new();

    for &level in levels {
        if level == LineState::Se0 {
            break;
        }
        if level != previous {
            if run < 6 {
                bits.push(0u8);
            }
            run = 0;
        } else {
            bits.push(1u8);
            run += 1;
        }
        previous = level;
    }

    bits.chunks_exact(8)
        .map(|c| c.iter().enumerate().fold(0u8, |b, (i, &v)| b | (v << i)))
        .collect()
}

pub struct Wire {
    now: u32,
    queue: VecDeque<Waveform>,
    playing: Option<Playing>,
    last_end: u32,
    output_enabled: bool,
    level: LineState,
    driven: Vec<LineState>,
    /// Packets sent by the device, sync byte included.
    pub sent: VecDeque<Vec<u8>>,
    /// Pull-up state.
    pub attached: bool,
}

impl Wire {
    fn new(now: u32) -> Self {
        Self {
            now,
            queue: VecDeque::new(),
            playing: None,
            last_end: now,
            output_enabled: false,
            level: LineState::J,
            driven: Vec::new(),
            sent: VecDeque::new(),
            attached: false,
        }
    }

    fn line(&mut self) -> LineState {
        if self.output_enabled {
            return self.level;
        }

        loop {
            if let Some(p) = &self.playing {
                let dt = since(self.now, p.start);
                if dt < 0 {
                    return LineState::J;
                }
                let idx = (dt as u32 / BIT) as usize;
                if idx < p.levels.len() {
                    return p.levels[idx];
                }
                self.last_end = p.end();
                self.playing = None;
            }

            let start = match self.queue.front().map(|w| w.start) {
                Some(Start::Idle) => self.now.wrapping_add(GAP_BITS * BIT),
                Some(Start::AfterHost) => {
                    let planned = self.last_end.wrapping_add(GAP_BITS * BIT);
                    if since(self.now, planned) >= 0 {
                        self.now.wrapping_add(1)
                    } else {
                        planned
                    }
                }
                _ => return LineState::J,
            };
            self.promote(start);
        }
    }

    fn promote(&mut self, start: u32) {
        if let Some(w) = self.queue.pop_front() {
            self.playing = Some(Playing {
                levels: w.levels,
                start,
            });
        }
    }

    /// Drop a host waveform that has finished playing.
    fn retire_played(&mut self) {
        if let Some(p) = &self.playing {
            if since(self.now, p.end()) >= 0 {
                self.last_end = p.end();
                self.playing = None;
            }
        }
    }

    fn device_packet_done(&mut self) {
        // line() is not sampled while the device drives the bus
        self.retire_played();

        let bytes = decode(&self.driven);
        let is_data = matches!(bytes.get(1), Some(0xc3) | Some(0x4b));
        self.sent.push_back(bytes);

        if self.playing.is_none()
            && self.queue.front().map(|w| w.start) == Some(Start::AfterDeviceData)
        {
            if is_data {
                let start = self.now.wrapping_add(GAP_BITS * BIT);
                self.promote(start);
            } else {
                self.queue.pop_front();
            }
        }
    }

    /// Queue a host packet.
    pub fn queue(&mut self, bytes: &[u8], start: Start) {
        self.queue_levels(encode(bytes), start);
    }

    /// Queue raw line levels.
    pub fn queue_levels(&mut self, levels: Vec<LineState>, start: Start) {
        self.queue.push_back(Waveform { levels, start });
    }

    /// Queue bus reset signalling of `bits` bit-times followed by idle.
    pub fn queue_reset(&mut self, bits: usize) {
        let mut levels = vec![LineState::Se0; bits];
        levels.push(LineState::J);
        self.queue_levels(levels, Start::Idle);
    }

    /// Nothing left to play.
    pub fn idle(&self) -> bool {
        let done = match &self.playing {
            Some(p) => since(self.now, p.end()) >= 0,
            None => true,
        };
        done && self.queue.is_empty()
    }

    /// Drop waveforms that will never start.
    pub fn abandon(&mut self) {
        self.queue.clear();
    }

    pub fn now(&self) -> u32 {
        self.now
    }
}

/// Device side of the wire.
#[derive(Clone)]
pub struct MockBus(pub Rc<RefCell<Wire>>);

impl MockBus {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Wire whose counter starts at `now`.
    pub fn starting_at(now: u32) -> Self {
        MockBus(Rc::new(RefCell::new(Wire::new(now))))
    }

    pub fn wire(&self) -> std::cell::RefMut<'_, Wire> {
        self.0.borrow_mut()
    }
}

impl BusIo for MockBus {
    fn now(&mut self) -> u32 {
        let mut w = self.0.borrow_mut();
        w.now = w.now.wrapping_add(1);
        w.now
    }

    fn read(&mut self) -> LineState {
        self.0.borrow_mut().line()
    }

    fn write(&mut self, state: LineState) {
        let mut w = self.0.borrow_mut();
        w.level = state;
        if w.output_enabled {
            w.driven.push(state);
        }
    }

    fn set_output_enabled(&mut self, enabled: bool) {
        let mut w = self.0.borrow_mut();
        if enabled && !w.output_enabled {
            w.driven.clear();
        }
        if !enabled && w.output_enabled {
            w.output_enabled = false;
            w.device_packet_done();
        }
        w.output_enabled = enabled;
    }

    fn attach(&mut self) {
        self.0.borrow_mut().attached = true;
    }

    fn detach(&mut self) {
        self.0.borrow_mut().attached = false;
    }
}
