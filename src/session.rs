//! Polling loop with timeouts.

use core::ops::ControlFlow;

use crate::class::{BlockProgrammer, DFUState};
use crate::device::DFUDevice;
use crate::fmt::info;
use crate::phy::{BusIo, BusState};

/// Limits for [`Session::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Give up if no address is assigned within this time.
    pub connect_timeout_ms: Option<u32>,
    /// Give up after this long without bus activity.
    pub inactivity_timeout_ms: Option<u32>,
    /// Keep serving the host this long after the update completed, so
    /// that it can read the final status.
    pub complete_delay_ms: u32,
    /// Minimum time between hook calls.
    pub hook_interval_ms: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            inactivity_timeout_ms: None,
            complete_delay_ms: 1000,
            hook_interval_ms: 1,
        }
    }
}

/// Why [`Session::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// New firmware was written and selected.
    Updated,
    /// The host never enumerated the device.
    NotConnected,
    /// The host stopped talking to the device.
    TimedOut,
    /// The hook asked to stop.
    Exited,
}

/// Whole milliseconds elapsed on a wrapping cycle counter.
///
/// Must be sampled more often than the counter wraps.
struct Millis {
    mark: u32,
    cycles_per_ms: u32,
}

impl Millis {
    fn new(now: u32, cycles_per_ms: u32) -> Self {
        Self {
            mark: now,
            cycles_per_ms: cycles_per_ms.max(1),
        }
    }

    fn elapsed(&mut self, now: u32) -> u32 {
        let ms = now.wrapping_sub(self.mark) / self.cycles_per_ms;
        self.mark = self.mark.wrapping_add(ms * self.cycles_per_ms);
        ms
    }
}

/// Runs a [`DFUDevice`] until the update finishes or a limit is hit.
pub struct Session {
    config: SessionConfig,
}

impl Session {
    /// Creates a session with the given limits.
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Poll `device` until done.
    ///
    /// `hook` is called between polls, at most once per
    /// [`hook_interval_ms`](SessionConfig::hook_interval_ms). Use it to
    /// feed a watchdog or check an exit button; returning
    /// `ControlFlow::Break` ends the session with [`Outcome::Exited`].
    pub fn run<'d, H, P, F>(&self, device: &mut DFUDevice<'d, H, P>, mut hook: F) -> Outcome
    where
        H: BusIo,
        P: BlockProgrammer,
        F: FnMut(&mut DFUDevice<'d, H, P>) -> ControlFlow<()>,
    {
        let cycles_per_ms = device.cycles_per_ms();
        let mut clock = Millis::new(device.now(), cycles_per_ms);

        let mut connected = false;
        let mut since_start = 0u32;
        let mut since_activity = 0u32;
        let mut since_hook = 0u32;
        let mut since_complete: Option<u32> = None;
        let mut last: (BusState, u8, DFUState) =
            (device.bus_state(), device.address(), device.dfu_state());

        loop {
            device.poll();

            let ms = clock.elapsed(device.now());
            since_start = since_start.saturating_add(ms);
            since_activity = since_activity.saturating_add(ms);
            since_hook = since_hook.saturating_add(ms);

            let current = (device.bus_state(), device.address(), device.dfu_state());
            if current != last {
                last = current;
                since_activity = 0;
            }
            if device.address() != 0 {
                connected = true;
            }

            if device.is_complete() {
                let t = since_complete.get_or_insert(0);
                *t = t.saturating_add(ms);
                if *t >= self.config.complete_delay_ms {
                    info!("session: update complete");
                    return Outcome::Updated;
                }
            }

            if let Some(limit) = self.config.connect_timeout_ms {
                if !connected && since_start >= limit {
                    info!("session: no host after {} ms", since_start);
                    return Outcome::NotConnected;
                }
            }

            if let Some(limit) = self.config.inactivity_timeout_ms {
                if since_activity >= limit {
                    info!("session: idle for {} ms", since_activity);
                    return Outcome::TimedOut;
                }
            }

            if since_hook >= self.config.hook_interval_ms {
                since_hook = 0;
                if hook(device).is_break() {
                    return Outcome::Exited;
                }
            }
        }
    }
}
