//! FPGA boot controller.
//!
//! One state machine serves both FPGAs, parameterised by the register
//! triple (data, control, status) and the load/done control-word pairs:
//! prepare the configuration port, stream the image word-aligned, then
//! poll the status register until the post-load pattern appears within a
//! bounded wall-clock budget. Streaming failures retry a bounded number of
//! times; nothing else in the SDK retries.

use std::time::{Duration, Instant};

use bytes::Bytes;
use pixie16_hw::regs::Controls;
use tracing::{debug, warn};

use crate::bus::BusDriver;
use crate::error::{Error, Result};

/// Wall-clock budget for a status transition.
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll period while waiting on a status transition.
const STATUS_POLL: Duration = Duration::from_millis(10);

/// Boot state, visible for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Nothing attempted.
    Idle,
    /// Configuration port prepared.
    Prepare,
    /// Image words streaming.
    Streaming,
    /// Waiting for the post-load status.
    Verify,
    /// Image booted.
    Done,
    /// Last attempt failed.
    Failed,
}

/// The shared FPGA load state machine.
pub struct FpgaControl<'a> {
    bus: &'a dyn BusDriver,
    name: &'static str,
    data_reg: u32,
    ctrl_reg: u32,
    status_reg: u32,
    load: Controls,
    done: Controls,
    state: BootState,
}

impl<'a> FpgaControl<'a> {
    /// Controller for the Com (system) FPGA.
    #[must_use]
    pub fn comms(bus: &'a dyn BusDriver) -> Self {
        use pixie16_hw::regs::{sys_fpga, CFG_CTRLCS, CFG_DATACS, CFG_RDCS};
        Self {
            bus,
            name: "comms",
            data_reg: CFG_DATACS,
            ctrl_reg: CFG_CTRLCS,
            status_reg: CFG_RDCS,
            load: sys_fpga::LOAD,
            done: sys_fpga::DONE,
            state: BootState::Idle,
        }
    }

    /// Controller for the FiPPI (signal processing) FPGA.
    #[must_use]
    pub fn fippi(bus: &'a dyn BusDriver) -> Self {
        use pixie16_hw::regs::{fippi_fpga, CFG_CTRLCS, CFG_DATACS, CFG_RDCS};
        Self {
            bus,
            name: "fippi",
            data_reg: CFG_DATACS,
            ctrl_reg: CFG_CTRLCS,
            status_reg: CFG_RDCS,
            load: fippi_fpga::LOAD,
            done: fippi_fpga::DONE,
            state: BootState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BootState {
        self.state
    }

    /// Whether the device reports the booted status pattern.
    ///
    /// # Errors
    ///
    /// Propagates register access failures.
    pub fn done(&self) -> Result<bool> {
        let status = self.bus.read_word(self.status_reg)?;
        Ok(status & !self.done.mask == self.done.status())
    }

    /// Load an image, retrying a streaming failure up to `retries` times.
    /// The caller must hold the module's bus guard.
    ///
    /// # Errors
    ///
    /// Returns `DeviceBootFailure` when all attempts are exhausted and
    /// `DeviceImageFailure` for an empty image.
    pub fn load(&mut self, image: &Bytes, retries: usize) -> Result<()> {
        if image.is_empty() {
            return Err(Error::DeviceImageFailure(format!("{}: empty image", self.name)));
        }
        let words = image_words(image);
        let mut last = None;
        for attempt in 1..=retries.max(1) {
            match self.attempt(&words) {
                Ok(()) => {
                    self.state = BootState::Done;
                    debug!("fpga: {}: booted ({} words, attempt {attempt})", self.name, words.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!("fpga: {}: attempt {attempt} failed: {e}", self.name);
                    self.state = BootState::Failed;
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::DeviceBootFailure(format!("{}: no load attempts made", self.name))
        }))
    }

    fn attempt(&mut self, words: &[u32]) -> Result<()> {
        self.state = BootState::Prepare;
        self.transition(self.load)?;
        self.state = BootState::Streaming;
        for word in words {
            self.bus
                .write_word(self.data_reg, *word)
                .map_err(|e| Error::DeviceLoadFailure(format!("{}: {e}", self.name)))?;
        }
        self.state = BootState::Verify;
        self.transition(self.done)
    }

    fn transition(&self, controls: Controls) -> Result<()> {
        let current = self.bus.read_word(self.ctrl_reg)?;
        self.bus
            .write_word(self.ctrl_reg, (current & controls.mask) | controls.value)?;
        let deadline = Instant::now() + STATUS_TIMEOUT;
        loop {
            let status = self.bus.read_word(self.status_reg)?;
            if status & !controls.mask == controls.status() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::DeviceBootFailure(format!(
                    "{}: status {status:#x} never matched {:#x}",
                    self.name,
                    controls.status()
                )));
            }
            std::thread::sleep(STATUS_POLL);
        }
    }
}

/// Split an image into the little-endian words the bus streams, padding a
/// ragged tail with zeros.
#[must_use]
pub fn image_words(image: &Bytes) -> Vec<u32> {
    let mut words: Vec<u32> = image
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().expect("chunks_exact yields 4 bytes")))
        .collect();
    let tail = image.chunks_exact(4).remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 4];
        last[..tail.len()].copy_from_slice(tail);
        words.push(u32::from_le_bytes(last));
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buses::{SimBus, SimConfig};

    #[test]
    fn comms_image_boots_on_sim() {
        let bus = SimBus::new(SimConfig::default());
        let mut ctrl = FpgaControl::comms(&bus);
        let image = Bytes::from(vec![0xAB; 64]);
        ctrl.load(&image, 3).unwrap();
        assert_eq!(ctrl.state(), BootState::Done);
        assert!(ctrl.done().unwrap());
    }

    #[test]
    fn fippi_image_boots_on_sim() {
        let bus = SimBus::new(SimConfig::default());
        let mut ctrl = FpgaControl::fippi(&bus);
        ctrl.load(&Bytes::from(vec![1, 2, 3, 4, 5]), 1).unwrap();
        assert_eq!(ctrl.state(), BootState::Done);
    }

    #[test]
    fn empty_image_rejected() {
        let bus = SimBus::new(SimConfig::default());
        let mut ctrl = FpgaControl::comms(&bus);
        let err = ctrl.load(&Bytes::new(), 3).unwrap_err();
        assert_eq!(err.api_result(), 504);
    }

    #[test]
    fn ragged_image_pads_to_words() {
        let words = image_words(&Bytes::from(vec![1, 0, 0, 0, 2]));
        assert_eq!(words, vec![1, 2]);
    }
}
