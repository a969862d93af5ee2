//! Simulated bus driver.
//!
//! A full software model of one module behind the register protocol: DSP
//! data memory, the IO buffer, MCA histogram memory and a rate-controlled
//! external FIFO generator. The module runtime drives a `SimBus` through
//! exactly the same code paths as hardware, which is what makes offline
//! crates and the test suite possible.
//!
//! The model keeps a few behavioural rules:
//!
//! - writing the FPGA control register reflects its low 12 bits into the
//!   status register, which satisfies the boot controllers;
//! - raising `CSR.RUN_ENABLE` with `RunTask == 0` executes the pending
//!   control task synchronously;
//! - a list-mode run produces FIFO words at a configured constant rate;
//!   ending the run freezes production and posts the run statistics into
//!   the DSP output variables.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use pixie16_hw as hw;
use pixie16_hw::pci::MAX_CHANNELS;
use pixie16_hw::regs;
use pixie16_hw::regs::csr;
use pixie16_hw::run::{ControlTask, RunTask};
use tracing::{debug, trace};

use crate::bus::{BusDriver, DeviceInfo};
use crate::error::{Error, Result};
use crate::param::{
    self, AddressMap, ChannelVar, ChannelVarDescs, ModuleVar, ModuleVarDescs,
};

/// Word production rate of the `lm_fifo` test generator, words/second.
const TEST_FIFO_RATE: f64 = 2_000_000.0;

/// Fraction of real time a simulated channel is live.
const LIVE_FRACTION: f64 = 0.98;

/// Configuration for one simulated module.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Reported PCI bus number.
    pub pci_bus: u32,
    /// Reported PCI slot number.
    pub pci_slot: u32,
    /// Module revision.
    pub revision: u16,
    /// Serial number.
    pub serial_num: u32,
    /// ADC resolution in bits.
    pub adc_bits: u32,
    /// ADC sampling rate in MSPS.
    pub adc_msps: u32,
    /// Channels fitted.
    pub num_channels: usize,
    /// List-mode word production rate, words/second.
    pub fifo_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pci_bus: 1,
            pci_slot: 2,
            revision: hw::pci::revision::F,
            serial_num: 1000,
            adc_bits: 14,
            adc_msps: 250,
            num_channels: MAX_CHANNELS,
            fifo_rate: 1000.0,
        }
    }
}

#[derive(Debug, Default)]
struct FifoState {
    active: bool,
    rate: f64,
    produced: f64,
    drained: u64,
    seq: u32,
    last_update: Option<Instant>,
}

impl FifoState {
    fn update(&mut self) {
        let now = Instant::now();
        if self.active {
            if let Some(last) = self.last_update {
                self.produced += now.duration_since(last).as_secs_f64() * self.rate;
            }
            let backlog_limit = self.drained as f64 + hw::dsp::EXT_FIFO_LENGTH as f64;
            if self.produced > backlog_limit {
                self.produced = backlog_limit;
            }
        }
        self.last_update = Some(now);
    }

    fn level(&self) -> u64 {
        (self.produced as u64).saturating_sub(self.drained)
    }

    fn reset(&mut self) {
        self.produced = 0.0;
        self.drained = 0;
        self.seq = 0;
        self.last_update = Some(Instant::now());
    }
}

#[derive(Debug)]
struct SimState {
    regs: HashMap<u32, u32>,
    csr: u32,
    data: Vec<u32>,
    io_buffer: Vec<u32>,
    histograms: Vec<u32>,
    run_task: u32,
    run_start: Option<Instant>,
    fifo: FifoState,
}

/// Simulated module bus.
#[derive(Debug)]
pub struct SimBus {
    config: SimConfig,
    module_descs: ModuleVarDescs,
    channel_descs: ChannelVarDescs,
    map: AddressMap,
    state: Mutex<SimState>,
    reg_trace: bool,
}

impl SimBus {
    /// Create a simulated module. The DSP variable layout is the canonical
    /// one from [`param::assign_default_addresses`].
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self::with_trace(config, false)
    }

    /// Create a simulated module with register tracing.
    ///
    /// # Panics
    ///
    /// Panics if the canonical variable layout fails its own gap check,
    /// which would be a bug in the layout tables.
    #[must_use]
    pub fn with_trace(config: SimConfig, reg_trace: bool) -> Self {
        let mut module_descs = param::default_module_var_descs();
        let mut channel_descs = param::default_channel_var_descs();
        param::assign_default_addresses(&mut module_descs, &mut channel_descs);
        let map = AddressMap::set(config.num_channels, &module_descs, &channel_descs)
            .expect("canonical layout is contiguous");
        let state = SimState {
            regs: HashMap::new(),
            csr: 0,
            data: vec![0; hw::dsp::DATA_MEMORY_LENGTH as usize],
            io_buffer: vec![0; hw::dsp::IO_BUFFER_LENGTH as usize],
            histograms: vec![0; MAX_CHANNELS * hw::dsp::MAX_HISTOGRAM_LENGTH],
            run_task: 0,
            run_start: None,
            fifo: FifoState::default(),
        };
        Self { config, module_descs, channel_descs, map, state: Mutex::new(state), reg_trace }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock poisoned")
    }

    fn module_cell(&self, state: &SimState, var: ModuleVar) -> u32 {
        let desc = &self.module_descs[var as usize];
        state.data[(desc.address - hw::dsp::DATA_MEMORY_ADDRESS) as usize]
    }

    fn set_module_cell(&self, state: &mut SimState, var: ModuleVar, value: u32) {
        let desc = &self.module_descs[var as usize];
        state.data[(desc.address - hw::dsp::DATA_MEMORY_ADDRESS) as usize] = value;
    }

    fn channel_cell(&self, state: &SimState, var: ChannelVar, channel: usize) -> u32 {
        let desc = &self.channel_descs[var as usize];
        let addr = self.map.channel_cell(desc, channel);
        state.data[(addr - hw::dsp::DATA_MEMORY_ADDRESS) as usize]
    }

    fn set_channel_cell(&self, state: &mut SimState, var: ChannelVar, channel: usize, value: u32) {
        let desc = &self.channel_descs[var as usize];
        let addr = self.map.channel_cell(desc, channel);
        state.data[(addr - hw::dsp::DATA_MEMORY_ADDRESS) as usize] = value;
    }

    fn adc_max(&self) -> f64 {
        f64::from((1u32 << self.config.adc_bits) - 1)
    }

    /// The simulated analog front end: the baseline level falls linearly as
    /// the offset DAC rises. `adjust_offsets` binary-searches against this.
    fn baseline_level(&self, state: &SimState, channel: usize) -> u32 {
        let dac = f64::from(self.channel_cell(state, ChannelVar::OffsetDAC, channel));
        let frac = 1.0 - dac / f64::from(hw::dsp::DAC_FULL_SCALE);
        (frac * self.adc_max()) as u32
    }

    fn control_task(&self, state: &mut SimState, task: u32) {
        if state.fifo.active && task != ControlTask::FillExtFifo.code() {
            // Any other control task ends the FIFO test generator.
            state.fifo.update();
            state.fifo.active = false;
        }
        if task == ControlTask::GetTraces.code() {
            for ch in 0..self.config.num_channels {
                let base = ch * hw::dsp::MAX_ADC_TRACE_LENGTH;
                let level = self.baseline_level(state, ch);
                for i in 0..hw::dsp::MAX_ADC_TRACE_LENGTH {
                    let ripple = ((i * 13 + ch * 7) % 9) as u32;
                    state.io_buffer[base + i] = level + ripple;
                }
            }
        } else if task == ControlTask::GetBaselines.code() {
            for rec in 0..hw::dsp::MAX_NUM_BASELINES {
                let base = rec * hw::dsp::BASELINE_RECORD_WORDS;
                state.io_buffer[base] = (rec * 10) as u32;
                state.io_buffer[base + 1] = 0;
                for ch in 0..MAX_CHANNELS {
                    let level = if ch < self.config.num_channels {
                        self.baseline_level(state, ch) + ((rec * 7 + ch) % 5) as u32
                    } else {
                        0
                    };
                    state.io_buffer[base + 2 + ch] = level;
                }
            }
        } else if task == ControlTask::FillExtFifo.code() {
            state.fifo.reset();
            state.fifo.rate = TEST_FIFO_RATE;
            state.fifo.active = true;
        }
        // The DAC and FiPPI programming tasks have no observable model
        // state; they complete immediately.
    }

    fn start_run(&self, state: &mut SimState, task: u32) {
        let new_run = self.module_cell(state, ModuleVar::Resume) == hw::run::RunMode::New.code();
        state.run_task = task;
        state.run_start = Some(Instant::now());
        state.csr |= csr::RUN_ACTIVE;
        if new_run {
            state.histograms.fill(0);
            state.fifo.reset();
        }
        state.fifo.rate = self.config.fifo_rate;
        state.fifo.active = task == RunTask::ListMode.code();
        debug!("sim: run start: task={task:#x} new={new_run}");
    }

    fn end_run(&self, state: &mut SimState) {
        state.fifo.update();
        state.fifo.active = false;
        state.csr &= !csr::RUN_ACTIVE;
        let Some(started) = state.run_start.take() else {
            return;
        };
        let elapsed = started.elapsed().as_secs_f64();
        let ticks = (elapsed / hw::dsp::CLOCK_TICK) as u64;
        self.set_module_cell(state, ModuleVar::RealTimeA, (ticks >> 32) as u32);
        self.set_module_cell(state, ModuleVar::RealTimeB, ticks as u32);
        self.set_module_cell(state, ModuleVar::RunTimeA, (ticks >> 32) as u32);
        self.set_module_cell(state, ModuleVar::RunTimeB, ticks as u32);

        let live = (elapsed * LIVE_FRACTION / hw::dsp::CLOCK_TICK) as u64;
        let events = (state.fifo.produced as u64 / 4).max(1);
        for ch in 0..self.config.num_channels {
            self.set_channel_cell(state, ChannelVar::LiveTimeA, ch, (live >> 32) as u32);
            self.set_channel_cell(state, ChannelVar::LiveTimeB, ch, live as u32);
            self.set_channel_cell(state, ChannelVar::FastPeaksA, ch, (events >> 32) as u32);
            self.set_channel_cell(state, ChannelVar::FastPeaksB, ch, events as u32);
            self.set_channel_cell(state, ChannelVar::ChanEventsA, ch, (events >> 32) as u32);
            self.set_channel_cell(state, ChannelVar::ChanEventsB, ch, events as u32);
        }

        if state.run_task == RunTask::Histogram.code() {
            let scale = (elapsed * 100.0).max(1.0);
            for ch in 0..self.config.num_channels {
                let peak = 100 + ch;
                let base = ch * hw::dsp::MAX_HISTOGRAM_LENGTH;
                for bin in 0..hw::dsp::MAX_HISTOGRAM_LENGTH {
                    let distance = bin.abs_diff(peak) + 1;
                    state.histograms[base + bin] += (scale / distance as f64) as u32;
                }
            }
        }
        state.run_task = 0;
        debug!("sim: run end: elapsed={elapsed:.3}s");
    }

    fn write_csr(&self, state: &mut SimState, value: u32) {
        if value & csr::DSP_RELEASE != 0 {
            state.csr |= csr::DSP_READY;
        }
        let was_active = state.csr & csr::RUN_ACTIVE != 0;
        if value & csr::RUN_ENABLE != 0 {
            if !was_active {
                let task = self.module_cell(state, ModuleVar::RunTask);
                if task == 0 {
                    let ctrl = self.module_cell(state, ModuleVar::ControlTask);
                    self.control_task(state, ctrl);
                } else {
                    self.start_run(state, task);
                }
            }
        } else if was_active {
            self.end_run(state);
        }
        state.csr = (state.csr & (csr::RUN_ACTIVE | csr::DSP_READY))
            | (value & !(csr::RUN_ACTIVE | csr::DSP_READY));
    }

    fn fifo_read(&self, state: &mut SimState, out: &mut [u32]) {
        state.fifo.update();
        for word in out.iter_mut() {
            *word = state.fifo.seq;
            state.fifo.seq = state.fifo.seq.wrapping_add(1);
        }
        state.fifo.drained += out.len() as u64;
        if state.fifo.produced < state.fifo.drained as f64 {
            state.fifo.produced = state.fifo.drained as f64;
        }
    }
}

impl BusDriver for SimBus {
    fn read_word(&self, offset: u32) -> Result<u32> {
        let mut state = self.lock();
        let value = match offset {
            regs::CSR => state.csr,
            regs::FIFO_LEVEL => {
                state.fifo.update();
                u32::try_from(state.fifo.level()).unwrap_or(u32::MAX)
            }
            other => state.regs.get(&other).copied().unwrap_or(0),
        };
        if self.reg_trace {
            trace!("sim: rd {offset:#04x} = {value:#010x}");
        }
        Ok(value)
    }

    fn write_word(&self, offset: u32, value: u32) -> Result<()> {
        if self.reg_trace {
            trace!("sim: wr {offset:#04x} = {value:#010x}");
        }
        let mut state = self.lock();
        match offset {
            regs::CSR => self.write_csr(&mut state, value),
            regs::CFG_CTRLCS => {
                state.regs.insert(regs::CFG_CTRLCS, value);
                state.regs.insert(regs::CFG_RDCS, value & 0xFFF);
            }
            other => {
                state.regs.insert(other, value);
            }
        }
        Ok(())
    }

    fn block_read(&self, addr: u32, out: &mut [u32]) -> Result<()> {
        let mut state = self.lock();
        let n = out.len();
        if in_window(addr, n, hw::dsp::DATA_MEMORY_ADDRESS, hw::dsp::DATA_MEMORY_LENGTH) {
            let base = (addr - hw::dsp::DATA_MEMORY_ADDRESS) as usize;
            out.copy_from_slice(&state.data[base..base + n]);
        } else if in_window(addr, n, hw::dsp::IO_BUFFER_ADDRESS, hw::dsp::IO_BUFFER_LENGTH) {
            let base = (addr - hw::dsp::IO_BUFFER_ADDRESS) as usize;
            out.copy_from_slice(&state.io_buffer[base..base + n]);
        } else if addr == hw::dsp::EXT_FIFO_ADDRESS {
            self.fifo_read(&mut state, out);
        } else if in_window(
            addr,
            n,
            hw::dsp::HISTOGRAM_ADDRESS,
            (MAX_CHANNELS * hw::dsp::MAX_HISTOGRAM_LENGTH) as u32,
        ) {
            let base = (addr - hw::dsp::HISTOGRAM_ADDRESS) as usize;
            out.copy_from_slice(&state.histograms[base..base + n]);
        } else {
            return Err(Error::DeviceDmaFailure(format!(
                "sim: block read outside modelled memory: {addr:#x}+{n}"
            )));
        }
        Ok(())
    }

    fn block_write(&self, addr: u32, data: &[u32]) -> Result<()> {
        let mut state = self.lock();
        let n = data.len();
        if in_window(addr, n, hw::dsp::DATA_MEMORY_ADDRESS, hw::dsp::DATA_MEMORY_LENGTH) {
            let base = (addr - hw::dsp::DATA_MEMORY_ADDRESS) as usize;
            state.data[base..base + n].copy_from_slice(data);
        } else if in_window(addr, n, hw::dsp::CODE_ADDRESS, hw::dsp::CODE_LENGTH) {
            // DSP program memory is write-only from the host; the image is
            // accepted and discarded.
        } else {
            return Err(Error::DeviceDmaFailure(format!(
                "sim: block write outside modelled memory: {addr:#x}+{n}"
            )));
        }
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            pci_bus: self.config.pci_bus,
            pci_slot: self.config.pci_slot,
            revision: self.config.revision,
            serial_num: self.config.serial_num,
            adc_bits: self.config.adc_bits,
            adc_msps: self.config.adc_msps,
            num_channels: self.config.num_channels,
        })
    }
}

fn in_window(addr: u32, words: usize, base: u32, length: u32) -> bool {
    addr >= base && u64::from(addr) + words as u64 <= u64::from(base) + u64::from(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_write_reflects_into_status() {
        let bus = SimBus::new(SimConfig::default());
        bus.write_word(regs::CFG_CTRLCS, regs::sys_fpga::LOAD.value).unwrap();
        assert_eq!(bus.read_word(regs::CFG_RDCS).unwrap(), 0x553);
    }

    #[test]
    fn data_memory_round_trips() {
        let bus = SimBus::new(SimConfig::default());
        let addr = hw::dsp::DATA_MEMORY_ADDRESS + 16;
        bus.block_write(addr, &[1, 2, 3]).unwrap();
        let mut out = [0u32; 3];
        bus.block_read(addr, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn out_of_window_dma_fails() {
        let bus = SimBus::new(SimConfig::default());
        let mut out = [0u32; 4];
        let err = bus.block_read(0xFFFF_0000, &mut out).unwrap_err();
        assert_eq!(err.api_result(), 506);
    }

    #[test]
    fn fifo_idle_reports_empty() {
        let bus = SimBus::new(SimConfig::default());
        assert_eq!(bus.read_word(regs::FIFO_LEVEL).unwrap(), 0);
    }

    #[test]
    fn dsp_release_raises_ready() {
        let bus = SimBus::new(SimConfig::default());
        bus.write_word(regs::CSR, csr::DSP_RELEASE).unwrap();
        assert_ne!(bus.read_word(regs::CSR).unwrap() & csr::DSP_READY, 0);
    }
}
