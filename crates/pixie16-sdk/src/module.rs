//! Module runtime.
//!
//! A [`Module`] owns one board: its bus, its bound firmware set, the
//! loaded variable descriptors and address map, and the host-side
//! parameter cache with dirty tracking. Operations serialise on the
//! module's bus guard; `run_active` is a lock-free flag so supervisors can
//! poll without touching the bus. Never hold two modules' guards at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use pixie16_hw as hw;
use pixie16_hw::regs::{self, csr};
use pixie16_hw::run::{ControlTask, RunMode, RunTask};
use tracing::{debug, info};

use crate::backplane::Backplane;
use crate::bus::{BusDriver, BusGuard, BusLock, DeviceInfo};
use crate::dsp;
use crate::error::{Error, Result};
use crate::firmware::{self, Device, ModuleFirmwares};
use crate::fpga::FpgaControl;
use crate::param::{
    self, AddressMap, ChannelParam, ChannelVar, ChannelVarDescs, ChannelVariables, ModuleParam,
    ModuleVar, ModuleVarDescs, ModuleVariables, Rw,
};
use crate::stats::{counter_seconds, counter_value, RunStats};

/// Boot pattern bits. `FULL` runs every stage; `FAST` skips only the two
/// FPGA loads on the assumption they are already configured.
pub mod boot_pattern {
    /// Load the Com (system) FPGA.
    pub const COM_FPGA: u8 = 0x01;
    /// Load the FiPPI (signal processing) FPGA.
    pub const SP_FPGA: u8 = 0x02;
    /// Load the DSP code image.
    pub const DSP_CODE: u8 = 0x08;
    /// Download DSP parameters from the host cache.
    pub const DSP_PARAMS: u8 = 0x10;
    /// Reprogram the FiPPI filter registers.
    pub const PROGRAM_FIPPI: u8 = 0x20;
    /// Set the offset and gain DACs.
    pub const SET_DACS: u8 = 0x40;
    /// All stages.
    pub const FULL: u8 = 0x7F;
    /// Every stage except the Com and FiPPI FPGA loads: DSP code still
    /// streams, parameters download, the FiPPI is reprogrammed and the
    /// DACs are set.
    pub const FAST: u8 = DSP_CODE | DSP_PARAMS | PROGRAM_FIPPI | SET_DACS;
}

/// Retries for FPGA image streaming.
const BOOT_RETRIES: usize = 3;
/// Wall-clock budget for a control task or run stop.
const TASK_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll period while waiting on the DSP.
const TASK_POLL: Duration = Duration::from_millis(5);
/// Offset adjustment converges within this many iterations or fails.
const OFFSET_ITERATIONS: usize = 16;

/// Module test modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    /// No test running.
    #[default]
    Off,
    /// Continuous FIFO traffic for throughput measurement.
    LmFifo,
}

impl TestMode {
    /// Parse the front-end test mode name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "off" => Some(Self::Off),
            "lmfifo" => Some(Self::LmFifo),
            _ => None,
        }
    }
}

/// Captured baselines: timestamps (channel 0's clock is canonical for the
/// module) and per-requested-channel sample vectors.
#[derive(Debug, Clone, Default)]
pub struct Baselines {
    /// Sample timestamps in seconds.
    pub timestamps: Vec<f64>,
    /// One vector of baseline values per requested channel.
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Default)]
struct ModuleData {
    firmware: ModuleFirmwares,
    module_descs: ModuleVarDescs,
    channel_descs: ChannelVarDescs,
    map: Option<AddressMap>,
    module_vars: ModuleVariables,
    channel_vars: Vec<ChannelVariables>,
    test: TestMode,
    probed: bool,
    booted: bool,
}

/// One Pixie-16 board.
#[derive(Debug)]
pub struct Module {
    /// Crate-assigned module number.
    pub number: usize,
    /// Physical slot.
    pub slot: usize,
    bus: Arc<dyn BusDriver>,
    lock: BusLock,
    backplane: Arc<Backplane>,
    info: OnceLock<DeviceInfo>,
    online: AtomicBool,
    running: AtomicBool,
    data: Mutex<ModuleData>,
    run_stats: Mutex<RunStats>,
}

impl Module {
    /// Construct an offline module bound to a bus driver.
    #[must_use]
    pub fn new(
        number: usize,
        slot: usize,
        bus: Arc<dyn BusDriver>,
        backplane: Arc<Backplane>,
    ) -> Self {
        Self {
            number,
            slot,
            bus,
            lock: BusLock::default(),
            backplane,
            info: OnceLock::new(),
            online: AtomicBool::new(false),
            running: AtomicBool::new(false),
            data: Mutex::new(ModuleData::default()),
            run_stats: Mutex::new(RunStats::default()),
        }
    }

    /// Acquire the module's bus guard.
    pub fn bus_guard(&self) -> BusGuard<'_> {
        self.lock.guard()
    }

    /// Open the module: bind the PCI device and read its identity.
    ///
    /// # Errors
    ///
    /// Returns `ModuleAlreadyOpen` on a second open and propagates EEPROM
    /// failures as `ModuleInfoFailure`.
    pub fn open(&self) -> Result<()> {
        if self.info.get().is_some() {
            return Err(Error::ModuleAlreadyOpen(format!("module {}", self.number)));
        }
        let _guard = self.bus_guard();
        let info = self
            .bus
            .device_info()
            .map_err(|e| Error::ModuleInfoFailure(format!("module {}: {e}", self.number)))?;
        info!(
            "module {}: slot {}: rev {:X} serial {} {}-bit {} MSPS {} channels",
            self.number,
            self.slot,
            info.revision,
            info.serial_num,
            info.adc_bits,
            info.adc_msps,
            info.num_channels
        );
        self.info.set(info).expect("module info set once");
        Ok(())
    }

    /// Close the module and return it to the offline state.
    ///
    /// # Errors
    ///
    /// Returns `ModuleCloseFailure` if a run is still active.
    pub fn close(&self) -> Result<()> {
        if self.run_active() {
            return Err(Error::ModuleCloseFailure(format!(
                "module {}: run active",
                self.number
            )));
        }
        self.online.store(false, Ordering::Release);
        let mut data = self.data.lock().expect("module data lock poisoned");
        data.booted = false;
        Ok(())
    }

    /// Device identity. Available after [`Module::open`].
    ///
    /// # Errors
    ///
    /// Returns `ModuleOffline` before open.
    pub fn device_info(&self) -> Result<&DeviceInfo> {
        self.info
            .get()
            .ok_or_else(|| Error::ModuleOffline(format!("module {}: not open", self.number)))
    }

    /// Channels fitted on this module.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.info.get().map_or(hw::pci::MAX_CHANNELS, |i| i.num_channels)
    }

    /// Whether the module is online (probed or booted).
    #[must_use]
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Whether a data run is active. Lock-free.
    #[must_use]
    pub fn run_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind the module's firmware set.
    pub fn set_firmware(&self, firmware: ModuleFirmwares) {
        let mut data = self.data.lock().expect("module data lock poisoned");
        data.firmware = firmware;
    }

    /// Load the variable descriptors from the `var` firmware, compute the
    /// address map and initialise the host cache. Sets the module online.
    ///
    /// # Errors
    ///
    /// Fails if the `var` firmware is missing or the descriptor set is
    /// inconsistent.
    pub fn probe(&self) -> Result<()> {
        let num_channels = self.num_channels();
        let mut data = self.data.lock().expect("module data lock poisoned");
        let var_fw = firmware::find(&data.firmware, Device::Var, self.slot)?;
        if var_fw.image().is_none() {
            var_fw.load()?;
        }
        let image = var_fw
            .image()
            .ok_or_else(|| Error::DeviceImageFailure("var file image missing".into()))?;
        let (module_descs, channel_descs) = param::load(std::io::Cursor::new(image.as_ref()))?;
        let map = AddressMap::set(num_channels, &module_descs, &channel_descs)?;

        data.module_vars = param::new_module_variables(&module_descs);
        data.channel_vars =
            (0..num_channels).map(|_| param::new_channel_variables(&channel_descs)).collect();
        data.module_descs = module_descs;
        data.channel_descs = channel_descs;
        data.map = Some(map);
        data.probed = true;
        drop(data);

        self.initialize_defaults()?;
        self.online.store(true, Ordering::Release);
        debug!("module {}: probed", self.number);
        Ok(())
    }

    /// Boot the module per the pattern bitmask. Pattern 0 is a no-op.
    /// Stage order is fixed: ComFPGA, SPFPGA, DSP code, DSP variables, DSP
    /// parameters, FiPPI programming, DAC set.
    ///
    /// # Errors
    ///
    /// Any image failure aborts the boot and the module stays offline.
    pub fn boot(&self, pattern: u8) -> Result<()> {
        if pattern == 0 {
            debug!("module {}: boot pattern 0: nothing to do", self.number);
            return Ok(());
        }
        let firmware = {
            let data = self.data.lock().expect("module data lock poisoned");
            data.firmware.clone()
        };

        if pattern & boot_pattern::COM_FPGA != 0 {
            let image = boot_image(&firmware, Device::Sys, self.slot)?;
            let _guard = self.bus_guard();
            FpgaControl::comms(self.bus.as_ref()).load(&image, BOOT_RETRIES)?;
        }
        if pattern & boot_pattern::SP_FPGA != 0 {
            let image = boot_image(&firmware, Device::Fippi, self.slot)?;
            let _guard = self.bus_guard();
            FpgaControl::fippi(self.bus.as_ref()).load(&image, BOOT_RETRIES)?;
        }
        if pattern & boot_pattern::DSP_CODE != 0 {
            let image = boot_image(&firmware, Device::Dsp, self.slot)?;
            let _guard = self.bus_guard();
            dsp::load(self.bus.as_ref(), &image)?;
        }
        if pattern & boot_pattern::DSP_PARAMS != 0 {
            let probed = self.data.lock().expect("module data lock poisoned").probed;
            if !probed {
                self.probe()?;
            }
            self.mark_all_dirty();
            self.sync_vars()?;
        }
        if pattern & boot_pattern::PROGRAM_FIPPI != 0 {
            self.control_task(ControlTask::ProgramFippi)?;
        }
        if pattern & boot_pattern::SET_DACS != 0 {
            self.control_task(ControlTask::SetDacs)?;
        }

        let mut data = self.data.lock().expect("module data lock poisoned");
        data.booted = true;
        drop(data);
        self.online.store(true, Ordering::Release);
        info!("module {}: booted (pattern {pattern:#04x})", self.number);
        Ok(())
    }

    fn check_online(&self) -> Result<()> {
        if self.online() {
            Ok(())
        } else {
            Err(Error::ModuleOffline(format!("module {}", self.number)))
        }
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel < self.num_channels() {
            Ok(())
        } else {
            Err(Error::ChannelNumberInvalid(format!(
                "module {}: channel {channel} of {}",
                self.number,
                self.num_channels()
            )))
        }
    }

    // ── Variable access ──────────────────────────────────────────────────

    /// Read a module variable word from the host cache.
    ///
    /// # Errors
    ///
    /// Enforces the descriptor's enable and read policy.
    pub fn read_var(&self, var: ModuleVar, offset: usize) -> Result<u32> {
        let data = self.data.lock().expect("module data lock poisoned");
        let desc = &data.module_descs[var as usize];
        if !desc.enabled {
            return Err(Error::ModuleParamDisabled(var.label().into()));
        }
        if desc.mode == Rw::WriteOnly {
            return Err(Error::ModuleParamWriteonly(var.label().into()));
        }
        data.module_vars[var as usize]
            .cells
            .get(offset)
            .map(|c| c.value)
            .ok_or_else(|| Error::ModuleInvalidVar(format!("{}[{offset}]", var.label())))
    }

    /// Write a module variable word into the host cache, marking it dirty.
    /// `SynchWait` writes also update the backplane's sync-wait set.
    ///
    /// # Errors
    ///
    /// Enforces the descriptor's enable and write policy.
    pub fn write_var(&self, var: ModuleVar, offset: usize, value: u32) -> Result<()> {
        if var == ModuleVar::SynchWait {
            self.backplane.sync_wait(self.number, value)?;
        }
        let mut data = self.data.lock().expect("module data lock poisoned");
        let desc = &data.module_descs[var as usize];
        if !desc.enabled {
            return Err(Error::ModuleParamDisabled(var.label().into()));
        }
        if desc.mode == Rw::ReadOnly {
            return Err(Error::ModuleParamReadonly(var.label().into()));
        }
        let cell = data.module_vars[var as usize]
            .cells
            .get_mut(offset)
            .ok_or_else(|| Error::ModuleInvalidVar(format!("{}[{offset}]", var.label())))?;
        cell.value = value;
        cell.dirty = true;
        Ok(())
    }

    /// Read a channel variable word from the host cache.
    ///
    /// # Errors
    ///
    /// Enforces channel range and the descriptor's enable and read policy.
    pub fn read_chan_var(&self, var: ChannelVar, channel: usize, offset: usize) -> Result<u32> {
        self.check_channel(channel)?;
        let data = self.data.lock().expect("module data lock poisoned");
        let desc = &data.channel_descs[var as usize];
        if !desc.enabled {
            return Err(Error::ChannelParamDisabled(var.label().into()));
        }
        if desc.mode == Rw::WriteOnly {
            return Err(Error::ChannelParamWriteonly(var.label().into()));
        }
        data.channel_vars[channel][var as usize]
            .cells
            .get(offset)
            .map(|c| c.value)
            .ok_or_else(|| Error::ChannelInvalidIndex(format!("{}[{offset}]", var.label())))
    }

    /// Write a channel variable word into the host cache, marking it dirty.
    ///
    /// # Errors
    ///
    /// Enforces channel range and the descriptor's enable and write policy.
    pub fn write_chan_var(
        &self,
        var: ChannelVar,
        channel: usize,
        offset: usize,
        value: u32,
    ) -> Result<()> {
        self.check_channel(channel)?;
        let mut data = self.data.lock().expect("module data lock poisoned");
        let desc = &data.channel_descs[var as usize];
        if !desc.enabled {
            return Err(Error::ChannelParamDisabled(var.label().into()));
        }
        if desc.mode == Rw::ReadOnly {
            return Err(Error::ChannelParamReadonly(var.label().into()));
        }
        let cell = data.channel_vars[channel][var as usize]
            .cells
            .get_mut(offset)
            .ok_or_else(|| Error::ChannelInvalidIndex(format!("{}[{offset}]", var.label())))?;
        cell.value = value;
        cell.dirty = true;
        Ok(())
    }

    /// Flush every dirty cell to the DSP. Multi-word variables transfer as
    /// one block so the module never sees a torn variable.
    ///
    /// # Errors
    ///
    /// Propagates DMA failures; dirty flags stay set on the failed cells so
    /// a later flush re-synchronises.
    pub fn sync_vars(&self) -> Result<()> {
        let _guard = self.bus_guard();
        let mut data = self.data.lock().expect("module data lock poisoned");
        let map = data
            .map
            .clone()
            .ok_or_else(|| Error::CrateNotReady(format!("module {}: not probed", self.number)))?;
        let mut writes = 0usize;

        let module_descs = data.module_descs.clone();
        for desc in module_descs.iter().filter(|d| d.enabled && d.mode != Rw::ReadOnly) {
            let variable = &mut data.module_vars[desc.var as usize];
            if variable.cells.iter().any(|c| c.dirty) {
                let words: Vec<u32> = variable.cells.iter().map(|c| c.value).collect();
                self.bus.block_write(desc.address, &words)?;
                variable.cells.iter_mut().for_each(|c| c.dirty = false);
                writes += 1;
            }
        }
        let channel_descs = data.channel_descs.clone();
        for channel in 0..data.channel_vars.len() {
            for desc in channel_descs.iter().filter(|d| d.enabled && d.mode != Rw::ReadOnly) {
                let variable = &mut data.channel_vars[channel][desc.var as usize];
                if variable.cells.iter().any(|c| c.dirty) {
                    let words: Vec<u32> = variable.cells.iter().map(|c| c.value).collect();
                    self.bus.block_write(map.channel_cell(desc, channel), &words)?;
                    variable.cells.iter_mut().for_each(|c| c.dirty = false);
                    writes += 1;
                }
            }
        }
        debug!("module {}: sync_vars: {writes} variables flushed", self.number);
        Ok(())
    }

    /// Apply parameter-derived hardware state: reprogram the FiPPI filter
    /// registers and set the DACs.
    ///
    /// # Errors
    ///
    /// Propagates control task failures.
    pub fn sync_hw(&self) -> Result<()> {
        self.control_task(ControlTask::ProgramFippi)?;
        self.control_task(ControlTask::SetDacs)
    }

    /// Flush the cache and re-apply hardware state; used after a config
    /// import replaces the cache wholesale.
    ///
    /// # Errors
    ///
    /// Propagates flush and control task failures.
    pub fn initialize_afe(&self) -> Result<()> {
        self.sync_vars()?;
        self.sync_hw()
    }

    /// Count of dirty cells across the whole cache.
    #[must_use]
    pub fn dirty_cells(&self) -> usize {
        let data = self.data.lock().expect("module data lock poisoned");
        let module = data
            .module_vars
            .iter()
            .flat_map(|v| &v.cells)
            .filter(|c| c.dirty)
            .count();
        let chans: usize = data
            .channel_vars
            .iter()
            .flatten()
            .flat_map(|v| &v.cells)
            .filter(|c| c.dirty)
            .count();
        module + chans
    }

    fn mark_all_dirty(&self) {
        let mut data = self.data.lock().expect("module data lock poisoned");
        let writable: Vec<usize> = data
            .module_descs
            .iter()
            .filter(|d| d.enabled && d.mode != Rw::ReadOnly)
            .map(|d| d.var as usize)
            .collect();
        for idx in writable {
            data.module_vars[idx].cells.iter_mut().for_each(|c| c.dirty = true);
        }
        let writable: Vec<usize> = data
            .channel_descs
            .iter()
            .filter(|d| d.enabled && d.mode != Rw::ReadOnly)
            .map(|d| d.var as usize)
            .collect();
        for channel in 0..data.channel_vars.len() {
            for &idx in &writable {
                data.channel_vars[channel][idx].cells.iter_mut().for_each(|c| c.dirty = true);
            }
        }
    }

    /// Seed the cache with workable power-on defaults after a probe.
    fn initialize_defaults(&self) -> Result<()> {
        use ChannelVar as C;
        use ModuleVar as M;
        self.write_var(M::ModNum, 0, self.number as u32)?;
        self.write_var(M::SlotID, 0, self.slot as u32)?;
        self.write_var(M::ModID, 0, self.number as u32)?;
        self.write_var(M::SlowFilterRange, 0, 2)?;
        self.write_var(M::FastFilterRange, 0, 0)?;
        self.write_var(M::Resume, 0, RunMode::New.code())?;
        for ch in 0..self.num_channels() {
            self.write_chan_var(C::FastLength, ch, 0, 10)?;
            self.write_chan_var(C::FastGap, ch, 0, 2)?;
            self.write_chan_var(C::SlowLength, ch, 0, 16)?;
            self.write_chan_var(C::SlowGap, ch, 0, 8)?;
            self.write_chan_var(C::PeakSample, ch, 0, 12)?;
            self.write_chan_var(C::PeakSep, ch, 0, 24)?;
            self.write_chan_var(C::FastThresh, ch, 0, 1000)?;
            self.write_chan_var(C::OffsetDAC, ch, 0, hw::dsp::DAC_FULL_SCALE / 2)?;
            self.write_chan_var(C::BaselinePercent, ch, 0, 10)?;
            self.write_chan_var(C::TraceLength, ch, 0, 500)?;
            self.write_chan_var(C::Xwait, ch, 0, 8)?;
            self.write_chan_var(C::Log2Ebin, ch, 0, 2)?;
            self.write_chan_var(C::Log2Bweight, ch, 0, 2)?;
            self.write_chan_var(C::PreampTau, ch, 0, 50.0f32.to_bits())?;
        }
        Ok(())
    }

    // ── Parameter access ─────────────────────────────────────────────────

    /// Read a module parameter.
    ///
    /// # Errors
    ///
    /// Propagates variable policy failures.
    pub fn read_param(&self, par: ModuleParam) -> Result<u32> {
        self.check_online()?;
        let (var, offset) = param::map_module_param(par);
        self.read_var(var, offset)
    }

    /// Write a module parameter into the host cache.
    ///
    /// # Errors
    ///
    /// Propagates variable policy failures; `SYNCH_WAIT` additionally
    /// validates against the backplane.
    pub fn write_param(&self, par: ModuleParam, value: u32) -> Result<()> {
        self.check_online()?;
        let (var, offset) = param::map_module_param(par);
        self.write_var(var, offset, value)
    }

    /// Read a channel parameter, converting from the backing variables.
    ///
    /// # Errors
    ///
    /// Propagates channel range and variable policy failures.
    pub fn read_chan_param(&self, par: ChannelParam, channel: usize) -> Result<f64> {
        self.check_online()?;
        self.convert_read(par, channel)
    }

    /// Write a channel parameter, converting to the backing variables in
    /// the host cache.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` when the value is outside the parameter's
    /// range, plus channel range and variable policy failures.
    pub fn write_chan_param(&self, par: ChannelParam, channel: usize, value: f64) -> Result<()> {
        self.check_online()?;
        self.convert_write(par, channel, value)
    }

    fn adc_msps(&self) -> f64 {
        f64::from(self.info.get().map_or(250, |i| i.adc_msps))
    }

    fn filter_factor(&self, var: ModuleVar) -> Result<f64> {
        let range = self.read_var(var, 0)?;
        Ok(f64::from(1u32 << range.min(15)))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn convert_write(&self, par: ChannelParam, channel: usize, value: f64) -> Result<()> {
        use ChannelParam as P;
        use ChannelVar as V;
        if !value.is_finite() {
            return Err(Error::InvalidValue(format!("{}: {value}", par.label())));
        }
        let msps = self.adc_msps();
        let to_u32 = |v: f64, what: &str| -> Result<u32> {
            if v < 0.0 || v > f64::from(u32::MAX) {
                return Err(Error::InvalidValue(format!("{what}: {v} out of range")));
            }
            Ok(v.round() as u32)
        };
        match par {
            P::TriggerRisetime | P::TriggerFlattop => {
                let ffr = self.filter_factor(ModuleVar::FastFilterRange)?;
                let samples = to_u32(value * msps / ffr, par.label())?;
                let var = if par == P::TriggerRisetime { V::FastLength } else { V::FastGap };
                self.write_chan_var(var, channel, 0, samples)
            }
            P::EnergyRisetime | P::EnergyFlattop => {
                let sfr = self.filter_factor(ModuleVar::SlowFilterRange)?;
                let samples = to_u32(value * msps / sfr, par.label())?;
                let var = if par == P::EnergyRisetime { V::SlowLength } else { V::SlowGap };
                self.write_chan_var(var, channel, 0, samples)
            }
            P::TriggerThreshold => {
                let fast_length = f64::from(self.read_chan_var(V::FastLength, channel, 0)?);
                let thresh = to_u32(value * fast_length, par.label())?;
                self.write_chan_var(V::FastThresh, channel, 0, thresh)
            }
            P::Tau => self.write_chan_var(V::PreampTau, channel, 0, (value as f32).to_bits()),
            P::TraceLength => {
                let samples =
                    to_u32(value * msps, par.label())?.min(hw::dsp::MAX_ADC_TRACE_LENGTH as u32);
                self.write_chan_var(V::TraceLength, channel, 0, samples)
            }
            P::TraceDelay => {
                let ffr = self.filter_factor(ModuleVar::FastFilterRange)?;
                let delay = to_u32(value * msps / ffr, par.label())?;
                let trace = self.read_chan_var(V::TraceLength, channel, 0)?;
                self.write_chan_var(V::TriggerDelay, channel, 0, delay)?;
                self.write_chan_var(V::PAFlength, channel, 0, delay + trace / 2)
            }
            P::Voffset => {
                if value.abs() > hw::dsp::DAC_VOLTAGE_RANGE / 2.0 {
                    return Err(Error::InvalidValue(format!("VOFFSET: {value} V out of range")));
                }
                let dac = ((value / hw::dsp::DAC_VOLTAGE_RANGE + 0.5)
                    * f64::from(hw::dsp::DAC_FULL_SCALE)) as u32;
                self.write_chan_var(V::OffsetDAC, channel, 0, dac)
            }
            P::Xdt => {
                let samples = to_u32(value * msps, par.label())?.max(4);
                self.write_chan_var(V::Xwait, channel, 0, samples)
            }
            P::BaselinePercent => {
                if !(0.0..=100.0).contains(&value) {
                    return Err(Error::InvalidValue(format!("BASELINE_PERCENT: {value}")));
                }
                self.write_chan_var(V::BaselinePercent, channel, 0, value as u32)
            }
            P::Emin => self.write_chan_var(V::EnergyLow, channel, 0, to_u32(value, "EMIN")?),
            P::BinFactor => {
                let factor = to_u32(value, "BINFACTOR")?;
                if !(1..=16).contains(&factor) {
                    return Err(Error::InvalidValue(format!("BINFACTOR: {value}")));
                }
                self.write_chan_var(V::Log2Ebin, channel, 0, factor)
            }
            P::BaselineAverage => {
                let avg = to_u32(value, "BASELINE_AVERAGE")?;
                if avg > 16 {
                    return Err(Error::InvalidValue(format!("BASELINE_AVERAGE: {value}")));
                }
                self.write_chan_var(V::Log2Bweight, channel, 0, avg)
            }
            P::ChannelCsra => {
                self.write_chan_var(V::ChanCSRa, channel, 0, to_u32(value, "CHANNEL_CSRA")?)
            }
            P::ChannelCsrb => {
                self.write_chan_var(V::ChanCSRb, channel, 0, to_u32(value, "CHANNEL_CSRB")?)
            }
            P::BlCut => self.write_chan_var(V::BLcut, channel, 0, to_u32(value, "BLCUT")?),
            P::Integrator => {
                self.write_chan_var(V::Integrator, channel, 0, to_u32(value, "INTEGRATOR")?)
            }
            P::CfdScale => {
                let scale = to_u32(value, "CFDScale")?;
                if scale > 7 {
                    return Err(Error::InvalidValue(format!("CFDScale: {value}")));
                }
                self.write_chan_var(V::CFDScale, channel, 0, scale)
            }
            P::CfdThresh => {
                self.write_chan_var(V::CFDThresh, channel, 0, to_u32(value, "CFDThresh")?)
            }
            P::CfdDelay => {
                let samples = to_u32(value * msps, "CFDDelay")?;
                self.write_chan_var(V::CFDDelay, channel, 0, samples)
            }
            P::MultiplicityMaskL => {
                self.write_chan_var(V::MultiplicityMaskL, channel, 0, value as u32)
            }
            P::MultiplicityMaskH => {
                self.write_chan_var(V::MultiplicityMaskH, channel, 0, value as u32)
            }
            P::FastTrigBackLen
            | P::ExtTrigStretch
            | P::VetoStretch
            | P::ChanTrigStretch
            | P::ExternDelayLen
            | P::FtrigoutDelay => {
                let samples = to_u32(value * msps, par.label())?;
                let var = match par {
                    P::FastTrigBackLen => V::FastTrigBackLen,
                    P::ExtTrigStretch => V::ExtTrigStretch,
                    P::VetoStretch => V::VetoStretch,
                    P::ChanTrigStretch => V::ChanTrigStretch,
                    P::ExternDelayLen => V::ExternDelayLen,
                    _ => V::FtrigoutDelay,
                };
                self.write_chan_var(var, channel, 0, samples)
            }
            P::QdcLen0 | P::QdcLen1 | P::QdcLen2 | P::QdcLen3 | P::QdcLen4 | P::QdcLen5
            | P::QdcLen6 | P::QdcLen7 => {
                let samples = to_u32(value * msps, par.label())?;
                let var = match par {
                    P::QdcLen0 => V::QDCLen0,
                    P::QdcLen1 => V::QDCLen1,
                    P::QdcLen2 => V::QDCLen2,
                    P::QdcLen3 => V::QDCLen3,
                    P::QdcLen4 => V::QDCLen4,
                    P::QdcLen5 => V::QDCLen5,
                    P::QdcLen6 => V::QDCLen6,
                    _ => V::QDCLen7,
                };
                self.write_chan_var(var, channel, 0, samples)
            }
        }
    }

    fn convert_read(&self, par: ChannelParam, channel: usize) -> Result<f64> {
        use ChannelParam as P;
        use ChannelVar as V;
        let msps = self.adc_msps();
        match par {
            P::TriggerRisetime | P::TriggerFlattop => {
                let ffr = self.filter_factor(ModuleVar::FastFilterRange)?;
                let var = if par == P::TriggerRisetime { V::FastLength } else { V::FastGap };
                Ok(f64::from(self.read_chan_var(var, channel, 0)?) * ffr / msps)
            }
            P::EnergyRisetime | P::EnergyFlattop => {
                let sfr = self.filter_factor(ModuleVar::SlowFilterRange)?;
                let var = if par == P::EnergyRisetime { V::SlowLength } else { V::SlowGap };
                Ok(f64::from(self.read_chan_var(var, channel, 0)?) * sfr / msps)
            }
            P::TriggerThreshold => {
                let fast_length = f64::from(self.read_chan_var(V::FastLength, channel, 0)?);
                let thresh = f64::from(self.read_chan_var(V::FastThresh, channel, 0)?);
                Ok(if fast_length > 0.0 { thresh / fast_length } else { 0.0 })
            }
            P::Tau => Ok(f64::from(f32::from_bits(
                self.read_chan_var(V::PreampTau, channel, 0)?,
            ))),
            P::TraceLength => {
                Ok(f64::from(self.read_chan_var(V::TraceLength, channel, 0)?) / msps)
            }
            P::TraceDelay => {
                let ffr = self.filter_factor(ModuleVar::FastFilterRange)?;
                Ok(f64::from(self.read_chan_var(V::TriggerDelay, channel, 0)?) * ffr / msps)
            }
            P::Voffset => {
                let dac = f64::from(self.read_chan_var(V::OffsetDAC, channel, 0)?);
                Ok((dac / f64::from(hw::dsp::DAC_FULL_SCALE) - 0.5) * hw::dsp::DAC_VOLTAGE_RANGE)
            }
            P::Xdt => Ok(f64::from(self.read_chan_var(V::Xwait, channel, 0)?) / msps),
            P::BaselinePercent => {
                Ok(f64::from(self.read_chan_var(V::BaselinePercent, channel, 0)?))
            }
            P::Emin => Ok(f64::from(self.read_chan_var(V::EnergyLow, channel, 0)?)),
            P::BinFactor => Ok(f64::from(self.read_chan_var(V::Log2Ebin, channel, 0)?)),
            P::BaselineAverage => Ok(f64::from(self.read_chan_var(V::Log2Bweight, channel, 0)?)),
            P::ChannelCsra => Ok(f64::from(self.read_chan_var(V::ChanCSRa, channel, 0)?)),
            P::ChannelCsrb => Ok(f64::from(self.read_chan_var(V::ChanCSRb, channel, 0)?)),
            P::BlCut => Ok(f64::from(self.read_chan_var(V::BLcut, channel, 0)?)),
            P::Integrator => Ok(f64::from(self.read_chan_var(V::Integrator, channel, 0)?)),
            P::CfdScale => Ok(f64::from(self.read_chan_var(V::CFDScale, channel, 0)?)),
            P::CfdThresh => Ok(f64::from(self.read_chan_var(V::CFDThresh, channel, 0)?)),
            P::CfdDelay => Ok(f64::from(self.read_chan_var(V::CFDDelay, channel, 0)?) / msps),
            P::MultiplicityMaskL => {
                Ok(f64::from(self.read_chan_var(V::MultiplicityMaskL, channel, 0)?))
            }
            P::MultiplicityMaskH => {
                Ok(f64::from(self.read_chan_var(V::MultiplicityMaskH, channel, 0)?))
            }
            P::FastTrigBackLen
            | P::ExtTrigStretch
            | P::VetoStretch
            | P::ChanTrigStretch
            | P::ExternDelayLen
            | P::FtrigoutDelay => {
                let var = match par {
                    P::FastTrigBackLen => V::FastTrigBackLen,
                    P::ExtTrigStretch => V::ExtTrigStretch,
                    P::VetoStretch => V::VetoStretch,
                    P::ChanTrigStretch => V::ChanTrigStretch,
                    P::ExternDelayLen => V::ExternDelayLen,
                    _ => V::FtrigoutDelay,
                };
                Ok(f64::from(self.read_chan_var(var, channel, 0)?) / msps)
            }
            P::QdcLen0 | P::QdcLen1 | P::QdcLen2 | P::QdcLen3 | P::QdcLen4 | P::QdcLen5
            | P::QdcLen6 | P::QdcLen7 => {
                let var = match par {
                    P::QdcLen0 => V::QDCLen0,
                    P::QdcLen1 => V::QDCLen1,
                    P::QdcLen2 => V::QDCLen2,
                    P::QdcLen3 => V::QDCLen3,
                    P::QdcLen4 => V::QDCLen4,
                    P::QdcLen5 => V::QDCLen5,
                    P::QdcLen6 => V::QDCLen6,
                    _ => V::QDCLen7,
                };
                Ok(f64::from(self.read_chan_var(var, channel, 0)?) / msps)
            }
        }
    }

    // ── Control tasks and acquisition ────────────────────────────────────

    /// Run a DSP control task to completion.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidOperation` if a data run is active and
    /// `ModuleTaskTimeout` if the DSP never completes.
    pub fn control_task(&self, task: ControlTask) -> Result<()> {
        self.check_online()?;
        if self.run_active() {
            return Err(Error::ModuleInvalidOperation(format!(
                "module {}: control task during active run",
                self.number
            )));
        }
        let _guard = self.bus_guard();
        self.flush_var(ModuleVar::RunTask, 0)?;
        self.flush_var(ModuleVar::ControlTask, task.code())?;
        let current = self.bus.read_word(regs::CSR)?;
        self.bus.write_word(regs::CSR, current | csr::RUN_ENABLE)?;

        let deadline = Instant::now() + TASK_TIMEOUT;
        loop {
            let status = self.bus.read_word(regs::CSR)?;
            if status & csr::RUN_ACTIVE == 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::ModuleTaskTimeout(format!(
                    "module {}: control task {:?}",
                    self.number, task
                )));
            }
            std::thread::sleep(TASK_POLL);
        }
        self.bus.write_word(regs::CSR, current & !csr::RUN_ENABLE)?;
        Ok(())
    }

    /// Write a module variable straight through to the DSP and the cache.
    fn flush_var(&self, var: ModuleVar, value: u32) -> Result<()> {
        let address = {
            let mut data = self.data.lock().expect("module data lock poisoned");
            let desc = &data.module_descs[var as usize];
            let address = desc.address;
            let cell = &mut data.module_vars[var as usize].cells[0];
            cell.value = value;
            cell.dirty = false;
            address
        };
        self.bus.block_write(address, &[value])
    }

    /// Iteratively set each channel's offset DAC so its baseline sits at
    /// the configured percentage of the ADC range.
    ///
    /// # Errors
    ///
    /// Returns `ModuleTaskTimeout` if a channel does not converge within
    /// the iteration budget.
    pub fn adjust_offsets(&self) -> Result<()> {
        self.check_online()?;
        let adc_bits = self.device_info()?.adc_bits;
        let adc_max = f64::from((1u32 << adc_bits) - 1);
        let tolerance = adc_max / 1024.0;

        for channel in 0..self.num_channels() {
            let percent = f64::from(self.read_chan_var(ChannelVar::BaselinePercent, channel, 0)?);
            let target = adc_max * percent / 100.0;
            let mut lo = 0u32;
            let mut hi = hw::dsp::DAC_FULL_SCALE;
            let mut converged = false;
            for _ in 0..OFFSET_ITERATIONS {
                let dac = lo + (hi - lo) / 2;
                self.write_chan_var(ChannelVar::OffsetDAC, channel, 0, dac)?;
                self.sync_vars()?;
                self.control_task(ControlTask::SetDacs)?;
                self.control_task(ControlTask::GetBaselines)?;
                let baseline = self.first_baseline(channel)?;
                if (baseline - target).abs() <= tolerance {
                    converged = true;
                    break;
                }
                // The baseline falls as the DAC rises.
                if baseline > target {
                    lo = dac;
                } else {
                    hi = dac;
                }
            }
            if !converged {
                return Err(Error::ModuleTaskTimeout(format!(
                    "module {}: adjust offsets: channel {channel} did not converge",
                    self.number
                )));
            }
            debug!("module {}: adjust offsets: channel {channel} converged", self.number);
        }
        Ok(())
    }

    fn first_baseline(&self, channel: usize) -> Result<f64> {
        let _guard = self.bus_guard();
        let mut record = vec![0u32; hw::dsp::BASELINE_RECORD_WORDS];
        self.bus.block_read(hw::dsp::IO_BUFFER_ADDRESS, &mut record)?;
        Ok(f64::from(record[2 + channel]))
    }

    /// Capture ADC traces for all channels into the DSP IO buffer.
    ///
    /// # Errors
    ///
    /// Propagates control task failures.
    pub fn get_traces(&self) -> Result<()> {
        self.control_task(ControlTask::GetTraces)
    }

    /// Read the captured ADC trace for one channel. With `resume` the
    /// previous capture is re-read without triggering a new one.
    ///
    /// # Errors
    ///
    /// Propagates channel range and DMA failures.
    pub fn read_adc(&self, channel: usize, out: &mut [u32], resume: bool) -> Result<()> {
        self.check_channel(channel)?;
        if out.len() > hw::dsp::MAX_ADC_TRACE_LENGTH {
            return Err(Error::InvalidValue(format!(
                "adc trace: {} words exceeds {}",
                out.len(),
                hw::dsp::MAX_ADC_TRACE_LENGTH
            )));
        }
        if !resume {
            self.get_traces()?;
        }
        let _guard = self.bus_guard();
        let base =
            hw::dsp::IO_BUFFER_ADDRESS + (channel * hw::dsp::MAX_ADC_TRACE_LENGTH) as u32;
        self.bus.block_read(base, out)
    }

    /// Capture baselines into the DSP IO buffer.
    ///
    /// # Errors
    ///
    /// Propagates control task failures.
    pub fn acquire_baselines(&self) -> Result<()> {
        self.control_task(ControlTask::GetBaselines)
    }

    /// Read captured baselines for the requested channels. Channel 0's
    /// timestamps are canonical for the whole module. With `compute_cut`
    /// each channel's baseline cut variable is refreshed from the sample
    /// spread.
    ///
    /// # Errors
    ///
    /// Propagates channel range and DMA failures.
    pub fn bl_get(&self, channels: &[usize], num: usize, compute_cut: bool) -> Result<Baselines> {
        for &ch in channels {
            self.check_channel(ch)?;
        }
        let num = num.min(hw::dsp::MAX_NUM_BASELINES);
        let mut raw = vec![0u32; num * hw::dsp::BASELINE_RECORD_WORDS];
        {
            let _guard = self.bus_guard();
            self.bus.block_read(hw::dsp::IO_BUFFER_ADDRESS, &mut raw)?;
        }
        let mut baselines = Baselines {
            timestamps: Vec::with_capacity(num),
            values: vec![Vec::with_capacity(num); channels.len()],
        };
        for rec in raw.chunks_exact(hw::dsp::BASELINE_RECORD_WORDS) {
            let ticks = u64::from(rec[1]) << 32 | u64::from(rec[0]);
            baselines.timestamps.push(ticks as f64 * hw::dsp::CLOCK_TICK);
            for (slot, &ch) in channels.iter().enumerate() {
                baselines.values[slot].push(f64::from(rec[2 + ch]));
            }
        }
        if compute_cut {
            for (slot, &ch) in channels.iter().enumerate() {
                let samples = &baselines.values[slot];
                let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
                let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>()
                    / samples.len().max(1) as f64;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let cut = (4.0 * var.sqrt()) as u32;
                self.write_chan_var(ChannelVar::BLcut, ch, 0, cut)?;
            }
        }
        Ok(baselines)
    }

    /// Copy histogram words for one channel out of MCA memory.
    ///
    /// # Errors
    ///
    /// Propagates channel range and DMA failures.
    pub fn read_histogram(&self, channel: usize, out: &mut [u32]) -> Result<()> {
        self.check_channel(channel)?;
        if out.len() > hw::dsp::MAX_HISTOGRAM_LENGTH {
            return Err(Error::InvalidValue(format!(
                "histogram: {} words exceeds {}",
                out.len(),
                hw::dsp::MAX_HISTOGRAM_LENGTH
            )));
        }
        let _guard = self.bus_guard();
        let base = hw::dsp::HISTOGRAM_ADDRESS + (channel * hw::dsp::MAX_HISTOGRAM_LENGTH) as u32;
        self.bus.block_read(base, out)
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Start an MCA histogram run.
    ///
    /// # Errors
    ///
    /// Propagates run start failures.
    pub fn start_histograms(&self, mode: RunMode) -> Result<()> {
        self.start_run(RunTask::Histogram, mode)
    }

    /// Start a list-mode run.
    ///
    /// # Errors
    ///
    /// Propagates run start failures.
    pub fn start_listmode(&self, mode: RunMode) -> Result<()> {
        self.start_run(RunTask::ListMode, mode)
    }

    fn start_run(&self, task: RunTask, mode: RunMode) -> Result<()> {
        self.check_online()?;
        if self.run_active() {
            return Err(Error::ModuleInvalidOperation(format!(
                "module {}: run already active",
                self.number
            )));
        }
        let _guard = self.bus_guard();
        self.flush_var(ModuleVar::Resume, mode.code())?;
        self.flush_var(ModuleVar::ControlTask, 0)?;
        self.flush_var(ModuleVar::RunTask, task.code())?;
        if mode == RunMode::New {
            self.run_stats.lock().expect("run stats lock poisoned").start();
        }
        let current = self.bus.read_word(regs::CSR)?;
        self.bus.write_word(regs::CSR, current | csr::RUN_ENABLE)?;
        self.running.store(true, Ordering::Release);
        info!("module {}: run start: {task:?} {mode:?}", self.number);
        Ok(())
    }

    /// End the active run and fold the DSP's run counters into the host
    /// statistics.
    ///
    /// # Errors
    ///
    /// Returns `ModuleTaskTimeout` if the DSP does not stop.
    pub fn run_end(&self) -> Result<()> {
        self.check_online()?;
        {
            let _guard = self.bus_guard();
            let current = self.bus.read_word(regs::CSR)?;
            self.bus.write_word(regs::CSR, current & !csr::RUN_ENABLE)?;
            let deadline = Instant::now() + TASK_TIMEOUT;
            loop {
                if self.bus.read_word(regs::CSR)? & csr::RUN_ACTIVE == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::ModuleTaskTimeout(format!(
                        "module {}: run end",
                        self.number
                    )));
                }
                std::thread::sleep(TASK_POLL);
            }
        }
        self.running.store(false, Ordering::Release);
        self.refresh_stats()?;
        info!("module {}: run end: {}", self.number, self.stats());
        Ok(())
    }

    /// Pull the DSP's output counters into the statistics snapshot.
    ///
    /// # Errors
    ///
    /// Propagates DMA failures.
    pub fn refresh_stats(&self) -> Result<()> {
        let _guard = self.bus_guard();
        let data = self.data.lock().expect("module data lock poisoned");
        let Some(map) = data.map.clone() else {
            return Ok(());
        };
        let read_module = |var: ModuleVar| -> Result<u32> {
            let mut word = [0u32; 1];
            self.bus.block_read(data.module_descs[var as usize].address, &mut word)?;
            Ok(word[0])
        };
        let read_chan = |var: ChannelVar, ch: usize| -> Result<u32> {
            let mut word = [0u32; 1];
            let desc = &data.channel_descs[var as usize];
            self.bus.block_read(map.channel_cell(desc, ch), &mut word)?;
            Ok(word[0])
        };

        let mut stats = self.run_stats.lock().expect("run stats lock poisoned");
        stats.real_time =
            counter_seconds(read_module(ModuleVar::RealTimeA)?, read_module(ModuleVar::RealTimeB)?);
        for ch in 0..data.channel_vars.len() {
            let chan = &mut stats.chans[ch];
            chan.live_time = counter_seconds(
                read_chan(ChannelVar::LiveTimeA, ch)?,
                read_chan(ChannelVar::LiveTimeB, ch)?,
            );
            chan.fast_peaks = counter_value(
                read_chan(ChannelVar::FastPeaksA, ch)?,
                read_chan(ChannelVar::FastPeaksB, ch)?,
            );
            chan.chan_events = counter_value(
                read_chan(ChannelVar::ChanEventsA, ch)?,
                read_chan(ChannelVar::ChanEventsB, ch)?,
            );
        }
        Ok(())
    }

    /// Statistics snapshot.
    ///
    /// # Panics
    ///
    /// Panics if a thread previously panicked while holding the stats lock.
    #[must_use]
    pub fn stats(&self) -> RunStats {
        self.run_stats.lock().expect("run stats lock poisoned").clone()
    }

    // ── External FIFO ────────────────────────────────────────────────────

    /// Words waiting in the external FIFO, without draining.
    ///
    /// # Errors
    ///
    /// Propagates register failures.
    pub fn read_list_mode_level(&self) -> Result<usize> {
        self.check_online()?;
        let _guard = self.bus_guard();
        Ok(self.bus.read_word(regs::FIFO_LEVEL)? as usize)
    }

    /// Append all available FIFO words to `out`; returns the word count.
    /// An empty FIFO returns 0 without touching the statistics.
    ///
    /// # Errors
    ///
    /// Propagates register and DMA failures.
    pub fn read_list_mode(&self, out: &mut Vec<u32>) -> Result<usize> {
        self.check_online()?;
        let _guard = self.bus_guard();
        let level = self.bus.read_word(regs::FIFO_LEVEL)? as usize;
        if level == 0 {
            return Ok(0);
        }
        let start = out.len();
        out.resize(start + level, 0);
        self.bus.block_read(hw::dsp::EXT_FIFO_ADDRESS, &mut out[start..])?;
        let mut stats = self.run_stats.lock().expect("run stats lock poisoned");
        stats.fifo_in += level;
        stats.fifo_out += level;
        Ok(level)
    }

    // ── Test modes ───────────────────────────────────────────────────────

    /// Start a module test.
    ///
    /// # Errors
    ///
    /// Returns `ModuleTestInvalid` if a test is already running.
    pub fn start_test(&self, mode: TestMode) -> Result<()> {
        self.check_online()?;
        {
            let data = self.data.lock().expect("module data lock poisoned");
            if data.test != TestMode::Off {
                return Err(Error::ModuleTestInvalid(format!(
                    "module {}: test already running",
                    self.number
                )));
            }
        }
        if mode == TestMode::LmFifo {
            self.control_task(ControlTask::FillExtFifo)?;
        }
        self.data.lock().expect("module data lock poisoned").test = mode;
        Ok(())
    }

    /// Stop the running test.
    ///
    /// # Errors
    ///
    /// Propagates control task failures.
    pub fn end_test(&self) -> Result<()> {
        let was = {
            let mut data = self.data.lock().expect("module data lock poisoned");
            std::mem::take(&mut data.test)
        };
        if was == TestMode::LmFifo {
            self.control_task(ControlTask::SetDacs)?;
        }
        Ok(())
    }

    // ── Persisted DSP parameters ─────────────────────────────────────────

    /// Snapshot the full DSP variable space as raw little-endian words.
    ///
    /// # Errors
    ///
    /// Fails before probe and propagates DMA failures.
    pub fn save_dsp_pars(&self) -> Result<Vec<u32>> {
        self.check_online()?;
        let _guard = self.bus_guard();
        let data = self.data.lock().expect("module data lock poisoned");
        let map = data
            .map
            .clone()
            .ok_or_else(|| Error::CrateNotReady(format!("module {}: not probed", self.number)))?;
        let mut words = vec![0u32; map.full.size()];
        self.bus.block_read(map.full.start, &mut words)?;
        Ok(words)
    }

    /// Restore a DSP parameter blob into the host cache (writable cells
    /// only, marked dirty). The blob length must match the address map.
    ///
    /// # Errors
    ///
    /// Returns `FileSizeInvalid` on a length mismatch.
    pub fn load_dsp_pars(&self, words: &[u32]) -> Result<()> {
        self.check_online()?;
        let mut data = self.data.lock().expect("module data lock poisoned");
        let map = data
            .map
            .clone()
            .ok_or_else(|| Error::CrateNotReady(format!("module {}: not probed", self.number)))?;
        if words.len() != map.full.size() {
            return Err(Error::FileSizeInvalid(format!(
                "dsp parameters: {} words, expected {}",
                words.len(),
                map.full.size()
            )));
        }
        let module_descs = data.module_descs.clone();
        for desc in module_descs.iter().filter(|d| d.enabled && d.mode != Rw::ReadOnly) {
            let base = (desc.address - map.full.start) as usize;
            let cells = &mut data.module_vars[desc.var as usize].cells;
            for (i, cell) in cells.iter_mut().enumerate() {
                cell.value = words[base + i];
                cell.dirty = true;
            }
        }
        let channel_descs = data.channel_descs.clone();
        for channel in 0..data.channel_vars.len() {
            for desc in channel_descs.iter().filter(|d| d.enabled && d.mode != Rw::ReadOnly) {
                let base = (map.channel_cell(desc, channel) - map.full.start) as usize;
                let cells = &mut data.channel_vars[channel][desc.var as usize].cells;
                for (i, cell) in cells.iter_mut().enumerate() {
                    cell.value = words[base + i];
                    cell.dirty = true;
                }
            }
        }
        Ok(())
    }

    /// The address map, if probed.
    #[must_use]
    pub fn address_map(&self) -> Option<AddressMap> {
        self.data.lock().expect("module data lock poisoned").map.clone()
    }

    /// The bound firmware set.
    #[must_use]
    pub fn firmware(&self) -> ModuleFirmwares {
        self.data.lock().expect("module data lock poisoned").firmware.clone()
    }

    /// Snapshot of one channel's variable cells.
    #[must_use]
    pub fn channel_variables(&self, channel: usize) -> ChannelVariables {
        self.data.lock().expect("module data lock poisoned").channel_vars[channel].clone()
    }

    /// Replace one channel's variable cells (used by the channel copy
    /// operation).
    pub fn set_channel_variables(&self, channel: usize, vars: ChannelVariables) {
        self.data.lock().expect("module data lock poisoned").channel_vars[channel] = vars;
    }

    /// Snapshot of the module variable cells.
    #[must_use]
    pub fn module_variables(&self) -> ModuleVariables {
        self.data.lock().expect("module data lock poisoned").module_vars.clone()
    }
}

/// Fetch a boot image, reading its file only when no image was injected.
fn boot_image(
    firmware: &ModuleFirmwares,
    device: Device,
    slot: usize,
) -> Result<bytes::Bytes> {
    let fw = firmware::find(firmware, device, slot)?;
    if fw.image().is_none() {
        fw.load()?;
    }
    fw.image()
        .ok_or_else(|| Error::DeviceImageFailure(format!("{device} image missing")))
}
