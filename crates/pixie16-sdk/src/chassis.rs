//! The crate facade.
//!
//! [`Crate`] owns the modules, the slot map, the shared firmware registry,
//! the backplane and the buffer pool, and is the single entry and exit
//! point for the whole runtime: construct, `initialize`, `set_firmware`,
//! `probe`/`boot`, operate, drop. The process-wide open-module table lives
//! in the bus driver layer; nothing here is global.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use pixie16_hw::pci;
use tracing::{debug, info};

use crate::backplane::Backplane;
use crate::buffer::Pool;
use crate::bus::{BusDriver, DeviceInfo};
use crate::buses::{MmioBus, SimBus, SimConfig};
use crate::config::{Config, CrateParams, ModuleParams};
use crate::error::{Error, Result};
use crate::firmware::{Device, Firmware, Registry};
use crate::module::Module;
use crate::param::{ChannelVar, ModuleVar, Rw};

/// Default buffer pool geometry: buffers sized to drain a full external
/// FIFO.
const POOL_BUFFERS: usize = 16;

/// A crate of Pixie-16 modules.
#[derive(Debug)]
pub struct Crate {
    config: Config,
    offline: bool,
    modules: Vec<Arc<Module>>,
    /// Crate-level firmware registry.
    pub firmware: Registry,
    backplane: Arc<Backplane>,
    pool: Arc<Pool>,
    initialized: bool,
    ready: bool,
}

impl Crate {
    /// Construct the facade around a populated configuration. Offline
    /// crates put every module behind a [`SimBus`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalidParam` for a bad module count.
    pub fn new(config: Config, offline: bool) -> Result<Self> {
        if config.modules.is_empty() || config.modules.len() > pci::MAX_MODULES {
            return Err(Error::ConfigInvalidParam(format!(
                "module count {} outside 1..={}",
                config.modules.len(),
                pci::MAX_MODULES
            )));
        }
        Ok(Self {
            config,
            offline,
            modules: Vec::new(),
            firmware: Registry::default(),
            backplane: Arc::new(Backplane::default()),
            pool: Pool::new(),
            initialized: false,
            ready: false,
        })
    }

    /// Discover and open the configured modules, create the buffer pool
    /// and register the configured firmware.
    ///
    /// # Errors
    ///
    /// Returns `CrateAlreadyOpen` on a second initialize and
    /// `ModuleTotalInvalid` when discovery disagrees with the
    /// configuration.
    pub fn initialize(&mut self, reg_trace: bool) -> Result<()> {
        if self.initialized {
            return Err(Error::CrateAlreadyOpen("crate already initialized".into()));
        }
        info!(
            "crate: initialize: {} module(s), {}",
            self.config.num_modules(),
            if self.offline { "offline" } else { "online" }
        );

        let module_configs = self.config.modules.clone();
        if self.offline {
            for (number, mcfg) in module_configs.iter().enumerate() {
                let mut sim = SimConfig {
                    pci_slot: mcfg.slot as u32,
                    serial_num: 1000 + number as u32,
                    ..SimConfig::default()
                };
                if let Some(fw) = &mcfg.fw {
                    sim.revision = fw.revision;
                    sim.adc_msps = fw.adc_msps;
                    sim.adc_bits = fw.adc_bits;
                }
                let bus: Arc<dyn BusDriver> = Arc::new(SimBus::with_trace(sim, reg_trace));
                self.open_module(number, mcfg.slot, bus)?;
            }
        } else {
            let found = discover_pci()?;
            if found.len() != self.config.num_modules() {
                return Err(Error::ModuleTotalInvalid(format!(
                    "found {} of {}",
                    found.len(),
                    self.config.num_modules()
                )));
            }
            for (number, (addr, mcfg)) in found.iter().zip(module_configs.iter()).enumerate() {
                let info = device_info_for(addr, mcfg.fw.as_ref());
                let bus: Arc<dyn BusDriver> =
                    Arc::new(MmioBus::open(addr, info, reg_trace)?);
                self.open_module(number, mcfg.slot, bus)?;
            }
        }

        self.pool.create(POOL_BUFFERS, pixie16_hw::dsp::EXT_FIFO_LENGTH)?;
        self.register_config_firmware()?;
        self.initialized = true;
        Ok(())
    }

    fn open_module(&mut self, number: usize, slot: usize, bus: Arc<dyn BusDriver>) -> Result<()> {
        let module = Arc::new(Module::new(number, slot, bus, self.backplane.clone()));
        module.open()?;
        self.modules.push(module);
        Ok(())
    }

    /// Register the firmware files named by the configuration, keyed by
    /// each module's revision. Offline crates get synthetic images so no
    /// firmware files are touched.
    fn register_config_firmware(&mut self) -> Result<()> {
        for (module, mcfg) in self.modules.iter().zip(&self.config.modules) {
            let revision = module.device_info()?.revision;
            let version = mcfg.fw.as_ref().map_or("config", |f| f.version.as_str()).to_string();
            let entries = [
                (Device::Sys, &mcfg.fpga.sys),
                (Device::Fippi, &mcfg.fpga.fippi),
                (Device::Dsp, &mcfg.dsp.ldr),
                (Device::Var, &mcfg.dsp.var),
            ];
            for (device, filename) in entries {
                let mut fw = Firmware::new(version.clone(), revision, device);
                fw.filename.clone_from(filename);
                if self.firmware.check(&fw) {
                    continue;
                }
                if self.offline {
                    match device {
                        Device::Var => {
                            fw.set_image(crate::param::default_var_listing().into_bytes());
                        }
                        _ => fw.set_image(vec![0xA5u8; 256]),
                    }
                }
                self.firmware.add(fw)?;
            }
        }
        Ok(())
    }

    /// Apply an explicit module-number → slot mapping, reordering and
    /// renumbering the modules.
    ///
    /// # Errors
    ///
    /// Returns `SlotMapInvalid` unless the map is a bijection onto the
    /// discovered slots, and `CrateNotReady` if modules are already shared
    /// with workers.
    pub fn assign(&mut self, slot_map: &[usize]) -> Result<()> {
        self.check_initialized()?;
        if slot_map.len() != self.modules.len() {
            return Err(Error::SlotMapInvalid(format!(
                "{} entries for {} modules",
                slot_map.len(),
                self.modules.len()
            )));
        }
        let mut reordered = Vec::with_capacity(slot_map.len());
        for &slot in slot_map {
            let found = self
                .modules
                .iter()
                .find(|m| m.slot == slot)
                .ok_or_else(|| Error::SlotMapInvalid(format!("no module in slot {slot}")))?;
            if reordered.iter().any(|m: &Arc<Module>| m.slot == slot) {
                return Err(Error::SlotMapInvalid(format!("slot {slot} repeated")));
            }
            reordered.push(found.clone());
        }
        self.modules.clear();
        for (number, mut module) in reordered.into_iter().enumerate() {
            Arc::get_mut(&mut module)
                .ok_or_else(|| Error::CrateNotReady("modules are in use".into()))?
                .number = number;
            self.modules.push(module);
        }
        debug!("crate: slot map applied: {slot_map:?}");
        Ok(())
    }

    /// Bind each module to its revision's firmware set from the registry.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidFirmware` for a revision with no firmware.
    pub fn set_firmware(&self) -> Result<()> {
        self.check_initialized()?;
        for module in &self.modules {
            let revision = module.device_info()?.revision;
            module.set_firmware(self.firmware.for_revision(revision)?);
        }
        Ok(())
    }

    /// Probe every module: load variable descriptors, compute address
    /// maps, set online.
    ///
    /// # Errors
    ///
    /// Propagates the first module failure.
    pub fn probe(&mut self) -> Result<()> {
        self.check_initialized()?;
        for module in &self.modules {
            module.probe()?;
        }
        self.ready = true;
        Ok(())
    }

    /// Boot every module in order with the given pattern.
    ///
    /// # Errors
    ///
    /// Propagates the first module failure; later modules are not booted.
    pub fn boot(&mut self, pattern: u8) -> Result<()> {
        self.check_initialized()?;
        for module in &self.modules {
            module.boot(pattern)?;
        }
        if pattern != 0 {
            self.ready = true;
        }
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::CrateNotReady("crate not initialized".into()))
        }
    }

    /// Whether probe or boot completed.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Module count.
    #[must_use]
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// All modules in number order.
    #[must_use]
    pub fn modules(&self) -> &[Arc<Module>] {
        &self.modules
    }

    /// One module by number.
    ///
    /// # Errors
    ///
    /// Returns `ModuleNumberInvalid` out of range.
    pub fn module(&self, number: usize) -> Result<Arc<Module>> {
        self.modules.get(number).cloned().ok_or_else(|| {
            Error::ModuleNumberInvalid(format!("{number} of {}", self.modules.len()))
        })
    }

    /// The backplane.
    #[must_use]
    pub fn backplane(&self) -> &Arc<Backplane> {
        &self.backplane
    }

    /// The shared buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Validate the crate-wide sync-wait consensus before a synchronised
    /// run start.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidOperation` on a partial sync-wait set.
    pub fn sync_wait_valid(&self) -> Result<()> {
        self.backplane.sync_wait_valid(self.modules.len())
    }

    // ── Parameter state persistence ──────────────────────────────────────

    /// Export the full writable parameter cache of every module as JSON.
    ///
    /// # Errors
    ///
    /// Propagates file failures.
    pub fn export_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut out: CrateParams = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let mut entry = ModuleParams {
                slot: module.slot,
                module: std::collections::BTreeMap::new(),
                channels: Vec::with_capacity(module.num_channels()),
            };
            for variable in &module.module_variables() {
                if variable.var.mode() != Rw::ReadOnly {
                    entry.module.insert(
                        variable.var.label().to_string(),
                        variable.cells.iter().map(|c| c.value).collect(),
                    );
                }
            }
            for channel in 0..module.num_channels() {
                let mut map = std::collections::BTreeMap::new();
                for variable in &module.channel_variables(channel) {
                    if variable.var.mode() != Rw::ReadOnly {
                        map.insert(
                            variable.var.label().to_string(),
                            variable.cells.iter().map(|c| c.value).collect(),
                        );
                    }
                }
                entry.channels.push(map);
            }
            out.push(entry);
        }
        let text = serde_json::to_string_pretty(&out)?;
        std::fs::write(path, text)
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))?;
        info!("crate: exported parameters to {}", path.display());
        Ok(())
    }

    /// Import a parameter export, set the cells into each module's host
    /// cache and push them to the DSP. Returns the slots restored.
    ///
    /// # Errors
    ///
    /// Returns `ModuleNotFound` for a slot with no module and variable
    /// errors for unknown labels.
    pub fn import_config(&self, path: impl AsRef<Path>) -> Result<Vec<usize>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", path.display())))?;
        let entries: CrateParams = serde_json::from_str(&text)?;
        let mut slots = Vec::with_capacity(entries.len());
        for entry in &entries {
            let module = self
                .modules
                .iter()
                .find(|m| m.slot == entry.slot)
                .ok_or_else(|| Error::ModuleNotFound(format!("slot {}", entry.slot)))?;
            for (label, words) in &entry.module {
                let var = ModuleVar::lookup(label)
                    .ok_or_else(|| Error::ModuleInvalidVar(label.clone()))?;
                for (offset, word) in words.iter().enumerate() {
                    module.write_var(var, offset, *word)?;
                }
            }
            for (channel, map) in entry.channels.iter().enumerate() {
                for (label, words) in map {
                    let var = ChannelVar::lookup(label)
                        .ok_or_else(|| Error::ChannelInvalidVar(label.clone()))?;
                    for (offset, word) in words.iter().enumerate() {
                        module.write_chan_var(var, channel, offset, *word)?;
                    }
                }
            }
            module.initialize_afe()?;
            slots.push(entry.slot);
        }
        info!("crate: imported parameters from {}", path.display());
        Ok(slots)
    }

    /// Persist the DSP parameter blobs of every module, concatenated in
    /// module order.
    ///
    /// # Errors
    ///
    /// Propagates DMA and file failures.
    pub fn save_dsp_pars(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut bytes = Vec::new();
        for module in &self.modules {
            for word in module.save_dsp_pars()? {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        std::fs::write(path, bytes)
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))
    }

    /// Restore DSP parameter blobs saved by [`Crate::save_dsp_pars`] into
    /// the host caches and push them to the DSPs.
    ///
    /// # Errors
    ///
    /// Returns `FileSizeInvalid` when the blob does not match the address
    /// maps.
    pub fn load_dsp_pars(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", path.display())))?;
        if bytes.len() % 4 != 0 {
            return Err(Error::FileSizeInvalid(format!(
                "{}: {} bytes is not word aligned",
                path.display(),
                bytes.len()
            )));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("chunks_exact yields 4 bytes")))
            .collect();
        let mut offset = 0;
        for module in &self.modules {
            let map = module.address_map().ok_or_else(|| {
                Error::CrateNotReady(format!("module {}: not probed", module.number))
            })?;
            let size = map.full.size();
            if offset + size > words.len() {
                return Err(Error::FileSizeInvalid(format!(
                    "{}: short blob for module {}",
                    path.display(),
                    module.number
                )));
            }
            module.load_dsp_pars(&words[offset..offset + size])?;
            module.initialize_afe()?;
            offset += size;
        }
        if offset != words.len() {
            return Err(Error::FileSizeInvalid(format!(
                "{}: {} trailing words",
                path.display(),
                words.len() - offset
            )));
        }
        Ok(())
    }

    /// Human-readable dump of crate, module and channel state.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "crate: modules:{} offline:{} ready:{}",
            self.modules.len(),
            self.offline,
            self.ready
        )?;
        writeln!(out, "firmware revisions: {:?}", self.firmware.revisions())?;
        for module in &self.modules {
            let info = module.device_info();
            match info {
                Ok(info) => writeln!(
                    out,
                    "module: num:{} slot:{} rev:{:X} serial:{} adc:{}bit,{}msps \
                     channels:{} online:{} dirty:{}",
                    module.number,
                    module.slot,
                    info.revision,
                    info.serial_num,
                    info.adc_bits,
                    info.adc_msps,
                    info.num_channels,
                    module.online(),
                    module.dirty_cells(),
                )?,
                Err(_) => writeln!(
                    out,
                    "module: num:{} slot:{} (not open)",
                    module.number, module.slot
                )?,
            }
            for fw in &module.firmware() {
                writeln!(out, "  firmware: {fw}")?;
            }
            if let Some(map) = module.address_map() {
                writeln!(
                    out,
                    "  address map: module_in:0x{:x}..0x{:x} module_out:0x{:x}..0x{:x}",
                    map.module_in.start, map.module_in.end, map.module_out.start, map.module_out.end
                )?;
                writeln!(
                    out,
                    "  channels: base:0x{:x} vars/channel:{} count:{}",
                    map.channels_in.start, map.vars_per_channel, map.num_channels
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for Crate {
    fn drop(&mut self) {
        for module in &self.modules {
            if module.run_active() {
                let _ = module.run_end();
            }
            let _ = module.close();
        }
        self.firmware.clear();
    }
}

/// Scan the PCI bus for Pixie-16 bridge devices, sorted by address.
///
/// # Errors
///
/// Returns `ModuleNotFound` when no device matches.
fn discover_pci() -> Result<Vec<String>> {
    let entries = std::fs::read_dir("/sys/bus/pci/devices")
        .map_err(|e| Error::DeviceHwFailure(format!("cannot read PCI devices: {e}")))?;
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let vendor = read_hex_sysfs(&path.join("vendor"));
        let device = read_hex_sysfs(&path.join("device"));
        if vendor == Some(pci::PLX_VENDOR_ID) && device == Some(pci::PLX_9054_DEVICE_ID) {
            found.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    if found.is_empty() {
        return Err(Error::ModuleNotFound("no Pixie-16 devices on the PCI bus".into()));
    }
    found.sort();
    Ok(found)
}

fn read_hex_sysfs(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16).ok()
}

fn device_info_for(pcie_address: &str, fw: Option<&crate::config::FwConfig>) -> DeviceInfo {
    let mut parts = pcie_address.split([':', '.']);
    let _domain = parts.next();
    let pci_bus = parts.next().and_then(|p| u32::from_str_radix(p, 16).ok()).unwrap_or(0);
    let pci_slot = parts.next().and_then(|p| u32::from_str_radix(p, 16).ok()).unwrap_or(0);
    DeviceInfo {
        pci_bus,
        pci_slot,
        revision: fw.map_or(pci::revision::F, |f| f.revision),
        serial_num: 0,
        adc_bits: fw.map_or(14, |f| f.adc_bits),
        adc_msps: fw.map_or(250, |f| f.adc_msps),
        num_channels: pci::MAX_CHANNELS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DspConfig, FpgaConfig, ModuleConfig};

    fn offline_config(slots: &[usize]) -> Config {
        Config {
            modules: slots
                .iter()
                .map(|&slot| ModuleConfig {
                    slot,
                    dsp: DspConfig {
                        ldr: "dsp.ldr".into(),
                        par: "dsp.par".into(),
                        var: "dsp.var".into(),
                    },
                    fpga: FpgaConfig { sys: "sys.bin".into(), fippi: "fippi.bin".into() },
                    fw: None,
                })
                .collect(),
        }
    }

    fn offline_crate(slots: &[usize]) -> Crate {
        let mut c = Crate::new(offline_config(slots), true).unwrap();
        c.initialize(false).unwrap();
        c.set_firmware().unwrap();
        c
    }

    #[test]
    fn initialize_twice_fails() {
        let mut c = offline_crate(&[2]);
        assert_eq!(c.initialize(false).unwrap_err().api_result(), 100);
    }

    #[test]
    fn empty_config_rejected() {
        let err = Crate::new(Config::default(), true).unwrap_err();
        assert_eq!(err.api_result(), 600);
    }

    #[test]
    fn probe_sets_ready_and_online() {
        let mut c = offline_crate(&[2, 3]);
        assert!(!c.ready());
        c.probe().unwrap();
        assert!(c.ready());
        assert!(c.module(0).unwrap().online());
        assert!(c.module(1).unwrap().online());
        assert_eq!(c.module(2).unwrap_err().api_result(), 200);
    }

    #[test]
    fn assign_reorders_and_renumbers() {
        let mut c = offline_crate(&[2, 3]);
        c.assign(&[3, 2]).unwrap();
        assert_eq!(c.module(0).unwrap().slot, 3);
        assert_eq!(c.module(1).unwrap().slot, 2);
        assert_eq!(c.module(0).unwrap().number, 0);
    }

    #[test]
    fn assign_rejects_bad_maps() {
        let mut c = offline_crate(&[2, 3]);
        assert_eq!(c.assign(&[2]).unwrap_err().api_result(), 801);
        assert_eq!(c.assign(&[2, 2]).unwrap_err().api_result(), 801);
        assert_eq!(c.assign(&[2, 9]).unwrap_err().api_result(), 801);
    }

    #[test]
    fn boot_full_brings_modules_online() {
        let mut c = offline_crate(&[2]);
        c.boot(crate::module::boot_pattern::FULL).unwrap();
        assert!(c.module(0).unwrap().online());
        assert!(c.ready());
    }

    #[test]
    fn boot_pattern_zero_is_noop() {
        let mut c = offline_crate(&[2]);
        c.boot(0).unwrap();
        assert!(!c.module(0).unwrap().online());
        assert!(!c.ready());
    }

    #[test]
    fn report_names_modules() {
        let mut c = offline_crate(&[2]);
        c.probe().unwrap();
        let mut out = Vec::new();
        c.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("module: num:0 slot:2"));
        assert!(text.contains("address map"));
    }
}
