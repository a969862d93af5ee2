//! Firmware registry.
//!
//! A firmware is identified by the triple (version, module revision,
//! device); the filename and image bytes are site-local metadata and do not
//! participate in equality. The registry maps module revisions to ordered
//! firmware sets; lookup prefers a slot-specific entry over a generic one.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Devices a firmware image can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Com (system) FPGA.
    Sys,
    /// FiPPI (signal processing) FPGA.
    Fippi,
    /// DSP code image.
    Dsp,
    /// DSP variable listing.
    Var,
}

impl Device {
    /// Parse the device tag used in firmware spec strings.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "sys" => Some(Self::Sys),
            "fippi" => Some(Self::Fippi),
            "dsp" => Some(Self::Dsp),
            "var" => Some(Self::Var),
            _ => None,
        }
    }

    /// The spec-string tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Sys => "sys",
            Self::Fippi => "fippi",
            Self::Dsp => "dsp",
            Self::Var => "var",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A firmware image. Version, module revision and device are invariant and
/// define identity; the image bytes are loaded lazily and can be dropped
/// after boot.
#[derive(Debug)]
pub struct Firmware {
    /// Firmware release version string.
    pub version: String,
    /// Module revision the image targets.
    pub mod_revision: u16,
    /// Device within the module.
    pub device: Device,
    /// Slots this image is restricted to; empty means generic/default.
    pub slot: Vec<usize>,
    /// Source file.
    pub filename: String,
    /// Image bytes, present after [`Firmware::load`].
    image: Mutex<Option<Bytes>>,
}

/// Shared firmware reference. Modules hold these; the registry owns them.
pub type FirmwareRef = Arc<Firmware>;

/// A module's bound firmware set.
pub type ModuleFirmwares = Vec<FirmwareRef>;

/// Crate-level registry: module revision → firmware set.
#[derive(Debug, Default)]
pub struct Registry {
    firmwares: BTreeMap<u16, ModuleFirmwares>,
}

impl Firmware {
    /// Create a firmware descriptor with no image loaded.
    #[must_use]
    pub fn new(version: impl Into<String>, mod_revision: u16, device: Device) -> Self {
        Self {
            version: version.into(),
            mod_revision,
            device,
            slot: Vec::new(),
            filename: String::new(),
            image: Mutex::new(None),
        }
    }

    /// Read the image file into memory. Loading twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` or `FileReadFailure`.
    pub fn load(&self) -> Result<()> {
        let mut image = self.image.lock().expect("firmware image lock poisoned");
        if image.is_some() {
            return Ok(());
        }
        let path = Path::new(&self.filename);
        if !path.is_file() {
            return Err(Error::FileNotFound(self.filename.clone()));
        }
        let data = fs::read(path)
            .map_err(|e| Error::FileReadFailure(format!("{}: {e}", self.filename)))?;
        debug!("firmware: load: {} ({} bytes)", self.filename, data.len());
        *image = Some(Bytes::from(data));
        Ok(())
    }

    /// Install image bytes directly, bypassing the file system. Offline
    /// crates use this to hand the simulator synthetic images.
    pub fn set_image(&self, data: impl Into<Bytes>) {
        let mut image = self.image.lock().expect("firmware image lock poisoned");
        *image = Some(data.into());
    }

    /// Drop the image bytes; the identity triple remains.
    pub fn clear(&self) {
        let mut image = self.image.lock().expect("firmware image lock poisoned");
        if image.take().is_some() {
            debug!("firmware: clear: {}", self.filename);
        }
    }

    /// The loaded image, if any. Cheap to clone.
    #[must_use]
    pub fn image(&self) -> Option<Bytes> {
        self.image.lock().expect("firmware image lock poisoned").clone()
    }

    /// Image length in 32-bit words (the bus streams words).
    #[must_use]
    pub fn words(&self) -> usize {
        self.image().map_or(0, |i| i.len() / 4)
    }

    fn same_triple(&self, other: &Firmware) -> bool {
        self.version == other.version
            && self.mod_revision == other.mod_revision
            && self.device == other.device
    }
}

impl PartialEq for Firmware {
    fn eq(&self, other: &Self) -> bool {
        self.same_triple(other)
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ver:{} rev:{} dev:{} slots:{:?} file:{}",
            self.version, self.mod_revision, self.device, self.slot, self.filename
        )
    }
}

/// Parse a firmware spec string: `version<d>revision<d>device<d>filename`.
/// A space delimiter treats any whitespace as a separator.
///
/// # Errors
///
/// Returns `ModuleInvalidFirmware` on missing fields, a bad revision
/// integer, or an unknown device tag.
pub fn parse(fw_desc: &str, delimiter: char) -> Result<Firmware> {
    let fields: Vec<&str> = if delimiter == ' ' {
        fw_desc.split_whitespace().collect()
    } else {
        fw_desc.split(delimiter).map(str::trim).collect()
    };
    if fields.len() != 4 {
        return Err(Error::ModuleInvalidFirmware(format!(
            "expected version{delimiter}revision{delimiter}device{delimiter}file: {fw_desc:?}"
        )));
    }
    let mod_revision: u16 = fields[1].parse().map_err(|e| {
        Error::ModuleInvalidFirmware(format!("bad revision {:?}: {e}", fields[1]))
    })?;
    let device = Device::parse(fields[2])
        .ok_or_else(|| Error::ModuleInvalidFirmware(format!("bad device {:?}", fields[2])))?;
    let mut fw = Firmware::new(fields[0], mod_revision, device);
    fw.filename = fields[3].to_string();
    Ok(fw)
}

impl Registry {
    /// Add a firmware. Its triple must not already be registered.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidFirmware` on a duplicate triple.
    pub fn add(&mut self, fw: Firmware) -> Result<()> {
        if self.check(&fw) {
            return Err(Error::ModuleInvalidFirmware(format!("duplicate firmware: {fw}")));
        }
        info!("firmware: add: {fw}");
        self.firmwares.entry(fw.mod_revision).or_default().push(Arc::new(fw));
        Ok(())
    }

    /// Whether a firmware with the same triple is registered.
    #[must_use]
    pub fn check(&self, fw: &Firmware) -> bool {
        self.firmwares
            .get(&fw.mod_revision)
            .is_some_and(|set| set.iter().any(|f| f.same_triple(fw)))
    }

    /// The firmware set for a module revision.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidFirmware` if the revision has no firmware.
    pub fn for_revision(&self, mod_revision: u16) -> Result<ModuleFirmwares> {
        self.firmwares.get(&mod_revision).cloned().ok_or_else(|| {
            Error::ModuleInvalidFirmware(format!("no firmware for revision {mod_revision}"))
        })
    }

    /// Load every registered image.
    ///
    /// # Errors
    ///
    /// Propagates the first file failure.
    pub fn load(&self) -> Result<()> {
        for set in self.firmwares.values() {
            for fw in set {
                fw.load()?;
            }
        }
        Ok(())
    }

    /// Release every registered image.
    pub fn clear(&self) {
        for set in self.firmwares.values() {
            for fw in set {
                fw.clear();
            }
        }
    }

    /// Registered revisions, ascending.
    #[must_use]
    pub fn revisions(&self) -> Vec<u16> {
        self.firmwares.keys().copied().collect()
    }
}

/// Find the firmware for a device within a module's set, preferring an
/// entry listing the module's slot over a generic (no-slot) entry.
///
/// # Errors
///
/// Returns `FileNotFound` if neither a slot-specific nor a default entry
/// exists.
pub fn find(firmwares: &ModuleFirmwares, device: Device, slot: usize) -> Result<FirmwareRef> {
    if let Some(fw) = firmwares
        .iter()
        .find(|f| f.device == device && f.slot.contains(&slot))
    {
        return Ok(fw.clone());
    }
    if let Some(fw) = firmwares
        .iter()
        .find(|f| f.device == device && f.slot.is_empty())
    {
        return Ok(fw.clone());
    }
    Err(Error::FileNotFound(format!("firmware: device {device} for slot {slot}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_colon_delimited() {
        let fw = parse("33.100:15:sys:syspixie16.bin", ':').unwrap();
        assert_eq!(fw.version, "33.100");
        assert_eq!(fw.mod_revision, 15);
        assert_eq!(fw.device, Device::Sys);
        assert_eq!(fw.filename, "syspixie16.bin");
    }

    #[test]
    fn parse_whitespace_delimited() {
        let fw = parse("1.2.3  15 fippi  fippixie16.bin", ' ').unwrap();
        assert_eq!(fw.device, Device::Fippi);
    }

    #[test]
    fn parse_rejects_missing_field() {
        assert!(parse("1.2.3:15:sys", ':').is_err());
    }

    #[test]
    fn parse_rejects_bad_revision() {
        let err = parse("1.2.3:xv:sys:f.bin", ':').unwrap_err();
        assert_eq!(err.api_result(), 207);
    }

    #[test]
    fn parse_rejects_bad_device() {
        assert!(parse("1.2.3:15:nic:f.bin", ':').is_err());
    }

    #[test]
    fn add_then_check_then_duplicate_fails() {
        let mut reg = Registry::default();
        reg.add(parse("1.0:15:sys:a.bin", ':').unwrap()).unwrap();
        assert!(reg.check(&parse("1.0:15:sys:elsewhere.bin", ':').unwrap()));
        let err = reg.add(parse("1.0:15:sys:b.bin", ':').unwrap()).unwrap_err();
        assert_eq!(err.api_result(), 207);
    }

    #[test]
    fn find_prefers_slot_specific() {
        let mut generic = parse("1.0:15:dsp:generic.ldr", ':').unwrap();
        generic.filename = "generic.ldr".into();
        let mut slotted = parse("1.0-s5:15:dsp:slot5.ldr", ':').unwrap();
        slotted.slot = vec![5];
        let set: ModuleFirmwares = vec![Arc::new(generic), Arc::new(slotted)];

        assert_eq!(find(&set, Device::Dsp, 5).unwrap().filename, "slot5.ldr");
        assert_eq!(find(&set, Device::Dsp, 2).unwrap().filename, "generic.ldr");
        assert_eq!(find(&set, Device::Sys, 2).unwrap_err().api_result(), 700);
    }
}
