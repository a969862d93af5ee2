//! Crate configuration.
//!
//! Two on-disk forms deliver the same populated [`Config`]: the JSON array
//! (one object per module) and the legacy fixed-order text format. The two
//! formats are never merged; a load reads exactly one of them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pixie16_hw::pci::{MAX_MODULES, MAX_SLOTS};

use crate::error::{Error, Result};

/// DSP firmware file paths for one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DspConfig {
    /// DSP code image (`.ldr`).
    pub ldr: String,
    /// DSP parameter defaults (`.par`); accepted but unused by the SDK.
    pub par: String,
    /// DSP variable listing (`.var`).
    pub var: String,
}

/// FPGA firmware file paths for one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpgaConfig {
    /// Com (system) FPGA image.
    pub sys: String,
    /// FiPPI FPGA image.
    pub fippi: String,
}

/// Optional firmware identity and front-end geometry override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FwConfig {
    /// Firmware release version.
    pub version: String,
    /// Module revision the firmware targets.
    pub revision: u16,
    /// ADC sampling rate in MSPS.
    pub adc_msps: u32,
    /// ADC resolution in bits.
    pub adc_bits: u32,
}

/// One module's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Physical slot.
    pub slot: usize,
    /// DSP firmware paths.
    pub dsp: DspConfig,
    /// FPGA firmware paths.
    pub fpga: FpgaConfig,
    /// Firmware identity, when the site pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw: Option<FwConfig>,
}

/// The populated crate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    /// Per-module entries, in module-number order.
    pub modules: Vec<ModuleConfig>,
}

impl Config {
    /// Load the JSON form: a top-level array of module objects.
    ///
    /// # Errors
    ///
    /// Returns `ConfigJsonError` for malformed JSON, `ConfigInvalidParam`
    /// for missing fields or a bad module count.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", path.display())))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let config: Config = serde_json::from_value(value)
            .map_err(|e| Error::ConfigInvalidParam(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the legacy text form: whitespace-separated tokens in fixed
    /// order — `num_modules`, `slot[0..n-1]`, `ComFPGA`, `SPFPGA`, `Trig`,
    /// `DSPcode`, `DSPpar`, `DSPvar`. The trigger FPGA path is accepted
    /// and ignored; every module shares the same firmware files.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalidParam` for missing tokens or bad integers.
    pub fn load_legacy(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::FileOpenFailure(format!("{}: {e}", path.display())))?;
        let mut tokens = text.split_whitespace();
        let mut next = |what: &str| {
            tokens
                .next()
                .ok_or_else(|| Error::ConfigInvalidParam(format!("legacy config: missing {what}")))
        };

        let num_modules: usize = next("num_modules")?
            .parse()
            .map_err(|e| Error::ConfigInvalidParam(format!("legacy config: num_modules: {e}")))?;
        let mut slots = Vec::with_capacity(num_modules);
        for i in 0..num_modules {
            let slot: usize = next("slot")?.parse().map_err(|e| {
                Error::ConfigInvalidParam(format!("legacy config: slot[{i}]: {e}"))
            })?;
            slots.push(slot);
        }
        let com_fpga = next("ComFPGA")?.to_string();
        let sp_fpga = next("SPFPGA")?.to_string();
        let _trig = next("Trig")?;
        let dsp_code = next("DSPcode")?.to_string();
        let dsp_par = next("DSPpar")?.to_string();
        let dsp_var = next("DSPvar")?.to_string();

        let modules = slots
            .into_iter()
            .map(|slot| ModuleConfig {
                slot,
                dsp: DspConfig {
                    ldr: dsp_code.clone(),
                    par: dsp_par.clone(),
                    var: dsp_var.clone(),
                },
                fpga: FpgaConfig { sys: com_fpga.clone(), fippi: sp_fpga.clone() },
                fw: None,
            })
            .collect();
        let config = Self { modules };
        config.validate()?;
        Ok(config)
    }

    /// Persist the JSON form.
    ///
    /// # Errors
    ///
    /// Returns `FileCreateFailure` if the file cannot be written.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))
    }

    /// Configured module count.
    #[must_use]
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    fn validate(&self) -> Result<()> {
        if self.modules.is_empty() || self.modules.len() > MAX_MODULES {
            return Err(Error::ConfigInvalidParam(format!(
                "module count {} outside 1..={MAX_MODULES}",
                self.modules.len()
            )));
        }
        let mut seen = Vec::with_capacity(self.modules.len());
        for m in &self.modules {
            if m.slot == 0 || m.slot > MAX_SLOTS {
                return Err(Error::ConfigInvalidParam(format!(
                    "slot {} outside 1..={MAX_SLOTS}",
                    m.slot
                )));
            }
            if seen.contains(&m.slot) {
                return Err(Error::ConfigInvalidParam(format!("slot {} repeated", m.slot)));
            }
            seen.push(m.slot);
        }
        Ok(())
    }
}

/// One module's persisted parameter state: variable label → cached words.
/// Maps are ordered so exports round-trip byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleParams {
    /// Physical slot the state belongs to.
    pub slot: usize,
    /// Module variable cells.
    pub module: BTreeMap<String, Vec<u32>>,
    /// Channel variable cells, one map per channel.
    pub channels: Vec<BTreeMap<String, Vec<u32>>>,
}

/// The persisted parameter state of the whole crate.
pub type CrateParams = Vec<ModuleParams>;

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, text: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn json_round_trip() {
        let text = r#"[{"slot":2,
            "dsp":{"ldr":"dsp.ldr","par":"dsp.par","var":"dsp.var"},
            "fpga":{"sys":"sys.bin","fippi":"fippi.bin"},
            "fw":{"version":"33.100","revision":15,"adc_msps":250,"adc_bits":14}}]"#;
        let path = write_temp("pixie16-config-rt.json", text);
        let config = Config::load_json(&path).unwrap();
        assert_eq!(config.num_modules(), 1);
        assert_eq!(config.modules[0].slot, 2);
        assert_eq!(config.modules[0].fw.as_ref().unwrap().revision, 15);

        let out = std::env::temp_dir().join("pixie16-config-rt-out.json");
        config.save_json(&out).unwrap();
        let again = Config::load_json(&out).unwrap();
        assert_eq!(again.modules[0].dsp.var, "dsp.var");
    }

    #[test]
    fn json_missing_field_fails_invalid_param() {
        let text = r#"[{"slot":2,"fpga":{"sys":"s","fippi":"f"}}]"#;
        let path = write_temp("pixie16-config-missing.json", text);
        assert_eq!(Config::load_json(&path).unwrap_err().api_result(), 600);
    }

    #[test]
    fn json_malformed_fails_json_error() {
        let path = write_temp("pixie16-config-bad.json", "[{");
        assert_eq!(Config::load_json(&path).unwrap_err().api_result(), 602);
    }

    #[test]
    fn json_empty_array_fails() {
        let path = write_temp("pixie16-config-empty.json", "[]");
        assert_eq!(Config::load_json(&path).unwrap_err().api_result(), 600);
    }

    #[test]
    fn legacy_fixed_order() {
        let text = "2  2 3  sys.bin fippi.bin trig.bin dsp.ldr dsp.par dsp.var\n";
        let path = write_temp("pixie16-config-legacy.txt", text);
        let config = Config::load_legacy(&path).unwrap();
        assert_eq!(config.num_modules(), 2);
        assert_eq!(config.modules[0].slot, 2);
        assert_eq!(config.modules[1].slot, 3);
        assert_eq!(config.modules[1].fpga.sys, "sys.bin");
        assert_eq!(config.modules[1].dsp.var, "dsp.var");
    }

    #[test]
    fn legacy_missing_token_fails() {
        let path = write_temp("pixie16-config-legacy-short.txt", "1 2 sys.bin");
        assert_eq!(Config::load_legacy(&path).unwrap_err().api_result(), 600);
    }

    #[test]
    fn bad_slot_rejected() {
        let text = "1  0  s f t c p v";
        let path = write_temp("pixie16-config-slot0.txt", text);
        assert!(Config::load_legacy(&path).is_err());
    }
}
