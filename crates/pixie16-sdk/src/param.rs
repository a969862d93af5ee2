//! Parameter and variable model.
//!
//! Three user-facing namespaces (system, module, channel parameters) map
//! onto two raw DSP namespaces (module and channel variables). The DSP VAR
//! file is authoritative for variable addresses; descriptors whose symbol
//! is absent from the VAR file are disabled rather than failing the load.
//!
//! Channel variables are addressed per channel block: the VAR file carries
//! channel 0's addresses and channel `c`'s cell lives at
//! `address + c * vars_per_channel`.

use std::io::BufRead;

use pixie16_hw as hw;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Variable input/output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    /// Host reads only; the DSP produces the value.
    ReadOnly,
    /// Host writes only.
    WriteOnly,
    /// Host reads and writes.
    ReadWrite,
}

macro_rules! params {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(#[doc = concat!("`", $label, "`")] $variant),+
        }

        impl $name {
            /// All parameters, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The user-facing label.
            #[must_use]
            pub const fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }

            /// Look a parameter up by its label.
            #[must_use]
            pub fn lookup(label: &str) -> Option<Self> {
                match label {
                    $($label => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

macro_rules! variables {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => ($mode:ident, $size:literal)),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(#[doc = concat!("`", stringify!($variant), "`")] $variant),+
        }

        impl $name {
            /// All variables, in DSP memory declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The DSP symbol name.
            #[must_use]
            pub const fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }

            /// Look a variable up by its DSP symbol.
            #[must_use]
            pub fn lookup(label: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.label() == label)
            }

            /// Default input/output mode.
            #[must_use]
            pub const fn mode(self) -> Rw {
                match self {
                    $(Self::$variant => Rw::$mode),+
                }
            }

            /// Word count the variable occupies per cell block.
            #[must_use]
            pub const fn size(self) -> usize {
                match self {
                    $(Self::$variant => $size),+
                }
            }
        }
    };
}

params! {
    /// System-level parameters.
    SystemParam {
        NumberModules => "NUMBER_MODULES",
        OfflineAnalysis => "OFFLINE_ANALYSIS",
        PxiSlotMap => "PXI_SLOT_MAP",
    }
}

params! {
    /// User-facing module parameters.
    ModuleParam {
        ModuleNumber => "MODULE_NUMBER",
        ModuleCsra => "MODULE_CSRA",
        ModuleCsrb => "MODULE_CSRB",
        ModuleFormat => "MODULE_FORMAT",
        MaxEvents => "MAX_EVENTS",
        SynchWait => "SYNCH_WAIT",
        InSynch => "IN_SYNCH",
        SlowFilterRange => "SLOW_FILTER_RANGE",
        FastFilterRange => "FAST_FILTER_RANGE",
        FastTrigBackplaneEna => "FastTrigBackplaneEna",
        CrateId => "CrateID",
        SlotId => "SlotID",
        ModId => "ModID",
        TrigConfig0 => "TrigConfig0",
        TrigConfig1 => "TrigConfig1",
        TrigConfig2 => "TrigConfig2",
        TrigConfig3 => "TrigConfig3",
        HostRtPreset => "HOST_RT_PRESET",
    }
}

params! {
    /// User-facing channel parameters.
    ChannelParam {
        TriggerRisetime => "TRIGGER_RISETIME",
        TriggerFlattop => "TRIGGER_FLATTOP",
        TriggerThreshold => "TRIGGER_THRESHOLD",
        EnergyRisetime => "ENERGY_RISETIME",
        EnergyFlattop => "ENERGY_FLATTOP",
        Tau => "TAU",
        TraceLength => "TRACE_LENGTH",
        TraceDelay => "TRACE_DELAY",
        Voffset => "VOFFSET",
        Xdt => "XDT",
        BaselinePercent => "BASELINE_PERCENT",
        Emin => "EMIN",
        BinFactor => "BINFACTOR",
        BaselineAverage => "BASELINE_AVERAGE",
        ChannelCsra => "CHANNEL_CSRA",
        ChannelCsrb => "CHANNEL_CSRB",
        BlCut => "BLCUT",
        Integrator => "INTEGRATOR",
        FastTrigBackLen => "FASTTRIGBACKLEN",
        CfdDelay => "CFDDelay",
        CfdScale => "CFDScale",
        CfdThresh => "CFDThresh",
        QdcLen0 => "QDCLen0",
        QdcLen1 => "QDCLen1",
        QdcLen2 => "QDCLen2",
        QdcLen3 => "QDCLen3",
        QdcLen4 => "QDCLen4",
        QdcLen5 => "QDCLen5",
        QdcLen6 => "QDCLen6",
        QdcLen7 => "QDCLen7",
        ExtTrigStretch => "ExtTrigStretch",
        VetoStretch => "VetoStretch",
        MultiplicityMaskL => "MultiplicityMaskL",
        MultiplicityMaskH => "MultiplicityMaskH",
        ExternDelayLen => "ExternDelayLen",
        FtrigoutDelay => "FtrigoutDelay",
        ChanTrigStretch => "ChanTrigStretch",
    }
}

variables! {
    /// Module variables from the DSP VAR file. Inputs first, then the
    /// DSP-produced outputs.
    ModuleVar {
        ModNum => (ReadWrite, 1),
        ModCSRA => (ReadWrite, 1),
        ModCSRB => (ReadWrite, 1),
        ModFormat => (ReadWrite, 1),
        RunTask => (ReadWrite, 1),
        ControlTask => (ReadWrite, 1),
        MaxEvents => (ReadWrite, 1),
        CoincPattern => (ReadWrite, 1),
        CoincWait => (ReadWrite, 1),
        SynchWait => (ReadWrite, 1),
        InSynch => (ReadWrite, 1),
        Resume => (ReadWrite, 1),
        SlowFilterRange => (ReadWrite, 1),
        FastFilterRange => (ReadWrite, 1),
        ChanNum => (ReadWrite, 1),
        HostIO => (ReadWrite, 16),
        UserIn => (ReadWrite, 16),
        FastTrigBackplaneEna => (ReadWrite, 1),
        CrateID => (ReadWrite, 1),
        SlotID => (ReadWrite, 1),
        ModID => (ReadWrite, 1),
        TrigConfig => (ReadWrite, 4),
        HostRunTimePreset => (ReadWrite, 1),
        PowerUpInitDone => (ReadOnly, 1),
        U00 => (ReadWrite, 1),
        RealTimeA => (ReadOnly, 1),
        RealTimeB => (ReadOnly, 1),
        RunTimeA => (ReadOnly, 1),
        RunTimeB => (ReadOnly, 1),
        GSLTtime => (ReadOnly, 1),
        DSPerror => (ReadOnly, 1),
        SynchDone => (ReadOnly, 1),
        UserOut => (ReadOnly, 16),
        AOutBuffer => (ReadOnly, 1),
        AECorr => (ReadOnly, 1),
        LECorr => (ReadOnly, 1),
        HardwareID => (ReadOnly, 1),
        HardVariant => (ReadOnly, 1),
        FIFOLength => (ReadOnly, 1),
        DSPrelease => (ReadOnly, 1),
        DSPbuild => (ReadOnly, 1),
        NumEventsA => (ReadOnly, 1),
        NumEventsB => (ReadOnly, 1),
        BufHeadLen => (ReadOnly, 1),
        EventHeadLen => (ReadOnly, 1),
        ChanHeadLen => (ReadOnly, 1),
        LOutBuffer => (ReadOnly, 1),
        FippiID => (ReadOnly, 1),
        FippiVariant => (ReadOnly, 1),
        DSPVariant => (ReadOnly, 1),
        U20 => (ReadOnly, 1),
    }
}

variables! {
    /// Channel variables from the DSP VAR file. Inputs first, then the
    /// DSP-produced outputs. Addresses are channel 0's block.
    ChannelVar {
        ChanCSRa => (ReadWrite, 1),
        ChanCSRb => (ReadWrite, 1),
        GainDAC => (ReadWrite, 1),
        OffsetDAC => (ReadWrite, 1),
        DigGain => (ReadWrite, 1),
        SlowLength => (ReadWrite, 1),
        SlowGap => (ReadWrite, 1),
        FastLength => (ReadWrite, 1),
        FastGap => (ReadWrite, 1),
        PeakSample => (ReadWrite, 1),
        PeakSep => (ReadWrite, 1),
        CFDThresh => (ReadWrite, 1),
        FastThresh => (ReadWrite, 1),
        ThreshWidth => (ReadWrite, 1),
        PAFlength => (ReadWrite, 1),
        TriggerDelay => (ReadWrite, 1),
        ResetDelay => (ReadWrite, 1),
        ChanTrigStretch => (ReadWrite, 1),
        TraceLength => (ReadWrite, 1),
        Xwait => (ReadWrite, 1),
        TrigOutLen => (ReadWrite, 1),
        EnergyLow => (ReadWrite, 1),
        Log2Ebin => (ReadWrite, 1),
        MultiplicityMaskL => (ReadWrite, 1),
        MultiplicityMaskH => (ReadWrite, 1),
        PSAoffset => (ReadWrite, 1),
        PSAlength => (ReadWrite, 1),
        Integrator => (ReadWrite, 1),
        BLcut => (ReadWrite, 1),
        BaselinePercent => (ReadWrite, 1),
        FtrigoutDelay => (ReadWrite, 1),
        Log2Bweight => (ReadWrite, 1),
        PreampTau => (ReadWrite, 1),
        Xavg => (ReadWrite, 1),
        FastTrigBackLen => (ReadWrite, 1),
        CFDDelay => (ReadWrite, 1),
        CFDScale => (ReadWrite, 1),
        ExternDelayLen => (ReadWrite, 1),
        ExtTrigStretch => (ReadWrite, 1),
        VetoStretch => (ReadWrite, 1),
        QDCLen0 => (ReadWrite, 1),
        QDCLen1 => (ReadWrite, 1),
        QDCLen2 => (ReadWrite, 1),
        QDCLen3 => (ReadWrite, 1),
        QDCLen4 => (ReadWrite, 1),
        QDCLen5 => (ReadWrite, 1),
        QDCLen6 => (ReadWrite, 1),
        QDCLen7 => (ReadWrite, 1),
        LiveTimeA => (ReadOnly, 1),
        LiveTimeB => (ReadOnly, 1),
        FastPeaksA => (ReadOnly, 1),
        FastPeaksB => (ReadOnly, 1),
        OverflowA => (ReadOnly, 1),
        OverflowB => (ReadOnly, 1),
        InSpecA => (ReadOnly, 1),
        InSpecB => (ReadOnly, 1),
        UnderflowA => (ReadOnly, 1),
        UnderflowB => (ReadOnly, 1),
        ChanEventsA => (ReadOnly, 1),
        ChanEventsB => (ReadOnly, 1),
        AutoTau => (ReadOnly, 1),
        U30 => (ReadOnly, 1),
    }
}

/// Route a module parameter to its backing variable and word offset within
/// that variable.
#[must_use]
pub const fn map_module_param(par: ModuleParam) -> (ModuleVar, usize) {
    match par {
        ModuleParam::ModuleNumber => (ModuleVar::ModNum, 0),
        ModuleParam::ModuleCsra => (ModuleVar::ModCSRA, 0),
        ModuleParam::ModuleCsrb => (ModuleVar::ModCSRB, 0),
        ModuleParam::ModuleFormat => (ModuleVar::ModFormat, 0),
        ModuleParam::MaxEvents => (ModuleVar::MaxEvents, 0),
        ModuleParam::SynchWait => (ModuleVar::SynchWait, 0),
        ModuleParam::InSynch => (ModuleVar::InSynch, 0),
        ModuleParam::SlowFilterRange => (ModuleVar::SlowFilterRange, 0),
        ModuleParam::FastFilterRange => (ModuleVar::FastFilterRange, 0),
        ModuleParam::FastTrigBackplaneEna => (ModuleVar::FastTrigBackplaneEna, 0),
        ModuleParam::CrateId => (ModuleVar::CrateID, 0),
        ModuleParam::SlotId => (ModuleVar::SlotID, 0),
        ModuleParam::ModId => (ModuleVar::ModID, 0),
        ModuleParam::TrigConfig0 => (ModuleVar::TrigConfig, 0),
        ModuleParam::TrigConfig1 => (ModuleVar::TrigConfig, 1),
        ModuleParam::TrigConfig2 => (ModuleVar::TrigConfig, 2),
        ModuleParam::TrigConfig3 => (ModuleVar::TrigConfig, 3),
        ModuleParam::HostRtPreset => (ModuleVar::HostRunTimePreset, 0),
    }
}

/// A variable descriptor: the enumeration tag plus the live attributes
/// resolved at probe time.
#[derive(Debug, Clone)]
pub struct VarDesc<V> {
    /// The variable this descriptor describes.
    pub var: V,
    /// Input/output mode.
    pub mode: Rw,
    /// Word count.
    pub size: usize,
    /// Present in the loaded VAR file.
    pub enabled: bool,
    /// DSP memory address (channel 0's block for channel variables).
    pub address: u32,
}

/// Module variable descriptors, indexed by `ModuleVar as usize`.
pub type ModuleVarDescs = Vec<VarDesc<ModuleVar>>;
/// Channel variable descriptors, indexed by `ChannelVar as usize`.
pub type ChannelVarDescs = Vec<VarDesc<ChannelVar>>;

/// Default (disabled, unaddressed) module descriptors.
#[must_use]
pub fn default_module_var_descs() -> ModuleVarDescs {
    ModuleVar::ALL
        .iter()
        .map(|&var| VarDesc { var, mode: var.mode(), size: var.size(), enabled: false, address: 0 })
        .collect()
}

/// Default (disabled, unaddressed) channel descriptors.
#[must_use]
pub fn default_channel_var_descs() -> ChannelVarDescs {
    ChannelVar::ALL
        .iter()
        .map(|&var| VarDesc { var, mode: var.mode(), size: var.size(), enabled: false, address: 0 })
        .collect()
}

/// Parse a DSP VAR stream (one `Symbol 0xADDRESS` per line) into descriptor
/// sets. Symbols missing from the stream leave their descriptor disabled;
/// unknown symbols are logged and skipped.
///
/// # Errors
///
/// Returns `ModuleInvalidVar` on a malformed line and `FileReadFailure` if
/// the stream cannot be read.
pub fn load(input: impl BufRead) -> Result<(ModuleVarDescs, ChannelVarDescs)> {
    let mut module_descs = default_module_var_descs();
    let mut channel_descs = default_channel_var_descs();

    for (lineno, line) in input.lines().enumerate() {
        let line = line.map_err(|e| Error::FileReadFailure(format!("dsp var stream: {e}")))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (name, addr) = match (tokens.next(), tokens.next()) {
            (Some(n), Some(a)) => (n, a),
            _ => {
                return Err(Error::ModuleInvalidVar(format!(
                    "dsp var line {}: expected `name address`: {line:?}",
                    lineno + 1
                )))
            }
        };
        let addr = addr.trim_start_matches("0x");
        let addr = u32::from_str_radix(addr, 16).map_err(|e| {
            Error::ModuleInvalidVar(format!("dsp var line {}: bad address: {e}", lineno + 1))
        })?;

        if let Some(var) = ModuleVar::lookup(name) {
            let desc = &mut module_descs[var as usize];
            desc.address = addr;
            desc.enabled = true;
        } else if let Some(var) = ChannelVar::lookup(name) {
            let desc = &mut channel_descs[var as usize];
            desc.address = addr;
            desc.enabled = true;
        } else {
            warn!("dsp var: unknown symbol ignored: {name}");
        }
    }

    debug!(
        "dsp var: loaded {} module / {} channel symbols",
        module_descs.iter().filter(|d| d.enabled).count(),
        channel_descs.iter().filter(|d| d.enabled).count()
    );
    Ok((module_descs, channel_descs))
}

/// Assign the canonical sequential layout starting at DSP data memory:
/// module inputs, module outputs, then the per-channel block (inputs then
/// outputs). The simulator and the test fixtures share this layout.
pub fn assign_default_addresses(
    module_descs: &mut ModuleVarDescs,
    channel_descs: &mut ChannelVarDescs,
) {
    let mut addr = hw::dsp::DATA_MEMORY_ADDRESS;
    for mode in [Rw::ReadWrite, Rw::ReadOnly] {
        for desc in module_descs.iter_mut().filter(|d| d.mode == mode) {
            desc.address = addr;
            desc.enabled = true;
            addr += u32::try_from(desc.size).expect("descriptor size fits u32");
        }
    }
    for mode in [Rw::ReadWrite, Rw::ReadOnly] {
        for desc in channel_descs.iter_mut().filter(|d| d.mode == mode) {
            desc.address = addr;
            desc.enabled = true;
            addr += u32::try_from(desc.size).expect("descriptor size fits u32");
        }
    }
}

/// Render the canonical layout as VAR file text. Used by the simulator's
/// firmware set and the test fixtures.
#[must_use]
pub fn default_var_listing() -> String {
    let mut module_descs = default_module_var_descs();
    let mut channel_descs = default_channel_var_descs();
    assign_default_addresses(&mut module_descs, &mut channel_descs);
    let mut out = String::new();
    for d in &module_descs {
        out.push_str(&format!("{} 0x{:x}\n", d.var.label(), d.address));
    }
    for d in &channel_descs {
        out.push_str(&format!("{} 0x{:x}\n", d.var.label(), d.address));
    }
    out
}

/// A contiguous DSP address range, end exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range {
    /// First word address.
    pub start: u32,
    /// One past the last word address.
    pub end: u32,
}

impl Range {
    /// Size of the range in words.
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Whether two ranges share any address.
    #[must_use]
    pub const fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The address map derived once per boot from the loaded descriptors.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    /// Full span from the first module input to the last channel output.
    pub full: Range,
    /// Module input variables.
    pub module_in: Range,
    /// Module output variables.
    pub module_out: Range,
    /// Channel 0's input variables.
    pub channels_in: Range,
    /// Channel 0's output variables.
    pub channels_out: Range,
    /// Words per channel block.
    pub vars_per_channel: usize,
    /// Channels covered by the map.
    pub num_channels: usize,
}

impl AddressMap {
    /// Build the map from loaded descriptors, checking for gaps and
    /// overlaps.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInvalidVar` if any range has a hole or the ranges
    /// overlap.
    pub fn set(
        num_channels: usize,
        module_descs: &ModuleVarDescs,
        channel_descs: &ChannelVarDescs,
    ) -> Result<Self> {
        let module_in = contiguous_range("module in", module_descs, Rw::ReadWrite)?;
        let module_out = contiguous_range("module out", module_descs, Rw::ReadOnly)?;
        let channels_in = contiguous_range("channels in", channel_descs, Rw::ReadWrite)?;
        let channels_out = contiguous_range("channels out", channel_descs, Rw::ReadOnly)?;

        if channels_out.start != channels_in.end {
            return Err(Error::ModuleInvalidVar(format!(
                "channel block has a gap between inputs (end 0x{:x}) and outputs (start 0x{:x})",
                channels_in.end, channels_out.start
            )));
        }
        let ranges = [&module_in, &module_out, &channels_in, &channels_out];
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::ModuleInvalidVar(format!(
                        "overlapping variable ranges: 0x{:x}..0x{:x} and 0x{:x}..0x{:x}",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }

        let vars_per_channel = channels_in.size() + channels_out.size();
        let last_base = channels_in.start
            + u32::try_from((num_channels - 1) * vars_per_channel)
                .map_err(|_| Error::InternalFailure("channel span overflows".into()))?;
        let full = Range {
            start: module_in.start,
            end: last_base
                + u32::try_from(vars_per_channel)
                    .map_err(|_| Error::InternalFailure("channel span overflows".into()))?,
        };

        Ok(Self {
            full,
            module_in,
            module_out,
            channels_in,
            channels_out,
            vars_per_channel,
            num_channels,
        })
    }

    /// Base address of channel `channel`'s block.
    #[must_use]
    pub fn channel_base(&self, channel: usize) -> u32 {
        self.channels_in.start + (channel * self.vars_per_channel) as u32
    }

    /// Address of a channel variable's cell for a specific channel.
    #[must_use]
    pub fn channel_cell(&self, desc: &VarDesc<ChannelVar>, channel: usize) -> u32 {
        desc.address + (channel * self.vars_per_channel) as u32
    }
}

fn contiguous_range<V: Copy + std::fmt::Debug>(
    what: &str,
    descs: &[VarDesc<V>],
    mode: Rw,
) -> Result<Range> {
    let mut entries: Vec<(u32, usize)> = descs
        .iter()
        .filter(|d| d.enabled && d.mode == mode)
        .map(|d| (d.address, d.size))
        .collect();
    if entries.is_empty() {
        return Err(Error::ModuleInvalidVar(format!("{what}: no enabled variables")));
    }
    entries.sort_unstable();
    let start = entries[0].0;
    let mut next = start;
    for (addr, size) in &entries {
        if *addr != next {
            return Err(Error::ModuleInvalidVar(format!(
                "{what}: gap at 0x{next:x} (next variable at 0x{addr:x})"
            )));
        }
        next = addr + u32::try_from(*size).expect("descriptor size fits u32");
    }
    Ok(Range { start, end: next })
}

/// One word cell of a variable: the host-cached value and its dirty flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueCell {
    /// Host-cached value.
    pub value: u32,
    /// Changed on the host but not yet flushed to the DSP.
    pub dirty: bool,
}

/// A variable with its cells; `cells.len() == desc.size`.
#[derive(Debug, Clone)]
pub struct Variable<V> {
    /// The variable tag.
    pub var: V,
    /// One cell per word.
    pub cells: Vec<ValueCell>,
}

/// All module variables for one module, indexed by `ModuleVar as usize`.
pub type ModuleVariables = Vec<Variable<ModuleVar>>;
/// All channel variables for one channel, indexed by `ChannelVar as usize`.
pub type ChannelVariables = Vec<Variable<ChannelVar>>;

/// Fresh zeroed module variable cells.
#[must_use]
pub fn new_module_variables(descs: &ModuleVarDescs) -> ModuleVariables {
    descs
        .iter()
        .map(|d| Variable { var: d.var, cells: vec![ValueCell::default(); d.size] })
        .collect()
}

/// Fresh zeroed channel variable cells for one channel.
#[must_use]
pub fn new_channel_variables(descs: &ChannelVarDescs) -> ChannelVariables {
    descs
        .iter()
        .map(|d| Variable { var: d.var, cells: vec![ValueCell::default(); d.size] })
        .collect()
}

/// Copy filter group masks. The mask bits select which variable groups a
/// channel-to-channel copy carries across.
pub mod filter_mask {
    /// Energy filter: slow filter lengths and peak sampling.
    pub const ENERGY: u32 = 1 << 0;
    /// Trigger filter: fast filter lengths and threshold.
    pub const TRIGGER: u32 = 1 << 1;
    /// Analog signal conditioning: DACs and digital gain.
    pub const ANALOG_SIGNAL_COND: u32 = 1 << 2;
    /// Histogram control: energy binning.
    pub const HISTOGRAM_CONTROL: u32 = 1 << 3;
    /// Preamp decay time.
    pub const DECAY_TIME: u32 = 1 << 4;
    /// Pulse shape analysis: trace capture geometry.
    pub const PULSE_SHAPE_ANALYSIS: u32 = 1 << 5;
    /// Baseline control.
    pub const BASELINE_CONTROL: u32 = 1 << 6;
    /// Channel CSRA control bits.
    pub const CHANNEL_CSRA: u32 = 1 << 7;
    /// CFD trigger settings.
    pub const CFD_TRIGGER: u32 = 1 << 8;
    /// Trigger stretch lengths.
    pub const TRIGGER_STRETCH_LEN: u32 = 1 << 9;
    /// FIFO delay settings.
    pub const FIFO_DELAYS: u32 = 1 << 10;
    /// Multiplicity masks.
    pub const MULTIPLICITY: u32 = 1 << 11;
    /// QDC windows.
    pub const QDC: u32 = 1 << 12;
    /// Every group.
    pub const ALL: u32 = (1 << 13) - 1;
}

/// A copy-filter entry: the variable plus the word mask of bits the copy
/// may touch. Bits outside the mask keep the destination's value.
#[derive(Debug, Clone, Copy)]
pub struct CopyVar {
    /// The channel variable to copy.
    pub var: ChannelVar,
    /// Bits carried across by the copy.
    pub mask: u32,
}

impl CopyVar {
    const fn all(var: ChannelVar) -> Self {
        Self { var, mask: u32::MAX }
    }
}

/// Expand a filter mask into the variables it selects.
#[must_use]
pub fn copy_filter(filter: u32) -> Vec<CopyVar> {
    use ChannelVar as V;
    let mut vars = Vec::new();
    if filter & filter_mask::ENERGY != 0 {
        vars.extend([V::SlowLength, V::SlowGap, V::PeakSample, V::PeakSep].map(CopyVar::all));
    }
    if filter & filter_mask::TRIGGER != 0 {
        vars.extend(
            [V::FastLength, V::FastGap, V::FastThresh, V::ThreshWidth].map(CopyVar::all),
        );
    }
    if filter & filter_mask::ANALOG_SIGNAL_COND != 0 {
        vars.extend([V::OffsetDAC, V::GainDAC, V::DigGain].map(CopyVar::all));
    }
    if filter & filter_mask::HISTOGRAM_CONTROL != 0 {
        vars.extend([V::EnergyLow, V::Log2Ebin].map(CopyVar::all));
    }
    if filter & filter_mask::DECAY_TIME != 0 {
        vars.push(CopyVar::all(V::PreampTau));
    }
    if filter & filter_mask::PULSE_SHAPE_ANALYSIS != 0 {
        vars.extend(
            [V::TraceLength, V::TriggerDelay, V::PAFlength, V::PSAoffset, V::PSAlength]
                .map(CopyVar::all),
        );
    }
    if filter & filter_mask::BASELINE_CONTROL != 0 {
        vars.extend([V::BLcut, V::BaselinePercent, V::Log2Bweight].map(CopyVar::all));
    }
    if filter & filter_mask::CHANNEL_CSRA != 0 {
        // Bits 30..31 are board-level and stay with the destination.
        vars.push(CopyVar { var: V::ChanCSRa, mask: 0x3FFF_FFFF });
    }
    if filter & filter_mask::CFD_TRIGGER != 0 {
        vars.extend([V::CFDDelay, V::CFDScale, V::CFDThresh].map(CopyVar::all));
    }
    if filter & filter_mask::TRIGGER_STRETCH_LEN != 0 {
        vars.extend([V::ExtTrigStretch, V::VetoStretch, V::ChanTrigStretch].map(CopyVar::all));
    }
    if filter & filter_mask::FIFO_DELAYS != 0 {
        vars.extend([V::ExternDelayLen, V::FtrigoutDelay].map(CopyVar::all));
    }
    if filter & filter_mask::MULTIPLICITY != 0 {
        vars.push(CopyVar::all(V::MultiplicityMaskL));
        // The high word's upper half carries coincidence configuration that
        // is specific to the destination channel.
        vars.push(CopyVar { var: V::MultiplicityMaskH, mask: 0x0000_FFFF });
    }
    if filter & filter_mask::QDC != 0 {
        vars.extend(
            [
                V::QDCLen0,
                V::QDCLen1,
                V::QDCLen2,
                V::QDCLen3,
                V::QDCLen4,
                V::QDCLen5,
                V::QDCLen6,
                V::QDCLen7,
            ]
            .map(CopyVar::all),
        );
    }
    vars
}

/// Copy the selected variable groups from one channel's cells to another,
/// masking each word and marking destination cells dirty so the next flush
/// re-synchronises the DSP.
pub fn copy_parameters(filter: u32, source: &ChannelVariables, dest: &mut ChannelVariables) {
    for copy in copy_filter(filter) {
        let idx = copy.var as usize;
        let (src, dst) = (&source[idx], &mut dest[idx]);
        for (s, d) in src.cells.iter().zip(dst.cells.iter_mut()) {
            d.value = (d.value & !copy.mask) | (s.value & copy.mask);
            d.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_layout() -> (ModuleVarDescs, ChannelVarDescs) {
        let mut m = default_module_var_descs();
        let mut c = default_channel_var_descs();
        assign_default_addresses(&mut m, &mut c);
        (m, c)
    }

    #[test]
    fn lookup_round_trips() {
        for &p in ChannelParam::ALL {
            assert_eq!(ChannelParam::lookup(p.label()), Some(p));
        }
        for &v in ModuleVar::ALL {
            assert_eq!(ModuleVar::lookup(v.label()), Some(v));
        }
        assert_eq!(ChannelParam::lookup("NOT_A_PARAM"), None);
    }

    #[test]
    fn var_listing_loads_back() {
        let listing = default_var_listing();
        let (m, c) = load(Cursor::new(listing)).unwrap();
        assert!(m.iter().all(|d| d.enabled));
        assert!(c.iter().all(|d| d.enabled));
        assert_eq!(
            m[ModuleVar::ModNum as usize].address,
            hw::dsp::DATA_MEMORY_ADDRESS
        );
    }

    #[test]
    fn missing_symbol_disables_descriptor() {
        let listing = "ModNum 0x4a000\nModCSRA 0x4a001\n";
        let (m, _) = load(Cursor::new(listing)).unwrap();
        assert!(m[ModuleVar::ModNum as usize].enabled);
        assert!(!m[ModuleVar::RunTask as usize].enabled);
    }

    #[test]
    fn bad_address_rejected() {
        let err = load(Cursor::new("ModNum zz\n")).unwrap_err();
        assert_eq!(err.api_result(), 210);
    }

    #[test]
    fn address_map_ranges_disjoint_and_uniform() {
        let (m, c) = default_layout();
        let map = AddressMap::set(16, &m, &c).unwrap();
        assert!(!map.module_in.overlaps(&map.module_out));
        assert!(!map.module_out.overlaps(&map.channels_in));
        for ch in 0..15 {
            assert_eq!(
                map.channel_base(ch + 1) - map.channel_base(ch),
                map.vars_per_channel as u32
            );
        }
        assert_eq!(
            map.vars_per_channel,
            map.channels_in.size() + map.channels_out.size()
        );
    }

    #[test]
    fn address_map_detects_gap() {
        let (m, mut c) = default_layout();
        c[ChannelVar::FastThresh as usize].address += 7;
        let err = AddressMap::set(16, &m, &c).unwrap_err();
        assert_eq!(err.api_result(), 210);
    }

    #[test]
    fn trigconfig_words_route_by_offset() {
        assert_eq!(map_module_param(ModuleParam::TrigConfig0), (ModuleVar::TrigConfig, 0));
        assert_eq!(map_module_param(ModuleParam::TrigConfig3), (ModuleVar::TrigConfig, 3));
    }

    #[test]
    fn copy_filter_masks_preserve_reserved_bits() {
        let (_, c) = default_layout();
        let mut src = new_channel_variables(&c);
        let mut dst = new_channel_variables(&c);
        src[ChannelVar::ChanCSRa as usize].cells[0].value = 0xFFFF_FFFF;
        dst[ChannelVar::ChanCSRa as usize].cells[0].value = 0x8000_0000;
        copy_parameters(filter_mask::CHANNEL_CSRA, &src, &mut dst);
        let cell = dst[ChannelVar::ChanCSRa as usize].cells[0];
        assert_eq!(cell.value, 0xBFFF_FFFF);
        assert!(cell.dirty);
    }

    #[test]
    fn copy_filter_selects_only_masked_groups() {
        let (_, c) = default_layout();
        let mut src = new_channel_variables(&c);
        let mut dst = new_channel_variables(&c);
        src[ChannelVar::SlowLength as usize].cells[0].value = 12;
        src[ChannelVar::FastLength as usize].cells[0].value = 34;
        copy_parameters(filter_mask::ENERGY, &src, &mut dst);
        assert_eq!(dst[ChannelVar::SlowLength as usize].cells[0].value, 12);
        assert_eq!(dst[ChannelVar::FastLength as usize].cells[0].value, 0);
        assert!(!dst[ChannelVar::FastLength as usize].cells[0].dirty);
    }
}
