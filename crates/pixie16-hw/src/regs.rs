//! Host-interface register map.
//!
//! The system FPGA exposes a small window of 32-bit registers over the PCI
//! bridge. Offsets are byte offsets into the module's BAR. The FPGA
//! configuration ports (`CFG_*`) are shared by the Com and FiPPI loaders;
//! which device a word stream reaches is selected by the control word
//! written to [`CFG_CTRLCS`].
//!
//! ```text
//! 0x00: CFG_DATACS   — FPGA configuration data port (write words)
//! 0x04: CFG_CTRLCS   — FPGA configuration control
//! 0x08: CFG_RDCS     — FPGA configuration status (read)
//! 0x10: I2CM24C64    — serial EEPROM access
//! 0x14: CFG_DCMRST   — clock manager reset
//! 0x48: CSR          — control/status register
//! 0x80: REQUEST_HBR  — request DSP host bus
//! 0x84: HBR_DONE     — release DSP host bus
//! 0xD0: WRT_DSP_MMA  — DSP memory address for block transfers
//! 0xD4: SET_EXT_FIFO — external FIFO configuration
//! 0xF0: FIFO_LEVEL   — external FIFO fill level in words (read)
//! ```

/// FPGA configuration data port.
pub const CFG_DATACS: u32 = 0x00;
/// FPGA configuration control register.
pub const CFG_CTRLCS: u32 = 0x04;
/// FPGA configuration status register.
pub const CFG_RDCS: u32 = 0x08;

/// Serial EEPROM (module information) access register.
pub const I2CM24C64: u32 = 0x10;
/// Clock manager reset.
pub const CFG_DCMRST: u32 = 0x14;

/// Control/status register.
pub const CSR: u32 = 0x48;

/// Request the DSP host bus before a block transfer.
pub const REQUEST_HBR: u32 = 0x80;
/// Release the DSP host bus after a block transfer.
pub const HBR_DONE: u32 = 0x84;

/// DSP memory address latch for block transfers.
pub const WRT_DSP_MMA: u32 = 0xD0;
/// External FIFO watermark configuration.
pub const SET_EXT_FIFO: u32 = 0xD4;
/// DSP memory data port; words auto-increment from the latched address.
pub const DSP_DATA: u32 = 0xD8;

/// External FIFO fill level in words.
pub const FIFO_LEVEL: u32 = 0xF0;

/// CSR bit definitions.
pub mod csr {
    /// Start/stop a run or control task.
    pub const RUN_ENABLE: u32 = 1 << 0;
    /// DSP code download in progress.
    pub const DSP_DOWNLOAD: u32 = 1 << 1;
    /// PCI interface active.
    pub const PCI_ACTIVE: u32 = 1 << 2;
    /// Wired-or trigger pullup drive.
    pub const PULLUP_CTRL: u32 = 1 << 3;
    /// Release the DSP from reset.
    pub const DSP_RELEASE: u32 = 1 << 4;
    /// DSP finished its power-up initialisation.
    pub const DSP_READY: u32 = 1 << 5;
    /// A run or control task is active.
    pub const RUN_ACTIVE: u32 = 1 << 13;
    /// External FIFO crossed its watermark.
    pub const EXT_FIFO_WML: u32 = 1 << 14;
}

/// An FPGA configuration control transition: the control register is
/// rewritten as `(ctrl & mask) | value` and the status register must then
/// read back `value` in the bits outside `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    /// Bits of the control register left untouched.
    pub mask: u32,
    /// Bits written; also the expected status readback.
    pub value: u32,
}

impl Controls {
    /// Expected status readback after the transition settles.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.value & !self.mask
    }
}

/// Control words for the Com (system) FPGA loader.
pub mod sys_fpga {
    use super::Controls;

    /// Put the configuration port into load mode.
    pub const LOAD: Controls = Controls { mask: 0xFFFF_F000, value: 0x0000_0553 };
    /// Terminate the load; status confirms the image booted.
    pub const DONE: Controls = Controls { mask: 0xFFFF_F000, value: 0x0000_0551 };
}

/// Control words for the FiPPI (signal processing) FPGA loader.
pub mod fippi_fpga {
    use super::Controls;

    /// Put the configuration port into load mode (all four FiPPI chips).
    pub const LOAD: Controls = Controls { mask: 0xFFFF_F000, value: 0x0000_05A2 };
    /// Terminate the load.
    pub const DONE: Controls = Controls { mask: 0xFFFF_F000, value: 0x0000_05A0 };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_non_overlapping() {
        assert_ne!(CFG_DATACS, CFG_CTRLCS);
        assert_ne!(CSR, FIFO_LEVEL);
        assert_ne!(REQUEST_HBR, HBR_DONE);
    }

    #[test]
    fn control_status_excludes_masked_bits() {
        assert_eq!(sys_fpga::LOAD.status(), 0x553);
        assert_eq!(fippi_fpga::DONE.status(), 0x5A0);
    }
}
