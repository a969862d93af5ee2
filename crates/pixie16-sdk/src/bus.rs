//! Bus driver abstraction.
//!
//! Provides the unified word/block register interface over a module's PCI
//! window. Two drivers implement it: [`crate::buses::MmioBus`] maps the
//! real BAR, [`crate::buses::SimBus`] is a full software simulation so the
//! whole SDK runs without hardware.

use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

/// Identity and analog front-end geometry of one module, as read from its
/// EEPROM (or synthesised by the simulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// PCI bus number.
    pub pci_bus: u32,
    /// PCI device (slot on the bus) number.
    pub pci_slot: u32,
    /// Module hardware revision.
    pub revision: u16,
    /// Board serial number.
    pub serial_num: u32,
    /// ADC resolution in bits.
    pub adc_bits: u32,
    /// ADC sampling rate in MSPS.
    pub adc_msps: u32,
    /// Number of channels fitted.
    pub num_channels: usize,
}

/// Word and block access to one module's register window and DSP memory.
///
/// All accesses for a module must be made while holding its [`BusLock`]
/// guard; the trait itself is lock-free so the simulator and the MMIO
/// driver stay interchangeable.
pub trait BusDriver: Debug + Send + Sync {
    /// Read one 32-bit register at a byte offset into the host interface.
    ///
    /// # Errors
    ///
    /// Returns `DeviceHwFailure` if the access faults.
    fn read_word(&self, offset: u32) -> Result<u32>;

    /// Write one 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns `DeviceHwFailure` if the access faults.
    fn write_word(&self, offset: u32, value: u32) -> Result<()>;

    /// Block-DMA read from DSP memory space into `out`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceDmaFailure` or `DeviceDmaBusy` on transfer faults.
    fn block_read(&self, addr: u32, out: &mut [u32]) -> Result<()>;

    /// Block-DMA write into DSP memory space.
    ///
    /// # Errors
    ///
    /// Returns `DeviceDmaFailure` or `DeviceDmaBusy` on transfer faults.
    fn block_write(&self, addr: u32, data: &[u32]) -> Result<()>;

    /// Identity information for the device behind this bus.
    ///
    /// # Errors
    ///
    /// Returns `ModuleInfoFailure` if the EEPROM cannot be read.
    fn device_info(&self) -> Result<DeviceInfo>;
}

/// Per-module bus lock. Register access paths acquire the guard for the
/// whole operation so concurrent callers queue per module. Never hold two
/// modules' guards at once.
#[derive(Debug, Default)]
pub struct BusLock {
    lock: Mutex<()>,
}

/// Scoped bus acquisition; released on drop on all exit paths.
pub type BusGuard<'a> = MutexGuard<'a, ()>;

impl BusLock {
    /// Acquire the module's bus.
    ///
    /// # Panics
    ///
    /// Panics if a thread previously panicked while holding the guard.
    pub fn guard(&self) -> BusGuard<'_> {
        self.lock.lock().expect("bus lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_serialises() {
        let lock = BusLock::default();
        let g = lock.guard();
        assert!(lock.lock.try_lock().is_err());
        drop(g);
        assert!(lock.lock.try_lock().is_ok());
    }
}
