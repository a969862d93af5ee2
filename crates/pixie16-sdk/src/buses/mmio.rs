//! Memory-mapped PCI bus driver.
//!
//! Maps the module's register BAR through
//! `/sys/bus/pci/devices/{addr}/resource0` and performs volatile,
//! bounds-checked word access. Block transfers latch the DSP address and
//! stream the auto-incrementing data port while holding the DSP host bus.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe.
#![allow(clippy::cast_ptr_alignment)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

use pixie16_hw::regs;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, trace};

use crate::bus::{BusDriver, DeviceInfo};
use crate::error::{Error, Result};

/// Bus driver over a memory-mapped PCI register window.
pub struct MmioBus {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    pcie_address: String,
    info: DeviceInfo,
    reg_trace: bool,
}

impl std::fmt::Debug for MmioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioBus")
            .field("pcie_address", &self.pcie_address)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

// SAFETY: MmioBus owns the mapping exclusively; volatile word access has no
// thread-local state and the register protocol is serialised by the
// module's bus guard.
unsafe impl Send for MmioBus {}
// SAFETY: see above; concurrent volatile reads of MMIO registers are safe
// and writes are serialised by the bus guard.
unsafe impl Sync for MmioBus {}

impl MmioBus {
    /// Map the register BAR of the module at a PCI address.
    ///
    /// # Errors
    ///
    /// Returns `DeviceHwFailure` if the resource file cannot be opened or
    /// mapped.
    pub fn open(pcie_address: &str, info: DeviceInfo, reg_trace: bool) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource0");
        debug!("mmio: mapping {path}");

        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            Error::DeviceHwFailure(format!("cannot open {path}: {e}. Is the device enabled?"))
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let size = file
            .metadata()
            .map_err(|e| Error::DeviceHwFailure(format!("cannot stat BAR: {e}")))?
            .len() as usize;
        if size == 0 {
            return Err(Error::DeviceHwFailure("BAR size is 0 (device not enabled?)".into()));
        }

        // SAFETY: the fd was just opened read/write; size is non-zero; the
        // mapping is unmapped in Drop and the file handle is kept open for
        // the mapping's lifetime.
        let ptr = unsafe {
            let addr = mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| Error::DeviceHwFailure(format!("mmap failed: {e}")))?;
            NonNull::new(addr.cast::<u8>()).expect("rustix mmap returns non-null on success")
        };

        debug!("mmio: mapped {pcie_address} ({size} bytes)");
        Ok(Self {
            ptr,
            size,
            _file: file,
            pcie_address: pcie_address.to_string(),
            info,
            reg_trace,
        })
    }

    fn check(&self, offset: u32) -> Result<()> {
        if offset as usize + 4 > self.size {
            return Err(Error::DeviceHwFailure(format!(
                "register offset out of bounds: {offset:#x} (limit {:#x})",
                self.size
            )));
        }
        Ok(())
    }

    fn raw_read(&self, offset: u32) -> u32 {
        // SAFETY: offset was bounds-checked by the caller; MMIO reads must
        // be volatile because the hardware changes register values.
        unsafe { self.ptr.as_ptr().add(offset as usize).cast::<u32>().read_volatile() }
    }

    fn raw_write(&self, offset: u32, value: u32) {
        // SAFETY: offset was bounds-checked by the caller; MMIO writes must
        // be volatile because they trigger hardware side effects.
        unsafe {
            self.ptr.as_ptr().add(offset as usize).cast::<u32>().write_volatile(value);
        }
    }
}

impl BusDriver for MmioBus {
    fn read_word(&self, offset: u32) -> Result<u32> {
        self.check(offset)?;
        let value = self.raw_read(offset);
        if self.reg_trace {
            trace!("mmio: rd {offset:#04x} = {value:#010x}");
        }
        Ok(value)
    }

    fn write_word(&self, offset: u32, value: u32) -> Result<()> {
        self.check(offset)?;
        if self.reg_trace {
            trace!("mmio: wr {offset:#04x} = {value:#010x}");
        }
        self.raw_write(offset, value);
        Ok(())
    }

    fn block_read(&self, addr: u32, out: &mut [u32]) -> Result<()> {
        self.check(regs::DSP_DATA)?;
        self.raw_write(regs::REQUEST_HBR, 1);
        self.raw_write(regs::WRT_DSP_MMA, addr);
        for word in out.iter_mut() {
            *word = self.raw_read(regs::DSP_DATA);
        }
        self.raw_write(regs::HBR_DONE, 1);
        Ok(())
    }

    fn block_write(&self, addr: u32, data: &[u32]) -> Result<()> {
        self.check(regs::DSP_DATA)?;
        self.raw_write(regs::REQUEST_HBR, 1);
        self.raw_write(regs::WRT_DSP_MMA, addr);
        for word in data {
            self.raw_write(regs::DSP_DATA, *word);
        }
        self.raw_write(regs::HBR_DONE, 1);
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        Ok(self.info.clone())
    }
}

impl Drop for MmioBus {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from the successful mmap in open(); Drop
        // runs at most once and no other references exist.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("mmio: munmap failed during drop: {e}");
            }
        }
        debug!("mmio: unmapped {}", self.pcie_address);
    }
}
