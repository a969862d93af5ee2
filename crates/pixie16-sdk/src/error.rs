//! Error types for Pixie-16 SDK operations.
//!
//! Every variant carries a stable API result code. The external boundary
//! (CLI, C-style wrappers) reports `0 - api_result()`; inside the SDK errors
//! stay typed and carry a context string.

use thiserror::Error;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during crate, module and device operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Crate facade constructed twice.
    #[error("crate already open: {0}")]
    CrateAlreadyOpen(String),
    /// Crate operation before initialise/probe.
    #[error("crate not ready: {0}")]
    CrateNotReady(String),
    /// Invalid system-level parameter.
    #[error("invalid system parameter: {0}")]
    CrateInvalidParam(String),

    /// Module number out of range.
    #[error("invalid module number: {0}")]
    ModuleNumberInvalid(String),
    /// Module count mismatch at discovery.
    #[error("invalid module count: {0}")]
    ModuleTotalInvalid(String),
    /// Module opened twice.
    #[error("module already open: {0}")]
    ModuleAlreadyOpen(String),
    /// Module failed to close.
    #[error("module failed to close: {0}")]
    ModuleCloseFailure(String),
    /// Operation on an offline module.
    #[error("module offline: {0}")]
    ModuleOffline(String),
    /// Module information (EEPROM) read failure.
    #[error("module information failure: {0}")]
    ModuleInfoFailure(String),
    /// Operation invalid in the module's current state.
    #[error("invalid module operation: {0}")]
    ModuleInvalidOperation(String),
    /// Firmware not valid for this module, or duplicate registration.
    #[error("invalid module firmware: {0}")]
    ModuleInvalidFirmware(String),
    /// Module initialisation failed.
    #[error("module initialization failure: {0}")]
    ModuleInitializeFailure(String),
    /// Unknown module parameter.
    #[error("invalid module parameter: {0}")]
    ModuleInvalidParam(String),
    /// Unknown or inconsistent module variable.
    #[error("invalid module variable: {0}")]
    ModuleInvalidVar(String),
    /// Module parameter disabled by the loaded variable set.
    #[error("module parameter disabled: {0}")]
    ModuleParamDisabled(String),
    /// Write to a read-only module parameter.
    #[error("module parameter is readonly: {0}")]
    ModuleParamReadonly(String),
    /// Read of a write-only module parameter.
    #[error("module parameter is writeonly: {0}")]
    ModuleParamWriteonly(String),
    /// A module task did not finish in its time budget.
    #[error("module task timeout: {0}")]
    ModuleTaskTimeout(String),
    /// Slot number out of range for the crate.
    #[error("invalid module slot number: {0}")]
    ModuleInvalidSlot(String),
    /// No module at the requested address.
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// Unknown test mode.
    #[error("invalid module test: {0}")]
    ModuleTestInvalid(String),

    /// Channel number out of range.
    #[error("invalid channel number: {0}")]
    ChannelNumberInvalid(String),
    /// Unknown channel parameter.
    #[error("invalid channel parameter: {0}")]
    ChannelInvalidParam(String),
    /// Unknown channel variable.
    #[error("invalid channel variable: {0}")]
    ChannelInvalidVar(String),
    /// Channel variable index out of range.
    #[error("invalid channel index: {0}")]
    ChannelInvalidIndex(String),
    /// Channel parameter disabled by the loaded variable set.
    #[error("channel parameter disabled: {0}")]
    ChannelParamDisabled(String),
    /// Write to a read-only channel parameter.
    #[error("channel parameter is readonly: {0}")]
    ChannelParamReadonly(String),
    /// Read of a write-only channel parameter.
    #[error("channel parameter is writeonly: {0}")]
    ChannelParamWriteonly(String),

    /// Device image load failed.
    #[error("device failed to load: {0}")]
    DeviceLoadFailure(String),
    /// Device did not report booted within its time budget.
    #[error("device failed to boot: {0}")]
    DeviceBootFailure(String),
    /// Device initialisation failed.
    #[error("device failed to initialize: {0}")]
    DeviceInitializeFailure(String),
    /// Variable copy between host and device failed.
    #[error("device variable copy failed: {0}")]
    DeviceCopyFailure(String),
    /// Firmware image is unusable.
    #[error("device image failure: {0}")]
    DeviceImageFailure(String),
    /// Register access failed.
    #[error("device hardware failure: {0}")]
    DeviceHwFailure(String),
    /// Block DMA transfer failed.
    #[error("device dma failure: {0}")]
    DeviceDmaFailure(String),
    /// Block DMA engine busy.
    #[error("device dma busy: {0}")]
    DeviceDmaBusy(String),
    /// External FIFO fault.
    #[error("device fifo failure: {0}")]
    DeviceFifoFailure(String),
    /// Module EEPROM access fault.
    #[error("device eeprom failure: {0}")]
    DeviceEepromFailure(String),

    /// Configuration field missing or out of range.
    #[error("invalid config parameter: {0}")]
    ConfigInvalidParam(String),
    /// Configuration field not present.
    #[error("config parameter not found: {0}")]
    ConfigParamNotFound(String),
    /// Configuration JSON malformed.
    #[error("config json error: {0}")]
    ConfigJsonError(String),

    /// File does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// File could not be opened.
    #[error("file open failure: {0}")]
    FileOpenFailure(String),
    /// File could not be read.
    #[error("file read failure: {0}")]
    FileReadFailure(String),
    /// File has an unexpected size.
    #[error("invalid file size: {0}")]
    FileSizeInvalid(String),
    /// File could not be created.
    #[error("file create failure: {0}")]
    FileCreateFailure(String),

    /// Allocation failure.
    #[error("no memory: {0}")]
    NoMemory(String),
    /// Slot map is not a bijection onto the discovered modules.
    #[error("invalid slot map: {0}")]
    SlotMapInvalid(String),
    /// Numeric value out of range.
    #[error("invalid number: {0}")]
    InvalidValue(String),
    /// Operation not supported on this module revision.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Buffer pool has no free buffers.
    #[error("buffer pool empty: {0}")]
    BufferPoolEmpty(String),
    /// Buffer pool already created.
    #[error("buffer pool not empty: {0}")]
    BufferPoolNotEmpty(String),
    /// Buffer pool destroy attempted with buffers in flight.
    #[error("buffer pool busy: {0}")]
    BufferPoolBusy(String),
    /// Queue drain requested more words than queued.
    #[error("buffer pool not enough: {0}")]
    BufferPoolNotEnough(String),

    /// Unclassified failure.
    #[error("unknown error: {0}")]
    UnknownError(String),
    /// An SDK invariant was violated; this is a bug.
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl Error {
    /// Stable API result code. Grouped by subsystem: crate 1xx, module 2xx,
    /// channel 3xx, device 5xx, config 6xx, file 7xx, system 8xx, 9xx
    /// catch-all.
    #[must_use]
    pub const fn api_result(&self) -> i32 {
        match self {
            Self::CrateAlreadyOpen(_) => 100,
            Self::CrateNotReady(_) => 101,
            Self::CrateInvalidParam(_) => 102,

            Self::ModuleNumberInvalid(_) => 200,
            Self::ModuleTotalInvalid(_) => 201,
            Self::ModuleAlreadyOpen(_) => 202,
            Self::ModuleCloseFailure(_) => 203,
            Self::ModuleOffline(_) => 204,
            Self::ModuleInfoFailure(_) => 205,
            Self::ModuleInvalidOperation(_) => 206,
            Self::ModuleInvalidFirmware(_) => 207,
            Self::ModuleInitializeFailure(_) => 208,
            Self::ModuleInvalidParam(_) => 209,
            Self::ModuleInvalidVar(_) => 210,
            Self::ModuleParamDisabled(_) => 211,
            Self::ModuleParamReadonly(_) => 212,
            Self::ModuleParamWriteonly(_) => 213,
            Self::ModuleTaskTimeout(_) => 214,
            Self::ModuleInvalidSlot(_) => 215,
            Self::ModuleNotFound(_) => 216,
            Self::ModuleTestInvalid(_) => 217,

            Self::ChannelNumberInvalid(_) => 300,
            Self::ChannelInvalidParam(_) => 301,
            Self::ChannelInvalidVar(_) => 302,
            Self::ChannelInvalidIndex(_) => 303,
            Self::ChannelParamDisabled(_) => 304,
            Self::ChannelParamReadonly(_) => 305,
            Self::ChannelParamWriteonly(_) => 306,

            Self::DeviceLoadFailure(_) => 500,
            Self::DeviceBootFailure(_) => 501,
            Self::DeviceInitializeFailure(_) => 502,
            Self::DeviceCopyFailure(_) => 503,
            Self::DeviceImageFailure(_) => 504,
            Self::DeviceHwFailure(_) => 505,
            Self::DeviceDmaFailure(_) => 506,
            Self::DeviceDmaBusy(_) => 507,
            Self::DeviceFifoFailure(_) => 508,
            Self::DeviceEepromFailure(_) => 509,

            Self::ConfigInvalidParam(_) => 600,
            Self::ConfigParamNotFound(_) => 601,
            Self::ConfigJsonError(_) => 602,

            Self::FileNotFound(_) => 700,
            Self::FileOpenFailure(_) => 701,
            Self::FileReadFailure(_) => 702,
            Self::FileSizeInvalid(_) => 703,
            Self::FileCreateFailure(_) => 704,

            Self::NoMemory(_) => 800,
            Self::SlotMapInvalid(_) => 801,
            Self::InvalidValue(_) => 802,
            Self::NotSupported(_) => 803,
            Self::BufferPoolEmpty(_) => 804,
            Self::BufferPoolNotEmpty(_) => 805,
            Self::BufferPoolBusy(_) => 806,
            Self::BufferPoolNotEnough(_) => 807,

            Self::UnknownError(_) => 900,
            Self::InternalFailure(_) => 901,
        }
    }

    /// Return code reported across the external boundary: `0 - api_result()`.
    #[must_use]
    pub const fn return_code(&self) -> i32 {
        0 - self.api_result()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ConfigJsonError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped() {
        assert_eq!(Error::CrateAlreadyOpen(String::new()).api_result(), 100);
        assert_eq!(Error::ModuleOffline(String::new()).api_result(), 204);
        assert_eq!(Error::ChannelNumberInvalid(String::new()).api_result(), 300);
        assert_eq!(Error::DeviceDmaBusy(String::new()).api_result(), 507);
        assert_eq!(Error::BufferPoolNotEnough(String::new()).api_result(), 807);
    }

    #[test]
    fn return_code_is_negated() {
        let e = Error::ModuleTaskTimeout("offsets".into());
        assert_eq!(e.return_code(), -214);
    }

    #[test]
    fn display_carries_context() {
        let e = Error::ModuleInvalidOperation("sync wait mismatch".into());
        let text = e.to_string();
        assert!(text.contains("invalid module operation"));
        assert!(text.contains("sync wait"));
    }
}
