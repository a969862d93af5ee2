//! Host-side SDK for crates of XIA Pixie-16 digital pulse processors.
//!
//! The crate runtime owns the collection of modules, their firmware
//! images, the parameter/variable model with host-side caching and DSP
//! addressing, the FPGA/DSP boot controllers, the backplane coordination
//! protocol and the threaded list-mode FIFO pipeline.
//!
//! # Bus hierarchy
//!
//! ```text
//! Hardware:
//!   MmioBus — memory-mapped PCI register window via sysfs
//!
//! Development / CI:
//!   SimBus  — full software model of a module, no hardware required
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use pixie16_sdk::prelude::*;
//!
//! # fn main() -> pixie16_sdk::Result<()> {
//! let config = Config::load_json("crate.json")?;
//! let mut crate_ = Crate::new(config, false)?;
//! crate_.initialize(false)?;
//! crate_.set_firmware()?;
//! crate_.boot(boot_pattern::FULL)?;
//!
//! let module = crate_.module(0)?;
//! module.write_chan_param(ChannelParam::TriggerThreshold, 0, 1234.5)?;
//! module.sync_vars()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod backplane;
pub mod buffer;
pub mod bus;
pub mod buses;
pub mod chassis;
pub mod config;
mod dsp;
pub mod error;
pub mod fifo;
pub mod firmware;
pub mod fpga;
pub mod module;
pub mod param;
pub mod stats;
mod util;

pub use backplane::Backplane;
pub use buffer::{Handle, Pool, Queue};
pub use bus::{BusDriver, BusGuard, DeviceInfo};
pub use buses::{MmioBus, SimBus, SimConfig};
pub use chassis::Crate;
pub use config::Config;
pub use error::{Error, Result};
pub use fifo::{ListSaveWorker, ModuleWorker, TestFifoWorker, WorkerState};
pub use firmware::{Device, Firmware, FirmwareRef, Registry};
pub use module::{boot_pattern, Baselines, Module, TestMode};
pub use param::{ChannelParam, ChannelVar, ModuleParam, ModuleVar, SystemParam};
pub use stats::RunStats;

/// Commonly used types.
pub mod prelude {
    pub use crate::chassis::Crate;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::module::{boot_pattern, Module, TestMode};
    pub use crate::param::{ChannelParam, ModuleParam};
    pub use pixie16_hw::run::RunMode;
}
