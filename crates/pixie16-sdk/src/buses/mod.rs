//! Bus driver implementations.
//!
//! ```text
//! Hardware:
//!   MmioBus — maps the module's PCI BAR via sysfs, volatile word access
//!
//! Development / CI:
//!   SimBus  — full software model of a module; no hardware required
//! ```

pub mod mmio;
pub mod sim;

pub use mmio::MmioBus;
pub use sim::{SimBus, SimConfig};
