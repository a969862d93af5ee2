//! DSP memory geometry.
//!
//! The DSP exposes one flat word-addressed space to the host. Variables
//! live in data memory; control task results land in the IO buffer; MCA
//! histograms and the external FIFO are windows onto external memory.

/// Base address of DSP program memory; code images stream here.
pub const CODE_ADDRESS: u32 = 0x0;
/// Program memory length in words.
pub const CODE_LENGTH: u32 = 0x4_A000;

/// Base address of DSP data memory (where variables live).
pub const DATA_MEMORY_ADDRESS: u32 = 0x4_A000;
/// Data memory length in words.
pub const DATA_MEMORY_LENGTH: u32 = 0x6000;

/// Base address of the DSP IO buffer (control task results).
pub const IO_BUFFER_ADDRESS: u32 = 0x5_0000;
/// IO buffer length in words; holds one full-length trace per channel.
pub const IO_BUFFER_LENGTH: u32 = 0x2_0000;

/// Base of the external FIFO read window.
pub const EXT_FIFO_ADDRESS: u32 = 0x20_0000;
/// External FIFO depth in words.
pub const EXT_FIFO_LENGTH: usize = 131_072;

/// Base of the MCA histogram window. Channel `c`'s spectrum starts at
/// `HISTOGRAM_ADDRESS + c * MAX_HISTOGRAM_LENGTH`.
pub const HISTOGRAM_ADDRESS: u32 = 0x30_0000;
/// Maximum histogram bins per channel.
pub const MAX_HISTOGRAM_LENGTH: usize = 32_768;

/// Maximum ADC trace samples per channel per capture.
pub const MAX_ADC_TRACE_LENGTH: usize = 8_192;

/// Maximum baseline records per capture.
pub const MAX_NUM_BASELINES: usize = 3_640;

/// Words per baseline record: a two-word timestamp followed by one word
/// per channel.
pub const BASELINE_RECORD_WORDS: usize = 2 + crate::pci::MAX_CHANNELS;

/// DSP system clock tick, seconds. Run time counters advance at this rate.
pub const CLOCK_TICK: f64 = 10e-9;

/// Offset DAC full scale (16-bit DAC).
pub const DAC_FULL_SCALE: u32 = 65_535;
/// Offset DAC output span in volts.
pub const DAC_VOLTAGE_RANGE: f64 = 3.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_do_not_overlap() {
        let data_end = DATA_MEMORY_ADDRESS + DATA_MEMORY_LENGTH;
        assert!(data_end <= IO_BUFFER_ADDRESS);
        let io_end = IO_BUFFER_ADDRESS + IO_BUFFER_LENGTH;
        assert!(io_end <= EXT_FIFO_ADDRESS);
        assert!(EXT_FIFO_ADDRESS < HISTOGRAM_ADDRESS);
    }

    #[test]
    fn baseline_record_fits_io_buffer() {
        assert!(MAX_NUM_BASELINES * BASELINE_RECORD_WORDS <= IO_BUFFER_LENGTH as usize);
    }
}
