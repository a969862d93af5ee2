//! Run statistics.
//!
//! Timing counters come from the DSP's output variables as 48-bit A/B word
//! pairs advancing at the DSP clock tick; FIFO and overflow counters are
//! tracked host-side by the module's list-mode reader.

use std::fmt;

use pixie16_hw as hw;
use pixie16_hw::pci::MAX_CHANNELS;

/// Join a DSP A/B counter pair into seconds.
#[must_use]
pub fn counter_seconds(a: u32, b: u32) -> f64 {
    (f64::from(a) * f64::from(u32::MAX) + f64::from(a) + f64::from(b)) * hw::dsp::CLOCK_TICK
}

/// Join a DSP A/B counter pair into a raw count.
#[must_use]
pub fn counter_value(a: u32, b: u32) -> f64 {
    f64::from(a) * f64::from(u32::MAX) + f64::from(a) + f64::from(b)
}

/// Per-channel statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Seconds the channel was able to accept triggers.
    pub live_time: f64,
    /// Fast trigger (input) count.
    pub fast_peaks: f64,
    /// Accepted event (output) count.
    pub chan_events: f64,
}

impl ChannelStats {
    /// Input count rate in counts/second.
    #[must_use]
    pub fn input_count_rate(&self) -> f64 {
        if self.live_time > 0.0 { self.fast_peaks / self.live_time } else { 0.0 }
    }
}

/// Per-module run statistics.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Seconds the run was active.
    pub real_time: f64,
    /// Per-channel counters.
    pub chans: [ChannelStats; MAX_CHANNELS],
    /// External FIFO overflows reported by the hardware.
    pub hw_overflows: usize,
    /// Host-side buffer overflows.
    pub overflows: usize,
    /// Words read out of the external FIFO.
    pub fifo_in: usize,
    /// Words handed to the caller.
    pub fifo_out: usize,
}

impl RunStats {
    /// Output count rate for a channel in counts/second.
    #[must_use]
    pub fn output_count_rate(&self, channel: usize) -> f64 {
        if self.real_time > 0.0 {
            self.chans[channel].chan_events / self.real_time
        } else {
            0.0
        }
    }

    /// Reset all counters for a new run.
    pub fn start(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "real-time={:.3}s hw-overflows={} overflows={} fifo: in={} out={}",
            self.real_time, self.hw_overflows, self.overflows, self.fifo_in, self.fifo_out
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_pair_scales_by_clock_tick() {
        // 1e8 ticks at 10 ns = 1 second.
        let secs = counter_seconds(0, 100_000_000);
        assert!((secs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rates_guard_zero_time() {
        let stats = RunStats::default();
        assert_eq!(stats.output_count_rate(0), 0.0);
        assert_eq!(stats.chans[0].input_count_rate(), 0.0);
    }

    #[test]
    fn display_names_fifo_totals() {
        let mut stats = RunStats::default();
        stats.fifo_in = 10;
        stats.fifo_out = 10;
        assert!(stats.to_string().contains("in=10 out=10"));
    }
}
