//! Run task, control task and run mode codes.
//!
//! A data run is selected by writing the `RunTask` variable and raising
//! `CSR.RUN_ENABLE`; a control task is selected by writing `ControlTask`
//! with `RunTask == 0`. The DSP clears `RUN_ACTIVE` when a control task
//! completes; data runs stay active until the host drops `RUN_ENABLE`.

/// Data run tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunTask {
    /// No run.
    Nop = 0,
    /// List mode — event-by-event streaming into the external FIFO.
    ListMode = 0x100,
    /// MCA histogram run.
    Histogram = 0x301,
}

/// Control tasks executed by the DSP while no data run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlTask {
    /// Program the offset and gain DACs from the variable values.
    SetDacs = 0,
    /// Enable the analog input stage.
    EnableInput = 1,
    /// Ramp the offset DACs across their range.
    RampOffsetDacs = 3,
    /// Capture raw ADC traces into the IO buffer.
    GetTraces = 4,
    /// Reprogram the FiPPI filter registers from the variable values.
    ProgramFippi = 5,
    /// Capture baselines into the IO buffer.
    GetBaselines = 6,
    /// Continuously fill the external FIFO with synthetic data.
    FillExtFifo = 11,
    /// Reset the ADCs.
    ResetAdc = 23,
}

/// Run start mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunMode {
    /// Resume the previous run, keeping histograms and counters.
    Resume = 0,
    /// Start a new run, clearing histograms and counters.
    New = 1,
}

impl RunTask {
    /// Raw code written to the `RunTask` variable.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl ControlTask {
    /// Raw code written to the `ControlTask` variable.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl RunMode {
    /// Raw code written to the `Resume` variable.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_codes() {
        assert_eq!(RunTask::ListMode.code(), 0x100);
        assert_eq!(RunTask::Histogram.code(), 0x301);
        assert_eq!(ControlTask::GetBaselines.code(), 6);
        assert_eq!(RunMode::New.code(), 1);
    }
}
