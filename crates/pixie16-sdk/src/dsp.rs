//! DSP code loader.
//!
//! The DSP is held in download mode while its code image streams into
//! program memory, then released from reset; the boot completes when the
//! CSR reports the DSP's power-up initialisation done.

use std::time::{Duration, Instant};

use bytes::Bytes;
use pixie16_hw as hw;
use pixie16_hw::regs::{self, csr};
use tracing::debug;

use crate::bus::BusDriver;
use crate::error::{Error, Result};
use crate::fpga::image_words;

/// Wall-clock budget for the DSP to come out of reset.
const READY_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll period while waiting for DSP ready.
const READY_POLL: Duration = Duration::from_millis(10);

/// Load a DSP code image and release the DSP. The caller must hold the
/// module's bus guard.
///
/// # Errors
///
/// Returns `DeviceImageFailure` for an empty or oversized image,
/// `DeviceLoadFailure` if the stream faults and `DeviceBootFailure` if the
/// DSP never reports ready.
pub fn load(bus: &dyn BusDriver, image: &Bytes) -> Result<()> {
    if image.is_empty() {
        return Err(Error::DeviceImageFailure("dsp: empty code image".into()));
    }
    let words = image_words(image);
    if words.len() > hw::dsp::CODE_LENGTH as usize {
        return Err(Error::DeviceImageFailure(format!(
            "dsp: code image too large: {} words",
            words.len()
        )));
    }

    let current = bus.read_word(regs::CSR)?;
    bus.write_word(regs::CSR, current | csr::DSP_DOWNLOAD)?;
    bus.block_write(hw::dsp::CODE_ADDRESS, &words)
        .map_err(|e| Error::DeviceLoadFailure(format!("dsp: {e}")))?;
    bus.write_word(regs::CSR, (current & !csr::DSP_DOWNLOAD) | csr::DSP_RELEASE)?;

    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        if bus.read_word(regs::CSR)? & csr::DSP_READY != 0 {
            debug!("dsp: booted ({} words)", words.len());
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::DeviceBootFailure(
                "dsp: never reported power-up init done".into(),
            ));
        }
        std::thread::sleep(READY_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buses::{SimBus, SimConfig};

    #[test]
    fn dsp_boots_on_sim() {
        let bus = SimBus::new(SimConfig::default());
        load(&bus, &Bytes::from(vec![0x5A; 256])).unwrap();
        assert_ne!(bus.read_word(regs::CSR).unwrap() & csr::DSP_READY, 0);
    }

    #[test]
    fn empty_image_rejected() {
        let bus = SimBus::new(SimConfig::default());
        assert_eq!(load(&bus, &Bytes::new()).unwrap_err().api_result(), 504);
    }
}
