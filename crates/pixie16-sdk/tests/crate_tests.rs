//! End-to-end tests against simulated crates.

use std::sync::Arc;
use std::time::Duration;

use pixie16_hw as hw;
use pixie16_sdk::config::{Config, DspConfig, FpgaConfig, ModuleConfig};
use pixie16_sdk::fifo::{self, ListSaveWorker};
use pixie16_sdk::module::boot_pattern;
use pixie16_sdk::param;
use pixie16_sdk::{
    Backplane, ChannelParam, Crate, Device, Firmware, Module, ModuleParam, SimBus, SimConfig,
};

fn offline_config(slots: &[usize]) -> Config {
    Config {
        modules: slots
            .iter()
            .map(|&slot| ModuleConfig {
                slot,
                dsp: DspConfig {
                    ldr: "dsp.ldr".into(),
                    par: "dsp.par".into(),
                    var: "dsp.var".into(),
                },
                fpga: FpgaConfig { sys: "sys.bin".into(), fippi: "fippi.bin".into() },
                fw: None,
            })
            .collect(),
    }
}

fn booted_crate(slots: &[usize]) -> Crate {
    let mut crate_ = Crate::new(offline_config(slots), true).unwrap();
    crate_.initialize(false).unwrap();
    crate_.set_firmware().unwrap();
    crate_.boot(boot_pattern::FULL).unwrap();
    crate_
}

fn temp_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("pixie16-crate-tests");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

#[test]
fn parameter_round_trip_through_export_and_import() {
    let crate_ = {
        let mut c = Crate::new(offline_config(&[2, 3]), true).unwrap();
        c.initialize(false).unwrap();
        c.set_firmware().unwrap();
        c.boot(boot_pattern::FULL).unwrap();
        c
    };
    let module = crate_.module(0).unwrap();

    module.write_chan_param(ChannelParam::TriggerThreshold, 0, 1234.5).unwrap();
    module.sync_vars().unwrap();
    let read = module.read_chan_param(ChannelParam::TriggerThreshold, 0).unwrap();
    assert!((read - 1234.5).abs() < 1e-3, "read back {read}");

    let path = temp_path("s1.json");
    crate_.export_config(&path).unwrap();
    crate_.import_config(&path).unwrap();
    let again = module.read_chan_param(ChannelParam::TriggerThreshold, 0).unwrap();
    assert!((again - read).abs() < f64::EPSILON);
}

#[test]
fn export_import_export_is_byte_equal() {
    let crate_ = booted_crate(&[2, 3]);
    crate_
        .module(1)
        .unwrap()
        .write_chan_param(ChannelParam::Tau, 7, 55.0)
        .unwrap();
    crate_.module(1).unwrap().sync_vars().unwrap();

    let first = temp_path("export-1.json");
    let second = temp_path("export-2.json");
    crate_.export_config(&first).unwrap();
    crate_.import_config(&first).unwrap();
    crate_.export_config(&second).unwrap();
    assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
}

#[test]
fn backplane_leader_election_is_exclusive() {
    let crate_ = booted_crate(&[2, 3]);
    let run = &crate_.backplane().run;
    assert!(run.request(0));
    assert!(!run.request(1));
    assert!(run.release(0));
    assert!(run.request(1));
}

#[test]
fn sync_wait_partial_set_is_invalid() {
    let crate_ = booted_crate(&[2, 3]);
    crate_.module(0).unwrap().write_param(ModuleParam::SynchWait, 1).unwrap();
    let err = crate_.sync_wait_valid().unwrap_err();
    assert_eq!(err.api_result(), 206);
    assert!(err.to_string().contains("sync wait"));

    crate_.module(1).unwrap().write_param(ModuleParam::SynchWait, 1).unwrap();
    crate_.sync_wait_valid().unwrap();
}

#[test]
fn dsp_parameter_blob_round_trips_bitwise() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();
    module.write_chan_param(ChannelParam::Emin, 3, 777.0).unwrap();
    module.sync_vars().unwrap();
    let before = module.save_dsp_pars().unwrap();

    let path = temp_path("pars.lset");
    crate_.save_dsp_pars(&path).unwrap();

    module.write_chan_param(ChannelParam::Emin, 3, 1.0).unwrap();
    module.sync_vars().unwrap();
    assert_ne!(module.save_dsp_pars().unwrap(), before);

    crate_.load_dsp_pars(&path).unwrap();
    assert_eq!(module.save_dsp_pars().unwrap(), before);
}

#[test]
fn equal_value_write_still_dirties_and_flushes() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();
    let value = module.read_param(ModuleParam::SlowFilterRange).unwrap();
    assert_eq!(module.dirty_cells(), 0);
    module.write_param(ModuleParam::SlowFilterRange, value).unwrap();
    assert_eq!(module.dirty_cells(), 1);
    module.sync_vars().unwrap();
    assert_eq!(module.dirty_cells(), 0);
}

#[test]
fn empty_fifo_read_returns_zero_and_keeps_totals() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();
    let mut out = Vec::new();
    assert_eq!(module.read_list_mode(&mut out).unwrap(), 0);
    assert!(out.is_empty());
    let stats = module.stats();
    assert_eq!(stats.fifo_in, 0);
    assert_eq!(stats.fifo_out, 0);
}

fn sim_module_with_bus(rate: f64) -> (Arc<Module>, Arc<SimBus>) {
    let bus = Arc::new(SimBus::new(SimConfig { fifo_rate: rate, ..SimConfig::default() }));
    let module = Arc::new(Module::new(0, 2, bus.clone(), Arc::new(Backplane::default())));
    module.open().unwrap();
    let firmwares = [Device::Sys, Device::Fippi, Device::Dsp, Device::Var].map(|device| {
        let fw = Firmware::new("sim", hw::pci::revision::F, device);
        if device == Device::Var {
            fw.set_image(param::default_var_listing().into_bytes());
        } else {
            fw.set_image(vec![0x5Au8; 128]);
        }
        Arc::new(fw)
    });
    module.set_firmware(firmwares.to_vec());
    (module, bus)
}

#[test]
fn full_boot_runs_all_stages_and_fast_skips_only_fpgas() {
    use pixie16_sdk::BusDriver;

    let dsp_booted = |bus: &SimBus| {
        bus.read_word(hw::regs::CSR).unwrap() & hw::regs::csr::DSP_READY != 0
    };

    let (module, bus) = sim_module_with_bus(1000.0);
    module.boot(boot_pattern::FULL).unwrap();
    assert!(module.online());
    // The FiPPI loader runs last; its done pattern stays latched.
    assert_eq!(bus.read_word(hw::regs::CFG_RDCS).unwrap(), 0x5A0);
    assert!(dsp_booted(&bus));

    let (module, bus) = sim_module_with_bus(1000.0);
    module.boot(boot_pattern::FAST).unwrap();
    assert!(module.online());
    // No FPGA pass touched the configuration port, but the DSP code
    // still streamed and released the DSP.
    assert_eq!(bus.read_word(hw::regs::CFG_RDCS).unwrap(), 0);
    assert!(dsp_booted(&bus));

    // Without the DSP code bit the DSP is never released.
    let (module, bus) = sim_module_with_bus(1000.0);
    module
        .boot(boot_pattern::DSP_PARAMS | boot_pattern::PROGRAM_FIPPI | boot_pattern::SET_DACS)
        .unwrap();
    assert!(module.online());
    assert!(!dsp_booted(&bus));
}

#[test]
fn boot_pattern_zero_leaves_module_offline() {
    let (module, _bus) = sim_module_with_bus(1000.0);
    module.boot(0).unwrap();
    assert!(!module.online());
}

#[test]
fn adjust_offsets_converges_on_simulated_frontend() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();
    module.adjust_offsets().unwrap();

    // The adjusted DAC puts the baseline at BaselinePercent of ADC range.
    let info = module.device_info().unwrap().clone();
    let adc_max = f64::from((1u32 << info.adc_bits) - 1);
    module.acquire_baselines().unwrap();
    let baselines = module.bl_get(&[0], 10, false).unwrap();
    let target = adc_max * 0.10;
    let got = baselines.values[0][0];
    assert!(
        (got - target).abs() <= adc_max / 256.0,
        "baseline {got} not near target {target}"
    );
}

#[test]
fn adc_traces_and_histograms_have_expected_shapes() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();

    let mut trace = vec![0u32; 256];
    module.read_adc(0, &mut trace, false).unwrap();
    assert!(trace.iter().any(|&s| s > 0));

    module.start_histograms(pixie16_hw::run::RunMode::New).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    module.run_end().unwrap();
    let mut histogram = vec![0u32; 1024];
    module.read_histogram(0, &mut histogram).unwrap();
    let peak = histogram.iter().enumerate().max_by_key(|(_, &v)| v).unwrap().0;
    assert_eq!(peak, 100);
}

#[test]
fn list_mode_run_matches_generator_rate() {
    let seconds = 2u64;
    let rate = 1000.0;
    let (module, _bus) = sim_module_with_bus(rate);
    module.probe().unwrap();

    let pool = pixie16_sdk::Pool::new();
    pool.create(4, hw::dsp::EXT_FIFO_LENGTH).unwrap();
    let base = temp_path("s5");
    let worker = Arc::new(ListSaveWorker {
        seconds,
        name: base.to_string_lossy().into_owned(),
        run_task: true,
        pool,
    });
    let states =
        fifo::module_threads(std::slice::from_ref(&module), &worker, "list mode failed").unwrap();

    let total = states[0].total();
    let expected = rate * seconds as f64;
    let slack = expected * 0.15 + 50.0;
    assert!(
        (total as f64 - expected).abs() < slack,
        "{total} words for {expected} expected"
    );

    let file = std::fs::metadata(temp_path("s5-0.lmd")).unwrap();
    assert_eq!(file.len() as usize, total * hw::WORD_SIZE);

    let stats = module.stats();
    assert_eq!(stats.overflows, 0);
    assert_eq!(stats.hw_overflows, 0);
    assert_eq!(stats.fifo_in, stats.fifo_out);
    assert!(stats.real_time > 0.0);
}

#[test]
fn channel_copy_carries_selected_groups() {
    let crate_ = booted_crate(&[2]);
    let module = crate_.module(0).unwrap();
    module.write_chan_param(ChannelParam::Emin, 0, 500.0).unwrap();

    let source = module.channel_variables(0);
    let mut dest = module.channel_variables(5);
    param::copy_parameters(param::filter_mask::HISTOGRAM_CONTROL, &source, &mut dest);
    module.set_channel_variables(5, dest);

    let copied = module.read_chan_param(ChannelParam::Emin, 5).unwrap();
    assert!((copied - 500.0).abs() < f64::EPSILON);
    assert!(module.dirty_cells() > 0);
}

#[test]
fn offline_crate_runs_without_firmware_files() {
    // No dsp.ldr / sys.bin etc. exist on disk; the offline crate must not
    // try to read them.
    let crate_ = booted_crate(&[2, 3, 4]);
    assert_eq!(crate_.num_modules(), 3);
    for module in crate_.modules() {
        assert!(module.online());
    }
}
