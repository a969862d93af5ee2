//! `pixie16` — command-line front-end for Pixie-16 crates.
//!
//! ```text
//! USAGE:
//!   pixie16 --config crate.json init               Discover and report modules
//!   pixie16 --config crate.json boot               Full boot (pattern 0x7F)
//!   pixie16 --config crate.json par-write 0 TRIGGER_THRESHOLD 0 1234.5
//!   pixie16 --config crate.json par-read 0 TRIGGER_THRESHOLD 0
//!   pixie16 --config crate.json adc-save all       ADC traces to CSV
//!   pixie16 --config crate.json mca all 10         Histogram run to CSV
//!   pixie16 --config crate.json list-mode all 5 out
//! ```
//!
//! Exit code is 0 on success, otherwise the positive API result code of
//! the failure (the negated API return value).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pixie16_hw as hw;
use pixie16_sdk::prelude::*;
use pixie16_sdk::{fifo, ChannelParam, Error, ListSaveWorker, ModuleParam, TestFifoWorker};

#[derive(Parser)]
#[command(name = "pixie16", about = "XIA Pixie-16 crate control", version)]
struct Cli {
    /// JSON crate configuration.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Legacy fixed-order text configuration.
    #[arg(long, global = true)]
    legacy: Option<String>,

    /// Run against simulated modules instead of hardware.
    #[arg(long, global = true)]
    offline: bool,

    /// Trace every register access.
    #[arg(long, global = true)]
    reg_trace: bool,

    /// Boot pattern for commands that need a booted crate.
    #[arg(long, global = true, default_value = "0x7F", value_parser = parse_pattern)]
    boot_pattern: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Discover the configured modules and print a report.
    Init,
    /// Boot the crate and print a report.
    Boot,
    /// Probe variable descriptors without loading firmware.
    Probe,
    /// Print the crate report.
    Report,
    /// Read a module or channel parameter.
    ParRead {
        /// Module number.
        module: usize,
        /// Parameter name.
        name: String,
        /// Channel number for channel parameters.
        channel: Option<usize>,
    },
    /// Write a module or channel parameter.
    ParWrite {
        /// Module number.
        module: usize,
        /// Parameter name.
        name: String,
        /// `<value>` for module parameters, `<channel> <value>` for
        /// channel parameters.
        #[arg(num_args = 1..=2)]
        rest: Vec<String>,
    },
    /// Adjust the offset DACs of the selected modules.
    AdjustOffsets {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
    },
    /// Capture ADC traces and save them as CSV.
    AdcSave {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
    },
    /// Capture baselines and save them as CSV.
    BlSave {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
    },
    /// Run MCA histograms for a number of seconds and save them as CSV.
    Mca {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
        /// Run length in seconds.
        seconds: u64,
    },
    /// Save run statistics as CSV.
    Stats {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
    },
    /// Run list mode and stream each module's words to `<name>-<N>.lmd`.
    ListMode {
        /// Module numbers (`all` or comma-separated list).
        modules: String,
        /// Run length in seconds.
        seconds: u64,
        /// Output base name.
        name: String,
    },
    /// Export the parameter state as JSON.
    Export {
        /// Output path.
        path: String,
    },
    /// Import a parameter state export.
    Import {
        /// Input path.
        path: String,
    },
    /// Save the raw DSP parameter blob.
    LsetSave {
        /// Output path.
        path: String,
    },
    /// Load a raw DSP parameter blob.
    LsetLoad {
        /// Input path.
        path: String,
    },
    /// Run a module test.
    Test {
        /// Test mode (`lmfifo`).
        mode: String,
        /// Module numbers (`all` or comma-separated list).
        modules: String,
        /// Words to move per module.
        #[arg(long, default_value_t = 1_000_000)]
        words: usize,
    },
}

fn parse_pattern(s: &str) -> std::result::Result<u8, String> {
    let s = s.trim_start_matches("0x");
    u8::from_str_radix(s, 16).map_err(|e| format!("bad boot pattern: {e}"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("ERROR - {e} (code {})", e.return_code());
        tracing::error!("{e}");
        std::process::exit(e.api_result());
    }
}

fn run(cli: &Cli) -> pixie16_sdk::Result<()> {
    let config = match (&cli.config, &cli.legacy) {
        (Some(path), None) => Config::load_json(path)?,
        (None, Some(path)) => Config::load_legacy(path)?,
        _ => {
            return Err(Error::ConfigInvalidParam(
                "exactly one of --config or --legacy is required".into(),
            ))
        }
    };

    let mut crate_ = Crate::new(config, cli.offline)?;
    crate_.initialize(cli.reg_trace)?;
    crate_.set_firmware()?;

    match &cli.command {
        Cmd::Init => print_report(&crate_),
        Cmd::Probe => {
            crate_.probe()?;
            print_report(&crate_)
        }
        Cmd::Boot | Cmd::Report => {
            crate_.boot(cli.boot_pattern)?;
            print_report(&crate_)
        }
        Cmd::ParRead { module, name, channel } => {
            crate_.boot(cli.boot_pattern)?;
            let module = crate_.module(*module)?;
            if let Some(par) = ModuleParam::lookup(name) {
                let value = module.read_param(par)?;
                println!("{name} = {value} (0x{value:x})");
            } else if let Some(par) = ChannelParam::lookup(name) {
                let channel = channel.ok_or_else(|| {
                    Error::ChannelInvalidParam(format!("{name}: channel required"))
                })?;
                let value = module.read_chan_param(par, channel)?;
                println!("{value}");
            } else {
                return Err(Error::ModuleInvalidParam(name.clone()));
            }
            Ok(())
        }
        Cmd::ParWrite { module, name, rest } => {
            crate_.boot(cli.boot_pattern)?;
            let module = crate_.module(*module)?;
            if let Some(par) = ModuleParam::lookup(name) {
                let value = parse_value(rest.first(), name)?;
                module.write_param(par, value as u32)?;
            } else if let Some(par) = ChannelParam::lookup(name) {
                if rest.len() != 2 {
                    return Err(Error::ChannelInvalidParam(format!(
                        "{name}: expected <channel> <value>"
                    )));
                }
                let channel: usize = rest[0]
                    .parse()
                    .map_err(|e| Error::ChannelNumberInvalid(format!("{}: {e}", rest[0])))?;
                let value = parse_value(rest.get(1), name)?;
                module.write_chan_param(par, channel, value)?;
            } else {
                return Err(Error::ModuleInvalidParam(name.clone()));
            }
            module.sync_vars()?;
            println!("OK");
            Ok(())
        }
        Cmd::AdjustOffsets { modules } => {
            crate_.boot(cli.boot_pattern)?;
            for module in select(&crate_, modules)? {
                module.adjust_offsets()?;
                println!("module {}: offsets adjusted", module.number);
            }
            Ok(())
        }
        Cmd::AdcSave { modules } => {
            crate_.boot(cli.boot_pattern)?;
            for module in select(&crate_, modules)? {
                save_adc(&module)?;
            }
            Ok(())
        }
        Cmd::BlSave { modules } => {
            crate_.boot(cli.boot_pattern)?;
            for module in select(&crate_, modules)? {
                save_baselines(&module)?;
            }
            Ok(())
        }
        Cmd::Mca { modules, seconds } => {
            crate_.boot(cli.boot_pattern)?;
            let selected = select(&crate_, modules)?;
            for module in &selected {
                module.start_histograms(RunMode::New)?;
            }
            std::thread::sleep(Duration::from_secs(*seconds));
            for module in &selected {
                module.run_end()?;
                save_histogram(module)?;
            }
            Ok(())
        }
        Cmd::Stats { modules } => {
            crate_.boot(cli.boot_pattern)?;
            for module in select(&crate_, modules)? {
                module.refresh_stats()?;
                save_stats(&module)?;
            }
            Ok(())
        }
        Cmd::ListMode { modules, seconds, name } => {
            crate_.boot(cli.boot_pattern)?;
            let selected = select(&crate_, modules)?;
            for module in &selected {
                module.adjust_offsets()?;
                module.write_param(ModuleParam::SynchWait, 1)?;
            }
            if let Some(first) = selected.first() {
                first.write_param(ModuleParam::InSynch, 0)?;
            }
            for module in &selected {
                module.sync_vars()?;
            }
            crate_.sync_wait_valid()?;

            let worker = Arc::new(ListSaveWorker {
                seconds: *seconds,
                name: name.clone(),
                run_task: true,
                pool: crate_.pool().clone(),
            });
            let states = fifo::module_threads(&selected, &worker, "list mode run failed")?;
            for state in &states {
                println!(
                    "module {}: {} bytes written",
                    state.number,
                    state.total() * hw::WORD_SIZE
                );
            }

            for module in &selected {
                module.write_param(ModuleParam::SynchWait, 0)?;
            }
            if let Some(first) = selected.first() {
                first.write_param(ModuleParam::InSynch, 1)?;
            }
            for module in &selected {
                module.sync_vars()?;
                save_stats(module)?;
            }
            Ok(())
        }
        Cmd::Export { path } => {
            crate_.boot(cli.boot_pattern)?;
            crate_.export_config(path)?;
            println!("exported to {path}");
            Ok(())
        }
        Cmd::Import { path } => {
            crate_.boot(cli.boot_pattern)?;
            let slots = crate_.import_config(path)?;
            println!("imported slots {slots:?} from {path}");
            Ok(())
        }
        Cmd::LsetSave { path } => {
            crate_.boot(cli.boot_pattern)?;
            crate_.save_dsp_pars(path)?;
            println!("saved DSP parameters to {path}");
            Ok(())
        }
        Cmd::LsetLoad { path } => {
            crate_.boot(cli.boot_pattern)?;
            crate_.load_dsp_pars(path)?;
            println!("loaded DSP parameters from {path}");
            Ok(())
        }
        Cmd::Test { mode, modules, words } => {
            if TestMode::parse(mode) != Some(TestMode::LmFifo) {
                return Err(Error::ModuleTestInvalid(mode.clone()));
            }
            crate_.boot(cli.boot_pattern)?;
            let selected = select(&crate_, modules)?;
            let worker = Arc::new(TestFifoWorker {
                length: *words,
                name: "test-lmfifo".into(),
                pool: crate_.pool().clone(),
            });
            let states = fifo::module_threads(&selected, &worker, "fifo test failed")?;
            for state in &states {
                println!(
                    "module {}: moved {} bytes",
                    state.number,
                    state.total() * hw::WORD_SIZE
                );
            }
            Ok(())
        }
    }
}

fn parse_value(token: Option<&String>, name: &str) -> pixie16_sdk::Result<f64> {
    let token =
        token.ok_or_else(|| Error::ModuleInvalidParam(format!("{name}: value required")))?;
    token
        .parse()
        .map_err(|e| Error::InvalidValue(format!("{name}: {token}: {e}")))
}

fn select(crate_: &Crate, modules: &str) -> pixie16_sdk::Result<Vec<Arc<Module>>> {
    if modules == "all" {
        return Ok(crate_.modules().to_vec());
    }
    modules
        .split(',')
        .map(|tok| {
            let number: usize = tok
                .trim()
                .parse()
                .map_err(|e| Error::ModuleNumberInvalid(format!("{tok}: {e}")))?;
            crate_.module(number)
        })
        .collect()
}

fn print_report(crate_: &Crate) -> pixie16_sdk::Result<()> {
    let mut out = Vec::new();
    crate_
        .report(&mut out)
        .map_err(|e| Error::UnknownError(format!("report: {e}")))?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

fn csv_writer(path: &str) -> pixie16_sdk::Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| Error::FileCreateFailure(format!("{path}: {e}")))
}

fn write_row(out: &mut impl Write, path: &str, row: &str) -> pixie16_sdk::Result<()> {
    writeln!(out, "{row}").map_err(|e| Error::FileCreateFailure(format!("{path}: {e}")))
}

fn save_adc(module: &Module) -> pixie16_sdk::Result<()> {
    let channels = module.num_channels();
    let samples = hw::dsp::MAX_ADC_TRACE_LENGTH;
    let mut traces = vec![vec![0u32; samples]; channels];
    for (ch, trace) in traces.iter_mut().enumerate() {
        module.read_adc(ch, trace, ch > 0)?;
    }

    let path = format!("module{}-adc.csv", module.number);
    let mut out = csv_writer(&path)?;
    let header = std::iter::once("bin".to_string())
        .chain((0..channels).map(|c| format!("Chan{c}")))
        .collect::<Vec<_>>()
        .join(",");
    write_row(&mut out, &path, &header)?;
    for bin in 0..samples {
        let row = std::iter::once(bin.to_string())
            .chain(traces.iter().map(|t| t[bin].to_string()))
            .collect::<Vec<_>>()
            .join(",");
        write_row(&mut out, &path, &row)?;
    }
    println!("module {}: wrote {path}", module.number);
    Ok(())
}

fn save_baselines(module: &Module) -> pixie16_sdk::Result<()> {
    let channels: Vec<usize> = (0..module.num_channels()).collect();
    module.acquire_baselines()?;
    let baselines = module.bl_get(&channels, hw::dsp::MAX_NUM_BASELINES, false)?;

    let path = format!("module{}-baselines.csv", module.number);
    let mut out = csv_writer(&path)?;
    let header = ["sample".to_string(), "time".to_string()]
        .into_iter()
        .chain(channels.iter().map(|c| format!("Chan{c}")))
        .collect::<Vec<_>>()
        .join(",");
    write_row(&mut out, &path, &header)?;
    for (sample, time) in baselines.timestamps.iter().enumerate() {
        let row = [sample.to_string(), format!("{time}")]
            .into_iter()
            .chain(baselines.values.iter().map(|v| format!("{}", v[sample])))
            .collect::<Vec<_>>()
            .join(",");
        write_row(&mut out, &path, &row)?;
    }
    println!("module {}: wrote {path}", module.number);
    Ok(())
}

fn save_histogram(module: &Module) -> pixie16_sdk::Result<()> {
    let channels = module.num_channels();
    let bins = hw::dsp::MAX_HISTOGRAM_LENGTH;
    let mut histograms = vec![vec![0u32; bins]; channels];
    for (ch, histogram) in histograms.iter_mut().enumerate() {
        module.read_histogram(ch, histogram)?;
    }

    let path = format!("module{}-mca.csv", module.number);
    let mut out = csv_writer(&path)?;
    let header = std::iter::once("bin".to_string())
        .chain((0..channels).map(|c| format!("Chan{c}")))
        .collect::<Vec<_>>()
        .join(",");
    write_row(&mut out, &path, &header)?;
    for bin in 0..bins {
        let row = std::iter::once(bin.to_string())
            .chain(histograms.iter().map(|h| h[bin].to_string()))
            .collect::<Vec<_>>()
            .join(",");
        write_row(&mut out, &path, &row)?;
    }
    println!("module {}: wrote {path}", module.number);
    Ok(())
}

fn save_stats(module: &Module) -> pixie16_sdk::Result<()> {
    let stats = module.stats();
    let path = format!("module{}-stats.csv", module.number);
    let mut out = csv_writer(&path)?;
    write_row(
        &mut out,
        &path,
        "channel,real_time,live_time,input_count_rate,output_count_rate",
    )?;
    for channel in 0..module.num_channels() {
        let chan = &stats.chans[channel];
        write_row(
            &mut out,
            &path,
            &format!(
                "{channel},{},{},{},{}",
                stats.real_time,
                chan.live_time,
                chan.input_count_rate(),
                stats.output_count_rate(channel)
            ),
        )?;
    }
    println!("module {}: wrote {path}", module.number);
    Ok(())
}
