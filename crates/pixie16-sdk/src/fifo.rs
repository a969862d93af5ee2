//! List-mode FIFO workers.
//!
//! One worker thread per participating module, plus a supervising thread.
//! Workers poll their module's external FIFO at a constant period and
//! stream words to their output file; the supervisor collects terminal
//! results over a channel, logs live throughput every few seconds, joins
//! everything, then re-raises the first error. Cancellation is
//! cooperative: a stop flag checked each poll iteration, never a kill.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use pixie16_hw::WORD_SIZE;
use pixie16_hw::run::RunMode;
use tracing::{info, warn};

use crate::buffer::Pool;
use crate::error::{Error, Result};
use crate::module::{Module, TestMode};
use crate::util::humanize;

/// Poll period for list-mode save workers.
const LIST_POLL: Duration = Duration::from_millis(1);
/// Poll period for FIFO throughput test workers.
const TEST_POLL: Duration = Duration::from_millis(10);
/// Supervisor sweep period.
const SWEEP: Duration = Duration::from_millis(20);
/// Throughput report interval.
const REPORT_EVERY: Duration = Duration::from_secs(5);
/// Budget for the DSP to produce its first list-mode words after start.
const RUN_START_WAIT: Duration = Duration::from_secs(1);

/// Telemetry shared between a worker thread and its supervisor.
#[derive(Debug)]
pub struct WorkerState {
    /// Module number.
    pub number: usize,
    /// Module slot.
    pub slot: usize,
    running: AtomicBool,
    stop: AtomicBool,
    total: AtomicUsize,
    last_total: AtomicUsize,
}

impl WorkerState {
    fn new(module: &Module) -> Self {
        Self {
            number: module.number,
            slot: module.slot,
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            total: AtomicUsize::new(0),
            last_total: AtomicUsize::new(0),
        }
    }

    /// Whether the worker thread is still inside its loop.
    #[must_use]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request a cooperative stop; takes effect at the next poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Total words this worker has moved.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    fn add(&self, words: usize) {
        self.total.fetch_add(words, Ordering::AcqRel);
    }
}

/// A per-module worker body run on its own OS thread.
pub trait ModuleWorker: Send + Sync + 'static {
    /// The worker loop. Poll the stop flag; never block indefinitely.
    ///
    /// # Errors
    ///
    /// A worker error is collected by the supervisor and re-raised after
    /// all workers join.
    fn work(&self, module: &Module, state: &WorkerState) -> Result<()>;
}

/// Run one worker per module with a supervising loop; returns the worker
/// states for final reporting.
///
/// # Errors
///
/// After all workers join, re-raises the first worker error wrapped with
/// `error_message`.
pub fn module_threads<W: ModuleWorker>(
    modules: &[Arc<Module>],
    worker: &Arc<W>,
    error_message: &str,
) -> Result<Vec<Arc<WorkerState>>> {
    let states: Vec<Arc<WorkerState>> =
        modules.iter().map(|m| Arc::new(WorkerState::new(m))).collect();
    let (tx, rx) = bounded::<(usize, Result<()>)>(modules.len());
    let mut threads = Vec::with_capacity(modules.len());

    for (idx, module) in modules.iter().enumerate() {
        let module = module.clone();
        let state = states[idx].clone();
        let worker = worker.clone();
        let tx = tx.clone();
        threads.push(thread::spawn(move || {
            state.running.store(true, Ordering::Release);
            let result = worker.work(&module, &state);
            state.running.store(false, Ordering::Release);
            let _ = tx.send((idx, result));
        }));
    }
    drop(tx);

    let mut first_error: Option<Error> = None;
    let mut finished = 0;
    let started = Instant::now();
    let mut last_report = Instant::now();
    while finished < threads.len() {
        match rx.recv_timeout(SWEEP) {
            Ok((idx, result)) => {
                finished += 1;
                if let Err(e) = result {
                    warn!("module {}: worker error: {e}", states[idx].number);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_report.elapsed() >= REPORT_EVERY {
            let secs = last_report.elapsed().as_secs_f64();
            last_report = Instant::now();
            let mut all_total = 0usize;
            for state in &states {
                let total = state.total();
                let delta = total - state.last_total.swap(total, Ordering::AcqRel);
                all_total += total;
                let active = if state.running() { '>' } else { ' ' };
                info!(
                    "{active}{:2}: total: {:>8} rate: {:>8} bytes/sec",
                    state.number,
                    humanize((total * WORD_SIZE) as f64),
                    humanize(delta as f64 * WORD_SIZE as f64 / secs),
                );
            }
            info!(
                "all: total: {:>8} rate: {:>8} bytes/sec",
                humanize((all_total * WORD_SIZE) as f64),
                humanize(all_total as f64 * WORD_SIZE as f64 / started.elapsed().as_secs_f64()),
            );
        }
    }
    for thread in threads {
        let _ = thread.join();
    }

    match first_error {
        Some(e) => {
            warn!("{error_message}");
            Err(e)
        }
        None => Ok(states),
    }
}

/// Worker that saves list-mode data to one file per module.
#[derive(Debug)]
pub struct ListSaveWorker {
    /// Run length in seconds.
    pub seconds: u64,
    /// Output base path; the module number and `.lmd` are appended.
    pub name: String,
    /// Whether this worker starts and ends the run. Non-run-task workers
    /// only drain.
    pub run_task: bool,
    /// Buffer pool the worker borrows its read buffer from.
    pub pool: Arc<Pool>,
}

impl ListSaveWorker {
    fn output_path(&self, module: &Module) -> PathBuf {
        PathBuf::from(format!("{}-{}.lmd", self.name, module.number))
    }
}

impl ModuleWorker for ListSaveWorker {
    fn work(&self, module: &Module, state: &WorkerState) -> Result<()> {
        let path = self.output_path(module);
        let file = File::create(&path)
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))?;
        let mut out = BufWriter::new(file);

        if self.run_task {
            module.start_listmode(RunMode::New)?;
            // Give the DSP time to come up before concluding the FIFO is
            // dry; the poll loop proper starts only after this.
            let deadline = Instant::now() + RUN_START_WAIT;
            while Instant::now() < deadline && module.read_list_mode_level()? == 0 {
                thread::sleep(LIST_POLL);
            }
        }

        let mut buffer = self.pool.request()?;
        let period = Instant::now();
        while period.elapsed().as_secs() < self.seconds && !state.stopped() {
            buffer.clear();
            if module.read_list_mode(&mut buffer)? > 0 {
                write_words(&mut out, &buffer, &path)?;
                state.add(buffer.len());
            } else {
                thread::sleep(LIST_POLL);
            }
        }

        if self.run_task {
            module.run_end()?;
            buffer.clear();
            if module.read_list_mode(&mut buffer)? > 0 {
                write_words(&mut out, &buffer, &path)?;
                state.add(buffer.len());
            }
            let stats = module.stats();
            info!("list-mode: {}: {stats}", module.number);
            if stats.hw_overflows != 0 {
                return Err(Error::ModuleInvalidOperation(format!(
                    "module {}: external FIFO overflow",
                    module.number
                )));
            }
            if stats.overflows != 0 {
                return Err(Error::ModuleInvalidOperation(format!(
                    "module {}: host buffer overflow",
                    module.number
                )));
            }
            if stats.fifo_in != stats.fifo_out {
                return Err(Error::ModuleInvalidOperation(format!(
                    "module {}: data left in FIFO pipeline",
                    module.number
                )));
            }
        }
        out.flush()
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

/// Worker that measures FIFO throughput via the `lm_fifo` test mode until
/// a target word count is reached.
#[derive(Debug)]
pub struct TestFifoWorker {
    /// Words to move before finishing.
    pub length: usize,
    /// Output base path; the module number and `.bin` are appended.
    pub name: String,
    /// Buffer pool the worker borrows its read buffer from.
    pub pool: Arc<Pool>,
}

impl ModuleWorker for TestFifoWorker {
    fn work(&self, module: &Module, state: &WorkerState) -> Result<()> {
        let path = PathBuf::from(format!("{}-{}.bin", self.name, module.number));
        let file = File::create(&path)
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))?;
        let mut out = BufWriter::new(file);

        module.start_test(TestMode::LmFifo)?;
        let result = (|| -> Result<()> {
            let mut buffer = self.pool.request()?;
            while state.total() < self.length && !state.stopped() {
                if module.read_list_mode_level()? > 0 {
                    buffer.clear();
                    module.read_list_mode(&mut buffer)?;
                    write_words(&mut out, &buffer, &path)?;
                    state.add(buffer.len());
                } else {
                    thread::sleep(TEST_POLL);
                }
            }
            Ok(())
        })();
        module.end_test()?;
        result
    }
}

fn write_words(out: &mut impl Write, words: &[u32], path: &std::path::Path) -> Result<()> {
    for word in words {
        out.write_all(&word.to_le_bytes())
            .map_err(|e| Error::FileCreateFailure(format!("{}: {e}", path.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::Backplane;
    use crate::buses::{SimBus, SimConfig};
    use crate::firmware::{Device, Firmware};
    use crate::param;
    use std::sync::Arc;

    fn sim_module(rate: f64) -> Arc<Module> {
        let config = SimConfig { fifo_rate: rate, ..SimConfig::default() };
        let bus = Arc::new(SimBus::new(config));
        let module = Arc::new(Module::new(0, 2, bus, Arc::new(Backplane::default())));
        module.open().unwrap();
        let var = Firmware::new("sim", pixie16_hw::pci::revision::F, Device::Var);
        var.set_image(param::default_var_listing().into_bytes());
        module.set_firmware(vec![Arc::new(var)]);
        module.probe().unwrap();
        module
    }

    #[test]
    fn test_fifo_worker_reaches_target() {
        let module = sim_module(1000.0);
        let pool = Pool::new();
        pool.create(2, 65536).unwrap();
        let dir = std::env::temp_dir().join("pixie16-fifo-test");
        std::fs::create_dir_all(&dir).unwrap();
        let worker = Arc::new(TestFifoWorker {
            length: 50_000,
            name: dir.join("tfw").to_string_lossy().into_owned(),
            pool,
        });
        let states = module_threads(std::slice::from_ref(&module), &worker, "fifo test").unwrap();
        assert!(states[0].total() >= 50_000);
        let written = std::fs::metadata(dir.join("tfw-0.bin")).unwrap().len();
        assert_eq!(written as usize, states[0].total() * WORD_SIZE);
    }

    #[test]
    fn stop_flag_ends_worker_early() {
        let module = sim_module(10.0);
        let pool = Pool::new();
        pool.create(1, 65536).unwrap();
        let dir = std::env::temp_dir().join("pixie16-fifo-stop");
        std::fs::create_dir_all(&dir).unwrap();
        let worker = Arc::new(ListSaveWorker {
            seconds: 3600,
            name: dir.join("stop").to_string_lossy().into_owned(),
            run_task: true,
            pool,
        });

        let state = Arc::new(WorkerState::new(&module));
        let module2 = module.clone();
        let worker2 = worker.clone();
        let state2 = state.clone();
        let t = std::thread::spawn(move || worker2.work(&module2, &state2));
        std::thread::sleep(Duration::from_millis(200));
        state.stop();
        t.join().unwrap().unwrap();
        assert!(!module.run_active());
    }
}
