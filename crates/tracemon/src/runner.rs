//! Fault-tolerant session runners
//!
//! A runner owns one remote session and drives a [`SessionFlow`] against
//! it on a fixed interval, producing pending writes for the persistence
//! pipeline. Connection lifecycle, interval pacing and the rolling fault
//! budget all live here; the transport below it stays a dumb pipe.
//!
//! Cancellation is dual: an external flag shared with the whole run, and
//! an internal one tripped by [`RunnerHandle::stop`] or by the fault
//! budget. Either flag ends the worker after the current command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use crate::config::RunnerConfig;
use crate::error::{ConfigError, Result, RunnerError};
use crate::flow::{FlowStage, ParseContext, SessionFlow};
use crate::schema::DB_DATETIME_FORMAT;
use crate::store::StoreHandle;
use crate::transport::Transport;

/// Cancellable sleeps are cut into slices no longer than this
const SLEEP_SLICE: Duration = Duration::from_millis(500);

/// Where a runner currently is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Disconnected,
    Connecting,
    Connected,
    Executing,
    Disconnecting,
    /// A connect or command failed; the fault was recorded
    Faulted,
    /// The worker thread has finished
    Stopped,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Executing => "executing",
            Self::Disconnecting => "disconnecting",
            Self::Faulted => "faulted",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the remote session is held across the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// One session for the whole run; reconnect only after a fault
    Persistent,
    /// A dedicated session per stage run: setup, every tick, teardown
    Interrupt,
}

#[derive(Debug)]
struct RunnerShared {
    state: Mutex<RunnerState>,
    fatal: Mutex<Option<String>>,
}

/// Entry point for launching session runner threads
pub struct SessionRunner;

impl SessionRunner {
    /// Validate the configuration and launch the worker thread
    ///
    /// Fails fast, before any connection attempt, when the config is
    /// invalid or the flow has no periodic commands.
    pub fn spawn(
        config: &RunnerConfig,
        flow: SessionFlow,
        transport: Box<dyn Transport>,
        store: StoreHandle,
        host_id: i64,
        external_cancel: Arc<AtomicBool>,
    ) -> Result<RunnerHandle> {
        config.validate()?;
        if !flow.has_commands() {
            return Err(ConfigError::EmptyCommandSet(config.name.clone()).into());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState::Disconnected),
            fatal: Mutex::new(None),
        });
        let worker = Worker {
            name: config.name.clone(),
            mode: config.mode,
            interval: config.interval(),
            command_delay: config.command_delay(),
            fault_tolerance: config.fault_tolerance,
            flow,
            transport,
            store,
            host_id,
            external_cancel,
            cancel: Arc::clone(&cancel),
            shared: Arc::clone(&shared),
            errors: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("runner-{}", config.name))
            .spawn(move || worker.run())?;

        Ok(RunnerHandle {
            name: config.name.clone(),
            stop_timeout: config.stop_timeout(),
            cancel,
            shared,
            worker: Some(handle),
        })
    }
}

/// Owner-side handle to a running session runner
#[derive(Debug)]
pub struct RunnerHandle {
    name: String,
    stop_timeout: Duration,
    cancel: Arc<AtomicBool>,
    shared: Arc<RunnerShared>,
    worker: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunnerState {
        *self.shared.state.lock()
    }

    /// Why the runner stopped itself, if it did
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal the runner to stop without waiting for it
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Stop the runner and wait up to the configured stop timeout
    ///
    /// Returns false when the worker is still running afterwards; a later
    /// call may still succeed.
    pub fn stop(&mut self) -> bool {
        self.cancel.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let deadline = Instant::now() + self.stop_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!(session = %self.name, "runner did not stop in time");
                self.worker = Some(worker);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if worker.join().is_err() {
            error!(session = %self.name, "runner thread panicked");
        }
        true
    }
}

/// Thread-side state of one session runner
struct Worker {
    name: String,
    mode: RunnerMode,
    interval: Duration,
    command_delay: Duration,
    fault_tolerance: usize,
    flow: SessionFlow,
    transport: Box<dyn Transport>,
    store: StoreHandle,
    host_id: i64,
    external_cancel: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    shared: Arc<RunnerShared>,
    /// Reasons of the current run of consecutive failures
    errors: Vec<String>,
}

impl Worker {
    fn run(mut self) {
        let span = info_span!("runner", session = %self.name);
        let _guard = span.enter();
        info!(mode = ?self.mode, interval = ?self.interval, "session runner started");
        match self.mode {
            RunnerMode::Persistent => self.run_persistent(),
            RunnerMode::Interrupt => self.run_interrupt(),
        }
        self.set_state(RunnerState::Stopped);
        let fatal = self.shared.fatal.lock().clone();
        match fatal {
            Some(reason) => error!(error = %reason, "session runner stopped after fault"),
            None => info!("session runner stopped"),
        }
    }

    fn run_persistent(&mut self) {
        let mut setup_done = false;
        while self.continue_expected() {
            if !self.transport.is_connected() {
                if !self.open() {
                    self.pace(Instant::now() + self.interval);
                    continue;
                }
                setup_done = false;
            }
            if !setup_done {
                if self.run_stage(FlowStage::Setup) {
                    setup_done = true;
                } else {
                    self.close();
                    self.pace(Instant::now() + self.interval);
                    continue;
                }
            }

            // the next tick is fixed before the commands run, so slow
            // commands eat into the pause instead of shifting the grid
            let next_tick = Instant::now() + self.interval;
            if self.run_stage(FlowStage::Command) {
                self.clear_faults();
            } else {
                // drop the session; the next iteration reconnects
                self.close();
            }
            self.pace(next_tick);
        }
        if self.transport.is_connected() {
            self.run_stage(FlowStage::Teardown);
        }
        self.close();
    }

    fn run_interrupt(&mut self) {
        if !self.bracketed(FlowStage::Setup) {
            warn!("setup stage failed");
        }
        while self.continue_expected() {
            let next_tick = Instant::now() + self.interval;
            if self.bracketed(FlowStage::Command) {
                self.clear_faults();
            }
            self.pace(next_tick);
        }
        // no teardown attempt once the fault budget stopped the session
        let faulted = self.shared.fatal.lock().is_some();
        if !faulted && !self.bracketed(FlowStage::Teardown) {
            warn!("teardown stage failed");
        }
    }

    /// Connect, run one stage, disconnect
    fn bracketed(&mut self, stage: FlowStage) -> bool {
        if !self.open() {
            return false;
        }
        let ok = self.run_stage(stage);
        self.close();
        ok
    }

    fn set_state(&self, state: RunnerState) {
        *self.shared.state.lock() = state;
        debug!(state = %state, "runner state");
    }

    fn continue_expected(&self) -> bool {
        if self.external_cancel.load(Ordering::SeqCst) {
            debug!("stop requested by external source");
            return false;
        }
        if self.cancel.load(Ordering::SeqCst) {
            debug!("stop requested internally");
            return false;
        }
        true
    }

    fn open(&mut self) -> bool {
        self.set_state(RunnerState::Connecting);
        if self.errors.is_empty() {
            info!("connection establishing");
        } else {
            warn!("connection restoring at {} time", self.errors.len());
        }
        match self.transport.connect() {
            Ok(()) => {
                self.set_state(RunnerState::Connected);
                true
            }
            Err(err) => {
                self.set_state(RunnerState::Faulted);
                self.record_fault(err.to_string());
                false
            }
        }
    }

    fn close(&mut self) {
        self.set_state(RunnerState::Disconnecting);
        if let Err(err) = self.transport.disconnect() {
            debug!(error = %err, "disconnect failed");
        }
        self.set_state(RunnerState::Disconnected);
    }

    /// Run every command of `stage`; false when a command or parser fails
    fn run_stage(&mut self, stage: FlowStage) -> bool {
        if self.flow.stage(stage).is_empty() {
            debug!(stage = stage.as_str(), "stage has no commands; skipped");
            return true;
        }
        self.set_state(RunnerState::Executing);
        let ctx = ParseContext {
            host_id: self.host_id,
            timestamp: Local::now().format(DB_DATETIME_FORMAT).to_string(),
        };
        let count = self.flow.stage(stage).len();
        for index in 0..count {
            if !self.run_command(stage, index, &ctx) {
                self.set_state(RunnerState::Faulted);
                return false;
            }
            if index + 1 < count {
                thread::sleep(self.command_delay);
            }
        }
        true
    }

    fn run_command(&mut self, stage: FlowStage, index: usize, ctx: &ParseContext) -> bool {
        let (rendered, background) = {
            let spec = &self.flow.stage(stage)[index];
            (spec.rendered(), spec.is_background())
        };
        debug!(stage = stage.as_str(), command = %rendered, "running command");

        if background {
            if let Err(err) = self.transport.start(&rendered) {
                self.record_fault(err.to_string());
                return false;
            }
            return true;
        }

        let output = match self.transport.exec(&rendered) {
            Ok(output) => output,
            Err(err) => {
                self.record_fault(err.to_string());
                return false;
            }
        };
        if !output.success() {
            warn!(command = %rendered, rc = output.rc, stderr = %output.stderr, "command returned non-zero");
        }

        let parsed = self.flow.stage(stage)[index]
            .parser()
            .map(|parser| parser.parse(ctx, &output));
        match parsed {
            None => true,
            Some(Ok(units)) => {
                // all rows of one tick share the tick's capture timestamp
                let stamped = units
                    .into_iter()
                    .map(|unit| unit.with_timestamp(ctx.timestamp.as_str()))
                    .collect::<Vec<_>>();
                if !stamped.is_empty() && !self.store.enqueue(stamped) {
                    debug!(command = %rendered, "store rejected batch");
                }
                true
            }
            Some(Err(err)) => {
                self.record_fault(format!("parser failed: {err}"));
                false
            }
        }
    }

    /// Count one failure against the rolling budget
    ///
    /// Reaching the limit stores the fatal reason and trips the internal
    /// cancel flag; the loop then winds down on its own.
    fn record_fault(&mut self, reason: String) {
        warn!(
            error = %reason,
            count = self.errors.len() + 1,
            allowed = self.fault_tolerance,
            "session fault",
        );
        self.errors.push(reason);
        if self.errors.len() >= self.fault_tolerance {
            let last = self.errors.last().cloned().unwrap_or_default();
            let fatal = RunnerError::BudgetExhausted {
                name: self.name.clone(),
                limit: self.fault_tolerance,
                last,
            };
            error!(error = %fatal, "fault budget exhausted");
            *self.shared.fatal.lock() = Some(fatal.to_string());
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// A fully successful command stage resets the budget
    fn clear_faults(&mut self) {
        if !self.errors.is_empty() {
            debug!(cleared = self.errors.len(), "fault budget reset after success");
            self.errors.clear();
        }
    }

    /// Sleep until `next_tick` in cancellable slices
    fn pace(&self, next_tick: Instant) {
        let now = Instant::now();
        if now >= next_tick {
            warn!(
                interval = ?self.interval,
                overrun = ?now.duration_since(next_tick),
                "command stage overran the interval; consider configuring a larger one",
            );
            return;
        }
        let mut remaining = next_tick - now;
        while remaining > Duration::ZERO {
            if !self.continue_expected() {
                return;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
            remaining = next_tick.saturating_duration_since(Instant::now());
        }
    }
}
