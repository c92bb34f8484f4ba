//! Host modules and the host registry
//!
//! A host module is the per-host front: it owns the registered host row,
//! launches session runners bound to that row and marks measurement
//! periods. The registry tracks every module of a run and keeps a current
//! host so alias-less calls have a target.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, RunnerConfig};
use crate::data_unit::DataUnit;
use crate::error::{ConfigError, Result};
use crate::flow::SessionFlow;
use crate::runner::{RunnerHandle, RunnerState, SessionRunner};
use crate::schema::Value;
use crate::store::StoreHandle;
use crate::transport::Transport;

/// One registered host and its session runners
pub struct HostModule {
    alias: String,
    host_id: i64,
    store: StoreHandle,
    cancel: Arc<AtomicBool>,
    runners: Mutex<Vec<RunnerHandle>>,
}

impl HostModule {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Row id assigned at registration; referenced by every metric row
    pub fn host_id(&self) -> i64 {
        self.host_id
    }

    /// Launch a session runner bound to this host
    pub fn start_runner(
        &self,
        config: &RunnerConfig,
        flow: SessionFlow,
        transport: Box<dyn Transport>,
    ) -> Result<()> {
        let runner = SessionRunner::spawn(
            config,
            flow,
            transport,
            self.store.clone(),
            self.host_id,
            Arc::clone(&self.cancel),
        )?;
        info!(host = %self.alias, session = %runner.name(), "runner attached");
        self.runners.lock().push(runner);
        Ok(())
    }

    /// Stop every runner with the given name
    ///
    /// Returns true when at least one matched and all matches stopped in
    /// time. Stopped runners leave the list; stuck ones stay for a retry.
    pub fn stop_runner(&self, name: &str) -> bool {
        let mut runners = self.runners.lock();
        let mut found = false;
        let mut all = true;
        for runner in runners.iter_mut().filter(|r| r.name() == name) {
            found = true;
            all &= runner.stop();
        }
        if !found {
            debug!(host = %self.alias, session = name, "no such runner");
            return false;
        }
        runners.retain(|r| r.name() != name || !r.is_finished());
        all
    }

    pub fn runner_state(&self, name: &str) -> Option<RunnerState> {
        self.runners
            .lock()
            .iter()
            .find(|r| r.name() == name)
            .map(RunnerHandle::state)
    }

    /// Why a runner stopped itself, if it did
    pub fn runner_fatal(&self, name: &str) -> Option<String> {
        self.runners
            .lock()
            .iter()
            .find(|r| r.name() == name)
            .and_then(RunnerHandle::fatal_error)
    }

    pub fn runner_names(&self) -> Vec<String> {
        self.runners
            .lock()
            .iter()
            .map(|r| r.name().to_owned())
            .collect()
    }

    pub fn active_runners(&self) -> usize {
        self.runners
            .lock()
            .iter()
            .filter(|r| !r.is_finished())
            .count()
    }

    /// Record a named measurement period for this host
    ///
    /// `start` and `end` carry preformatted database timestamps.
    pub fn mark_point(&self, name: &str, start: &str, end: &str) -> Result<()> {
        let table = self.store.registry().get("Points")?;
        let row = vec![
            Value::Integer(self.host_id),
            Value::from(name),
            Value::from(start),
            Value::from(end),
        ];
        let unit = DataUnit::new(table, vec![row])?;
        if !self.store.enqueue(unit) {
            warn!(host = %self.alias, point = name, "store rejected measurement point");
        }
        Ok(())
    }

    /// Stop every runner of this host
    pub fn close(&self) -> bool {
        let mut runners = self.runners.lock();
        let mut all = true;
        for runner in runners.iter_mut() {
            all &= runner.stop();
        }
        runners.retain(|r| !r.is_finished());
        if all {
            info!(host = %self.alias, "host module closed");
        } else {
            warn!(host = %self.alias, "some runners did not stop in time");
        }
        all
    }
}

/// All host modules of a run
pub struct HostRegistry {
    store: StoreHandle,
    cancel: Arc<AtomicBool>,
    modules: Vec<HostModule>,
    current: Option<String>,
}

impl HostRegistry {
    /// `cancel` is the run-wide stop flag shared with the data store
    pub fn new(store: StoreHandle, cancel: Arc<AtomicBool>) -> Self {
        Self {
            store,
            cancel,
            modules: Vec::new(),
            current: None,
        }
    }

    /// Insert the host row and create its module
    ///
    /// The insert bypasses the write queue so the fresh id is available
    /// to runners immediately. The new host becomes the current one.
    pub fn register(&mut self, config: &HostConfig) -> Result<i64> {
        config.validate()?;
        if self.modules.iter().any(|m| m.alias == config.alias) {
            return Err(ConfigError::DuplicateAlias(config.alias.clone()).into());
        }
        let table = self.store.registry().get("TraceHost")?;
        let row = vec![Value::Null, Value::from(config.alias.as_str())];
        let outcome = self.store.execute(&table.insert_sql(), &[row])?;
        let host_id = outcome.last_insert_id;
        info!(alias = %config.alias, host_id, "host registered");
        self.modules.push(HostModule {
            alias: config.alias.clone(),
            host_id,
            store: self.store.clone(),
            cancel: Arc::clone(&self.cancel),
            runners: Mutex::new(Vec::new()),
        });
        self.current = Some(config.alias.clone());
        Ok(host_id)
    }

    /// Look up a module; `None` falls back to the current host
    pub fn get(&self, alias: Option<&str>) -> Option<&HostModule> {
        let wanted = alias.or(self.current.as_deref())?;
        self.modules.iter().find(|m| m.alias == wanted)
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Returns false when no module carries the alias
    pub fn set_current(&mut self, alias: &str) -> bool {
        if self.modules.iter().any(|m| m.alias == alias) {
            self.current = Some(alias.to_owned());
            true
        } else {
            false
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.alias.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Close one host and drop its module
    pub fn close(&mut self, alias: Option<&str>) -> bool {
        let Some(wanted) = alias.or(self.current.as_deref()).map(str::to_owned) else {
            return false;
        };
        let Some(index) = self.modules.iter().position(|m| m.alias == wanted) else {
            debug!(alias = %wanted, "no such host to close");
            return false;
        };
        let module = self.modules.remove(index);
        let stopped = module.close();
        if self.current.as_deref() == Some(wanted.as_str()) {
            self.current = self.modules.last().map(|m| m.alias.clone());
        }
        stopped
    }

    /// Close every host module
    pub fn close_all(&mut self) -> bool {
        let mut all = true;
        for module in self.modules.drain(..) {
            all &= module.close();
        }
        self.current = None;
        all
    }
}
