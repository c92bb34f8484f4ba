//! Single-writer persistence engine
//!
//! All database mutation funnels through one background thread. Producers
//! enqueue [`WriteBatch`]es on an unbounded channel and may block on a
//! [`crate::Receipt`] for the outcome; the writer resolves timeline and
//! output references, substitutes them into the pending rows, executes the
//! insert, and publishes the result. A failed unit is logged and skipped,
//! never fatal to the loop.
//!
//! Reads and setup writes that must complete in the caller's thread go
//! through [`StoreHandle::execute`], which serializes on the same
//! connection lock the writer holds while applying a unit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, error, info, info_span, warn};

use crate::config::StoreConfig;
use crate::content::OutputCache;
use crate::data_unit::{DataUnit, ExecOutcome, WriteBatch};
use crate::error::{Error, Result, StoreError};
use crate::schema::{OUTPUT_REF, SchemaRegistry, TL_REF, Value};
use crate::timeline::TimelineResolver;

const PRAGMAS: &str =
    "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;";
const TABLE_EXISTS: &str = "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1";

/// State shared between the engine, its handles and the writer thread
#[derive(Debug)]
struct StoreShared {
    conn: Mutex<Connection>,
    sender: Sender<WriteBatch>,
    cancel: OnceLock<Arc<AtomicBool>>,
    registry: Arc<SchemaRegistry>,
}

impl StoreShared {
    fn cancelled(&self) -> bool {
        self.cancel
            .get()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Owner side of the persistence pipeline
///
/// Lifecycle: [`TraceStore::init`] opens the database, [`TraceStore::start`]
/// creates missing tables and launches the writer, [`TraceStore::stop`]
/// drains the queue and joins it. Producers interact through cloned
/// [`StoreHandle`]s, which stay valid for reads after stop.
#[derive(Debug)]
pub struct TraceStore {
    shared: Arc<StoreShared>,
    receiver: Option<Receiver<WriteBatch>>,
    worker: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
    poll_interval: Duration,
    db_path: Option<PathBuf>,
}

impl TraceStore {
    /// Open (or create) the database file under `config.location`
    ///
    /// A non-cumulative run deletes any previous file first, so every run
    /// starts from an empty schema.
    pub fn init(registry: Arc<SchemaRegistry>, config: &StoreConfig) -> Result<Self> {
        let location = Path::new(&config.location);
        if !location.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("output location '{}' does not exist", location.display()),
            )));
        }
        let db_path = location.join(&config.file_name);
        if !config.cumulative && db_path.exists() {
            std::fs::remove_file(&db_path)?;
            debug!(path = %db_path.display(), "previous database removed");
        }
        let conn = Connection::open(&db_path).map_err(StoreError::from)?;
        info!(path = %db_path.display(), cumulative = config.cumulative, "database opened");
        Self::with_connection(registry, conn, config.poll_interval(), Some(db_path))
    }

    /// In-memory engine, used by tests and tooling
    pub fn in_memory(registry: Arc<SchemaRegistry>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        Self::with_connection(registry, conn, Duration::from_millis(50), None)
    }

    fn with_connection(
        registry: Arc<SchemaRegistry>,
        conn: Connection,
        poll_interval: Duration,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        conn.execute_batch(PRAGMAS).map_err(StoreError::from)?;
        let (sender, receiver) = channel::unbounded();
        Ok(Self {
            shared: Arc::new(StoreShared {
                conn: Mutex::new(conn),
                sender,
                cancel: OnceLock::new(),
                registry,
            }),
            receiver: Some(receiver),
            worker: None,
            done_rx: None,
            poll_interval,
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Create missing tables, freeze the schema and launch the writer
    ///
    /// `cancel` is the stop flag shared with the session runners; tripping
    /// it from anywhere shuts the writer down after a final drain.
    pub fn start(&mut self, cancel: Arc<AtomicBool>) -> Result<()> {
        let receiver = self.receiver.take().ok_or(StoreError::AlreadyStarted)?;
        self.shared.registry.freeze();
        {
            let conn = self.shared.conn.lock();
            for table in self.shared.registry.tables() {
                let exists: Option<String> = conn
                    .query_row(TABLE_EXISTS, params![table.name()], |row| row.get(0))
                    .optional()
                    .map_err(StoreError::from)?;
                if exists.is_some() {
                    warn!(table = table.name(), "table already exists; create skipped");
                    continue;
                }
                conn.execute_batch(&table.create_sql())
                    .map_err(StoreError::from)?;
                debug!(table = table.name(), "table created");
            }
        }
        if self.shared.cancel.set(Arc::clone(&cancel)).is_err() {
            return Err(StoreError::AlreadyStarted.into());
        }

        let (done_tx, done_rx) = channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let poll = self.poll_interval;
        let worker = thread::Builder::new()
            .name("tracemon-writer".into())
            .spawn(move || {
                writer_loop(&shared, &receiver, &cancel, poll);
                let _ = done_tx.send(());
            })?;
        self.worker = Some(worker);
        self.done_rx = Some(done_rx);
        info!("data handler started");
        Ok(())
    }

    /// Producer-side handle; cheap to clone
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request shutdown and wait for the writer to drain the queue
    ///
    /// Everything enqueued before this call is still written. Returns
    /// false when the writer did not finish within `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(cancel) = self.shared.cancel.get() else {
            debug!("stop on an engine that never started");
            return true;
        };
        cancel.store(true, Ordering::SeqCst);
        let drained = self.done_rx.as_ref().is_none_or(|rx| {
            !matches!(rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
        });
        if drained {
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    error!("writer thread panicked");
                }
            }
            self.done_rx = None;
            info!("data handler gracefully stopped");
        } else {
            warn!(?timeout, "writer did not stop in time");
        }
        drained
    }
}

impl Drop for TraceStore {
    fn drop(&mut self) {
        // a dropped engine must not leave the writer spinning
        if self.worker.is_none() {
            return;
        }
        if let Some(cancel) = self.shared.cancel.get() {
            cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Producer-side handle to the persistence pipeline
///
/// Every host module and session runner holds one. `enqueue` feeds the
/// writer; `execute` and `query` serialize on the shared connection for
/// work that cannot wait in the queue.
#[derive(Clone)]
pub struct StoreHandle {
    shared: Arc<StoreShared>,
}

impl StoreHandle {
    /// Queue a batch for the writer; false once stop has been requested
    /// or the writer is gone
    pub fn enqueue(&self, batch: impl Into<WriteBatch>) -> bool {
        if self.shared.cancelled() {
            debug!("stop invoked; new data cannot be enqueued");
            return false;
        }
        if self.shared.sender.send(batch.into()).is_err() {
            debug!("writer gone; batch dropped");
            return false;
        }
        true
    }

    /// Run one statement synchronously, bypassing the queue
    ///
    /// Statements producing columns are fetched into `rows`; for others,
    /// the statement executes once per parameter row (or once with no
    /// parameters when `rows` is empty). A SELECT binds the first row.
    pub fn execute(&self, sql: &str, rows: &[Vec<Value>]) -> Result<ExecOutcome> {
        let conn = self.shared.conn.lock();
        exec_on(&conn, sql, rows).map_err(Into::into)
    }

    /// Convenience wrapper fetching the rows of a parameterized SELECT
    pub fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Vec<Value>>> {
        Ok(self.execute(sql, &[params])?.rows)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.shared.registry
    }
}

fn exec_on(
    conn: &Connection,
    sql: &str,
    rows: &[Vec<Value>],
) -> std::result::Result<ExecOutcome, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let mut outcome = ExecOutcome::default();
    if columns > 0 {
        let bind = rows.first().map_or(&[][..], Vec::as_slice);
        let mut fetched = stmt.query(params_from_iter(bind.iter()))?;
        while let Some(row) = fetched.next()? {
            let mut values = Vec::with_capacity(columns);
            for index in 0..columns {
                values.push(Value::from(row.get_ref(index)?));
            }
            outcome.rows.push(values);
        }
    } else {
        if rows.is_empty() {
            outcome.affected += stmt.execute([])?;
        } else {
            for row in rows {
                outcome.affected += stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        outcome.last_insert_id = conn.last_insert_rowid();
    }
    Ok(outcome)
}

fn writer_loop(
    shared: &StoreShared,
    receiver: &Receiver<WriteBatch>,
    cancel: &Arc<AtomicBool>,
    poll: Duration,
) {
    let span = info_span!("writer");
    let _guard = span.enter();
    let mut timeline = TimelineResolver::new();
    let mut outputs = OutputCache::new();
    info!("writer started");
    loop {
        if cancel.load(Ordering::SeqCst) && receiver.is_empty() {
            break;
        }
        match receiver.recv_timeout(poll) {
            Ok(batch) => {
                for unit in batch.into_units() {
                    process_unit(shared, &mut timeline, &mut outputs, unit);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // a batch can land between the emptiness check and loop exit
    while let Ok(batch) = receiver.try_recv() {
        for unit in batch.into_units() {
            process_unit(shared, &mut timeline, &mut outputs, unit);
        }
    }
    info!("writer drained");
}

fn process_unit(
    shared: &StoreShared,
    timeline: &mut TimelineResolver,
    outputs: &mut OutputCache,
    mut unit: DataUnit,
) {
    let result = apply_unit(shared, timeline, outputs, &mut unit);
    if let Err(err) = &result {
        error!(table = unit.table().name(), error = %err, "write failed; unit skipped");
    }
    unit.publish(result);
}

/// Resolve references, substitute them into the rows, execute the insert
///
/// The connection lock is held for the whole unit, so reference resolution
/// and the insert are atomic with respect to synchronous `execute` calls.
fn apply_unit(
    shared: &StoreShared,
    timeline: &mut TimelineResolver,
    outputs: &mut OutputCache,
    unit: &mut DataUnit,
) -> std::result::Result<ExecOutcome, StoreError> {
    let conn = shared.conn.lock();
    if unit.table().needs_time_ref() {
        let tl_id = timeline.resolve(&conn, unit.timestamp())?;
        unit.substitute(TL_REF, &Value::Integer(tl_id));
    }
    if let Some(text) = unit.take_output() {
        let output_ref = outputs.store(&conn, &text)?;
        if !unit.substitute(OUTPUT_REF, &Value::Integer(output_ref)) {
            warn!(
                table = unit.table().name(),
                "table has no OUTPUT_REF field; reference discarded"
            );
        }
    }
    exec_on(&conn, &unit.table().insert_sql(), unit.rows())
}
