//! Pending writes and their one-shot results
//!
//! A [`DataUnit`] is one queued write: a target table, positional rows, the
//! capture timestamp, and optionally the raw output text to run through the
//! content cache. The background writer mutates it exactly once (reference
//! substitution) just before execution and then publishes into its result
//! slot. A producer that cares about the outcome takes a [`Receipt`] before
//! enqueueing and blocks on it, with an optional deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{SchemaError, StoreError};
use crate::schema::{DB_DATETIME_FORMAT, Table, Value};

/// Raw outcome of one executed statement
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Rows fetched by a SELECT-like statement, empty otherwise
    pub rows: Vec<Vec<Value>>,
    /// Rowid generated by the most recent insert on the connection
    pub last_insert_id: i64,
    /// Number of rows changed by the statement
    pub affected: usize,
}

/// What the writer publishes for one processed unit
pub type WriteResult = Result<ExecOutcome, StoreError>;

#[derive(Debug, Default)]
struct SlotState {
    value: Option<WriteResult>,
    published: bool,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn publish(&self, result: WriteResult) {
        let mut state = self.state.lock();
        if state.published {
            warn!("result already published; duplicate dropped");
            return;
        }
        state.value = Some(result);
        state.published = true;
        self.ready.notify_all();
    }
}

/// Producer-held handle to one pending write's eventual result
///
/// Consumed by [`Receipt::wait`]; at most one receipt exists per unit.
#[derive(Debug)]
pub struct Receipt {
    slot: Arc<Slot>,
    deadline: Option<Duration>,
    statement: String,
}

impl Receipt {
    /// Whether the writer has already published
    pub fn is_ready(&self) -> bool {
        self.slot.state.lock().published
    }

    /// Block until the writer publishes, or the unit's deadline passes
    ///
    /// A deadline that fires surfaces [`StoreError::WaitTimeout`] to this
    /// caller only; the underlying write may still complete later.
    pub fn wait(self) -> WriteResult {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.value.take() {
                return result;
            }
            match deadline {
                Some(at) => {
                    if self.slot.ready.wait_until(&mut state, at).timed_out() {
                        // publication can slip in right at the deadline
                        if let Some(result) = state.value.take() {
                            return result;
                        }
                        return Err(StoreError::WaitTimeout {
                            statement: self.statement,
                        });
                    }
                }
                None => self.slot.ready.wait(&mut state),
            }
        }
    }
}

/// One queued write: target table, positional rows, capture timestamp
pub struct DataUnit {
    table: Arc<Table>,
    rows: Vec<Vec<Value>>,
    timestamp: String,
    output_text: Option<String>,
    timeout: Option<Duration>,
    slot: Arc<Slot>,
    receipt_issued: bool,
}

impl DataUnit {
    /// Build a unit for `table`; every row must match the table's field count
    pub fn new(table: Arc<Table>, rows: Vec<Vec<Value>>) -> Result<Self, SchemaError> {
        let expected = table.fields().len();
        for row in &rows {
            if row.len() != expected {
                return Err(SchemaError::RowArity {
                    table: table.name().to_string(),
                    expected,
                    got: row.len(),
                });
            }
        }
        Ok(Self {
            table,
            rows,
            timestamp: Local::now().format(DB_DATETIME_FORMAT).to_string(),
            output_text: None,
            timeout: None,
            slot: Arc::new(Slot::default()),
            receipt_issued: false,
        })
    }

    /// Override the capture timestamp (defaults to now)
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Deadline applied when waiting on this unit's receipt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Raw output to store through the content cache; the returned
    /// reference is substituted into the rows' `OUTPUT_REF` cells
    pub fn with_output(mut self, text: impl Into<String>) -> Self {
        self.output_text = Some(text.into());
        self
    }

    /// Issue the unit's receipt; `Some` on the first call only
    pub fn receipt(&mut self) -> Option<Receipt> {
        if self.receipt_issued {
            return None;
        }
        self.receipt_issued = true;
        Some(Receipt {
            slot: Arc::clone(&self.slot),
            deadline: self.timeout,
            statement: self.table.insert_sql(),
        })
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub(crate) fn take_output(&mut self) -> Option<String> {
        self.output_text.take()
    }

    /// Set the named cell in every row; false when the table lacks the field
    pub(crate) fn substitute(&mut self, field: &str, value: &Value) -> bool {
        let Some(index) = self.table.field_index(field) else {
            return false;
        };
        for row in &mut self.rows {
            row[index] = value.clone();
        }
        true
    }

    pub(crate) fn publish(&self, result: WriteResult) {
        self.slot.publish(result);
    }
}

impl Drop for DataUnit {
    fn drop(&mut self) {
        // a unit discarded before processing must not strand its waiter
        if self.receipt_issued && !self.slot.state.lock().published {
            self.slot.publish(Err(StoreError::WriterGone));
        }
    }
}

impl std::fmt::Debug for DataUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataUnit")
            .field("table", &self.table.name())
            .field("rows", &self.rows.len())
            .field("timestamp", &self.timestamp)
            .field("has_output", &self.output_text.is_some())
            .finish_non_exhaustive()
    }
}

/// What producers enqueue: one unit, or a group applied in order
///
/// An empty group is a sentinel; the writer skips it.
#[derive(Debug)]
pub enum WriteBatch {
    Single(DataUnit),
    Group(Vec<DataUnit>),
}

impl WriteBatch {
    /// Flatten into individual units, preserving order
    pub fn into_units(self) -> Vec<DataUnit> {
        match self {
            Self::Single(unit) => vec![unit],
            Self::Group(units) => units,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Group(units) => units.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<DataUnit> for WriteBatch {
    fn from(unit: DataUnit) -> Self {
        Self::Single(unit)
    }
}

impl From<Vec<DataUnit>> for WriteBatch {
    fn from(units: Vec<DataUnit>) -> Self {
        Self::Group(units)
    }
}
