//! Content-addressed storage for captured command output
//!
//! Output text is split into lines; each distinct line is stored once in
//! `LinesCache`, keyed by its SHA-256 digest. An output then becomes an
//! ordered group of line references in `LinesCacheMap` under a single
//! `OUTPUT_REF`. When a capture is identical to the most recent one, the
//! prior reference is handed back and no new group is written, so a host
//! printing the same screen every tick costs one group total.
//!
//! The cache lives on the writer thread. All lookups and inserts are
//! serialized there, which is what makes select-then-insert safe.

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreError;

const SELECT_LINE: &str = "SELECT LINE_ID FROM LinesCache WHERE HashTag = ?1";
const INSERT_LINE: &str = "INSERT INTO LinesCache VALUES (NULL, ?1, ?2)";
const SELECT_SEQUENCE: &str =
    "SELECT LINE_REF FROM LinesCacheMap WHERE OUTPUT_REF = ?1 ORDER BY ORDER_ID";
const SELECT_LAST_REF: &str = "SELECT max(OUTPUT_REF) FROM LinesCacheMap";
const INSERT_MAP: &str = "INSERT INTO LinesCacheMap VALUES (?1, ?2, ?3)";

/// SHA-256 of one output line, as stored in the `HashTag` column
pub fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deduplicating store for captured output
///
/// Remembers the most recently returned `OUTPUT_REF`; only that group is
/// compared against incoming output, so an older identical capture still
/// gets a fresh reference.
#[derive(Debug, Default)]
pub struct OutputCache {
    last_ref: Option<i64>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `output` and return the `OUTPUT_REF` naming its line sequence
    ///
    /// Empty output is a valid capture: it gets a reference with no map
    /// rows, and consecutive empty captures share it.
    pub fn store(&mut self, conn: &Connection, output: &str) -> Result<i64, StoreError> {
        let mut line_refs = Vec::with_capacity(output.lines().count());
        for line in output.lines() {
            line_refs.push(self.line_ref(conn, line)?);
        }

        if let Some(last) = self.last_ref {
            if self.sequence_matches(conn, last, &line_refs)? {
                debug!(output_ref = last, "output unchanged, reference reused");
                return Ok(last);
            }
        }

        let next = self.next_ref(conn)?;
        for (order, line_ref) in line_refs.iter().enumerate() {
            conn.execute(INSERT_MAP, params![next, order as i64, line_ref])?;
        }
        self.last_ref = Some(next);
        Ok(next)
    }

    fn line_ref(&self, conn: &Connection, line: &str) -> Result<i64, StoreError> {
        let hash = line_hash(line);
        let found: Option<i64> = conn
            .query_row(SELECT_LINE, params![hash], |row| row.get(0))
            .optional()?;
        match found {
            Some(id) => Ok(id),
            None => {
                conn.execute(INSERT_LINE, params![hash, line])?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Strict full-length comparison against one stored group
    fn sequence_matches(
        &self,
        conn: &Connection,
        output_ref: i64,
        refs: &[i64],
    ) -> Result<bool, StoreError> {
        let mut stmt = conn.prepare(SELECT_SEQUENCE)?;
        let stored = stmt
            .query_map(params![output_ref], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(stored == refs)
    }

    /// Next free reference: one past the largest stored, starting at 0
    ///
    /// Groups with no rows are invisible to the max query, so the
    /// writer-local floor keeps references monotonic within a run.
    fn next_ref(&self, conn: &Connection) -> Result<i64, StoreError> {
        let max: Option<i64> = conn.query_row(SELECT_LAST_REF, [], |row| row.get(0))?;
        let candidate = max.map_or(0, |m| m + 1);
        Ok(candidate.max(self.last_ref.map_or(0, |last| last + 1)))
    }
}
