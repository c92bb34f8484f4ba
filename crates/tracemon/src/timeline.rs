//! Timestamp deduplication for the `TimeLine` table
//!
//! Every captured second gets exactly one `TimeLine` row no matter how many
//! writes share it. The resolver lives on the writer thread, so lookups are
//! serialized with inserts and the select-then-insert pair cannot race.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::trace;

use crate::error::StoreError;

const SELECT_TL: &str = "SELECT TL_ID FROM TimeLine WHERE TimeStamp = ?1";
const INSERT_TL: &str = "INSERT INTO TimeLine VALUES (NULL, ?1)";

/// Maps a capture timestamp to its `TL_ID`, creating the row on first sight
///
/// Caches the most recent pair; consecutive writes within the same second
/// skip the database entirely.
#[derive(Debug, Default)]
pub struct TimelineResolver {
    last: Option<(String, i64)>,
}

impl TimelineResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row id for `timestamp`, inserting a `TimeLine` row if none exists
    pub fn resolve(&mut self, conn: &Connection, timestamp: &str) -> Result<i64, StoreError> {
        if let Some((last_ts, last_id)) = &self.last {
            if last_ts == timestamp {
                return Ok(*last_id);
            }
        }
        let found: Option<i64> = conn
            .query_row(SELECT_TL, params![timestamp], |row| row.get(0))
            .optional()?;
        let id = match found {
            Some(id) => id,
            None => {
                conn.execute(INSERT_TL, params![timestamp])?;
                conn.last_insert_rowid()
            }
        };
        trace!(timestamp, id, "timeline entry resolved");
        self.last = Some((timestamp.to_string(), id));
        Ok(id)
    }
}
