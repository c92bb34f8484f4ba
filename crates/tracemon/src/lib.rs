//! tracemon: remote host monitoring over pluggable transports
//!
//! Session runner threads hold a session per monitored host, run command
//! flows on a fixed interval and parse the output into rows. Rows travel
//! as pending writes through an unbounded queue to the single writer
//! thread owning the SQLite connection, which resolves timeline and
//! cached-output references before inserting.
//!
//! # Architecture
//!
//! ```text
//! HostRegistry → HostModule → SessionRunner threads
//!                                     ↓ pending writes
//!                        TraceStore writer thread → SQLite
//!                     (TimeLine / LinesCache resolution)
//! ```
//!
//! # Modules
//!
//! - `schema`: table model, registry and SQL rendering
//! - `data_unit`: pending writes and their result slots
//! - `store`: single-writer persistence engine
//! - `timeline`: timestamp to timeline reference resolution
//! - `content`: line-level output dedup cache
//! - `flow`: command stages and output parsers
//! - `transport`: remote session contract
//! - `runner`: fault-tolerant session runners
//! - `host`: host modules and the host registry
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: error taxonomy
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod content;
pub mod data_unit;
pub mod error;
pub mod flow;
pub mod host;
pub mod logging;
pub mod runner;
pub mod schema;
pub mod store;
pub mod timeline;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
