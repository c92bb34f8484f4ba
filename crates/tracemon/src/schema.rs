//! Declarative table model and SQL rendering
//!
//! Tables are described as an ordered field list plus foreign-key
//! annotations and named queries. Field order is fixed at construction and
//! defines the positional row tuples used by every write; the registry
//! holds all tables for a run and freezes when the persistence engine
//! starts.
//!
//! Reference columns are added by composition, not inheritance: the
//! `with_host_ref` / `with_time_ref` / `with_output_ref` builders take a
//! base field list and return the augmented list plus the matching
//! foreign keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rusqlite::types::{self, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Rendering format for timestamps stored in the database
pub const DB_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Field name carrying the owning host's surrogate id
pub const HOST_REF: &str = "HOST_REF";
/// Field name carrying the timeline surrogate id, filled in by the writer
pub const TL_REF: &str = "TL_REF";
/// Field name carrying the content-cache output reference, filled in by the writer
pub const OUTPUT_REF: &str = "OUTPUT_REF";

/// Column affinity of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Text,
    Real,
}

impl FieldType {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Real => "REAL",
        }
    }
}

/// A single column: name, affinity, primary-key flag
///
/// At most one field per table may be a primary key; it is an
/// auto-incrementing rowid alias and is never supplied by producers
/// (rows carry `Value::Null` in that position).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub primary_key: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            primary_key: false,
        }
    }

    /// Integer auto-increment primary key
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Integer,
            primary_key: true,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Real)
    }

    fn render(&self) -> String {
        if self.primary_key {
            format!("{} {} PRIMARY KEY", self.name, self.field_type.as_sql())
        } else {
            format!("{} {}", self.name, self.field_type.as_sql())
        }
    }
}

/// Referential annotation rendered into the create statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub own_field: String,
    pub foreign_table: String,
    pub foreign_field: String,
}

impl ForeignKey {
    pub fn new(
        own_field: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            own_field: own_field.into(),
            foreign_table: foreign_table.into(),
            foreign_field: foreign_field.into(),
        }
    }

    fn render(&self) -> String {
        format!(
            "FOREIGN KEY({}) REFERENCES {}({})",
            self.own_field, self.foreign_table, self.foreign_field
        )
    }
}

/// Named statement attached to a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    pub sql: String,
}

impl Query {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// A dynamically typed SQL cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer payload, if this cell holds one
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload, if this cell holds one
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(types::Value::Null),
            Self::Integer(v) => ToSqlOutput::Owned(types::Value::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Owned(types::Value::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Self::Text(hex::encode(b)),
        }
    }
}

/// A declared table: unique name, ordered fields, foreign keys, named queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    fields: Vec<Field>,
    foreign_keys: Vec<ForeignKey>,
    queries: Vec<Query>,
}

impl Table {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<Field>,
        foreign_keys: Vec<ForeignKey>,
        queries: Vec<Query>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            foreign_keys,
            queries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Look up a named query
    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }

    /// Position of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Whether the writer must resolve a timeline id for rows of this table
    pub fn needs_time_ref(&self) -> bool {
        self.field_index(TL_REF).is_some()
    }

    /// Whether rows of this table carry a content-cache output reference
    pub fn has_output_ref(&self) -> bool {
        self.field_index(OUTPUT_REF).is_some()
    }

    /// An all-`Null` positional row matching this table's field count
    pub fn template(&self) -> Vec<Value> {
        vec![Value::Null; self.fields.len()]
    }

    /// `CREATE TABLE IF NOT EXISTS {name} ({fields}, {foreign keys})`
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.fields.iter().map(Field::render).collect();
        parts.extend(self.foreign_keys.iter().map(ForeignKey::render));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }

    /// `INSERT INTO {name} VALUES (?, ...)` with one placeholder per field
    pub fn insert_sql(&self) -> String {
        let placeholders = vec!["?"; self.fields.len()].join(", ");
        format!("INSERT INTO {} VALUES ({})", self.name, placeholders)
    }

    /// `SELECT * FROM {name}` plus an optional WHERE clause
    pub fn select_sql(&self, where_clause: Option<&str>) -> String {
        match where_clause {
            Some(cond) => format!("SELECT * FROM {} WHERE {}", self.name, cond),
            None => format!("SELECT * FROM {}", self.name),
        }
    }
}

/// Prepend a host reference to a base field list
pub fn with_host_ref(mut base: Vec<Field>) -> (Vec<Field>, Vec<ForeignKey>) {
    base.insert(0, Field::integer(HOST_REF));
    (
        base,
        vec![ForeignKey::new(HOST_REF, "TraceHost", "HOST_ID")],
    )
}

/// Prepend host and timeline references to a base field list
///
/// Tables built this way get their `TL_REF` cells substituted by the
/// writer from the pending write's capture timestamp.
pub fn with_time_ref(mut base: Vec<Field>) -> (Vec<Field>, Vec<ForeignKey>) {
    base.insert(0, Field::integer(TL_REF));
    base.insert(0, Field::integer(HOST_REF));
    (
        base,
        vec![
            ForeignKey::new(HOST_REF, "TraceHost", "HOST_ID"),
            ForeignKey::new(TL_REF, "TimeLine", "TL_ID"),
        ],
    )
}

/// Append a content-cache output reference to a base field list
///
/// No foreign key is emitted: `OUTPUT_REF` groups in `LinesCacheMap` are
/// not unique, so the linkage stays an application-level reference.
pub fn with_output_ref(mut base: Vec<Field>) -> (Vec<Field>, Vec<ForeignKey>) {
    base.push(Field::integer(OUTPUT_REF));
    (base, Vec::new())
}

/// `TraceHost(HOST_ID, HostName)` - one row per registered host
pub fn trace_host() -> Table {
    Table::new(
        "TraceHost",
        vec![Field::primary_key("HOST_ID"), Field::text("HostName")],
        vec![],
        vec![],
    )
}

/// `TimeLine(TL_ID, TimeStamp)` - timestamp surrogates, one row per distinct value
pub fn time_line() -> Table {
    Table::new(
        "TimeLine",
        vec![Field::primary_key("TL_ID"), Field::text("TimeStamp")],
        vec![],
        vec![],
    )
}

/// `Points(HOST_REF, PointName, Start, End)` - named time-span markers
pub fn points() -> Table {
    Table::new(
        "Points",
        vec![
            Field::integer(HOST_REF),
            Field::text("PointName"),
            Field::text("Start"),
            Field::text("End"),
        ],
        vec![ForeignKey::new(HOST_REF, "TraceHost", "HOST_ID")],
        vec![],
    )
}

/// `LinesCache(LINE_ID, HashTag, Line)` - deduplicated output lines
pub fn lines_cache() -> Table {
    Table::new(
        "LinesCache",
        vec![
            Field::primary_key("LINE_ID"),
            Field::text("HashTag"),
            Field::text("Line"),
        ],
        vec![],
        vec![],
    )
}

/// `LinesCacheMap(OUTPUT_REF, ORDER_ID, LINE_REF)` - ordered output composition
pub fn lines_cache_map() -> Table {
    Table::new(
        "LinesCacheMap",
        vec![
            Field::integer(OUTPUT_REF),
            Field::integer("ORDER_ID"),
            Field::integer("LINE_REF"),
        ],
        vec![ForeignKey::new("LINE_REF", "LinesCache", "LINE_ID")],
        vec![Query::new(
            "last_output_id",
            "SELECT max(OUTPUT_REF) FROM LinesCacheMap",
        )],
    )
}

#[derive(Debug, Default)]
struct RegistryInner {
    order: Vec<Arc<Table>>,
    by_name: HashMap<String, usize>,
}

/// Registry of every table persisted during a run
///
/// Constructed explicitly and shared by handle; the engine freezes it on
/// `start`, after which registration fails.
#[derive(Debug)]
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
    frozen: AtomicBool,
}

impl SchemaRegistry {
    /// A registry pre-populated with the built-in tables
    /// (TraceHost, TimeLine, Points, LinesCache, LinesCacheMap)
    pub fn new() -> Self {
        let registry = Self::empty();
        for table in [
            trace_host(),
            time_line(),
            points(),
            lines_cache(),
            lines_cache_map(),
        ] {
            registry.insert(table);
        }
        registry
    }

    /// A registry with no tables at all
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            frozen: AtomicBool::new(false),
        }
    }

    fn insert(&self, table: Table) {
        let mut inner = self.inner.write();
        let index = inner.order.len();
        inner.by_name.insert(table.name().to_string(), index);
        inner.order.push(Arc::new(table));
    }

    /// Register a table; duplicates and post-freeze registration are errors
    pub fn register(&self, table: Table) -> Result<(), SchemaError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(SchemaError::RegistryFrozen(table.name().to_string()));
        }
        if table.fields().iter().filter(|f| f.primary_key).count() > 1 {
            return Err(SchemaError::MultiplePrimaryKeys(table.name().to_string()));
        }
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(table.name()) {
            return Err(SchemaError::DuplicateTable(table.name().to_string()));
        }
        let index = inner.order.len();
        inner.by_name.insert(table.name().to_string(), index);
        inner.order.push(Arc::new(table));
        Ok(())
    }

    /// Look up a registered table by name
    pub fn get(&self, name: &str) -> Result<Arc<Table>, SchemaError> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .map(|&i| Arc::clone(&inner.order[i]))
            .ok_or_else(|| SchemaError::TableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// Snapshot of all tables in registration order
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().order.clone()
    }

    /// Stop accepting registrations; called by the engine on `start`
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
