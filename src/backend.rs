//! Backend capability traits and the text row model
//!
//! The dispatch core never talks to a SQL engine directly; it goes
//! through the `Connector`/`Connection` pair so the pool, handler and
//! tests are independent of the concrete driver. The production
//! implementation lives in `pg.rs`.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// One result row: ordered `(column, value)` cells.
///
/// Column order must match the result-set metadata and survive
/// encoding, so this is a cell vector rather than a map type (the
/// default `serde_json` map would reorder keys alphabetically).
/// All values are text regardless of the source column type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Build a row from `(column, value)` pairs, preserving order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cells: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.cells.push((column.into(), value.into()));
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of column name to text value")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Row, A::Error> {
        let mut cells = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((column, value)) = access.next_entry::<String, String>()? {
            cells.push((column, value));
        }
        Ok(Row { cells })
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Row, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

/// A live database session.
///
/// Held exclusively by the pool's free list or by exactly one
/// in-flight request. Dropping the box closes the session.
pub trait Connection: Send {
    /// Probe whether the session is still usable. A `false` here makes
    /// the pool discard and replace the connection; it is never
    /// surfaced to clients.
    fn is_valid(&mut self) -> bool;

    /// Execute `sql` verbatim and collect the full result set as text
    /// rows, preserving column order and row order as reported by the
    /// engine. Statements without a result set yield an empty vec.
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>>;
}

/// Factory for `Connection`s, shared by the pool and its heartbeat.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}
