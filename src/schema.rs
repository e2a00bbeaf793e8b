//! Table schema: column definitions and name/id resolution.
//!
//! The core treats the schema as a read-mostly external collaborator (see
//! `external::TableSchema`); this module provides the concrete in-memory
//! implementation used by tests and by a single-node deployment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Columns are sparsely allocated within this range.
pub const MAX_COLUMNS: u16 = 8192;

/// Column carrying the event type / action name. Present in every table.
pub const ACTION_COLUMN: &str = "__action";

/// Column carrying each row's event timestamp (epoch milliseconds).
pub const TIME_COLUMN: &str = "__time";

/// Pseudo-column addressing named segment bitmaps rather than row data.
pub const SEGMENT_COLUMN: &str = "segment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Double,
    Text,
    Bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: u16,
    pub name: String,
    pub column_type: ColumnType,
}

/// Whether unknown columns seen during insert are auto-added or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    Permissive,
    Strict,
}

#[derive(Debug, Clone)]
pub struct Schema {
    mode: SchemaMode,
    columns: Vec<Option<ColumnDef>>,
    by_name: HashMap<String, u16>,
    next_id: u16,
}

impl Schema {
    pub fn new(mode: SchemaMode) -> Schema {
        let mut schema = Schema {
            mode,
            columns: (0..MAX_COLUMNS).map(|_| None).collect(),
            by_name: HashMap::new(),
            next_id: 0,
        };
        schema
            .add_column(ACTION_COLUMN, ColumnType::Text)
            .expect("reserved column");
        schema
            .add_column(TIME_COLUMN, ColumnType::Int)
            .expect("reserved column");
        schema
            .add_column(SEGMENT_COLUMN, ColumnType::Text)
            .expect("reserved column");
        schema
    }

    pub fn add_column(&mut self, name: &str, column_type: ColumnType) -> Result<u16> {
        if let Some(&id) = self.by_name.get(name) {
            let existing = self.columns[id as usize].as_ref().unwrap();
            if existing.column_type != column_type {
                return Err(Error::BadSchema(format!(
                    "column {name} already exists with type {:?}",
                    existing.column_type
                )));
            }
            return Ok(id);
        }
        if self.next_id >= MAX_COLUMNS {
            return Err(Error::BadSchema("column table exhausted".into()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.columns[id as usize] = Some(ColumnDef {
            id,
            name: name.to_string(),
            column_type,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Resolve a column by name, auto-adding it in permissive mode when
    /// `value_type` is known.
    pub fn resolve_or_add(&mut self, name: &str, value_type: ColumnType) -> Result<u16> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        match self.mode {
            SchemaMode::Permissive => self.add_column(name, value_type),
            SchemaMode::Strict => Err(Error::BadSchema(format!("unknown column {name}"))),
        }
    }

    pub fn column_id(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn column(&self, id: u16) -> Option<&ColumnDef> {
        self.columns.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDef> {
        self.column_id(name).and_then(|id| self.column(id))
    }

    pub fn action_column(&self) -> u16 {
        self.column_id(ACTION_COLUMN).unwrap()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter_map(|c| c.as_ref())
    }
}

impl Default for Schema {
    fn default() -> Schema {
        Schema::new(SchemaMode::Permissive)
    }
}
