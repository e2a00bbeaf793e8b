//! Grid: a transient, column-mapped materialization of one person (§3, §4.A).

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

use fnv::FnvHasher;
use serde_json::{Map, Value as Json};

use crate::errors::{Error, Result};
use crate::person::encode::{decode_double, decode_rows, encode_double, encode_rows};
use crate::person::flags::FlagRecord;
use crate::person::intern::StringInterner;
use crate::person::record::PersonData;
use crate::schema::{ColumnType, Schema, TIME_COLUMN};
use crate::value::Val;

/// Default session gap: 30 minutes, in milliseconds.
pub const DEFAULT_SESSION_GAP_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridMode {
    /// Mapped to a subset of columns referenced by a compiled query.
    Query,
    /// Mapped to the full schema; required for insert and introspection.
    FullSchema,
}

#[derive(Debug, Clone)]
pub struct Grid {
    mode: GridMode,
    columns: Vec<u16>,
    reverse: HashMap<u16, usize>,
    pub external_id: u64,
    pub linear_id: u32,
    pub id: String,
    rows: Vec<Vec<Option<Val>>>,
    flags: Vec<FlagRecord>,
    props: Json,
    insert_seen: HashSet<u128>,
    session_column: Option<String>,
    session_gap_ms: i64,
}

impl Default for Grid {
    fn default() -> Grid {
        Grid {
            mode: GridMode::Query,
            columns: Vec::new(),
            reverse: HashMap::new(),
            external_id: 0,
            linear_id: 0,
            id: String::new(),
            rows: Vec::new(),
            flags: Vec::new(),
            props: Json::Object(Map::new()),
            insert_seen: HashSet::new(),
            session_column: None,
            session_gap_ms: DEFAULT_SESSION_GAP_MS,
        }
    }
}

impl Grid {
    pub fn new() -> Grid {
        Grid::default()
    }

    pub fn with_session_column(mut self, column_name: &str, gap_ms: i64) -> Grid {
        self.session_column = Some(column_name.to_string());
        self.session_gap_ms = gap_ms;
        self
    }

    /// Bind the grid to `schema`, either to the full schema (inserts,
    /// introspection) or a named subset (query execution).
    pub fn map_schema(&mut self, schema: &Schema, column_names: Option<&[String]>) -> Result<()> {
        self.columns.clear();
        self.reverse.clear();
        self.rows.clear();
        match column_names {
            None => {
                self.mode = GridMode::FullSchema;
                for col in schema.columns() {
                    self.add_mapped_column(col.id);
                }
            }
            Some(names) => {
                self.mode = GridMode::Query;
                for name in names {
                    let id = schema
                        .column_id(name)
                        .ok_or_else(|| Error::BadSchema(format!("unknown column {name}")))?;
                    self.add_mapped_column(id);
                }
            }
        }
        Ok(())
    }

    fn add_mapped_column(&mut self, id: u16) {
        if self.reverse.contains_key(&id) {
            return;
        }
        self.reverse.insert(id, self.columns.len());
        self.columns.push(id);
        for row in &mut self.rows {
            row.push(None);
        }
    }

    pub fn mode(&self) -> GridMode {
        self.mode
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Decompress `person.comp` into `self.rows`, keeping only mapped
    /// columns; cells for unmapped columns are dropped during decode.
    /// Also rehydrates `insert_seen` from the decoded rows, so a later
    /// `insert()` against this same person still rejects a row it already
    /// holds, not just duplicates seen earlier in the current call.
    pub fn mount(
        &mut self,
        person: &PersonData,
        schema: &Schema,
        interner: &dyn StringInterner,
    ) -> Result<()> {
        self.rows.clear();
        self.insert_seen.clear();
        self.external_id = person.external_id;
        self.linear_id = person.linear_id;
        self.id = person.id.clone();
        self.flags = person.flags.clone();
        self.props = if person.props.is_empty() {
            Json::Object(Map::new())
        } else {
            serde_json::from_slice(&person.props)?
        };

        let decompressed = if person.comp.is_empty() {
            Vec::new()
        } else {
            lz4_flex::block::decompress(&person.comp, person.uncompressed_event_bytes as usize)
                .map_err(|e| Error::BadRecord(format!("lz4 decode failed: {e}")))?
        };
        let enc_rows = decode_rows(&decompressed)?;

        for enc_row in enc_rows {
            let mut row = vec![None; self.columns.len()];
            for (col, payload) in enc_row {
                let Some(&idx) = self.reverse.get(&col) else {
                    continue; // not mapped into this grid; dropped, never materialized
                };
                let column_type = schema
                    .column(col)
                    .ok_or_else(|| Error::BadRecord(format!("unknown column id {col}")))?
                    .column_type;
                let value = match column_type {
                    ColumnType::Text => Val::Text(interner.resolve(payload).unwrap_or_default()),
                    ColumnType::Double => Val::Double(decode_double(payload).into()),
                    ColumnType::Bool => Val::Bool(payload != 0),
                    ColumnType::Int => Val::Int(payload),
                };
                row[idx] = Some(value);
            }
            let cells: Vec<(u16, Val)> = row
                .iter()
                .enumerate()
                .filter_map(|(idx, cell)| cell.as_ref().map(|v| (self.columns[idx], v.clone())))
                .collect();
            self.insert_seen.insert(row_digest(&cells));
            self.rows.push(row);
        }
        Ok(())
    }

    /// Merge `row_json` into the grid, skipping exact duplicates per
    /// `(timestamp, __action, row)` and auto-adding unknown columns when
    /// `schema` is in permissive mode.
    pub fn insert(&mut self, schema: &mut Schema, interner: &mut dyn StringInterner, row_json: &Json, now_ms: i64) -> Result<bool> {
        let obj = row_json
            .as_object()
            .ok_or_else(|| Error::BadInsert("insert row must be a JSON object".into()))?;

        let mut cells: Vec<(u16, Val)> = Vec::with_capacity(obj.len());
        for (name, json_value) in obj {
            let value = Val::from_json(json_value);
            let value_type = value.get_type().unwrap_or(ColumnType::Text);
            let col_id = schema.resolve_or_add(name, value_type)?;
            cells.push((col_id, value));
        }

        let time_col = schema.column_id(TIME_COLUMN).unwrap();
        if !cells.iter().any(|&(c, _)| c == time_col) {
            cells.push((time_col, Val::Int(now_ms)));
        }

        let digest = row_digest(&cells);
        if !self.insert_seen.insert(digest) {
            return Ok(false); // duplicate, skipped
        }

        for &(col, _) in &cells {
            self.add_mapped_column(col);
        }
        let mut row = vec![None; self.columns.len()];
        for (col, value) in cells {
            let idx = self.reverse[&col];
            row[idx] = Some(value);
        }
        self.rows.push(row);
        Ok(true)
    }

    fn time_idx(&self, schema: &Schema) -> Option<usize> {
        schema.column_id(TIME_COLUMN).and_then(|id| self.reverse.get(&id).copied())
    }

    /// Sort rows by timestamp, recompute session group ids, re-encode the
    /// event stream, and return the canonical packed buffer.
    pub fn commit(&mut self, schema: &Schema, interner: &mut dyn StringInterner) -> Result<PersonData> {
        let time_idx = self
            .time_idx(schema)
            .ok_or_else(|| Error::BadSchema("grid has no time column mapped".into()))?;

        self.rows.sort_by_key(|row| match &row[time_idx] {
            Some(Val::Int(t)) => *t,
            _ => i64::MIN,
        });

        if let Some(session_name) = self.session_column.clone() {
            let session_col = schema
                .column_id(&session_name)
                .ok_or_else(|| Error::BadSchema(format!("unknown session column {session_name}")))?;
            self.add_mapped_column(session_col);
            let session_idx = self.reverse[&session_col];
            let mut group_id = 0i64;
            let mut prev_time: Option<i64> = None;
            for row_idx in 0..self.rows.len() {
                let t = match &self.rows[row_idx][time_idx] {
                    Some(Val::Int(t)) => *t,
                    _ => 0,
                };
                let new_group = match prev_time {
                    None => true,
                    Some(p) => t - p > self.session_gap_ms,
                };
                if new_group {
                    group_id += 1;
                }
                prev_time = Some(t);
                self.rows[row_idx][session_idx] = Some(Val::Int(group_id));
            }
        }

        let mut enc_rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut cells: Vec<(u16, i64)> = Vec::new();
            for (idx, cell) in row.iter().enumerate() {
                if let Some(value) = cell {
                    let col_id = self.columns[idx];
                    let column_type = schema
                        .column(col_id)
                        .ok_or_else(|| Error::BadSchema(format!("unknown column id {col_id}")))?
                        .column_type;
                    let payload = match (column_type, value) {
                        (ColumnType::Text, Val::Text(s)) => interner.intern(s),
                        (ColumnType::Double, _) => encode_double(value.as_f64().unwrap_or(0.0)),
                        (ColumnType::Bool, _) => value.as_bool().unwrap_or(false) as i64,
                        _ => value.as_i64().unwrap_or(0),
                    };
                    cells.push((col_id, payload));
                }
            }
            cells.sort_by_key(|&(c, _)| c);
            enc_rows.push(cells);
        }

        let plain = encode_rows(&enc_rows);
        let uncompressed_event_bytes = plain.len() as u32;
        let comp = if plain.is_empty() {
            Vec::new()
        } else {
            lz4_flex::block::compress(&plain)
        };

        Ok(PersonData {
            external_id: self.external_id,
            linear_id: self.linear_id,
            uncompressed_event_bytes,
            id: self.id.clone(),
            flags: self.flags.clone(),
            props: serde_json::to_vec(&self.props)?,
            comp,
        })
    }

    pub fn add_flag(&mut self, flag: FlagRecord) {
        self.flags = crate::person::flags::add_flag(&self.flags, flag);
    }

    pub fn clear_flag(&mut self, flag_type: u16) {
        self.flags = crate::person::flags::clear_flag(&self.flags, flag_type);
    }

    pub fn flags(&self) -> &[FlagRecord] {
        &self.flags
    }

    /// Lossless JSON representation of the mounted rows.
    pub fn to_json(&self, schema: &Schema) -> Json {
        let mut out = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut obj = Map::new();
            for (idx, cell) in row.iter().enumerate() {
                if let Some(value) = cell {
                    let col_id = self.columns[idx];
                    if let Some(def) = schema.column(col_id) {
                        obj.insert(def.name.clone(), value.to_json());
                    }
                }
            }
            out.push(Json::Object(obj));
        }
        Json::Array(out)
    }

    pub fn column_value(&self, row: usize, schema_col: u16) -> Option<&Val> {
        let idx = *self.reverse.get(&schema_col)?;
        self.rows.get(row)?.get(idx)?.as_ref()
    }

    pub fn action_value(&self, row: usize, schema: &Schema) -> Option<&Val> {
        self.column_value(row, schema.action_column())
    }
}

fn row_digest(cells: &[(u16, Val)]) -> u128 {
    let mut sorted: Vec<&(u16, Val)> = cells.iter().collect();
    sorted.sort_by_key(|&&(c, _)| c);
    let mut h1 = FnvHasher::default();
    let mut h2 = FnvHasher::with_key(0x9E37_79B9_7F4A_7C15);
    for (col, value) in sorted {
        let rendered = format!("{col}:{value}");
        h1.write(rendered.as_bytes());
        h2.write(rendered.as_bytes());
    }
    ((h1.finish() as u128) << 64) | h2.finish() as u128
}
