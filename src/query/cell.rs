//! `QueryCell`: the scheduler [`Cell`](crate::scheduler::Cell) that drives a
//! compiled [`Macro`] to completion against one partition (§4.E/§4.F),
//! replying once to a [`Shuttle`] when every candidate person has been
//! visited.
//!
//! Index hints narrow the set of persons mounted. Two top-level forms skip
//! person-mounting entirely: `is_segment_math` (runs the Macro once, with no
//! grid mounted) and `countable` (the candidate bitmap's population seeds
//! the tally result directly). Every other Macro still mounts and runs its
//! real bytecode per candidate person.

use std::sync::Arc;

use crate::errors::Error;
use crate::interp::{Interp, ResultSet};
use crate::partition::PartitionState;
use crate::person::grid::Grid;
use crate::query::ast::Modifier;
use crate::query::hint;
use crate::query::macro_::Macro;
use crate::scheduler::cell::{Cell, CellStatus};
use crate::schema::Schema;
use crate::shuttle::Shuttle;
use crate::value::Val;

/// Persons mounted per `run()` step, bounding one cell's time slice (§4.F).
const BATCH_SIZE: usize = 64;

pub struct QueryCell {
    macro_: Arc<Macro>,
    schema: Arc<Schema>,
    partition: Arc<PartitionState>,
    now_ms: i64,
    shuttle: Arc<Shuttle<ResultSet>>,
    candidates: Vec<u32>,
    cursor: usize,
    accum: ResultSet,
    immediate: Option<ResultSet>,
    error: Option<Error>,
}

impl QueryCell {
    pub fn new(
        macro_: Arc<Macro>,
        schema: Arc<Schema>,
        partition: Arc<PartitionState>,
        now_ms: i64,
        shuttle: Arc<Shuttle<ResultSet>>,
    ) -> QueryCell {
        QueryCell {
            macro_,
            schema,
            partition,
            now_ms,
            shuttle,
            candidates: Vec::new(),
            cursor: 0,
            accum: ResultSet::new(),
            immediate: None,
            error: None,
        }
    }

    fn run_one_person(&mut self, linear_id: u32) {
        let Some(person) = self.partition.get_person(linear_id) else { return };
        let store = self.partition.attributes.lock().unwrap();
        let mut grid = Grid::new();
        if let Err(e) = grid.map_schema(&self.schema, None) {
            self.error.get_or_insert(e);
            return;
        }
        if let Err(e) = grid.mount(&person, &self.schema, &*store) {
            self.error.get_or_insert(e);
            return;
        }
        let capacity = self.partition.max_linear_id() as usize;
        let mut interp = Interp::new(&self.schema, &grid, &store, capacity, self.now_ms);
        if let Err(e) = interp.run(&self.macro_) {
            self.error.get_or_insert(e);
            return;
        }
        self.accum = std::mem::take(&mut self.accum).merge(interp.results().clone());
    }
}

impl Cell for QueryCell {
    fn prepare(&mut self) {
        if self.macro_.is_segment_math {
            let store = self.partition.attributes.lock().unwrap();
            let grid = Grid::new();
            let capacity = self.partition.max_linear_id() as usize;
            let mut interp = Interp::new(&self.schema, &grid, &store, capacity, self.now_ms);
            match interp.run(&self.macro_) {
                Ok(()) => {
                    let value = interp.returned().cloned().unwrap_or(Val::Null);
                    let mut result = ResultSet::new();
                    // Sum, not overwrite: each partition evaluates segment math once
                    // over its own disjoint person ids, so the per-partition values
                    // (populations / population arithmetic) add across the shuttle.
                    result.record(Vec::new(), 0, Modifier::Sum, &value, 0);
                    self.immediate = Some(result);
                }
                Err(e) => self.error = Some(e),
            }
            return;
        }

        if self.macro_.countable {
            let store = self.partition.attributes.lock().unwrap();
            let capacity = self.partition.max_linear_id() as usize;
            match hint::fold(&store, &self.macro_, capacity) {
                Ok(bits) => {
                    let population = bits.population() as u64;
                    let mut result = ResultSet::new();
                    for target in &self.macro_.tally_targets {
                        result.record_population(
                            self.macro_.countable_keys.clone(),
                            target.column as u32,
                            target.modifier,
                            population,
                        );
                    }
                    self.immediate = Some(result);
                }
                Err(e) => self.error = Some(e),
            }
            return;
        }

        if self.macro_.hint_program.is_empty() {
            self.candidates = (0..self.partition.max_linear_id()).collect();
        } else {
            let store = self.partition.attributes.lock().unwrap();
            let capacity = self.partition.max_linear_id() as usize;
            match hint::fold(&store, &self.macro_, capacity) {
                Ok(bits) => self.candidates = bits.iter().collect(),
                Err(e) => self.error = Some(e),
            }
        }
    }

    fn run(&mut self) -> CellStatus {
        if let Some(e) = self.error.take() {
            self.shuttle.reply(Err(e));
            return CellStatus::Done;
        }
        if let Some(result) = self.immediate.take() {
            self.shuttle.reply(Ok(result));
            return CellStatus::Done;
        }

        let end = (self.cursor + BATCH_SIZE).min(self.candidates.len());
        for i in self.cursor..end {
            let linear_id = self.candidates[i];
            self.run_one_person(linear_id);
            if self.error.is_some() {
                break;
            }
        }
        self.cursor = end;

        if self.error.is_some() || self.cursor >= self.candidates.len() {
            match self.error.take() {
                Some(e) => self.shuttle.reply(Err(e)),
                None => self.shuttle.reply(Ok(std::mem::take(&mut self.accum))),
            }
            CellStatus::Done
        } else {
            CellStatus::Continue
        }
    }

    fn partition_removed(&mut self) {
        self.shuttle.reply(Err(Error::PartitionMigrated));
    }

    fn is_realtime(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "query"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::person::intern::InternTable;
    use crate::person::StringInterner;
    use crate::query::compiler::compile;
    use crate::schema::ColumnType;
    use serde_json::json;
    use std::time::Duration;

    fn insert_person(partition: &PartitionState, schema: &mut Schema, external_id: &str, rows: &[serde_json::Value]) {
        let linear_id = partition.linear_id_for(external_id);
        let mut interner = InternTable::default();
        let mut grid = Grid::new();
        grid.map_schema(schema, None).unwrap();
        grid.linear_id = linear_id;
        grid.id = external_id.to_string();
        for row in rows {
            grid.insert(schema, &mut interner, row, 0).unwrap();
        }
        let packed = grid.commit(schema, &mut interner).unwrap();
        partition.put_person(linear_id, packed);
        let mut store = partition.attributes.lock().unwrap();
        let country_id = schema.column_id("country").unwrap();
        store.mark_membership(country_id, &crate::value::Val::Text("us".into()), linear_id, 16);
    }

    #[test]
    fn counts_two_matching_persons() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let partition = Arc::new(PartitionState::new(0));
        insert_person(&partition, &mut schema, "alice", &[json!({"__time": 1, "__action": "view", "country": "us"})]);
        insert_person(&partition, &mut schema, "bob", &[json!({"__time": 1, "__action": "view", "country": "us"})]);

        let macro_ = Arc::new(
            compile(&schema, "if country == \"us\":\n    tally(1):\n        n = count(1)\n").unwrap(),
        );
        let shuttle = Arc::new(Shuttle::new(1, |a: ResultSet, b: ResultSet| a.merge(b)));
        let mut cell = QueryCell::new(macro_, Arc::new(schema), partition, 0, shuttle.clone());
        cell.prepare();
        while cell.run() == CellStatus::Continue {}

        let result = shuttle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn countable_query_answers_from_the_bitmap_without_mounting_any_person() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let partition = Arc::new(PartitionState::new(0));
        // Mark two linear ids as matching in the index, but never call
        // `put_person`: if the cell fell back to per-person iteration,
        // `get_person` would return `None` for both and the result would
        // stay empty, so a non-empty, correct count proves the candidate
        // bitmap's population alone answered the query.
        {
            let capacity = 16;
            let mut store = partition.attributes.lock().unwrap();
            store.mark_membership(schema.column_id("country").unwrap(), &crate::value::Val::Text("us".into()), 0, capacity);
            store.mark_membership(schema.column_id("country").unwrap(), &crate::value::Val::Text("us".into()), 1, capacity);
        }
        partition.linear_id_for("alice");
        partition.linear_id_for("bob");

        let macro_ = Arc::new(
            compile(&schema, "if country == \"us\":\n    tally(1):\n        n = count(1)\n").unwrap(),
        );
        assert!(macro_.countable);
        let shuttle = Arc::new(Shuttle::new(1, |a: ResultSet, b: ResultSet| a.merge(b)));
        let mut cell = QueryCell::new(macro_, Arc::new(schema), partition, 0, shuttle.clone());
        cell.prepare();
        while cell.run() == CellStatus::Continue {}

        let result = shuttle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.get(&[crate::value::Val::Int(1)], 0).unwrap().to_json(), json!(2));
    }
}
