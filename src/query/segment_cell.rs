//! `SegmentCell`: the scheduler's `Segment-refresh` [`Cell`] (§3/§4.F/§4.G),
//! materializing one declared segment's bitmap for one partition.
//!
//! Membership follows the same rule a tally uses to decide a person
//! contributed a row: a person is in the segment iff running its body's
//! compiled [`Macro`] against them executes at least one `tally(...)` (the
//! common shape is `if <predicate>: tally(1): n = count(1)`). The bitmap is
//! stored back into the partition's attribute store under the segment's
//! name, stamped with fresh `SegmentMeta` TTL/refresh bookkeeping.

use std::sync::Arc;

use crate::errors::Error;
use crate::index::bitmap::IndexBits;
use crate::index::segment::SegmentMeta;
use crate::interp::Interp;
use crate::partition::PartitionState;
use crate::person::grid::Grid;
use crate::query::macro_::Macro;
use crate::scheduler::cell::{Cell, CellStatus};
use crate::schema::Schema;
use crate::shuttle::Shuttle;

const BATCH_SIZE: usize = 64;

pub struct SegmentCell {
    name: String,
    macro_: Arc<Macro>,
    schema: Arc<Schema>,
    partition: Arc<PartitionState>,
    now_ms: i64,
    ttl_ms: i64,
    refresh_interval_ms: i64,
    shuttle: Arc<Shuttle<()>>,
    candidates: Vec<u32>,
    cursor: usize,
    bits: IndexBits,
    error: Option<Error>,
}

impl SegmentCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        macro_: Arc<Macro>,
        schema: Arc<Schema>,
        partition: Arc<PartitionState>,
        now_ms: i64,
        ttl_ms: i64,
        refresh_interval_ms: i64,
        shuttle: Arc<Shuttle<()>>,
    ) -> SegmentCell {
        SegmentCell {
            name,
            macro_,
            schema,
            partition,
            now_ms,
            ttl_ms,
            refresh_interval_ms,
            shuttle,
            candidates: Vec::new(),
            cursor: 0,
            bits: IndexBits::new(0),
            error: None,
        }
    }

    fn test_one_person(&mut self, linear_id: u32) {
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
        if interp.results().row_count() > 0 {
            self.bits.set(linear_id);
        }
    }
}

impl Cell for SegmentCell {
    fn prepare(&mut self) {
        self.candidates = (0..self.partition.max_linear_id()).collect();
        self.bits = IndexBits::new(self.partition.max_linear_id() as usize);
    }

    fn run(&mut self) -> CellStatus {
        let end = (self.cursor + BATCH_SIZE).min(self.candidates.len());
        for i in self.cursor..end {
            let linear_id = self.candidates[i];
            self.test_one_person(linear_id);
            if self.error.is_some() {
                break;
            }
        }
        self.cursor = end;

        if self.error.is_some() || self.cursor >= self.candidates.len() {
            match self.error.take() {
                Some(e) => self.shuttle.reply(Err(e)),
                None => {
                    let mut store = self.partition.attributes.lock().unwrap();
                    let meta = SegmentMeta::new(self.ttl_ms, self.refresh_interval_ms, self.now_ms);
                    let bits = std::mem::replace(&mut self.bits, IndexBits::new(0));
                    store.set_segment(&self.name, bits, meta);
                    drop(store);
                    self.shuttle.reply(Ok(()));
                }
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
        "segment-refresh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::person::intern::InternTable;
    use crate::query::compiler::compile_segment;
    use crate::query::ast::SegmentDecl;
    use crate::query::parser;
    use crate::schema::ColumnType;
    use serde_json::json;
    use std::time::Duration;

    fn insert_person(partition: &PartitionState, schema: &mut Schema, external_id: &str, country: &str) {
        let linear_id = partition.linear_id_for(external_id);
        let mut interner = InternTable::default();
        let mut grid = Grid::new();
        grid.map_schema(schema, None).unwrap();
        grid.linear_id = linear_id;
        grid.id = external_id.to_string();
        grid.insert(schema, &mut interner, &json!({"__time": 1, "__action": "view", "country": country}), 0).unwrap();
        let packed = grid.commit(schema, &mut interner).unwrap();
        partition.put_person(linear_id, packed);
    }

    #[test]
    fn materializes_bitmap_for_matching_persons_only() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let partition = Arc::new(PartitionState::new(0));
        insert_person(&partition, &mut schema, "alice", "us");
        insert_person(&partition, &mut schema, "bob", "fr");

        let program = parser::parse("segment us_users:\n    if country == \"us\":\n        tally(1):\n            n = count(1)\n").unwrap();
        let decl: &SegmentDecl = &program.segments[0];
        let macro_ = Arc::new(compile_segment(&schema, decl, &["us_users".to_string()]).unwrap());

        let shuttle = Arc::new(Shuttle::new(1, |_: (), _: ()| ()));
        let mut cell = SegmentCell::new(
            "us_users".to_string(),
            macro_,
            Arc::new(schema),
            partition.clone(),
            0,
            60_000,
            5_000,
            shuttle.clone(),
        );
        cell.prepare();
        while cell.run() == CellStatus::Continue {}
        shuttle.wait(Duration::from_secs(1)).unwrap();

        let store = partition.attributes.lock().unwrap();
        let (bits, meta) = store.get_segment("us_users").unwrap();
        assert_eq!(bits.population(), 1);
        assert!(bits.get(partition.existing_linear_id("alice").unwrap()));
        assert!(!bits.get(partition.existing_linear_id("bob").unwrap()));
        assert_eq!(meta.ttl_ms, 60_000);
    }
}
