//! In-memory, partitioned, user-centric event database with a built-in
//! behavioral query engine (§1). This crate provides the core: schema,
//! per-partition storage and indexing, the cooperative scheduler, and the
//! query compiler/interpreter. Transport, durability, and distributed
//! rebalancing are external collaborators (see [`external`]).

pub mod errors;
pub mod external;
pub mod index;
pub mod interp;
pub mod observability;
pub mod partition;
pub mod person;
pub mod query;
pub mod schema;
pub mod scheduler;
pub mod shuttle;
pub mod value;
pub mod wire;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value as Json;

use crate::errors::Result;
use crate::interp::ResultSet;
use crate::external::{partition_for_id, OwnershipOracle, PartitionMap, StaticPartitionMap};
use crate::observability::metrics;
use crate::partition::{PartitionId, PartitionState};
use crate::person::grid::Grid;
use crate::query::ast::SegmentDecl;
use crate::query::cell::QueryCell;
use crate::query::segment_cell::SegmentCell;
use crate::schema::{Schema, SchemaMode};
use crate::scheduler::AsyncPool;
use crate::shuttle::Shuttle;

/// Process-wide knobs (§1 ambient stack): everything the core needs to boot
/// that isn't part of the data model itself.
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker threads in the cooperative scheduler's pool (§4.F).
    pub num_workers: usize,
    /// Fixed partition count this node hosts; `partition_for_id` hashes into
    /// this range (§5).
    pub partition_count: u64,
    pub schema_mode: SchemaMode,
    /// How long a query shuttle waits for every partition's cell to reply
    /// before surfacing a timeout (§4.G).
    pub query_timeout: Duration,
    /// TTL applied to a declared segment that omits an explicit `ttl` (§3).
    pub default_segment_ttl_ms: i64,
    /// Refresh interval applied to a declared segment that omits an
    /// explicit `refresh` (§3).
    pub default_segment_refresh_ms: i64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            num_workers: num_cpus::get().max(1),
            partition_count: 16,
            schema_mode: SchemaMode::Permissive,
            query_timeout: Duration::from_secs(30),
            default_segment_ttl_ms: 60_000,
            default_segment_refresh_ms: 30_000,
        }
    }
}

/// Top-level handle tying the schema, partitions, and scheduler together
/// for a single node (§1). Distributed rebalancing, durability, and RPC
/// transport sit outside this type and drive it through the same methods a
/// local caller would use.
pub struct Database {
    options: Options,
    schema: RwLock<Schema>,
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionState>>>,
    partition_map: Arc<StaticPartitionMap>,
    pool: Arc<AsyncPool>,
}

impl Database {
    pub fn new(options: Options) -> Arc<Database> {
        let ids: Vec<PartitionId> = (0..options.partition_count).collect();
        let partition_map = Arc::new(StaticPartitionMap::new(ids.iter().copied()));
        let pool = AsyncPool::start(options.num_workers, partition_map.clone() as Arc<dyn OwnershipOracle>);

        let mut partitions = HashMap::with_capacity(ids.len());
        for id in ids {
            let state = Arc::new(PartitionState::new(id));
            pool.add_partition(state.clone());
            partitions.insert(id, state);
        }
        metrics::PARTITION_COUNT.set(partitions.len() as f64);

        Arc::new(Database {
            schema: RwLock::new(Schema::new(options.schema_mode)),
            partitions: RwLock::new(partitions),
            partition_map,
            options,
            pool,
        })
    }

    pub fn schema_snapshot(&self) -> Schema {
        self.schema.read().unwrap().clone()
    }

    fn partition_for(&self, external_id: &str) -> Arc<PartitionState> {
        let id = partition_for_id(external_id, self.options.partition_count);
        self.partitions.read().unwrap().get(&id).expect("static partition map covers every id").clone()
    }

    /// Merge `rows` into `external_id`'s event stream (§4.A), auto-adding
    /// unknown columns in permissive mode. Returns the number of rows that
    /// were not exact duplicates of an existing event.
    pub fn insert(&self, external_id: &str, rows: &[Json], now_ms: i64) -> Result<usize> {
        metrics::INSERTS_TOTAL.inc();
        let partition = self.partition_for(external_id);
        let linear_id = partition.linear_id_for(external_id);

        let mut schema = self.schema.write().unwrap();
        let mut store = partition.attributes.lock().unwrap();

        let mut grid = Grid::new();
        grid.map_schema(&schema, None)?;
        if let Some(existing) = partition.get_person(linear_id) {
            grid.mount(&existing, &schema, &*store)?;
        } else {
            grid.linear_id = linear_id;
            grid.id = external_id.to_string();
        }

        let mut accepted = 0;
        for row in rows {
            if grid.insert(&mut schema, &mut *store, row, now_ms)? {
                accepted += 1;
            }
        }
        metrics::INSERT_ROWS_TOTAL.inc_by(accepted as f64);

        let packed = grid.commit(&schema, &mut *store)?;
        let capacity = partition.max_linear_id() as usize;
        for row_idx in 0..grid.row_count() {
            for column in schema.columns() {
                if let Some(value) = grid.column_value(row_idx, column.id) {
                    store.mark_membership(column.id, value, linear_id, capacity);
                }
            }
        }
        partition.put_person(linear_id, packed);

        let total_persons: usize = self.partitions.read().unwrap().values().map(|p| p.person_count()).sum();
        metrics::PERSON_COUNT.set(total_persons as f64);
        Ok(accepted)
    }

    /// Compiles and runs `source` against every partition this node owns,
    /// merging per-partition results into a single JSON result tree (§4.G).
    pub fn query(&self, source: &str, now_ms: i64) -> Result<Json> {
        metrics::QUERIES_TOTAL.inc();
        let result = self.query_inner(source, now_ms);
        match &result {
            Ok(_) => metrics::QUERIES_OK_TOTAL.inc(),
            Err(_) => metrics::QUERIES_ERROR_TOTAL.inc(),
        }
        result
    }

    fn query_inner(&self, source: &str, now_ms: i64) -> Result<Json> {
        let schema = Arc::new(self.schema_snapshot());
        let program = query::parser::parse(source)?;

        let partitions: Vec<Arc<PartitionState>> = {
            let guard = self.partitions.read().unwrap();
            self.partition_map.assigned_partitions().into_iter().filter_map(|id| guard.get(&id).cloned()).collect()
        };

        if !program.segments.is_empty() {
            self.refresh_segments(&schema, &program.segments, &partitions, now_ms)?;
        }

        if program.body.is_empty() {
            let mut rows = Vec::with_capacity(program.segments.len());
            for decl in &program.segments {
                let population: u64 = partitions
                    .iter()
                    .map(|p| {
                        let store = p.attributes.lock().unwrap();
                        store.get_segment(&decl.name).map(|(bits, _)| bits.population()).unwrap_or(0)
                    })
                    .sum();
                rows.push(serde_json::json!({"name": decl.name, "population": population}));
            }
            return Ok(Json::Array(rows));
        }

        let macro_ = Arc::new(query::compiler::compile_program(&schema, &program)?);
        let shuttle = Arc::new(Shuttle::new(partitions.len(), |a: ResultSet, b| a.merge(b)));
        for partition in partitions {
            let cell = QueryCell::new(macro_.clone(), schema.clone(), partition.clone(), now_ms, shuttle.clone());
            partition.enqueue(Box::new(cell));
        }

        let result = shuttle.wait(self.options.query_timeout)?;
        Ok(result.to_json())
    }

    /// Recomputes any declared segment whose cached bitmap is missing or
    /// past its TTL in at least one owned partition (§3), blocking until
    /// every `Segment-refresh` cell it enqueues has replied.
    fn refresh_segments(
        &self,
        schema: &Arc<Schema>,
        decls: &[SegmentDecl],
        partitions: &[Arc<PartitionState>],
        now_ms: i64,
    ) -> Result<()> {
        let sibling_names: Vec<String> = decls.iter().map(|d| d.name.clone()).collect();
        let mut pending: Vec<(Arc<PartitionState>, &SegmentDecl)> = Vec::new();
        for decl in decls {
            for partition in partitions {
                let store = partition.attributes.lock().unwrap();
                let needs_refresh = match store.is_segment_expired_ttl(&decl.name, now_ms) {
                    Some(expired) => expired,
                    None => true,
                };
                drop(store);
                if needs_refresh {
                    metrics::SEGMENT_CACHE_MISSES_TOTAL.inc();
                    pending.push((partition.clone(), decl));
                } else {
                    metrics::SEGMENT_CACHE_HITS_TOTAL.inc();
                }
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let shuttle = Arc::new(Shuttle::new(pending.len(), |_, _| ()));
        for (partition, decl) in pending {
            let macro_ = Arc::new(query::compiler::compile_segment(schema, decl, &sibling_names)?);
            let ttl_ms = decl.ttl_ms.unwrap_or(self.options.default_segment_ttl_ms);
            let refresh_ms = decl.refresh_ms.unwrap_or(self.options.default_segment_refresh_ms);
            let cell = SegmentCell::new(decl.name.clone(), macro_, schema.clone(), partition.clone(), now_ms, ttl_ms, refresh_ms, shuttle.clone());
            partition.enqueue(Box::new(cell));
        }
        shuttle.wait(self.options.query_timeout)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().unwrap().len()
    }

    pub fn shutdown(&self) {
        self.pool.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_then_count_query() {
        let db = Database::new(Options { num_workers: 2, partition_count: 4, ..Options::default() });
        db.insert("alice", &[json!({"__time": 1, "__action": "view", "country": "us"})], 0).unwrap();
        db.insert("bob", &[json!({"__time": 1, "__action": "view", "country": "fr"})], 0).unwrap();

        let result = db
            .query("if country == \"us\":\n    tally(1):\n        n = count(1)\n", 0)
            .unwrap();
        assert!(result.is_array());
        db.shutdown();
    }

    #[test]
    fn duplicate_insert_is_not_double_counted() {
        let db = Database::new(Options { num_workers: 1, partition_count: 1, ..Options::default() });
        let row = json!({"__time": 1, "__action": "view"});
        assert_eq!(db.insert("alice", &[row.clone()], 0).unwrap(), 1);
        assert_eq!(db.insert("alice", &[row], 0).unwrap(), 0);
        db.shutdown();
    }
}
