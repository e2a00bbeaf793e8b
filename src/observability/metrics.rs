//! Prometheus counters/gauges published by the core (§1 ambient stack).
//! Registered once, process-wide, via the standard `lazy_static!` +
//! `register_*!` idiom.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_gauge};
use prometheus::{Counter, Gauge};

lazy_static! {
    pub static ref QUERIES_TOTAL: Counter =
        register_counter!("queries_total", "Number of queries executed").unwrap();
    pub static ref QUERIES_OK_TOTAL: Counter =
        register_counter!("queries_ok_total", "Number of queries executed successfully").unwrap();
    pub static ref QUERIES_ERROR_TOTAL: Counter =
        register_counter!("queries_error_total", "Number of queries that returned an error").unwrap();
    pub static ref CELLS_RUN_TOTAL: Counter =
        register_counter!("cells_run_total", "Number of cell run() steps executed").unwrap();
    pub static ref SEGMENT_CACHE_HITS_TOTAL: Counter =
        register_counter!("segment_cache_hits_total", "Segment lookups served from a cached bitmap").unwrap();
    pub static ref SEGMENT_CACHE_MISSES_TOTAL: Counter =
        register_counter!("segment_cache_misses_total", "Segment lookups that required recomputation").unwrap();
    pub static ref INSERTS_TOTAL: Counter =
        register_counter!("inserts_total", "Number of insert calls accepted").unwrap();
    pub static ref INSERT_ROWS_TOTAL: Counter =
        register_counter!("insert_rows_total", "Number of event rows ingested").unwrap();
    pub static ref SUSPEND_TOTAL: Counter =
        register_counter!("suspend_total", "Number of suspendAsync calls").unwrap();
    pub static ref WORKERS_SUSPENDED: Gauge =
        register_gauge!("workers_suspended", "Workers currently parked in a suspended region").unwrap();
    pub static ref PARTITION_COUNT: Gauge =
        register_gauge!("partition_count", "Number of partitions owned by this node").unwrap();
    pub static ref PERSON_COUNT: Gauge =
        register_gauge!("person_count", "Number of person records held across owned partitions").unwrap();
}
