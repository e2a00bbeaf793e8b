//! Ambient observability (§1): `prometheus`-backed counters/gauges. Logging
//! itself goes through the `log` facade directly from call sites, with no
//! wrapper module — call sites use bare `log::{trace,debug,info,warn}!`.

pub(crate) mod metrics;
