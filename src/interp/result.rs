//! Result tree the interpreter's `tally` opcode addresses into (§4.E). Keyed
//! by the tuple of key expressions evaluated at a `tally(...)` call site;
//! merge is commutative/associative so partial results from independent
//! partitions combine without replaying any person (§4.G).

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value as Json};

use crate::query::ast::Modifier;
use crate::value::Val;

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(f64),
    Min(f64),
    Max(f64),
    Avg { sum: f64, count: u64 },
    Count(u64),
    DistCountPerson(HashSet<u32>),
    Value(Val),
    /// Running variance via Welford's algorithm.
    Var { count: u64, mean: f64, m2: f64 },
}

impl Accumulator {
    fn seed(modifier: Modifier, value: &Val, linear_id: u32) -> Accumulator {
        let f = value.as_f64().unwrap_or(0.0);
        match modifier {
            Modifier::Sum => Accumulator::Sum(f),
            Modifier::Min => Accumulator::Min(f),
            Modifier::Max => Accumulator::Max(f),
            Modifier::Avg => Accumulator::Avg { sum: f, count: 1 },
            Modifier::Count => Accumulator::Count(1),
            Modifier::DistCountPerson => {
                let mut set = HashSet::new();
                set.insert(linear_id);
                Accumulator::DistCountPerson(set)
            }
            Modifier::Value => Accumulator::Value(value.clone()),
            Modifier::Var => Accumulator::Var { count: 1, mean: f, m2: 0.0 },
        }
    }

    fn fold(&mut self, modifier: Modifier, value: &Val, linear_id: u32) {
        let f = value.as_f64().unwrap_or(0.0);
        match (self, modifier) {
            (Accumulator::Sum(s), Modifier::Sum) => *s += f,
            (Accumulator::Min(m), Modifier::Min) => *m = m.min(f),
            (Accumulator::Max(m), Modifier::Max) => *m = m.max(f),
            (Accumulator::Avg { sum, count }, Modifier::Avg) => {
                *sum += f;
                *count += 1;
            }
            (Accumulator::Count(c), Modifier::Count) => *c += 1,
            (Accumulator::DistCountPerson(set), Modifier::DistCountPerson) => {
                set.insert(linear_id);
            }
            (Accumulator::Value(v), Modifier::Value) => *v = value.clone(),
            (Accumulator::Var { count, mean, m2 }, Modifier::Var) => {
                *count += 1;
                let delta = f - *mean;
                *mean += delta / *count as f64;
                let delta2 = f - *mean;
                *m2 += delta * delta2;
            }
            (acc, m) => panic!("accumulator/modifier mismatch: {acc:?} vs {m:?}"),
        }
    }

    /// Commutative, associative merge across partitions (§4.G).
    fn merge(self, other: Accumulator) -> Accumulator {
        match (self, other) {
            (Accumulator::Sum(a), Accumulator::Sum(b)) => Accumulator::Sum(a + b),
            (Accumulator::Min(a), Accumulator::Min(b)) => Accumulator::Min(a.min(b)),
            (Accumulator::Max(a), Accumulator::Max(b)) => Accumulator::Max(a.max(b)),
            (Accumulator::Avg { sum: s1, count: c1 }, Accumulator::Avg { sum: s2, count: c2 }) => {
                Accumulator::Avg { sum: s1 + s2, count: c1 + c2 }
            }
            (Accumulator::Count(a), Accumulator::Count(b)) => Accumulator::Count(a + b),
            (Accumulator::DistCountPerson(mut a), Accumulator::DistCountPerson(b)) => {
                a.extend(b);
                Accumulator::DistCountPerson(a)
            }
            (Accumulator::Value(_), Accumulator::Value(b)) => Accumulator::Value(b),
            (
                Accumulator::Var { count: c1, mean: m1, m2: v1 },
                Accumulator::Var { count: c2, mean: m2, m2: v2 },
            ) => {
                let count = c1 + c2;
                if count == 0 {
                    return Accumulator::Var { count: 0, mean: 0.0, m2: 0.0 };
                }
                let delta = m2 - m1;
                let mean = m1 + delta * (c2 as f64) / (count as f64);
                let merged_m2 = v1 + v2 + delta * delta * (c1 as f64) * (c2 as f64) / (count as f64);
                Accumulator::Var { count, mean, m2: merged_m2 }
            }
            (a, _) => a,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Accumulator::Sum(v) | Accumulator::Min(v) | Accumulator::Max(v) => {
                serde_json::Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null)
            }
            Accumulator::Avg { sum, count } => {
                let avg = if *count == 0 { 0.0 } else { sum / *count as f64 };
                serde_json::Number::from_f64(avg).map(Json::Number).unwrap_or(Json::Null)
            }
            Accumulator::Count(c) => Json::from(*c),
            Accumulator::DistCountPerson(set) => Json::from(set.len() as u64),
            Accumulator::Value(v) => v.to_json(),
            Accumulator::Var { count, m2, .. } => {
                let var = if *count < 2 { 0.0 } else { m2 / (*count - 1) as f64 };
                serde_json::Number::from_f64(var).map(Json::Number).unwrap_or(Json::Null)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    rows: HashMap<Vec<Val>, HashMap<u32, (Modifier, Accumulator)>>,
}

impl ResultSet {
    pub fn new() -> ResultSet {
        ResultSet::default()
    }

    pub fn record(&mut self, keys: Vec<Val>, target: u32, modifier: Modifier, value: &Val, linear_id: u32) {
        let row = self.rows.entry(keys).or_default();
        match row.get_mut(&target) {
            Some((_, acc)) => acc.fold(modifier, value, linear_id),
            None => {
                row.insert(target, (modifier, Accumulator::seed(modifier, value, linear_id)));
            }
        }
    }

    /// Seeds a row directly from a known population, without folding one
    /// call per person (the `countable` fast path in §4.D/§4.F, where the
    /// candidate bitmap's population is already the answer). Only valid for
    /// modifiers fully determined by population: `Count` and
    /// `DistCountPerson`.
    pub fn record_population(&mut self, keys: Vec<Val>, target: u32, modifier: Modifier, population: u64) {
        let acc = match modifier {
            Modifier::Count => Accumulator::Count(population),
            Modifier::DistCountPerson => Accumulator::DistCountPerson((0..population as u32).collect()),
            _ => panic!("record_population only supports population-determined modifiers, got {modifier:?}"),
        };
        self.rows.entry(keys).or_default().insert(target, (modifier, acc));
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, keys: &[Val], target: u32) -> Option<&Accumulator> {
        self.rows.get(keys).and_then(|row| row.get(&target)).map(|(_, acc)| acc)
    }

    /// Commutative/associative merge across partitions (§4.G): tallies add,
    /// distinct-count sets union, min/max fold.
    pub fn merge(mut self, other: ResultSet) -> ResultSet {
        for (keys, row) in other.rows {
            let entry = self.rows.entry(keys).or_default();
            for (target, (modifier, acc)) in row {
                match entry.remove(&target) {
                    Some((_, existing)) => {
                        entry.insert(target, (modifier, existing.merge(acc)));
                    }
                    None => {
                        entry.insert(target, (modifier, acc));
                    }
                }
            }
        }
        self
    }

    /// Renders one JSON object per tally row, keyed by a `"."`-joined
    /// rendering of the key tuple, with target ids rendered under `columns`.
    pub fn to_json(&self) -> Json {
        let mut rows = Vec::with_capacity(self.rows.len());
        for (keys, row) in &self.rows {
            let mut obj = Map::new();
            obj.insert(
                "key".into(),
                Json::Array(keys.iter().map(Val::to_json).collect()),
            );
            let mut columns = Map::new();
            let mut sorted: Vec<_> = row.iter().collect();
            sorted.sort_by_key(|(target, _)| **target);
            for (target, (_, acc)) in sorted {
                columns.insert(target.to_string(), acc.to_json());
            }
            obj.insert("columns".into(), Json::Object(columns));
            rows.push(Json::Object(obj));
        }
        Json::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_accumulates_across_records() {
        let mut rs = ResultSet::new();
        rs.record(vec![Val::Text("us".into())], 0, Modifier::Count, &Val::Int(1), 1);
        rs.record(vec![Val::Text("us".into())], 0, Modifier::Count, &Val::Int(1), 2);
        assert_eq!(rs.get(&[Val::Text("us".into())], 0), Some(&Accumulator::Count(2)));
    }

    #[test]
    fn dist_count_person_deduplicates_linear_ids() {
        let mut rs = ResultSet::new();
        let key = vec![Val::Text("us".into())];
        rs.record(key.clone(), 0, Modifier::DistCountPerson, &Val::Int(1), 7);
        rs.record(key.clone(), 0, Modifier::DistCountPerson, &Val::Int(1), 7);
        rs.record(key.clone(), 0, Modifier::DistCountPerson, &Val::Int(1), 8);
        match rs.get(&key, 0).unwrap() {
            Accumulator::DistCountPerson(set) => assert_eq!(set.len(), 2),
            other => panic!("wrong accumulator {other:?}"),
        }
    }

    #[test]
    fn merge_sums_tallies_from_two_partitions() {
        let mut a = ResultSet::new();
        a.record(vec![Val::Int(1)], 0, Modifier::Sum, &Val::Int(10), 1);
        let mut b = ResultSet::new();
        b.record(vec![Val::Int(1)], 0, Modifier::Sum, &Val::Int(5), 2);
        let merged = a.merge(b);
        assert_eq!(merged.get(&[Val::Int(1)], 0), Some(&Accumulator::Sum(15.0)));
    }

    #[test]
    fn min_max_fold_on_merge() {
        let mut a = ResultSet::new();
        a.record(vec![], 0, Modifier::Min, &Val::Int(10), 1);
        let mut b = ResultSet::new();
        b.record(vec![], 0, Modifier::Min, &Val::Int(3), 2);
        let merged = a.merge(b);
        assert_eq!(merged.get(&[], 0), Some(&Accumulator::Min(3.0)));
    }
}
