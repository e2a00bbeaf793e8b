//! String interning used to carry text columns as 64-bit hashes in the row
//! stream (§3) while keeping a reverse map for `toJSON`/result rendering.

use std::collections::HashMap;
use std::hash::Hasher;

use fnv::FnvHasher;

pub fn hash_str(s: &str) -> i64 {
    let mut hasher = FnvHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish() as i64
}

/// A per-partition interning table: owned by the attribute store (§4.B) so
/// that both the index and the grid resolve hashed text through the same
/// dictionary.
pub trait StringInterner {
    fn intern(&mut self, s: &str) -> i64;
    fn resolve(&self, hash: i64) -> Option<String>;
}

#[derive(Debug, Default, Clone)]
pub struct InternTable {
    forward: HashMap<i64, String>,
}

impl StringInterner for InternTable {
    fn intern(&mut self, s: &str) -> i64 {
        let h = hash_str(s);
        self.forward.entry(h).or_insert_with(|| s.to_string());
        h
    }

    fn resolve(&self, hash: i64) -> Option<String> {
        self.forward.get(&hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_and_resolve() {
        let mut table = InternTable::default();
        let h = table.intern("us");
        assert_eq!(table.resolve(h).as_deref(), Some("us"));
    }

    #[test]
    fn same_string_same_hash() {
        let mut table = InternTable::default();
        assert_eq!(table.intern("a"), table.intern("a"));
    }
}
