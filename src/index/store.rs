//! Attribute/Index store (§4.B): per-partition `(column, value) -> bitmap`
//! map, plus named segment storage and the shared string interning table.

use std::collections::HashMap;

use crate::index::bitmap::{CompressedBits, IndexBits};
use crate::index::segment::SegmentMeta;
use crate::person::intern::{InternTable, StringInterner};
use crate::value::Val;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct AttrKey {
    column: u16,
    value: Val,
}

#[derive(Debug, Default)]
pub struct AttributeStore {
    attrs: HashMap<AttrKey, CompressedBits>,
    segments: HashMap<String, (CompressedBits, SegmentMeta)>,
    strings: InternTable,
}

impl AttributeStore {
    pub fn new() -> AttributeStore {
        AttributeStore::default()
    }

    pub fn get(&self, column: u16, value: &Val) -> Option<IndexBits> {
        self.attrs
            .get(&AttrKey { column, value: value.clone() })
            .map(CompressedBits::decompress)
    }

    /// Create-if-absent: returns a fresh empty bitmap when no attribute
    /// record exists yet for `(column, value)`.
    pub fn get_make(&mut self, column: u16, value: &Val, capacity: usize) -> IndexBits {
        self.get(column, value).unwrap_or_else(|| IndexBits::new(capacity))
    }

    /// Atomically replace the stored bitmap for `(column, value)`, taking
    /// ownership of `bits`. Returns the previous bitmap, if any, for the
    /// caller to dispose of.
    pub fn swap(&mut self, column: u16, value: &Val, bits: IndexBits) -> Option<IndexBits> {
        let key = AttrKey { column, value: value.clone() };
        let previous = self.attrs.get(&key).map(CompressedBits::decompress);
        self.attrs.insert(key, bits.compress());
        previous
    }

    pub fn mark_membership(&mut self, column: u16, value: &Val, linear_id: u32, capacity: usize) {
        let mut bits = self.get_make(column, value, capacity);
        bits.set(linear_id);
        self.swap(column, value, bits);
    }

    pub fn set_segment(&mut self, name: &str, bits: IndexBits, meta: SegmentMeta) {
        self.segments.insert(name.to_string(), (bits.compress(), meta));
    }

    pub fn get_segment(&self, name: &str) -> Option<(IndexBits, SegmentMeta)> {
        self.segments.get(name).map(|(bits, meta)| (bits.decompress(), *meta))
    }

    pub fn set_segment_ttl(&mut self, name: &str, ttl_ms: i64) -> bool {
        if let Some((_, meta)) = self.segments.get_mut(name) {
            meta.ttl_ms = ttl_ms;
            true
        } else {
            false
        }
    }

    pub fn set_segment_refresh(&mut self, name: &str, refresh_interval_ms: i64) -> bool {
        if let Some((_, meta)) = self.segments.get_mut(name) {
            meta.refresh_interval_ms = refresh_interval_ms;
            true
        } else {
            false
        }
    }

    pub fn is_segment_expired_ttl(&self, name: &str, now_ms: i64) -> Option<bool> {
        self.segments.get(name).map(|(_, meta)| meta.is_expired(now_ms))
    }

    pub fn segment_names(&self) -> impl Iterator<Item = &String> {
        self.segments.keys()
    }
}

impl StringInterner for AttributeStore {
    fn intern(&mut self, s: &str) -> i64 {
        self.strings.intern(s)
    }

    fn resolve(&self, hash: i64) -> Option<String> {
        self.strings.resolve(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous_bitmap() {
        let mut store = AttributeStore::new();
        let mut bits = IndexBits::new(10);
        bits.set(1);
        assert!(store.swap(0, &Val::Text("us".into()), bits.clone()).is_none());

        let mut replacement = IndexBits::new(10);
        replacement.set(2);
        let previous = store.swap(0, &Val::Text("us".into()), replacement.clone());
        assert_eq!(previous, Some(bits));
        assert_eq!(store.get(0, &Val::Text("us".into())), Some(replacement));
    }

    #[test]
    fn get_make_returns_empty_when_absent() {
        let mut store = AttributeStore::new();
        let bits = store.get_make(5, &Val::Int(1), 16);
        assert_eq!(bits.population(), 0);
    }

    #[test]
    fn segment_ttl_lifecycle() {
        let mut store = AttributeStore::new();
        let bits = IndexBits::new(4);
        store.set_segment("power_users", bits, SegmentMeta::new(1000, 500, 0));
        assert_eq!(store.is_segment_expired_ttl("power_users", 500), Some(false));
        assert_eq!(store.is_segment_expired_ttl("power_users", 1500), Some(true));
        assert_eq!(store.is_segment_expired_ttl("missing", 0), None);
    }
}
