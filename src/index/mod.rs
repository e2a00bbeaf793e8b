//! Attribute/Index store (§4.B): compressed per-column value bitmaps and
//! named segment storage, shared by one partition.

pub mod bitmap;
pub mod segment;
pub mod store;

pub use bitmap::{CompressedBits, IndexBits};
pub use segment::SegmentMeta;
pub use store::AttributeStore;
