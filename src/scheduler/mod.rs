//! Async pool & cells (§4.F): fixed worker threads cooperatively stepping
//! per-partition cell queues.

pub mod cell;
pub mod pool;
pub mod shared_sender;
pub mod suspend;

pub use cell::{Cell, CellStatus};
pub use pool::AsyncPool;
pub use shared_sender::SharedSender;
