//! Query interpreter (§4.E): executes a compiled [`crate::query::Macro`]
//! against a mounted person and accumulates its results.

pub mod marshals;
pub mod result;
pub mod vm;

pub use result::{Accumulator, ResultSet};
pub use vm::Interp;
