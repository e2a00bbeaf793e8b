//! Query compiler (§4.D): source text -> AST -> bytecode `Macro`, plus the
//! index-hint folder consumed by partition execution (§4.F/§4.G).

pub mod ast;
pub mod cell;
pub mod compiler;
pub mod hint;
pub mod lexer;
pub mod macro_;
pub mod opcode;
pub mod parser;
pub mod segment_cell;

pub use compiler::compile;
pub use macro_::Macro;
