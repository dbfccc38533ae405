//! Domain types and errors shared across the runtime.

pub mod errors;

pub use errors::{ReportError, SymbolizeError};

/// An address captured from the target process - a program counter, stack
/// pointer, or heap pointer. Stored as `usize` so event records stay `Send`.
pub type Addr = usize;
