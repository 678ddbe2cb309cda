//! Statistical operators over encrypted column blocks
//!
//! Each submodule turns encrypted block sets into a single result
//! ciphertext through the evaluator façade. Operators never touch
//! plaintext data and never perform I/O; all blocks are loaded by the
//! caller (or streamed through the provider traits) before ciphertext
//! work begins.

pub mod approx;
pub mod categorical;
pub mod inverse;
pub mod lbc;
pub mod numeric;
pub mod ordinal;
