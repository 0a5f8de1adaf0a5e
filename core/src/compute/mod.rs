//! Thread coordination primitives.

mod latch;

pub use latch::Latch;
