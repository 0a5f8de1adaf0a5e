//! Core types shared by the arbor rendering crates.
//!
//! This crate holds the pieces that the graphics crate and its callers both
//! need without pulling in a GPU backend:
//!
//! - [`FrameStamp`]: the per-frame counter and timestamp handed to recorders
//! - [`compute::Latch`]: countdown latch used to join parallel command recording
//! - [`profiling`]: optional Tracy instrumentation macros

pub mod compute;
pub mod frame;
pub mod profiling;

pub use frame::FrameStamp;
