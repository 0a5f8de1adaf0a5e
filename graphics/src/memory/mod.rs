//! Pooled sub-allocation of GPU memory, buffers and descriptor sets.
//!
//! # Layers
//!
//! ```text
//! MemoryBufferPools ── buffer arenas ──► Buffer ─┐ (MemorySlots)
//!         │                                      │ bound into
//!         └────────── memory arenas ───► DeviceMemory (MemorySlots)
//!
//! DescriptorPools ──► DescriptorPool (set / per-type headroom)
//! ```
//!
//! Callers ask a pool for a range and receive a [`Lease`]. Pools walk their
//! arenas in creation order and grow by exactly one arena when none has room.
//! Arenas are never removed, so a lease's weak reference stays valid for the
//! lifetime of the pool.

mod descriptor;
mod dynamic;
mod lease;
mod pools;
mod requirements;
mod slots;

pub use descriptor::{DescriptorPool, DescriptorPools, DescriptorSetLease};
pub use dynamic::DynamicData;
pub use lease::{Arena, BufferLease, Lease, MemoryLease};
pub use pools::MemoryBufferPools;
pub use requirements::{ResourcePreferences, ResourceRequirements};
pub use slots::{MemorySlots, align_up};
