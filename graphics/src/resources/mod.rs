//! GPU resources that back pooled allocations.
//!
//! - [`DeviceMemory`] - one device memory block, sub-allocated for resources
//! - [`Buffer`] - one buffer object bound into a memory block, sub-allocated
//!   for vertex, index, uniform and staging data
//!
//! Both are arenas: pools create them, own them through [`Arc`], and never
//! remove them. Callers only ever see them through a [`Lease`](crate::memory::Lease)
//! holding a weak reference.
//!
//! [`Arc`]: std::sync::Arc

mod buffer;
mod device_memory;

pub use buffer::Buffer;
pub use device_memory::DeviceMemory;
