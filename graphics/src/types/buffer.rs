//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 3;
        /// Buffer can be used as an indirect buffer.
        const INDIRECT = 1 << 4;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Properties a device memory block must have.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Memory is local to the GPU.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory can be mapped for CPU access.
        const HOST_VISIBLE = 1 << 1;
        /// CPU writes are visible to the GPU without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// CPU reads are cached.
        const HOST_CACHED = 1 << 3;
    }
}

impl MemoryProperties {
    /// Whether blocks with these properties can be written from the CPU.
    pub fn is_mappable(self) -> bool {
        self.contains(Self::HOST_VISIBLE)
    }
}

impl Default for MemoryProperties {
    fn default() -> Self {
        Self::DEVICE_LOCAL
    }
}

/// Whether a resource may be accessed from more than one queue family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharingMode {
    /// Owned by one queue family at a time.
    #[default]
    Exclusive,
    /// Accessible from all queue families concurrently.
    Concurrent,
}

/// Size, alignment and memory type constraints reported for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Bytes the resource needs.
    pub size: u64,
    /// Required offset alignment inside a memory block.
    pub alignment: u64,
    /// Bit `i` set means memory type `i` is acceptable.
    pub memory_type_bits: u32,
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
    /// Queue family sharing.
    pub sharing_mode: SharingMode,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            sharing_mode: SharingMode::Exclusive,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the sharing mode.
    pub fn with_sharing_mode(mut self, sharing_mode: SharingMode) -> Self {
        self.sharing_mode = sharing_mode;
        self
    }
}

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CopyRegion {
    /// Byte offset in the source buffer.
    pub src_offset: u64,
    /// Byte offset in the destination buffer.
    pub dst_offset: u64,
    /// Number of bytes.
    pub size: u64,
}

impl CopyRegion {
    pub fn new(src_offset: u64, dst_offset: u64, size: u64) -> Self {
        Self {
            src_offset,
            dst_offset,
            size,
        }
    }
}
