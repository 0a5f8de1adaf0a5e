//! Command buffer and queue types.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages a submission waits at before its wait semaphores are satisfied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 5;
        const COMPUTE_SHADER = 1 << 6;
        const TRANSFER = 1 << 7;
        const BOTTOM_OF_PIPE = 1 << 8;
        const ALL_COMMANDS = 1 << 9;
    }
}

/// Whether a command buffer is submitted directly or executed from a primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandBufferLevel {
    #[default]
    Primary,
    Secondary,
}

/// Capability class of a device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    /// Graphics queue, also capable of transfer.
    #[default]
    Graphics,
    /// Dedicated transfer queue.
    Transfer,
}
