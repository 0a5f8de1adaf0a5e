use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::sync::{Fence, Semaphore};
use crate::types::{CommandBufferLevel, PipelineStage, QueueKind};

/// Per-frame GPU resources of one ring slot.
pub(crate) struct FrameSlot {
    pub(crate) fence: Fence,
    pub(crate) command_buffer: Arc<CommandBuffer>,
    pub(crate) secondary_command_buffers: Vec<Arc<CommandBuffer>>,
    pub(crate) semaphore: Arc<Semaphore>,
    /// Frame number of the last submission from this slot.
    pub(crate) submitted_frame: Option<u64>,
}

impl FrameSlot {
    pub(crate) fn new(device: &GraphicsDevice, queue: QueueKind) -> Result<Self, GraphicsError> {
        Ok(Self {
            fence: device.create_fence()?,
            command_buffer: Arc::new(
                device.create_command_buffer(queue, CommandBufferLevel::Primary)?,
            ),
            secondary_command_buffers: Vec::new(),
            semaphore: Arc::new(device.create_semaphore(PipelineStage::COLOR_ATTACHMENT_OUTPUT)?),
            submitted_frame: None,
        })
    }

    /// Grow the secondary command buffers to `count`.
    pub(crate) fn ensure_secondaries(
        &mut self,
        device: &GraphicsDevice,
        queue: QueueKind,
        count: usize,
    ) -> Result<(), GraphicsError> {
        while self.secondary_command_buffers.len() < count {
            let cmd = device.create_command_buffer(queue, CommandBufferLevel::Secondary)?;
            self.secondary_command_buffers.push(Arc::new(cmd));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("fence", &self.fence.id())
            .field("command_buffer", &self.command_buffer.id())
            .field("secondaries", &self.secondary_command_buffers.len())
            .field("submitted_frame", &self.submitted_frame)
            .finish()
    }
}
