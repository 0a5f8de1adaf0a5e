//! Command buffers and recording.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{GpuCommandBuffer, RecordedCommand};
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::types::{CommandBufferLevel, CopyRegion, QueueKind};

/// A command buffer bound to one queue.
///
/// Recording goes through [`CommandBuffer::begin`], which hands out a
/// [`CommandEncoder`]; only one encoder may exist at a time.
pub struct CommandBuffer {
    id: u64,
    queue: QueueKind,
    level: CommandBufferLevel,
    gpu: GpuCommandBuffer,
    recording: Mutex<()>,
}

impl CommandBuffer {
    pub(crate) fn new(
        id: u64,
        queue: QueueKind,
        level: CommandBufferLevel,
        gpu: GpuCommandBuffer,
    ) -> Self {
        Self {
            id,
            queue,
            level,
            gpu,
            recording: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn gpu(&self) -> &GpuCommandBuffer {
        &self.gpu
    }

    /// Reset the command buffer and start recording.
    ///
    /// Fails if another encoder is still recording into it.
    pub fn begin(&self) -> Result<CommandEncoder<'_>, GraphicsError> {
        let guard = self.recording.try_lock().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "command buffer {} is already being recorded",
                self.id
            ))
        })?;
        self.gpu.begin()?;
        Ok(CommandEncoder {
            command_buffer: self,
            _guard: guard,
            finished: false,
        })
    }

    /// Commands recorded since the last `begin`. Empty on real backends.
    #[allow(unreachable_patterns)]
    pub fn recorded_commands(&self) -> Vec<RecordedCommand> {
        match &self.gpu {
            GpuCommandBuffer::Dummy(cmd) => cmd.recorded(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("level", &self.level)
            .finish()
    }
}

/// Records into a [`CommandBuffer`] until [`finish`](Self::finish) is called.
pub struct CommandEncoder<'a> {
    command_buffer: &'a CommandBuffer,
    _guard: MutexGuard<'a, ()>,
    finished: bool,
}

impl CommandEncoder<'_> {
    pub fn command_buffer(&self) -> &CommandBuffer {
        self.command_buffer
    }

    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[CopyRegion]) {
        if regions.is_empty() {
            return;
        }
        self.command_buffer
            .gpu
            .copy_buffer(src.gpu(), dst.gpu(), regions);
    }

    /// Fill `size` bytes at `offset` with a repeated 32-bit `value`.
    pub fn fill_buffer(&mut self, dst: &Buffer, offset: u64, size: u64, value: u32) {
        self.command_buffer
            .gpu
            .fill_buffer(dst.gpu(), offset, size, value);
    }

    /// Execute secondary command buffers from this primary.
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        let handles: Vec<&GpuCommandBuffer> = secondaries.iter().map(|cmd| cmd.gpu()).collect();
        self.command_buffer.gpu.execute_commands(&handles);
    }

    /// End recording and make the command buffer executable.
    pub fn finish(mut self) -> Result<(), GraphicsError> {
        self.finished = true;
        self.command_buffer.gpu.end()
    }
}

impl Drop for CommandEncoder<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!(
                "CommandEncoder for command buffer {} dropped without finish",
                self.command_buffer.id
            );
            if let Err(e) = self.command_buffer.gpu.end() {
                log::error!("Failed to end command buffer {}: {e}", self.command_buffer.id);
            }
        }
    }
}

/// Command buffers recorded for one frame, in submission order.
#[derive(Debug, Default)]
pub struct RecordedCommandBuffers {
    command_buffers: Mutex<Vec<Arc<CommandBuffer>>>,
}

impl RecordedCommandBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, command_buffer: Arc<CommandBuffer>) {
        self.command_buffers.lock().push(command_buffer);
    }

    pub fn snapshot(&self) -> Vec<Arc<CommandBuffer>> {
        self.command_buffers.lock().clone()
    }

    pub fn take(&self) -> Vec<Arc<CommandBuffer>> {
        std::mem::take(&mut *self.command_buffers.lock())
    }

    pub fn len(&self) -> usize {
        self.command_buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.command_buffers.lock().clear();
    }
}

static_assertions::assert_impl_all!(CommandBuffer: Send, Sync);
static_assertions::assert_impl_all!(RecordedCommandBuffers: Send, Sync);
