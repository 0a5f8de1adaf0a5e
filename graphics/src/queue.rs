//! Queue submission.

use std::sync::Arc;

use arbor_core::profiling::profile_scope;
use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuCommandBuffer, GpuSemaphore, SubmitInfo};
use crate::command::CommandBuffer;
use crate::error::GraphicsError;
use crate::sync::{Fence, Semaphore};
use crate::types::{CommandBufferLevel, PipelineStage, QueueKind};

/// Work handed to [`Queue::submit`].
#[derive(Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [Arc<CommandBuffer>],
    pub wait_semaphores: &'a [Arc<Semaphore>],
    pub signal_semaphores: &'a [Arc<Semaphore>],
    pub fence: Option<&'a Fence>,
}

/// A device queue. Submissions to it are serialized.
pub struct Queue {
    kind: QueueKind,
    backend: Arc<GpuBackend>,
    submit_lock: Mutex<()>,
}

impl Queue {
    pub(crate) fn new(kind: QueueKind, backend: Arc<GpuBackend>) -> Self {
        Self {
            kind,
            backend,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Submit primary command buffers.
    ///
    /// Secondary command buffers are rejected; they run through
    /// [`CommandEncoder::execute_commands`](crate::CommandEncoder::execute_commands).
    pub fn submit(&self, submission: &Submission<'_>) -> Result<(), GraphicsError> {
        profile_scope!("Queue::submit");

        if let Some(secondary) = submission
            .command_buffers
            .iter()
            .find(|cmd| cmd.level() == CommandBufferLevel::Secondary)
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "secondary command buffer {} submitted directly",
                secondary.id()
            )));
        }

        let command_buffers: Vec<&GpuCommandBuffer> =
            submission.command_buffers.iter().map(|cmd| cmd.gpu()).collect();
        let wait_semaphores: Vec<(&GpuSemaphore, PipelineStage)> = submission
            .wait_semaphores
            .iter()
            .map(|semaphore| (semaphore.gpu(), semaphore.wait_stage()))
            .collect();
        let signal_semaphores: Vec<&GpuSemaphore> = submission
            .signal_semaphores
            .iter()
            .map(|semaphore| semaphore.gpu())
            .collect();

        let _guard = self.submit_lock.lock();
        self.backend.submit(
            self.kind,
            &SubmitInfo {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                signal_semaphores: &signal_semaphores,
                fence: submission.fence.map(|fence| fence.gpu()),
            },
        )?;
        if let Some(fence) = submission.fence {
            fence.mark_submitted();
        }

        log::trace!(
            "Queue {:?}: submitted {} command buffers, {} waits, {} signals",
            self.kind,
            command_buffers.len(),
            wait_semaphores.len(),
            signal_semaphores.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("kind", &self.kind).finish()
    }
}

static_assertions::assert_impl_all!(Queue: Send, Sync);
