//! Fences and semaphores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::{GpuFence, GpuSemaphore};
use crate::error::GraphicsError;
use crate::types::PipelineStage;

/// CPU-GPU synchronization point.
///
/// Tracks whether it has been handed to a submission since the last reset, so
/// waiting on a fence nobody submitted returns immediately instead of
/// blocking until the timeout.
#[derive(Debug)]
pub struct Fence {
    id: u64,
    gpu: GpuFence,
    submitted: AtomicBool,
}

impl Fence {
    pub(crate) fn new(id: u64, gpu: GpuFence) -> Self {
        Self {
            id,
            gpu,
            submitted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu(&self) -> &GpuFence {
        &self.gpu
    }

    /// Whether a submission will signal this fence.
    pub fn has_dependencies(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the fence.
    ///
    /// Returns `Ok(true)` once signaled, `Ok(false)` on timeout. A fence with
    /// no pending submission counts as signaled.
    pub fn wait(&self, timeout: Duration) -> Result<bool, GraphicsError> {
        if !self.has_dependencies() {
            return Ok(true);
        }
        self.gpu.wait(timeout)
    }

    /// Non-blocking signaled check.
    pub fn status(&self) -> Result<bool, GraphicsError> {
        if !self.has_dependencies() {
            return Ok(true);
        }
        self.gpu.status()
    }

    /// Return the fence to the unsignaled state for reuse.
    pub fn reset(&self) -> Result<(), GraphicsError> {
        if self.submitted.swap(false, Ordering::AcqRel) {
            self.gpu.reset()?;
        }
        Ok(())
    }

    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }
}

/// GPU-GPU synchronization point, with the pipeline stage a waiter blocks at.
#[derive(Debug)]
pub struct Semaphore {
    id: u64,
    gpu: GpuSemaphore,
    wait_stage: PipelineStage,
}

impl Semaphore {
    pub(crate) fn new(id: u64, gpu: GpuSemaphore, wait_stage: PipelineStage) -> Self {
        Self {
            id,
            gpu,
            wait_stage,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu(&self) -> &GpuSemaphore {
        &self.gpu
    }

    /// Stage at which a submission waiting on this semaphore blocks.
    pub fn wait_stage(&self) -> PipelineStage {
        self.wait_stage
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);
static_assertions::assert_impl_all!(Semaphore: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_unsubmitted_fence_is_ready() {
        let backend = DummyBackend::new();
        let fence = Fence::new(1, backend.create_fence(false).unwrap());
        assert!(!fence.has_dependencies());
        assert!(fence.wait(Duration::ZERO).unwrap());
        assert!(fence.status().unwrap());
        fence.reset().unwrap();
    }

    #[test]
    fn test_submitted_fence_waits_for_gpu() {
        let backend = DummyBackend::new();
        let fence = Fence::new(1, backend.create_fence(false).unwrap());
        fence.mark_submitted();
        // Nothing signals the underlying fence.
        assert!(!fence.wait(Duration::from_millis(1)).unwrap());

        fence.reset().unwrap();
        assert!(!fence.has_dependencies());
    }
}
