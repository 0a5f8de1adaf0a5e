//! Multi-buffered frame pipeline.
//!
//! [`FramePipeline`] owns a ring of `num_buffers` frame slots. Each slot holds
//! the fence, command buffers and transfer staging state of one frame in
//! flight. A frame runs through:
//!
//! ```text
//! advance() ─► start() ─► record() ─► submit() ─► finish()
//!              │           │           │
//!              │           │           └ transfers, then render waiting on
//!              │           │             their semaphores; signals the fence
//!              │           └ recorders (secondaries on worker threads)
//!              └ waits for the slot's fence from num_buffers frames ago
//! ```
//!
//! # Frame Overlap
//!
//! With 3 buffers, the CPU may record up to two frames ahead of the GPU:
//!
//! ```text
//! Slot 0: [Frame 0] ──► [Frame 3] ──► [Frame 6] ──►
//! Slot 1: [Frame 1] ──► [Frame 4] ──► [Frame 7] ──►
//! Slot 2: [Frame 2] ──► [Frame 5] ──► [Frame 8] ──►
//! ```
//!
//! `start()` is the only place the CPU blocks on GPU progress. Once it
//! returns, the slot's command buffers and staging memory are free to
//! overwrite.
//!
//! # Relative Indices
//!
//! `index(0)` is the slot used by the current frame, `index(1)` the slot used
//! by the previous frame, and so on; `index(num_buffers)` wraps back to
//! `index(0)`.
//!
//! # Example
//!
//! ```
//! use arbor_core::FrameStamp;
//! use arbor_graphics::{DeviceParameters, FramePipeline, GraphicsDevice, PipelineParameters};
//! use arbor_graphics::pipeline::recorder_fn;
//!
//! let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
//! let mut pipeline = FramePipeline::new(device, PipelineParameters::new()).unwrap();
//! pipeline.add_recorder(recorder_fn(|_encoder, _frame| Ok(())));
//!
//! let mut frame = FrameStamp::new();
//! for _ in 0..5 {
//!     pipeline.advance();
//!     pipeline.execute(frame).unwrap();
//!     frame = frame.next_at(std::time::Instant::now(), frame.time);
//! }
//! pipeline.wait_idle().unwrap();
//! ```

mod record;
mod slot;
mod transfer;

pub use record::{CommandRecorder, recorder_fn};
pub use transfer::TransferTask;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_core::FrameStamp;
use arbor_core::profiling::{frame_mark, profile_scope};

use crate::command::RecordedCommandBuffers;
use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::queue::Submission;
use crate::sync::{Fence, Semaphore};
use crate::types::QueueKind;

use slot::FrameSlot;

/// Parameters for [`FramePipeline::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineParameters {
    /// Number of frame slots.
    pub num_buffers: usize,
    /// How long `start()` waits before logging a warning and waiting again.
    pub fence_timeout: Duration,
    /// Queue the render submission goes to.
    pub queue: QueueKind,
    /// Signal the slot semaphore on every render submission.
    ///
    /// Only useful when something (a presentation engine, another pipeline)
    /// waits on [`FramePipeline::semaphore`] each frame.
    pub signal_frame_semaphore: bool,
}

impl Default for PipelineParameters {
    fn default() -> Self {
        Self {
            num_buffers: 3,
            fence_timeout: Duration::from_secs(1),
            queue: QueueKind::Graphics,
            signal_frame_semaphore: false,
        }
    }
}

impl PipelineParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_buffers(mut self, num_buffers: usize) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_signal_frame_semaphore(mut self, signal: bool) -> Self {
        self.signal_frame_semaphore = signal;
        self
    }
}

/// Records and submits frames through a ring of frame slots.
///
/// # Thread Safety
///
/// Driven from one thread; `&mut self` methods enforce it. Secondary
/// recorders run on scoped worker threads inside [`record`](Self::record).
pub struct FramePipeline {
    device: Arc<GraphicsDevice>,
    parameters: PipelineParameters,
    slots: Vec<FrameSlot>,
    current_frame_index: usize,
    frame_count: u64,
    recorders: Vec<Arc<dyn CommandRecorder>>,
    secondary_recorders: Vec<Arc<dyn CommandRecorder>>,
    early_transfer: Arc<TransferTask>,
    late_transfer: Arc<TransferTask>,
    wait_semaphores: Vec<Arc<Semaphore>>,
    signal_semaphores: Vec<Arc<Semaphore>>,
}

impl FramePipeline {
    /// Create a pipeline and its frame slots.
    ///
    /// The early and late transfer tasks submit to the transfer queue.
    pub fn new(
        device: Arc<GraphicsDevice>,
        parameters: PipelineParameters,
    ) -> Result<Self, GraphicsError> {
        let num_buffers = parameters.num_buffers;
        if num_buffers == 0 {
            return Err(GraphicsError::InvalidParameter(
                "num_buffers must be at least 1".to_string(),
            ));
        }

        let slots = (0..num_buffers)
            .map(|_| FrameSlot::new(&device, parameters.queue))
            .collect::<Result<Vec<_>, _>>()?;
        let early_transfer = Arc::new(TransferTask::new(
            Arc::clone(&device),
            num_buffers,
            QueueKind::Transfer,
        )?);
        let late_transfer = Arc::new(TransferTask::new(
            Arc::clone(&device),
            num_buffers,
            QueueKind::Transfer,
        )?);

        log::debug!("Created frame pipeline with {num_buffers} buffers");

        Ok(Self {
            device,
            parameters,
            slots,
            // The first advance() lands on slot 0.
            current_frame_index: num_buffers - 1,
            frame_count: 0,
            recorders: Vec::new(),
            secondary_recorders: Vec::new(),
            early_transfer,
            late_transfer,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
        })
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn parameters(&self) -> &PipelineParameters {
        &self.parameters
    }

    /// Number of frame slots.
    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    /// Number of `advance()` calls so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Move to the next frame slot. Call once per frame, before `start()`.
    pub fn advance(&mut self) {
        self.current_frame_index = (self.current_frame_index + 1) % self.slots.len();
        self.frame_count += 1;
        log::trace!(
            "Advance to frame {} (slot {})",
            self.frame_count,
            self.current_frame_index
        );
    }

    /// Slot used `relative` frames ago; 0 is the current frame.
    pub fn index(&self, relative: usize) -> usize {
        let n = self.slots.len();
        (self.current_frame_index + n - relative % n) % n
    }

    /// Fence of the slot used `relative` frames ago.
    pub fn fence(&self, relative: usize) -> &Fence {
        &self.slots[self.index(relative)].fence
    }

    /// Semaphore of the slot used `relative` frames ago.
    pub fn semaphore(&self, relative: usize) -> &Arc<Semaphore> {
        &self.slots[self.index(relative)].semaphore
    }

    /// Frame number last submitted from the slot used `relative` frames ago.
    pub fn submitted_frame(&self, relative: usize) -> Option<u64> {
        self.slots[self.index(relative)].submitted_frame
    }

    /// Non-blocking check whether the slot used `relative` frames ago has
    /// finished on the GPU.
    pub fn is_slot_ready(&self, relative: usize) -> Result<bool, GraphicsError> {
        self.fence(relative).status()
    }

    /// Add a recorder that runs on the driving thread into the primary
    /// command buffer.
    pub fn add_recorder(&mut self, recorder: Arc<dyn CommandRecorder>) {
        self.recorders.push(recorder);
    }

    /// Add a recorder that runs on a worker thread into its own secondary
    /// command buffer.
    pub fn add_secondary_recorder(&mut self, recorder: Arc<dyn CommandRecorder>) {
        self.secondary_recorders.push(recorder);
    }

    /// Transfer task whose copies are recorded in `start()`.
    pub fn early_transfer(&self) -> &Arc<TransferTask> {
        &self.early_transfer
    }

    /// Transfer task whose copies are recorded in `submit()`, after the
    /// recorders had a chance to modify data.
    pub fn late_transfer(&self) -> &Arc<TransferTask> {
        &self.late_transfer
    }

    pub fn set_early_transfer(&mut self, task: Arc<TransferTask>) -> Result<(), GraphicsError> {
        self.check_transfer(&task)?;
        self.early_transfer = task;
        Ok(())
    }

    pub fn set_late_transfer(&mut self, task: Arc<TransferTask>) -> Result<(), GraphicsError> {
        self.check_transfer(&task)?;
        self.late_transfer = task;
        Ok(())
    }

    /// Make every render submission wait on `semaphore`.
    pub fn add_wait_semaphore(&mut self, semaphore: Arc<Semaphore>) {
        self.wait_semaphores.push(semaphore);
    }

    /// Make every render submission signal `semaphore`.
    pub fn add_signal_semaphore(&mut self, semaphore: Arc<Semaphore>) {
        self.signal_semaphores.push(semaphore);
    }

    /// Wait until the current slot's previous submission has completed, then
    /// reset its fence and record early transfers.
    ///
    /// Loops on `fence_timeout`, logging a warning each time it elapses.
    /// Device loss and other failures are returned unchanged.
    pub fn start(&mut self) -> Result<(), GraphicsError> {
        profile_scope!("FramePipeline::start");

        let index = self.index(0);
        let slot = &self.slots[index];
        if slot.fence.has_dependencies() {
            let began = Instant::now();
            while !slot.fence.wait(self.parameters.fence_timeout)? {
                log::warn!(
                    "FramePipeline: slot {index} (frame {:?}) still busy after {:?}",
                    slot.submitted_frame,
                    began.elapsed()
                );
            }
            log::trace!("FramePipeline: slot {index} free after {:?}", began.elapsed());
        }
        slot.fence.reset()?;

        self.early_transfer.record(index)?;
        Ok(())
    }

    /// Record the current slot's command buffers and append the primary to
    /// `recorded`.
    pub fn record(
        &mut self,
        recorded: &RecordedCommandBuffers,
        frame: FrameStamp,
    ) -> Result<(), GraphicsError> {
        profile_scope!("FramePipeline::record");

        let index = self.index(0);
        let queue = self.parameters.queue;
        let slot = &mut self.slots[index];
        slot.ensure_secondaries(&self.device, queue, self.secondary_recorders.len())?;

        let secondaries: Vec<_> = self
            .secondary_recorders
            .iter()
            .zip(&slot.secondary_command_buffers)
            .map(|(recorder, cmd)| (Arc::clone(recorder), Arc::clone(cmd)))
            .collect();

        record::record_frame(&slot.command_buffer, &self.recorders, &secondaries, frame)?;
        recorded.add(Arc::clone(&slot.command_buffer));
        Ok(())
    }

    /// Submit transfers and then `recorded`, signaling the current slot's fence.
    ///
    /// The render submission waits on the semaphores of any transfer that
    /// had work this frame.
    pub fn submit(
        &mut self,
        recorded: &RecordedCommandBuffers,
        frame: FrameStamp,
    ) -> Result<(), GraphicsError> {
        profile_scope!("FramePipeline::submit");

        let index = self.index(0);
        self.late_transfer.record(index)?;

        let mut wait_semaphores = Vec::with_capacity(self.wait_semaphores.len() + 2);
        if let Some(semaphore) = self.early_transfer.submit(index)? {
            wait_semaphores.push(semaphore);
        }
        if let Some(semaphore) = self.late_transfer.submit(index)? {
            wait_semaphores.push(semaphore);
        }
        wait_semaphores.extend(self.wait_semaphores.iter().cloned());

        let slot = &mut self.slots[index];
        let mut signal_semaphores = self.signal_semaphores.clone();
        if self.parameters.signal_frame_semaphore {
            signal_semaphores.push(Arc::clone(&slot.semaphore));
        }

        let command_buffers = recorded.snapshot();
        self.device.queue(self.parameters.queue).submit(&Submission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            signal_semaphores: &signal_semaphores,
            fence: Some(&slot.fence),
        })?;
        slot.submitted_frame = Some(frame.frame_count);

        log::trace!(
            "FramePipeline: submitted frame {} from slot {index} ({} command buffers, {} waits)",
            frame.frame_count,
            command_buffers.len(),
            wait_semaphores.len()
        );
        frame_mark!();
        Ok(())
    }

    /// Clear per-submission state.
    pub fn finish(&mut self, recorded: &RecordedCommandBuffers) {
        let index = self.index(0);
        recorded.clear();
        self.early_transfer.finish(index);
        self.late_transfer.finish(index);
    }

    /// Run `start`, `record`, `submit` and `finish` for the current slot.
    ///
    /// Call [`advance`](Self::advance) first.
    pub fn execute(&mut self, frame: FrameStamp) -> Result<(), GraphicsError> {
        let recorded = RecordedCommandBuffers::new();
        let result = self.execute_with(&recorded, frame);
        self.finish(&recorded);
        result
    }

    fn execute_with(
        &mut self,
        recorded: &RecordedCommandBuffers,
        frame: FrameStamp,
    ) -> Result<(), GraphicsError> {
        self.start()?;
        self.record(recorded, frame)?;
        self.submit(recorded, frame)
    }

    /// Block until every submitted slot has completed.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        profile_scope!("FramePipeline::wait_idle");

        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.fence.has_dependencies() {
                continue;
            }
            let began = Instant::now();
            while !slot.fence.wait(self.parameters.fence_timeout)? {
                log::warn!(
                    "FramePipeline: waiting for slot {index} to drain ({:?})",
                    began.elapsed()
                );
            }
        }
        log::trace!("FramePipeline: idle");
        Ok(())
    }

    fn check_transfer(&self, task: &TransferTask) -> Result<(), GraphicsError> {
        if task.num_buffers() != self.slots.len() {
            return Err(GraphicsError::InvalidParameter(format!(
                "transfer task has {} buffers, pipeline has {}",
                task.num_buffers(),
                self.slots.len()
            )));
        }
        Ok(())
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("FramePipeline: failed to drain frames on drop: {e}");
        }
    }
}

impl std::fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("num_buffers", &self.slots.len())
            .field("current_frame_index", &self.current_frame_index)
            .field("frame_count", &self.frame_count)
            .field("recorders", &self.recorders.len())
            .field("secondary_recorders", &self.secondary_recorders.len())
            .finish()
    }
}
