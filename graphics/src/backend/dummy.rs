//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU, but it behaves like one closely
//! enough to exercise the pools and the frame pipeline:
//!
//! - Device memory blocks keep a host shadow, so buffer copies recorded into
//!   command buffers really move bytes when the work is submitted.
//! - Each queue is a timeline. A submission completes `gpu_latency` after
//!   the later of its submit time, the completion of the previous submission
//!   on the same queue, and the signal time of every semaphore it waits on.
//!   Fences and semaphores become signaled at that completion time.
//! - Memory allocation can be capped to inject API failures, and the device
//!   can be marked lost.
//! - Every submission is logged for inspection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::GraphicsError;
use crate::memory::align_up;
use crate::types::{
    BufferDescriptor, BufferUsage, CommandBufferLevel, CopyRegion, DescriptorPoolSize,
    DescriptorSetLayout, DescriptorType, MemoryProperties, MemoryRequirements, QueueKind,
};

use super::{
    GpuBuffer, GpuCommandBuffer, GpuDescriptorPool, GpuDescriptorSet, GpuFence, GpuMemory,
    GpuSemaphore, SubmitInfo,
};

/// Alignment the dummy device reports for buffer memory.
const BUFFER_ALIGNMENT: u64 = 16;

/// Configuration of the stub GPU.
#[derive(Debug, Clone, Default)]
pub struct DummyConfig {
    /// Time each submission takes to execute.
    pub gpu_latency: Duration,
    /// Fail device memory allocation after this many successful allocations.
    pub memory_allocation_limit: Option<usize>,
}

impl DummyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution time of each submission.
    pub fn with_gpu_latency(mut self, latency: Duration) -> Self {
        self.gpu_latency = latency;
        self
    }

    /// Fail memory allocations once `limit` blocks exist.
    pub fn with_memory_allocation_limit(mut self, limit: usize) -> Self {
        self.memory_allocation_limit = Some(limit);
        self
    }
}

/// A command as recorded into a dummy command buffer, with resources
/// identified by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    CopyBuffer {
        src: u64,
        dst: u64,
        regions: Vec<CopyRegion>,
    },
    FillBuffer {
        dst: u64,
        offset: u64,
        size: u64,
        value: u32,
    },
    ExecuteCommands(Vec<u64>),
}

/// One logged queue submission.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub queue: QueueKind,
    pub command_buffers: Vec<u64>,
    pub wait_semaphores: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
    pub fence: Option<u64>,
    pub submitted_at: Instant,
    pub completes_at: Instant,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    config: DummyConfig,
    next_id: AtomicU64,
    memory_allocations: AtomicUsize,
    device_lost: Arc<AtomicBool>,
    /// Completion time of the last submission, per queue.
    timelines: Mutex<[Option<Instant>; 2]>,
    submissions: Mutex<Vec<SubmissionRecord>>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a dummy backend with zero latency.
    pub fn new() -> Self {
        Self::with_config(DummyConfig::default())
    }

    /// Create a dummy backend with explicit behaviour.
    pub fn with_config(config: DummyConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            memory_allocations: AtomicUsize::new(0),
            device_lost: Arc::new(AtomicBool::new(false)),
            timelines: Mutex::new([None; 2]),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Simulate device loss: every later submit or fence wait fails.
    pub fn lose_device(&self) {
        log::warn!("DummyBackend: device lost");
        self.device_lost.store(true, Ordering::SeqCst);
    }

    /// Whether [`lose_device`](Self::lose_device) was called.
    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::SeqCst)
    }

    /// Snapshot of all submissions so far.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().clone()
    }

    /// Number of device memory blocks allocated so far.
    pub fn memory_allocation_count(&self) -> usize {
        self.memory_allocations.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(&self) -> Result<(), GraphicsError> {
        if self.is_device_lost() {
            Err(GraphicsError::DeviceLost)
        } else {
            Ok(())
        }
    }

    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let id = self.next_id();
        log::trace!(
            "DummyBackend: creating buffer {id} {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::Dummy(Arc::new(DummyBuffer {
            id,
            size: descriptor.size,
            usage: descriptor.usage,
            binding: Mutex::new(None),
        })))
    }

    #[allow(unreachable_patterns)]
    pub fn buffer_memory_requirements(&self, buffer: &GpuBuffer) -> MemoryRequirements {
        let size = match buffer {
            GpuBuffer::Dummy(buffer) => buffer.size,
            _ => 0,
        };
        MemoryRequirements {
            size: align_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<GpuMemory, GraphicsError> {
        self.check_device()?;

        let count = self.memory_allocations.load(Ordering::SeqCst);
        if let Some(limit) = self.config.memory_allocation_limit
            && count >= limit
        {
            return Err(GraphicsError::OutOfDeviceMemory(format!(
                "dummy allocation limit of {limit} blocks reached"
            )));
        }

        let len = usize::try_from(requirements.size).map_err(|_| {
            GraphicsError::OutOfDeviceMemory(format!(
                "{} bytes exceeds host address space",
                requirements.size
            ))
        })?;

        self.memory_allocations.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id();
        log::trace!(
            "DummyBackend: allocating memory block {id} ({} bytes, {:?})",
            requirements.size,
            properties
        );
        Ok(GpuMemory::Dummy(Arc::new(DummyMemory {
            id,
            size: requirements.size,
            properties,
            bytes: Mutex::new(vec![0u8; len]),
        })))
    }

    #[allow(unreachable_patterns, irrefutable_let_patterns)]
    pub fn bind_buffer_memory(
        &self,
        buffer: &GpuBuffer,
        memory: &GpuMemory,
        offset: u64,
    ) -> Result<(), GraphicsError> {
        let (GpuBuffer::Dummy(buffer), GpuMemory::Dummy(memory)) = (buffer, memory) else {
            return Err(GraphicsError::InvalidParameter(
                "resource from another backend".to_string(),
            ));
        };
        if offset + buffer.size > memory.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "binding {} bytes at {offset} overruns a {} byte block",
                buffer.size, memory.size
            )));
        }
        let mut binding = buffer.binding.lock();
        if binding.is_some() {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {} is already bound",
                buffer.id
            )));
        }
        *binding = Some((Arc::clone(memory), offset));
        Ok(())
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[DescriptorPoolSize],
    ) -> Result<GpuDescriptorPool, GraphicsError> {
        let id = self.next_id();
        let mut remaining = BTreeMap::new();
        for size in pool_sizes {
            *remaining.entry(size.ty).or_insert(0) += size.count;
        }
        log::trace!("DummyBackend: creating descriptor pool {id} (max sets: {max_sets})");
        Ok(GpuDescriptorPool::Dummy(Arc::new(DummyDescriptorPool {
            id,
            max_sets,
            state: Mutex::new(DummyDescriptorPoolState {
                remaining_sets: max_sets,
                remaining,
            }),
        })))
    }

    #[allow(unreachable_patterns, irrefutable_let_patterns)]
    pub fn allocate_descriptor_set(
        &self,
        pool: &GpuDescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        let GpuDescriptorPool::Dummy(pool) = pool else {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool from another backend".to_string(),
            ));
        };
        pool.allocate(layout)?;
        Ok(GpuDescriptorSet::Dummy { id: self.next_id() })
    }

    pub fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        Ok(GpuFence::Dummy(Arc::new(DummyFence {
            id: self.next_id(),
            state: Mutex::new(state),
            changed: Condvar::new(),
            device_lost: Arc::clone(&self.device_lost),
        })))
    }

    pub fn create_semaphore(&self) -> Result<GpuSemaphore, GraphicsError> {
        Ok(GpuSemaphore::Dummy(Arc::new(DummySemaphore {
            id: self.next_id(),
            signaled_at: Mutex::new(None),
        })))
    }

    pub fn create_command_buffer(
        &self,
        queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<GpuCommandBuffer, GraphicsError> {
        Ok(GpuCommandBuffer::Dummy(Arc::new(DummyCommandBuffer {
            id: self.next_id(),
            queue,
            level,
            state: Mutex::new(DummyCommandState::default()),
        })))
    }

    #[allow(unreachable_patterns, irrefutable_let_patterns)]
    pub fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_>) -> Result<(), GraphicsError> {
        self.check_device()?;
        let submitted_at = Instant::now();

        let mut command_buffers = Vec::with_capacity(info.command_buffers.len());
        for cmd in info.command_buffers {
            let GpuCommandBuffer::Dummy(cmd) = cmd else {
                return Err(foreign("command buffer"));
            };
            if cmd.level != CommandBufferLevel::Primary {
                return Err(GraphicsError::InvalidParameter(format!(
                    "command buffer {} is secondary and cannot be submitted",
                    cmd.id
                )));
            }
            if !cmd.is_executable() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "command buffer {} is not in the executable state",
                    cmd.id
                )));
            }
            command_buffers.push(cmd);
        }

        let fence = match info.fence {
            Some(GpuFence::Dummy(fence)) => {
                if fence.state() != FenceState::Unsignaled {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "fence {} submitted without being reset",
                        fence.id
                    )));
                }
                Some(fence)
            }
            Some(_) => return Err(foreign("fence")),
            None => None,
        };

        let mut start = submitted_at;
        let mut wait_ids = Vec::with_capacity(info.wait_semaphores.len());
        for (semaphore, _stage) in info.wait_semaphores {
            let GpuSemaphore::Dummy(semaphore) = semaphore else {
                return Err(foreign("semaphore"));
            };
            match semaphore.take_signal() {
                Some(signaled_at) => start = start.max(signaled_at),
                None => log::warn!(
                    "DummyBackend: waiting on semaphore {} that no submission signals",
                    semaphore.id
                ),
            }
            wait_ids.push(semaphore.id);
        }

        let completes_at = {
            let mut timelines = self.timelines.lock();
            let timeline = &mut timelines[queue_index(queue)];
            if let Some(previous) = *timeline {
                start = start.max(previous);
            }
            let completes_at = start + self.config.gpu_latency;
            *timeline = Some(completes_at);
            completes_at
        };

        for cmd in &command_buffers {
            cmd.execute()?;
        }

        let mut signal_ids = Vec::with_capacity(info.signal_semaphores.len());
        for semaphore in info.signal_semaphores {
            let GpuSemaphore::Dummy(semaphore) = semaphore else {
                return Err(foreign("semaphore"));
            };
            semaphore.signal_at(completes_at);
            signal_ids.push(semaphore.id);
        }

        if let Some(fence) = fence {
            fence.signal_at(completes_at);
        }

        log::trace!(
            "DummyBackend: submit {:?} cmds {:?} wait {:?} signal {:?}",
            queue,
            command_buffers.iter().map(|c| c.id).collect::<Vec<_>>(),
            wait_ids,
            signal_ids
        );

        self.submissions.lock().push(SubmissionRecord {
            queue,
            command_buffers: command_buffers.iter().map(|c| c.id).collect(),
            wait_semaphores: wait_ids,
            signal_semaphores: signal_ids,
            fence: fence.map(|f| f.id),
            submitted_at,
            completes_at,
        });

        Ok(())
    }

    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.check_device()?;
        let latest = self.timelines.lock().iter().flatten().max().copied();
        if let Some(latest) = latest {
            let now = Instant::now();
            if latest > now {
                std::thread::sleep(latest - now);
            }
        }
        Ok(())
    }
}

fn queue_index(queue: QueueKind) -> usize {
    match queue {
        QueueKind::Graphics => 0,
        QueueKind::Transfer => 1,
    }
}

fn foreign(what: &str) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("{what} from another backend"))
}

// ============================================================================
// Memory and buffers
// ============================================================================

/// Host shadow of a device memory block.
pub struct DummyMemory {
    id: u64,
    size: u64,
    properties: MemoryProperties,
    bytes: Mutex<Vec<u8>>,
}

impl DummyMemory {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// CPU write through a mapping; requires host-visible memory.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        if !self.properties.is_mappable() {
            return Err(GraphicsError::InvalidParameter(format!(
                "memory block {} is not host visible",
                self.id
            )));
        }
        self.store(offset, data)
    }

    /// CPU read through a mapping; requires host-visible memory.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        if !self.properties.is_mappable() {
            return Err(GraphicsError::InvalidParameter(format!(
                "memory block {} is not host visible",
                self.id
            )));
        }
        self.load(offset, out)
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, GraphicsError> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if end as u64 <= self.size => Ok(start..end),
            _ => Err(GraphicsError::InvalidParameter(format!(
                "access of {len} bytes at {offset} overruns memory block {} ({} bytes)",
                self.id, self.size
            ))),
        }
    }

    fn store(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        let range = self.range(offset, data.len())?;
        self.bytes.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn load(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        let range = self.range(offset, out.len())?;
        out.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }
}

impl std::fmt::Debug for DummyMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyMemory")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// A buffer object, optionally bound to a memory block.
#[derive(Debug)]
pub struct DummyBuffer {
    id: u64,
    size: u64,
    usage: BufferUsage,
    binding: Mutex<Option<(Arc<DummyMemory>, u64)>>,
}

impl DummyBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn bound(&self) -> Result<(Arc<DummyMemory>, u64), GraphicsError> {
        self.binding.lock().clone().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("buffer {} has no memory bound", self.id))
        })
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<(), GraphicsError> {
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "range [{offset}, +{size}) overruns buffer {} ({} bytes)",
                self.id, self.size
            )));
        }
        Ok(())
    }

    /// Bytes currently stored at `[offset, offset + size)`, regardless of
    /// memory properties.
    pub fn contents(&self, offset: u64, size: u64) -> Result<Vec<u8>, GraphicsError> {
        self.check_range(offset, size)?;
        let (memory, base) = self.bound()?;
        let mut out = vec![0u8; size as usize];
        memory.load(base + offset, &mut out)?;
        Ok(out)
    }

    fn store(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        self.check_range(offset, data.len() as u64)?;
        let (memory, base) = self.bound()?;
        memory.store(base + offset, data)
    }
}

// ============================================================================
// Descriptor pools
// ============================================================================

#[derive(Debug)]
struct DummyDescriptorPoolState {
    remaining_sets: u32,
    remaining: BTreeMap<DescriptorType, u32>,
}

/// Descriptor pool that enforces its capacity like a driver would.
#[derive(Debug)]
pub struct DummyDescriptorPool {
    id: u64,
    max_sets: u32,
    state: Mutex<DummyDescriptorPoolState>,
}

impl DummyDescriptorPool {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    fn allocate(&self, layout: &DescriptorSetLayout) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.remaining_sets == 0 {
            return Err(GraphicsError::OutOfDeviceMemory(format!(
                "descriptor pool {} has no sets left",
                self.id
            )));
        }
        let sizes = layout.pool_sizes();
        for size in &sizes {
            let available = state.remaining.get(&size.ty).copied().unwrap_or(0);
            if available < size.count {
                return Err(GraphicsError::OutOfDeviceMemory(format!(
                    "descriptor pool {} has {available} {:?} descriptors left, {} needed",
                    self.id, size.ty, size.count
                )));
            }
        }
        state.remaining_sets -= 1;
        for size in &sizes {
            if let Some(available) = state.remaining.get_mut(&size.ty) {
                *available -= size.count;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Synchronization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    /// Submitted; signaled once the instant passes.
    Pending(Instant),
    Signaled,
}

/// Fence signaled by the simulated GPU timeline.
pub struct DummyFence {
    id: u64,
    state: Mutex<FenceState>,
    changed: Condvar,
    device_lost: Arc<AtomicBool>,
}

impl DummyFence {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> FenceState {
        let mut state = self.state.lock();
        if let FenceState::Pending(at) = *state
            && at <= Instant::now()
        {
            *state = FenceState::Signaled;
        }
        *state
    }

    /// Whether the fence has been submitted and not yet signaled.
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), FenceState::Pending(_))
    }

    fn signal_at(&self, at: Instant) {
        *self.state.lock() = FenceState::Pending(at);
        self.changed.notify_all();
    }

    pub(super) fn reset(&self) {
        *self.state.lock() = FenceState::Unsignaled;
    }

    pub(super) fn wait(&self, timeout: Duration) -> Result<bool, GraphicsError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if self.device_lost.load(Ordering::SeqCst) {
                return Err(GraphicsError::DeviceLost);
            }

            let now = Instant::now();
            let pending_until = match *state {
                FenceState::Signaled => return Ok(true),
                FenceState::Pending(at) if at <= now => {
                    *state = FenceState::Signaled;
                    return Ok(true);
                }
                FenceState::Pending(at) => Some(at),
                FenceState::Unsignaled => None,
            };

            if deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(false);
            }

            let wake = match (pending_until, deadline) {
                (Some(at), Some(deadline)) => Some(at.min(deadline)),
                (Some(at), None) => Some(at),
                (None, deadline) => deadline,
            };
            match wake {
                Some(wake) => {
                    self.changed.wait_until(&mut state, wake);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

impl std::fmt::Debug for DummyFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyFence")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Binary semaphore on the simulated timeline.
#[derive(Debug)]
pub struct DummySemaphore {
    id: u64,
    signaled_at: Mutex<Option<Instant>>,
}

impl DummySemaphore {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn signal_at(&self, at: Instant) {
        *self.signaled_at.lock() = Some(at);
    }

    /// Consume the pending signal, as a wait operation does.
    fn take_signal(&self) -> Option<Instant> {
        self.signaled_at.lock().take()
    }
}

// ============================================================================
// Command buffers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CommandPhase {
    #[default]
    Initial,
    Recording,
    Executable,
}

enum DummyCommand {
    CopyBuffer {
        src: Arc<DummyBuffer>,
        dst: Arc<DummyBuffer>,
        regions: Vec<CopyRegion>,
    },
    FillBuffer {
        dst: Arc<DummyBuffer>,
        offset: u64,
        size: u64,
        value: u32,
    },
    ExecuteCommands(Vec<Arc<DummyCommandBuffer>>),
}

#[derive(Default)]
struct DummyCommandState {
    phase: CommandPhase,
    commands: Vec<DummyCommand>,
}

/// Command buffer that stores commands and replays them on submit.
pub struct DummyCommandBuffer {
    id: u64,
    queue: QueueKind,
    level: CommandBufferLevel,
    state: Mutex<DummyCommandState>,
}

impl DummyCommandBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    fn is_executable(&self) -> bool {
        self.state.lock().phase == CommandPhase::Executable
    }

    /// Commands recorded since the last `begin`.
    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|command| match command {
                DummyCommand::CopyBuffer { src, dst, regions } => RecordedCommand::CopyBuffer {
                    src: src.id,
                    dst: dst.id,
                    regions: regions.clone(),
                },
                DummyCommand::FillBuffer {
                    dst,
                    offset,
                    size,
                    value,
                } => RecordedCommand::FillBuffer {
                    dst: dst.id,
                    offset: *offset,
                    size: *size,
                    value: *value,
                },
                DummyCommand::ExecuteCommands(secondaries) => {
                    RecordedCommand::ExecuteCommands(secondaries.iter().map(|s| s.id).collect())
                }
            })
            .collect()
    }

    pub(super) fn begin(&self) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.phase == CommandPhase::Recording {
            return Err(GraphicsError::InvalidParameter(format!(
                "command buffer {} is already recording",
                self.id
            )));
        }
        state.commands.clear();
        state.phase = CommandPhase::Recording;
        Ok(())
    }

    pub(super) fn end(&self) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.phase != CommandPhase::Recording {
            return Err(GraphicsError::InvalidParameter(format!(
                "command buffer {} is not recording",
                self.id
            )));
        }
        state.phase = CommandPhase::Executable;
        Ok(())
    }

    fn push(&self, command: DummyCommand) {
        let mut state = self.state.lock();
        if state.phase != CommandPhase::Recording {
            log::warn!(
                "DummyBackend: command recorded into command buffer {} outside begin/end",
                self.id
            );
            return;
        }
        state.commands.push(command);
    }

    #[allow(unreachable_patterns)]
    pub(super) fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, regions: &[CopyRegion]) {
        match (src, dst) {
            (GpuBuffer::Dummy(src), GpuBuffer::Dummy(dst)) => self.push(DummyCommand::CopyBuffer {
                src: Arc::clone(src),
                dst: Arc::clone(dst),
                regions: regions.to_vec(),
            }),
            _ => log::error!("DummyBackend: copy between buffers of another backend ignored"),
        }
    }

    #[allow(unreachable_patterns)]
    pub(super) fn fill_buffer(&self, dst: &GpuBuffer, offset: u64, size: u64, value: u32) {
        match dst {
            GpuBuffer::Dummy(dst) => self.push(DummyCommand::FillBuffer {
                dst: Arc::clone(dst),
                offset,
                size,
                value,
            }),
            _ => log::error!("DummyBackend: fill of a buffer of another backend ignored"),
        }
    }

    #[allow(unreachable_patterns)]
    pub(super) fn execute_commands(&self, secondaries: &[&GpuCommandBuffer]) {
        let mut collected = Vec::with_capacity(secondaries.len());
        for secondary in secondaries {
            match secondary {
                GpuCommandBuffer::Dummy(cmd) if cmd.level == CommandBufferLevel::Secondary => {
                    collected.push(Arc::clone(cmd));
                }
                GpuCommandBuffer::Dummy(cmd) => log::error!(
                    "DummyBackend: primary command buffer {} passed to execute_commands",
                    cmd.id
                ),
                _ => log::error!("DummyBackend: command buffer of another backend ignored"),
            }
        }
        self.push(DummyCommand::ExecuteCommands(collected));
    }

    /// Replay recorded commands against the memory shadows.
    fn execute(&self) -> Result<(), GraphicsError> {
        let state = self.state.lock();
        for command in &state.commands {
            match command {
                DummyCommand::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        let bytes = src.contents(region.src_offset, region.size)?;
                        dst.store(region.dst_offset, &bytes)?;
                    }
                }
                DummyCommand::FillBuffer {
                    dst,
                    offset,
                    size,
                    value,
                } => {
                    let pattern = value.to_le_bytes();
                    let bytes: Vec<u8> = (0..*size as usize).map(|i| pattern[i % 4]).collect();
                    dst.store(*offset, &bytes)?;
                }
                DummyCommand::ExecuteCommands(secondaries) => {
                    for secondary in secondaries {
                        if !secondary.is_executable() {
                            return Err(GraphicsError::InvalidParameter(format!(
                                "secondary command buffer {} is not executable",
                                secondary.id
                            )));
                        }
                        secondary.execute()?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DummyCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyCommandBuffer")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineStage;

    fn host_block(backend: &DummyBackend, size: u64) -> GpuMemory {
        backend
            .allocate_memory(
                &MemoryRequirements {
                    size,
                    alignment: 16,
                    memory_type_bits: 1,
                },
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            )
            .unwrap()
    }

    fn bound_buffer(backend: &DummyBackend, memory: &GpuMemory, offset: u64, size: u64) -> GpuBuffer {
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(
                size,
                BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ))
            .unwrap();
        backend.bind_buffer_memory(&buffer, memory, offset).unwrap();
        buffer
    }

    #[test]
    fn test_fence_signals_after_latency() {
        let backend = DummyBackend::with_config(
            DummyConfig::new().with_gpu_latency(Duration::from_millis(20)),
        );
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend
            .create_command_buffer(QueueKind::Graphics, CommandBufferLevel::Primary)
            .unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();

        backend
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: &[&cmd],
                    wait_semaphores: &[],
                    signal_semaphores: &[],
                    fence: Some(&fence),
                },
            )
            .unwrap();

        assert!(!fence.status().unwrap());
        assert!(fence.wait(Duration::from_secs(1)).unwrap());
        assert!(fence.status().unwrap());
    }

    #[test]
    fn test_unsubmitted_fence_times_out() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        assert!(!fence.wait(Duration::from_millis(5)).unwrap());

        let signaled = backend.create_fence(true).unwrap();
        assert!(signaled.wait(Duration::ZERO).unwrap());
        signaled.reset().unwrap();
        assert!(!signaled.status().unwrap());
    }

    #[test]
    fn test_submit_executes_copies() {
        let backend = DummyBackend::new();
        let memory = host_block(&backend, 256);
        let src = bound_buffer(&backend, &memory, 0, 64);
        let dst = bound_buffer(&backend, &memory, 128, 64);
        memory.write(0, &[1, 2, 3, 4]).unwrap();

        let cmd = backend
            .create_command_buffer(QueueKind::Transfer, CommandBufferLevel::Primary)
            .unwrap();
        cmd.begin().unwrap();
        cmd.copy_buffer(&src, &dst, &[CopyRegion::new(0, 8, 4)]);
        cmd.end().unwrap();

        backend
            .submit(
                QueueKind::Transfer,
                &SubmitInfo {
                    command_buffers: &[&cmd],
                    wait_semaphores: &[],
                    signal_semaphores: &[],
                    fence: None,
                },
            )
            .unwrap();

        let mut out = [0u8; 4];
        memory.read(136, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_semaphore_orders_queues() {
        let latency = Duration::from_millis(10);
        let backend = DummyBackend::with_config(DummyConfig::new().with_gpu_latency(latency));
        let semaphore = backend.create_semaphore().unwrap();
        let cmd = backend
            .create_command_buffer(QueueKind::Graphics, CommandBufferLevel::Primary)
            .unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();

        backend
            .submit(
                QueueKind::Transfer,
                &SubmitInfo {
                    command_buffers: &[&cmd],
                    wait_semaphores: &[],
                    signal_semaphores: &[&semaphore],
                    fence: None,
                },
            )
            .unwrap();
        backend
            .submit(
                QueueKind::Graphics,
                &SubmitInfo {
                    command_buffers: &[&cmd],
                    wait_semaphores: &[(&semaphore, PipelineStage::TRANSFER)],
                    signal_semaphores: &[],
                    fence: None,
                },
            )
            .unwrap();

        let log = backend.submissions();
        assert_eq!(log.len(), 2);
        assert!(log[1].completes_at >= log[0].completes_at + latency);
    }

    #[test]
    fn test_unreset_fence_rejected() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(true).unwrap();
        let result = backend.submit(
            QueueKind::Graphics,
            &SubmitInfo {
                command_buffers: &[],
                wait_semaphores: &[],
                signal_semaphores: &[],
                fence: Some(&fence),
            },
        );
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_device_lost_propagates() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        backend.lose_device();
        assert_eq!(fence.wait(Duration::ZERO), Err(GraphicsError::DeviceLost));
        assert_eq!(backend.wait_idle(), Err(GraphicsError::DeviceLost));
    }

    #[test]
    fn test_allocation_limit() {
        let backend =
            DummyBackend::with_config(DummyConfig::new().with_memory_allocation_limit(1));
        host_block(&backend, 64);
        let result = backend.allocate_memory(
            &MemoryRequirements {
                size: 64,
                alignment: 16,
                memory_type_bits: 1,
            },
            MemoryProperties::DEVICE_LOCAL,
        );
        assert!(matches!(result, Err(GraphicsError::OutOfDeviceMemory(_))));
    }

    #[test]
    fn test_device_local_memory_not_mappable() {
        let backend = DummyBackend::new();
        let memory = backend
            .allocate_memory(
                &MemoryRequirements {
                    size: 64,
                    alignment: 16,
                    memory_type_bits: 1,
                },
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap();
        assert!(memory.write(0, &[0]).is_err());
    }
}
