//! Upload of modified CPU-side data through per-frame staging buffers.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use arbor_core::profiling::{profile_plot, profile_scope};
use parking_lot::Mutex;

use crate::command::CommandBuffer;
use crate::device::GraphicsDevice;
use crate::error::GraphicsError;
use crate::memory::{BufferLease, align_up};
use crate::queue::Submission;
use crate::resources::Buffer;
use crate::sync::Semaphore;
use crate::types::{
    BufferUsage, CommandBufferLevel, CopyRegion, MemoryProperties, PipelineStage, QueueKind,
    SharingMode,
};

/// Alignment of each upload inside a staging buffer.
const STAGING_ALIGNMENT: u64 = 16;

struct TransferEntry {
    lease: Weak<BufferLease>,
    /// Modification count of the data last copied.
    uploaded: Option<u64>,
}

struct TransferSlot {
    staging: BufferLease,
    command_buffer: Arc<CommandBuffer>,
    semaphore: Arc<Semaphore>,
    /// Copy regions per destination buffer id.
    copies: BTreeMap<u64, (Arc<Buffer>, Vec<CopyRegion>)>,
    /// Leases and modification counts recorded but not yet submitted.
    recorded: Vec<(Weak<BufferLease>, u64)>,
    pending: bool,
}

/// Copies [`DynamicData`](crate::memory::DynamicData) attached to buffer
/// leases to the GPU whenever it changes.
///
/// Each frame slot owns a host-visible staging range, a transfer command
/// buffer and a semaphore. [`record`](Self::record) packs every modified
/// data block into the slot's staging range and records the copies;
/// [`submit`](Self::submit) submits them and returns the semaphore the render
/// submission must wait on.
///
/// Leases are registered with [`assign`](Self::assign) and held weakly;
/// dropping the last `Arc<BufferLease>` unregisters it.
pub struct TransferTask {
    device: Arc<GraphicsDevice>,
    queue: QueueKind,
    entries: Mutex<Vec<TransferEntry>>,
    slots: Vec<Mutex<TransferSlot>>,
}

impl TransferTask {
    pub fn new(
        device: Arc<GraphicsDevice>,
        num_buffers: usize,
        queue: QueueKind,
    ) -> Result<Self, GraphicsError> {
        if num_buffers == 0 {
            return Err(GraphicsError::InvalidParameter(
                "transfer task needs at least one buffer".to_string(),
            ));
        }
        let slots = (0..num_buffers)
            .map(|_| {
                Ok(Mutex::new(TransferSlot {
                    staging: BufferLease::default(),
                    command_buffer: Arc::new(
                        device.create_command_buffer(queue, CommandBufferLevel::Primary)?,
                    ),
                    semaphore: Arc::new(device.create_semaphore(PipelineStage::ALL_COMMANDS)?),
                    copies: BTreeMap::new(),
                    recorded: Vec::new(),
                    pending: false,
                }))
            })
            .collect::<Result<Vec<_>, GraphicsError>>()?;

        Ok(Self {
            device,
            queue,
            entries: Mutex::new(Vec::new()),
            slots,
        })
    }

    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Register a lease whose data should be kept uploaded.
    ///
    /// Leases without data are ignored with a warning.
    pub fn assign(&self, lease: &Arc<BufferLease>) {
        if lease.data().is_none() {
            log::warn!("TransferTask::assign: lease at offset {} has no data", lease.offset());
            return;
        }
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|entry| std::ptr::eq(entry.lease.as_ptr(), Arc::as_ptr(lease)))
        {
            return;
        }
        entries.push(TransferEntry {
            lease: Arc::downgrade(lease),
            uploaded: None,
        });
    }

    /// Number of live registered leases.
    pub fn assigned_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.lease.strong_count() > 0)
            .count()
    }

    /// Whether slot `index` has recorded copies waiting for submission.
    pub fn is_pending(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.lock().pending)
    }

    /// Size of the staging range currently held by slot `index`.
    pub fn staging_size(&self, index: usize) -> u64 {
        self.slots
            .get(index)
            .map_or(0, |slot| slot.lock().staging.range())
    }

    /// Pack modified data into slot `index`'s staging range and record the copies.
    ///
    /// Returns `Ok(false)` when nothing changed. The slot's previous
    /// submission must have completed.
    pub fn record(&self, index: usize) -> Result<bool, GraphicsError> {
        profile_scope!("TransferTask::record");

        let mut slot = self.slot(index)?.lock();
        slot.copies.clear();
        slot.recorded.clear();
        slot.pending = false;

        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.lease.strong_count() > 0);

        struct Upload {
            lease: Arc<BufferLease>,
            buffer: Arc<Buffer>,
            modified_count: u64,
            bytes: Vec<u8>,
        }

        let mut uploads = Vec::new();
        let mut total = 0u64;
        for entry in entries.iter() {
            let Some(lease) = entry.lease.upgrade() else {
                continue;
            };
            let (Some(data), Some(buffer)) = (lease.data(), lease.buffer()) else {
                continue;
            };
            let modified_count = data.modified_count();
            if entry.uploaded == Some(modified_count) {
                continue;
            }
            let mut bytes = data.snapshot();
            if bytes.len() as u64 > lease.range() {
                log::warn!(
                    "TransferTask: {} bytes of data truncated to a {} byte lease",
                    bytes.len(),
                    lease.range()
                );
                bytes.truncate(lease.range() as usize);
            }
            if bytes.is_empty() {
                continue;
            }
            total = align_up(total, STAGING_ALIGNMENT) + bytes.len() as u64;
            uploads.push(Upload {
                lease,
                buffer,
                modified_count,
                bytes,
            });
        }

        if uploads.is_empty() {
            return Ok(false);
        }

        if slot.staging.range() < total {
            slot.staging.release();
            slot.staging = self.device.reserve_buffer(
                total,
                STAGING_ALIGNMENT,
                BufferUsage::COPY_SRC,
                SharingMode::Exclusive,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            )?;
            log::debug!("TransferTask: slot {index} staging grown to {total} bytes");
        }
        let staging_buffer = slot.staging.buffer().ok_or_else(|| {
            GraphicsError::Internal("staging buffer dropped while recording".to_string())
        })?;

        let mut offset = 0u64;
        for upload in &uploads {
            offset = align_up(offset, STAGING_ALIGNMENT);
            slot.staging.write(offset, &upload.bytes)?;
            let region = CopyRegion::new(
                slot.staging.offset() + offset,
                upload.lease.offset(),
                upload.bytes.len() as u64,
            );
            slot.copies
                .entry(upload.buffer.id())
                .or_insert_with(|| (Arc::clone(&upload.buffer), Vec::new()))
                .1
                .push(region);
            offset += upload.bytes.len() as u64;
        }

        let mut encoder = slot.command_buffer.begin()?;
        for (dst, regions) in slot.copies.values() {
            encoder.copy_buffer(&staging_buffer, dst, regions);
        }
        encoder.finish()?;

        slot.recorded = uploads
            .iter()
            .map(|upload| (Arc::downgrade(&upload.lease), upload.modified_count))
            .collect();
        slot.pending = true;

        log::trace!(
            "TransferTask: slot {index} recorded {} uploads, {total} bytes",
            uploads.len()
        );
        profile_plot!("transfer_bytes", total);
        Ok(true)
    }

    /// Submit slot `index`'s recorded copies.
    ///
    /// Returns the semaphore signaled when they complete, or `None` when
    /// nothing was recorded.
    pub fn submit(&self, index: usize) -> Result<Option<Arc<Semaphore>>, GraphicsError> {
        profile_scope!("TransferTask::submit");

        let mut slot = self.slot(index)?.lock();
        if !slot.pending {
            return Ok(None);
        }
        let command_buffers = [Arc::clone(&slot.command_buffer)];
        let signal_semaphores = [Arc::clone(&slot.semaphore)];
        self.device.queue(self.queue).submit(&Submission {
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
            ..Default::default()
        })?;

        // Only submitted copies count as uploaded; a frame that fails before
        // this point uploads the same data again next time.
        let mut entries = self.entries.lock();
        for (lease, modified_count) in slot.recorded.drain(..) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|entry| Weak::ptr_eq(&entry.lease, &lease))
            {
                entry.uploaded = Some(modified_count);
            }
        }
        slot.pending = false;
        Ok(Some(Arc::clone(&slot.semaphore)))
    }

    /// Drop the per-submission state of slot `index`.
    ///
    /// Copies recorded but never submitted are discarded and their data stays
    /// marked as modified.
    pub fn finish(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let mut slot = slot.lock();
            if slot.pending {
                log::debug!(
                    "TransferTask: slot {index} dropped {} unsubmitted uploads",
                    slot.recorded.len()
                );
            }
            slot.copies.clear();
            slot.recorded.clear();
            slot.pending = false;
        }
    }

    fn slot(&self, index: usize) -> Result<&Mutex<TransferSlot>, GraphicsError> {
        self.slots.get(index).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "transfer slot {index} out of range ({} slots)",
                self.slots.len()
            ))
        })
    }
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("queue", &self.queue)
            .field("num_buffers", &self.slots.len())
            .field("assigned", &self.assigned_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(TransferTask: Send, Sync);
