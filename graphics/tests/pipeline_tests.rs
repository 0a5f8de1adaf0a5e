//! Integration tests for the N-buffered frame pipeline.
//!
//! Timing and failure tests drive the dummy backend, whose submissions
//! complete after a configurable latency and whose device can be lost on
//! demand.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rstest::rstest;

use arbor_core::FrameStamp;
use arbor_graphics::backend::GpuBuffer;
use arbor_graphics::pipeline::recorder_fn;
use arbor_graphics::{
    BufferLease, BufferUsage, DummyConfig, DynamicData, FramePipeline, GraphicsDevice,
    GraphicsError, MemoryProperties, PipelineParameters, QueueKind, SharingMode,
};
use common::{Backend, TestContext};

fn pipeline(device: &Arc<GraphicsDevice>, num_buffers: usize) -> FramePipeline {
    FramePipeline::new(
        Arc::clone(device),
        PipelineParameters::new().with_num_buffers(num_buffers),
    )
    .unwrap()
}

fn run_frames(pipeline: &mut FramePipeline, frames: u64) -> Result<(), GraphicsError> {
    for frame in 0..frames {
        pipeline.advance();
        pipeline.execute(FrameStamp::with_frame_count(frame))?;
    }
    Ok(())
}

fn device_contents(lease: &BufferLease) -> Vec<u8> {
    #[allow(unreachable_patterns)]
    match lease.buffer().unwrap().gpu() {
        GpuBuffer::Dummy(buffer) => buffer.contents(lease.offset(), lease.range()).unwrap(),
        _ => unreachable!("dummy device"),
    }
}

// ============================================================================
// Ring indexing
// ============================================================================

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(5)]
fn test_previous_frame_fence_after_advance(#[case] num_buffers: usize) {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, num_buffers);
    pipeline.advance();

    for _ in 0..2 * num_buffers {
        let current = pipeline.fence(0).id();
        pipeline.advance();
        assert_eq!(pipeline.fence(1 % num_buffers).id(), current);
        if num_buffers > 1 {
            assert_ne!(pipeline.fence(0).id(), current);
        }
    }
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(4)]
fn test_num_buffers_advances_restore_index(#[case] num_buffers: usize) {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, num_buffers);
    pipeline.advance();
    let start = pipeline.index(0);

    for _ in 0..num_buffers {
        pipeline.advance();
    }
    assert_eq!(pipeline.index(0), start);
    assert_eq!(pipeline.frame_count(), num_buffers as u64 + 1);
}

// ============================================================================
// Back-pressure
// ============================================================================

#[test]
fn test_at_most_num_buffers_frames_in_flight() {
    const NUM_BUFFERS: usize = 2;
    const FRAMES: u64 = 6;
    let latency = Duration::from_millis(20);

    let ctx = TestContext::dummy(DummyConfig::new().with_gpu_latency(latency));
    let mut pipeline = pipeline(&ctx.device, NUM_BUFFERS);

    let began = Instant::now();
    run_frames(&mut pipeline, FRAMES).unwrap();
    let elapsed = began.elapsed();

    // Frame k cannot be submitted before frame k - N has completed.
    let submissions: Vec<_> = ctx
        .stub()
        .submissions()
        .into_iter()
        .filter(|s| s.queue == QueueKind::Graphics)
        .collect();
    assert_eq!(submissions.len(), FRAMES as usize);
    for k in NUM_BUFFERS..submissions.len() {
        assert!(
            submissions[k].submitted_at >= submissions[k - NUM_BUFFERS].completes_at,
            "frame {k} submitted while frame {} was in flight",
            k - NUM_BUFFERS
        );
    }

    let expected = latency * (FRAMES as u32 - NUM_BUFFERS as u32);
    assert!(elapsed >= expected, "elapsed {elapsed:?}, expected at least {expected:?}");

    pipeline.wait_idle().unwrap();
}

#[test]
fn test_fence_timeout_keeps_waiting() {
    let latency = Duration::from_millis(30);
    let ctx = TestContext::dummy(DummyConfig::new().with_gpu_latency(latency));
    let mut pipeline = FramePipeline::new(
        Arc::clone(&ctx.device),
        PipelineParameters::new()
            .with_num_buffers(1)
            .with_fence_timeout(Duration::from_millis(5)),
    )
    .unwrap();

    // The second frame times out on the first frame's fence several times
    // before the fence signals, and still succeeds.
    run_frames(&mut pipeline, 2).unwrap();
    let submissions = ctx.stub().submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions[1].submitted_at >= submissions[0].completes_at);
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_render_submission_waits_on_transfer() {
    let ctx = TestContext::dummy(DummyConfig::new().with_gpu_latency(Duration::from_millis(2)));
    let mut pipeline = pipeline(&ctx.device, 2);

    let data = Arc::new(DynamicData::new(vec![7u8; 64]));
    let lease = Arc::new(
        ctx.device
            .reserve_buffer(
                64,
                16,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap()
            .with_data(Arc::clone(&data)),
    );
    pipeline.early_transfer().assign(&lease);

    run_frames(&mut pipeline, 1).unwrap();

    let submissions = ctx.stub().submissions();
    assert_eq!(submissions.len(), 2);
    let transfer = &submissions[0];
    let render = &submissions[1];
    assert_eq!(transfer.queue, QueueKind::Transfer);
    assert_eq!(render.queue, QueueKind::Graphics);
    assert_eq!(transfer.signal_semaphores.len(), 1);
    assert!(render.wait_semaphores.contains(&transfer.signal_semaphores[0]));
    assert!(render.completes_at >= transfer.completes_at);
    assert_eq!(device_contents(&lease), vec![7u8; 64]);

    // Unchanged data: the next frame submits no transfer.
    run_frames(&mut pipeline, 1).unwrap();
    let submissions = ctx.stub().submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions[2].wait_semaphores.is_empty());

    data.set(&[9u8; 64]);
    run_frames(&mut pipeline, 1).unwrap();
    pipeline.wait_idle().unwrap();
    assert_eq!(device_contents(&lease), vec![9u8; 64]);
}

// ============================================================================
// Failure propagation
// ============================================================================

#[test]
fn test_device_lost_during_submit() {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, 2);
    run_frames(&mut pipeline, 1).unwrap();

    ctx.stub().lose_device();

    // Slot 1 has never been submitted, so the loss surfaces at submit.
    pipeline.advance();
    assert_eq!(
        pipeline.execute(FrameStamp::with_frame_count(1)),
        Err(GraphicsError::DeviceLost)
    );
}

#[test]
fn test_device_lost_during_fence_wait() {
    let ctx = TestContext::dummy(DummyConfig::new().with_gpu_latency(Duration::from_millis(50)));
    let mut pipeline = pipeline(&ctx.device, 1);
    run_frames(&mut pipeline, 1).unwrap();

    ctx.stub().lose_device();

    pipeline.advance();
    assert_eq!(pipeline.start(), Err(GraphicsError::DeviceLost));
}

#[test]
fn test_staging_allocation_failure_propagates() {
    // One memory block: the device-local destination takes it, so the
    // host-visible staging buffer cannot be allocated.
    let ctx = TestContext::dummy(DummyConfig::new().with_memory_allocation_limit(1));
    let mut pipeline = pipeline(&ctx.device, 2);

    let lease = Arc::new(
        ctx.device
            .reserve_buffer(
                32,
                16,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap()
            .with_data(Arc::new(DynamicData::zeroed(32))),
    );
    pipeline.late_transfer().assign(&lease);

    pipeline.advance();
    let result = pipeline.execute(FrameStamp::with_frame_count(0));
    assert!(matches!(result, Err(GraphicsError::OutOfDeviceMemory(_))));
    assert!(ctx.stub().submissions().is_empty());
}

#[test]
fn test_recorder_error_propagates() {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, 2);
    pipeline.add_recorder(recorder_fn(|_, frame| {
        if frame.frame_count == 1 {
            Err(GraphicsError::Internal("scene traversal failed".to_string()))
        } else {
            Ok(())
        }
    }));

    pipeline.advance();
    pipeline.execute(FrameStamp::with_frame_count(0)).unwrap();
    pipeline.advance();
    assert_eq!(
        pipeline.execute(FrameStamp::with_frame_count(1)),
        Err(GraphicsError::Internal("scene traversal failed".to_string()))
    );

    // The pipeline stays usable after a failed frame.
    pipeline.advance();
    pipeline.execute(FrameStamp::with_frame_count(2)).unwrap();
    assert_eq!(ctx.stub().submissions().len(), 2);
}

#[test]
fn test_failed_frame_uploads_again() {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, 2);

    let lease = Arc::new(
        ctx.device
            .reserve_buffer(
                16,
                16,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap()
            .with_data(Arc::new(DynamicData::new(vec![7u8; 16]))),
    );
    pipeline.early_transfer().assign(&lease);
    pipeline.add_recorder(recorder_fn(|_, frame| {
        if frame.frame_count == 0 {
            Err(GraphicsError::Internal("first frame aborted".to_string()))
        } else {
            Ok(())
        }
    }));

    // The early transfer is recorded in start(), then the recorder fails.
    pipeline.advance();
    assert!(pipeline.execute(FrameStamp::with_frame_count(0)).is_err());
    assert!(ctx.stub().submissions().is_empty());

    pipeline.advance();
    pipeline.execute(FrameStamp::with_frame_count(1)).unwrap();
    pipeline.wait_idle().unwrap();

    let submissions = ctx.stub().submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].queue, QueueKind::Transfer);
    assert_eq!(device_contents(&lease), vec![7u8; 16]);
}

// ============================================================================
// Recording
// ============================================================================

#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_primary_and_secondary_recorders_run_each_frame(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let mut pipeline = pipeline(&ctx.device, 3);

    let primary_calls = Arc::new(AtomicUsize::new(0));
    let secondary_calls = Arc::new(AtomicUsize::new(0));
    let last_frame = Arc::new(AtomicU64::new(u64::MAX));

    {
        let primary_calls = Arc::clone(&primary_calls);
        let last_frame = Arc::clone(&last_frame);
        pipeline.add_recorder(recorder_fn(move |_, frame| {
            primary_calls.fetch_add(1, Ordering::SeqCst);
            last_frame.store(frame.frame_count, Ordering::SeqCst);
            Ok(())
        }));
    }
    for _ in 0..2 {
        let secondary_calls = Arc::clone(&secondary_calls);
        pipeline.add_secondary_recorder(recorder_fn(move |_, _| {
            secondary_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }

    run_frames(&mut pipeline, 5).unwrap();
    pipeline.wait_idle().unwrap();

    assert_eq!(primary_calls.load(Ordering::SeqCst), 5);
    assert_eq!(secondary_calls.load(Ordering::SeqCst), 10);
    assert_eq!(last_frame.load(Ordering::SeqCst), 4);
}

#[test]
fn test_recorded_fill_reaches_buffer() {
    let ctx = TestContext::dummy(DummyConfig::new());
    let mut pipeline = pipeline(&ctx.device, 2);

    let target = Arc::new(
        ctx.device
            .reserve_buffer(
                16,
                16,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap(),
    );
    {
        let target = Arc::clone(&target);
        pipeline.add_secondary_recorder(recorder_fn(move |encoder, _| {
            let buffer = target.buffer().ok_or(GraphicsError::DeviceLost)?;
            encoder.fill_buffer(&buffer, target.offset(), target.range(), 0x0101_0101);
            Ok(())
        }));
    }

    run_frames(&mut pipeline, 1).unwrap();
    assert_eq!(device_contents(&target), vec![1u8; 16]);
}
