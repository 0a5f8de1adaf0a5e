//! Command recording callbacks and parallel secondary recording.

use std::sync::Arc;

use arbor_core::FrameStamp;
use arbor_core::compute::Latch;
use arbor_core::profiling::profile_scope;

use crate::command::{CommandBuffer, CommandEncoder};
use crate::error::GraphicsError;

/// Produces the commands of one frame.
///
/// Implemented for any `Fn(&mut CommandEncoder, FrameStamp) -> Result<(), GraphicsError>`
/// closure that is `Send + Sync`.
pub trait CommandRecorder: Send + Sync {
    fn record(
        &self,
        encoder: &mut CommandEncoder<'_>,
        frame: FrameStamp,
    ) -> Result<(), GraphicsError>;
}

impl<F> CommandRecorder for F
where
    F: Fn(&mut CommandEncoder<'_>, FrameStamp) -> Result<(), GraphicsError> + Send + Sync,
{
    fn record(
        &self,
        encoder: &mut CommandEncoder<'_>,
        frame: FrameStamp,
    ) -> Result<(), GraphicsError> {
        self(encoder, frame)
    }
}

/// Wrap a closure as a shareable recorder.
///
/// Going through this function pins the closure's argument types, which
/// plain `Arc::new(|encoder, frame| ..)` cannot infer.
pub fn recorder_fn<F>(f: F) -> Arc<dyn CommandRecorder>
where
    F: Fn(&mut CommandEncoder<'_>, FrameStamp) -> Result<(), GraphicsError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Counts the latch down when dropped, so a failing or panicking worker
/// still releases the primary.
struct CountDownOnDrop<'a>(&'a Latch);

impl Drop for CountDownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Record one frame into `primary`.
///
/// Each secondary recorder runs on its own scoped thread into its own
/// secondary command buffer while the primary recorders run on the calling
/// thread. The primary then waits on a latch for the secondaries and
/// executes them in order.
pub(crate) fn record_frame(
    primary: &CommandBuffer,
    recorders: &[Arc<dyn CommandRecorder>],
    secondaries: &[(Arc<dyn CommandRecorder>, Arc<CommandBuffer>)],
    frame: FrameStamp,
) -> Result<(), GraphicsError> {
    profile_scope!("record_frame");

    let latch = Latch::new(secondaries.len());

    std::thread::scope(|scope| {
        let workers: Vec<_> = secondaries
            .iter()
            .map(|(recorder, command_buffer)| {
                let latch = &latch;
                scope.spawn(move || {
                    let _count_down = CountDownOnDrop(latch);
                    profile_scope!("record_secondary");
                    let mut encoder = command_buffer.begin()?;
                    recorder.record(&mut encoder, frame)?;
                    encoder.finish()
                })
            })
            .collect();

        let mut encoder = primary.begin()?;
        for recorder in recorders {
            recorder.record(&mut encoder, frame)?;
        }

        latch.wait();
        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(GraphicsError::Internal(
                        "secondary command recorder panicked".to_string(),
                    ));
                }
            }
        }

        let command_buffers: Vec<&CommandBuffer> =
            secondaries.iter().map(|(_, cmd)| cmd.as_ref()).collect();
        encoder.execute_commands(&command_buffers);
        encoder.finish()
    })
}
