use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A single-use countdown latch.
///
/// The latch starts with a count. Workers call [`count_down`](Latch::count_down)
/// when their share of the work is done; any number of threads may block in
/// [`wait`](Latch::wait) until the count reaches zero.
///
/// Used by the frame pipeline to join secondary command buffer recording
/// before the primary command buffer executes them.
///
/// # Example
///
/// ```
/// use arbor_core::compute::Latch;
///
/// let latch = Latch::new(2);
/// std::thread::scope(|s| {
///     for _ in 0..2 {
///         s.spawn(|| latch.count_down());
///     }
///     latch.wait();
/// });
/// assert!(latch.is_released());
/// ```
pub struct Latch {
    count: Mutex<usize>,
    released: Condvar,
}

impl Latch {
    /// Create a latch that releases after `count` calls to `count_down`.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    ///
    /// Extra calls after the latch has released are ignored.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            log::trace!("Latch::count_down called on a released latch");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.released.notify_all();
        }
    }

    /// Remaining count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Whether the count has reached zero.
    pub fn is_released(&self) -> bool {
        self.count() == 0
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.released.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or the timeout elapses.
    ///
    /// Returns `true` if the latch released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.released.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_count_is_released() {
        let latch = Latch::new(0);
        assert!(latch.is_released());
        latch.wait();
        assert!(latch.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_count_down_releases() {
        let latch = Latch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        assert!(!latch.wait_timeout(Duration::from_millis(1)));
        latch.count_down();
        assert!(latch.is_released());
    }

    #[test]
    fn test_extra_count_down_ignored() {
        let latch = Latch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_observes_all_workers() {
        let latch = Latch::new(4);
        let done = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    std::thread::sleep(Duration::from_millis(2));
                    done.fetch_add(1, Ordering::SeqCst);
                    latch.count_down();
                });
            }
            latch.wait();
            assert_eq!(done.load(Ordering::SeqCst), 4);
        });
    }
}
