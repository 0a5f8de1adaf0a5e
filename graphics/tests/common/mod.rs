//! Common utilities for integration tests.
//!
//! Tests are parameterized over [`Backend`]; backends that are not compiled in
//! or cannot create a device on this machine are skipped.

use std::sync::Arc;

use arbor_graphics::{
    BackendKind, DeviceParameters, DummyBackend, DummyConfig, GraphicsDevice, ResourcePreferences,
};

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Stub GPU, always available.
    Dummy,
    /// Native Vulkan via ash.
    Vulkan,
}

impl Backend {
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Dummy => true,
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan => true,
            #[cfg(not(feature = "vulkan-backend"))]
            Backend::Vulkan => false,
        }
    }

    fn kind(self) -> BackendKind {
        match self {
            Backend::Dummy => BackendKind::Dummy,
            Backend::Vulkan => BackendKind::Vulkan,
        }
    }
}

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Small pool minimums so growth happens after a handful of reservations.
pub fn small_preferences() -> ResourcePreferences {
    ResourcePreferences::new()
        .with_minimum_buffer_size(1024)
        .with_minimum_device_memory_size(64 * 1024)
        .with_minimum_max_sets(4)
        .with_minimum_descriptor_pool_size(4)
}

/// Device and parameters shared by a test.
pub struct TestContext {
    #[allow(dead_code)]
    pub backend: Backend,
    pub device: Arc<GraphicsDevice>,
}

impl TestContext {
    /// Create a context for `backend`, or `None` if it is unavailable.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_parameters(backend, DeviceParameters::new().with_preferences(small_preferences()))
    }

    pub fn with_parameters(backend: Backend, parameters: DeviceParameters) -> Option<Self> {
        init_logging();
        if !backend.is_available() {
            return None;
        }

        let device = match GraphicsDevice::new(parameters.with_backend(backend.kind())) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("Backend {:?} could not create a device: {}", backend, e);
                return None;
            }
        };

        Some(Self { backend, device })
    }

    /// Dummy-only context with a stub GPU configured by `config`.
    #[allow(dead_code)]
    pub fn dummy(config: DummyConfig) -> Self {
        init_logging();
        let device = GraphicsDevice::new(
            DeviceParameters::new()
                .with_preferences(small_preferences())
                .with_dummy_config(config),
        )
        .expect("dummy device");
        Self {
            backend: Backend::Dummy,
            device,
        }
    }

    /// The stub GPU behind a dummy context.
    #[allow(dead_code)]
    pub fn stub(&self) -> &DummyBackend {
        self.device.dummy().expect("dummy backend")
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
    }
}

/// Generate test data pattern for buffer tests.
#[allow(dead_code)]
pub fn generate_test_pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
