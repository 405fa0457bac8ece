use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation handle.
///
/// Cloning produces another handle to the same flag, so a host can hand one
/// clone to a Ctrl-C handler thread while the run loop polls another. The
/// call loop checks the token before opening a stream, between streamed
/// events, and before each tool invocation; it never checks mid-operation.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so a host can resume after a pause.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
