#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// Source of time for all timeout decisions, injected so that timing logic can be tested
///  deterministically.
///
/// Time is measured in milliseconds since an arbitrary, fixed origin.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Reads tokio's clock, so that paused / advanced time in tokio tests applies to it as well
pub struct TokioClock {
    origin: Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioClock {
    pub fn new() -> TokioClock {
        TokioClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
