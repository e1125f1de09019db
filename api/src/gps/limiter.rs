use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-window rate limiter bounding outbound calls to the Compass GPS
/// endpoints. Advisory and process-local: a rejection means the caller must
/// fall back to stored data instead of making the HTTP request. State is not
/// persisted and resets on restart.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    cap: u32,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, cap: u32) -> Self {
        FixedWindowLimiter {
            window,
            cap,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Counts one attempted call. Returns false when the current window is
    /// already at capacity.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        if now.duration_since(window.started) > self.window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.cap
    }
}
