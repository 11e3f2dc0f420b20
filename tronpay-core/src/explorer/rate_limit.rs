//! Explorer request rate limiting.
//!
//! Two constraints share one mutex: a sliding 60-second window capped at
//! `requests_per_minute` issued requests, and a minimum spacing of
//! `max(3 s, 60 / requests_per_minute)` between consecutive requests. A 429
//! response arms an exponential holdoff (factor doubling up to 8, each unit
//! worth 30 s); a 200 disarms it. Waits are computed under the lock and slept
//! outside it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const MIN_SPACING: Duration = Duration::from_secs(3);
const BACKOFF_UNIT: Duration = Duration::from_secs(30);
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Padding added when the window itself forces a wait, matching the
/// explorer's own rate accounting slack.
const WINDOW_SLACK: Duration = Duration::from_secs(5);

pub struct RateLimiter {
    requests_per_minute: usize,
    min_interval: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    window: VecDeque<Instant>,
    last_429: Option<Instant>,
    backoff_factor: u32,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let requests_per_minute = requests_per_minute.max(1) as usize;
        let spacing = Duration::from_secs_f64(60.0 / requests_per_minute as f64);
        Self {
            requests_per_minute,
            min_interval: spacing.max(MIN_SPACING),
            state: Mutex::new(LimiterState {
                window: VecDeque::new(),
                last_429: None,
                backoff_factor: 1,
            }),
        }
    }

    /// Block until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            match self.next_wait(Instant::now()) {
                None => return,
                Some(wait) => {
                    debug!(wait_secs = wait.as_secs_f64(), "rate limiter waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Returns the wait still required before a request may go out, or
    /// claims a slot and returns `None`.
    fn next_wait(&self, now: Instant) -> Option<Duration> {
        let mut state = self.lock_state();

        if let Some(last_429) = state.last_429 {
            let holdoff = BACKOFF_UNIT * state.backoff_factor;
            let elapsed = now.saturating_duration_since(last_429);
            if elapsed < holdoff {
                warn!(
                    factor = state.backoff_factor,
                    "still backing off after a 429 response"
                );
                return Some(holdoff - elapsed);
            }
        }

        while state
            .window
            .front()
            .is_some_and(|issued| now.saturating_duration_since(*issued) >= WINDOW)
        {
            state.window.pop_front();
        }

        if state.window.len() >= self.requests_per_minute {
            if let Some(oldest) = state.window.front().copied() {
                let wait =
                    WINDOW.saturating_sub(now.saturating_duration_since(oldest)) + WINDOW_SLACK;
                return Some(wait);
            }
        }

        if let Some(last) = state.window.back() {
            let since_last = now.saturating_duration_since(*last);
            if since_last < self.min_interval {
                return Some(self.min_interval - since_last);
            }
        }

        state.window.push_back(now);
        None
    }

    /// Record a 429: stamp the clock and double the holdoff factor.
    pub fn record_429(&self) {
        let mut state = self.lock_state();
        state.last_429 = Some(Instant::now());
        state.backoff_factor = (state.backoff_factor * 2).min(MAX_BACKOFF_FACTOR);
    }

    /// Record a successful response: the holdoff is disarmed.
    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.last_429 = None;
        state.backoff_factor = 1;
    }

    #[cfg(test)]
    fn current_backoff_factor(&self) -> u32 {
        self.lock_state().backoff_factor
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
