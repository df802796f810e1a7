use std::{collections::VecDeque, time::Duration};

use tokio::{sync::Mutex, time::Instant};

/// Sliding-window request limiter.
///
/// Allows at most `max_calls` acquisitions within any `period`. Callers over
/// the limit wait until the oldest call in the window expires instead of
/// being rejected.
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    /// Instants of the calls still inside the window, oldest first.
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_calls` per `period`.
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            window: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Wait until a call is admitted and record it.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                Self::cleanup(&mut window, now, self.period);

                if window.len() < self.max_calls {
                    window.push_back(now);
                    return;
                }

                // Full window, so it has a front.
                window[0] + self.period
            };

            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Drop calls that have left the window.
    fn cleanup(window: &mut VecDeque<Instant>, now: Instant, period: Duration) {
        while let Some(oldest) = window.front()
            && now.duration_since(*oldest) >= period
        {
            window.pop_front();
        }
    }
}
