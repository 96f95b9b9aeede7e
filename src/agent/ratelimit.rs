//! Per-key token bucket throttling LLM calls.
//!
//! Provider API keys are shared across every CR in the process; the bucket
//! keeps the aggregate call rate below the provider limit. One bucket per
//! key, refilled continuously.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket allowing `calls_per_minute` sustained, with burst capacity
    /// of the same size.
    pub fn per_minute(calls_per_minute: u32) -> Self {
        let capacity = calls_per_minute.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait until a call slot is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
