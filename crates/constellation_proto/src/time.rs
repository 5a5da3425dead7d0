use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis_to_i64_saturating)
        .unwrap_or(0)
}

fn duration_millis_to_i64_saturating(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Tracks how long an agent has been up, in protocol time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime {
    started_at_ms: i64,
}

impl Uptime {
    pub fn starting_at(started_at_ms: i64) -> Self {
        Self { started_at_ms }
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn seconds(&self, now_ms: i64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.started_at_ms);
        if elapsed <= 0 {
            0
        } else {
            (elapsed / 1_000) as u64
        }
    }
}
