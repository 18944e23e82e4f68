//! Timeout parameters and the TIME_WAIT delay.
//!
//! Two clocks drive the protocol:
//! - the **receive timeout** bounds every blocking read; for the client's
//!   data transfer its expiry is the retransmission trigger.
//! - the **maximum segment lifetime** (MSL); an endpoint in `TIME_WAIT`
//!   holds its socket for `2 × MSL` so stray segments of the old connection
//!   die out before the port is reused.
//!
//! The wait is served in ten slices so the remaining time shows up in the
//! debug log while a teardown is in progress.

use std::time::Duration;

/// Default bound on a single blocking receive.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Default maximum segment lifetime.
pub const DEFAULT_MSL: Duration = Duration::from_secs(5);

/// Adjustable timeout parameters shared by client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Bound on each socket read.
    pub recv_timeout: Duration,
    /// Maximum segment lifetime; `TIME_WAIT` lasts twice this.
    pub msl: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            msl: DEFAULT_MSL,
        }
    }
}

impl TimerConfig {
    /// Total `TIME_WAIT` duration.
    pub fn time_wait(&self) -> Duration {
        self.msl * 2
    }
}

/// Block for `2 × MSL`, logging the countdown at debug level.
pub async fn time_wait(config: &TimerConfig, role: &str) {
    let total = config.time_wait();
    let slice = (total / 10).max(Duration::from_millis(1));
    let mut remaining = total;

    while !remaining.is_zero() {
        log::debug!("[{role}] TIME_WAIT(remaining={remaining:?})");
        let step = slice.min(remaining);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn time_wait_is_twice_msl() {
        assert_eq!(TimerConfig::default().time_wait(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn time_wait_blocks_for_the_full_period() {
        let config = TimerConfig {
            recv_timeout: Duration::from_millis(10),
            msl: Duration::from_millis(15),
        };
        let started = Instant::now();
        time_wait(&config, "test").await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
