//! Connection retry policies.
//!
//! One strategy governs the initial connect and another the reconnects after
//! a drop. Delays come from a `backon` constant backoff: the iterator yields
//! one delay per permitted retry and then ends.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBackoff, ConstantBuilder};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryStrategy {
    #[default]
    Never,
    Forever { interval: Duration },
    Parametrized { retries: u32, interval: Duration },
}

impl RetryStrategy {
    /// Give up after the first failure.
    pub fn never_retry() -> Self {
        RetryStrategy::Never
    }

    /// Retry every `interval` until it works.
    pub fn forever_retry(interval: Duration) -> Self {
        RetryStrategy::Forever { interval }
    }

    /// Retry up to `retries` times, `interval` apart.
    pub fn parametrized_retry(retries: u32, interval: Duration) -> Self {
        RetryStrategy::Parametrized { retries, interval }
    }

    /// Maps a configured retry count: `-1` (or any negative) retries forever,
    /// `0` never retries, `n` retries `n` times.
    pub fn from_count(count: i32, interval: Duration) -> Self {
        match count {
            0 => RetryStrategy::Never,
            n if n < 0 => RetryStrategy::Forever { interval },
            n => RetryStrategy::Parametrized {
                retries: n.unsigned_abs(),
                interval,
            },
        }
    }

    /// Delays to wait before each retry.
    pub fn backoff(&self) -> ConstantBackoff {
        let (delay, times) = match *self {
            RetryStrategy::Never => (Duration::ZERO, 0),
            RetryStrategy::Forever { interval } => (interval, usize::MAX),
            RetryStrategy::Parametrized { retries, interval } => {
                (interval, usize::try_from(retries).unwrap_or(usize::MAX))
            }
        };
        ConstantBuilder::default()
            .with_delay(delay)
            .with_max_times(times)
            .build()
    }
}
