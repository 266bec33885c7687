use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// A resettable series of sleep durations.
///
/// Returning `None` means the series has given up; callers decide what that
/// implies for them.
pub trait Backoff: Iterator<Item = Duration> + Send + Sync + Unpin {
    /// Start the series over, as after a success.
    fn reset(&mut self);
}

/// The default recovery policy for informer list/watch failures: jittered
/// exponential growth, capped, never giving up.
pub struct DefaultBackoff {
    builder: ExponentialBuilder,
    inner: backon::ExponentialBackoff,
}

impl DefaultBackoff {
    /// An unbounded jittered exponential series between `min` and `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(min)
            .with_max_delay(max)
            .with_jitter()
            .without_max_times();
        Self {
            inner: builder.clone().build(),
            builder,
        }
    }
}

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(800), Duration::from_secs(30))
    }
}

impl Iterator for DefaultBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.inner.next()
    }
}

impl Backoff for DefaultBackoff {
    fn reset(&mut self) {
        self.inner = self.builder.clone().build();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic policy for tests that assert on timing.
    pub(crate) struct LinearBackoff {
        interval: Duration,
        current: Duration,
    }

    impl LinearBackoff {
        pub(crate) fn new(interval: Duration) -> Self {
            Self {
                interval,
                current: Duration::ZERO,
            }
        }
    }

    impl Iterator for LinearBackoff {
        type Item = Duration;

        fn next(&mut self) -> Option<Duration> {
            self.current += self.interval;
            Some(self.current)
        }
    }

    impl Backoff for LinearBackoff {
        fn reset(&mut self) {
            self.current = Duration::ZERO;
        }
    }

    #[test]
    fn default_backoff_grows_and_resets() {
        let mut backoff = DefaultBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let first = backoff.next().unwrap();
        // jitter only ever adds
        assert!(first >= Duration::from_millis(100));
        for _ in 0..20 {
            assert!(backoff.next().unwrap() <= Duration::from_secs(20));
        }
        backoff.reset();
        let restarted = backoff.next().unwrap();
        assert!(restarted <= Duration::from_millis(200));
    }
}
