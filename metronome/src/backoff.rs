//! Backoff strategies for retried jobs.
//!
//! When a run fails with attempts remaining, the scheduler re-queues the job
//! after a delay computed from the attempt number. Strategies grow constant,
//! linear, or exponential, optionally clamped and jittered; all constructors
//! and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! use metronome::backoff::{BackoffStrategy, Jitter, Strategy};
//! use chrono::TimeDelta;
//!
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay before retrying a job, from its 1-based attempt number.
pub trait Strategy {
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// The same delay for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Delay growing linearly with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.factor * attempt.into();
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// Delay doubling with each attempt, starting from a base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let doublings = u32::from(attempt.saturating_sub(1));
        let backoff = 2i32
            .checked_pow(doublings)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(TimeDelta::max_value());
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// A random jitter applied on top of the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added uniformly from `-delta..=delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the computed backoff.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A [`Strategy`] together with optional jitter and a minimum delay.
///
/// Constructed via [`BackoffStrategy::constant`], [`BackoffStrategy::linear`],
/// or [`BackoffStrategy::exponential`]; [`BackoffStrategy::new`] accepts a
/// custom [`Strategy`] implementation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the computed backoff (before jitter) to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the computed backoff (before jitter) to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Floors the final delay, which is mostly useful to stop a large jitter
    /// from producing a near-zero retry delay.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply(backoff);
        }
        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::seconds(30);
        let strategy = BackoffStrategy::constant(delay);

        for attempt in 1..50 {
            assert_eq!(strategy.backoff(attempt), delay);
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let factor = TimeDelta::seconds(10);
        let max = TimeDelta::seconds(35);
        let strategy = BackoffStrategy::linear(factor).with_max(max);

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(20));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(30));
        assert_eq!(strategy.backoff(4), max);
        assert_eq!(strategy.backoff(50), max);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(3));

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(3));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(6));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(12));
        assert_eq!(strategy.backoff(4), TimeDelta::seconds(24));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        assert!(strategy.backoff(u16::MAX) > TimeDelta::days(365));
    }

    #[test]
    fn absolute_jitter_stays_within_bounds() {
        let delay = TimeDelta::seconds(60);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for attempt in 1..100 {
            let backoff = strategy.backoff(attempt);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn relative_jitter_stays_within_bounds() {
        let delay = TimeDelta::seconds(60);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Relative(0.1));

        for attempt in 1..100 {
            let backoff = strategy.backoff(attempt);
            assert!(backoff >= delay - TimeDelta::seconds(6));
            assert!(backoff <= delay + TimeDelta::seconds(6));
        }
    }

    #[test]
    fn min_floors_the_jittered_delay() {
        let delay = TimeDelta::seconds(10);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::constant(delay)
            .with_jitter(Jitter::Absolute(delay))
            .with_min(min);

        for attempt in 1..100 {
            assert!(strategy.backoff(attempt) >= min);
        }
    }
}
