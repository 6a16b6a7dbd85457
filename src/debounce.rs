//! # activation debouncer
//!
//! Wraps an action which a caller wants to poke as often as it likes (once per
//! refresh, say) and makes sure the action itself runs no more often than a
//! target rate.
//!
//! Policy, in order:
//!
//! * interval of zero: disabled, every activation fires
//! * nothing recorded yet: fire, so a fresh debouncer never stalls waiting
//!   for an interval to elapse
//! * elapsed <= interval: skip
//! * elapsed > interval: fire once; or, with catch-up on and more than two
//!   intervals gone, fire `floor(elapsed / interval)` times to make up for a
//!   stall
//!
//! `now` is read before the action runs, so a slow action never pushes out the
//! next measurement, and the new baseline is `now` rather than `last +
//! interval`, so drift is absorbed rather than corrected. The catch-up count
//! is worked out once from the original elapsed time; the repeated calls do
//! not account for their own run time.
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};

/// outcome of a single `activate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// the action ran this many times
    Fired(u64),
    Skipped,
}

impl Activation {
    pub fn fired(&self) -> bool {
        matches!(self, Activation::Fired(_))
    }

    /// how many times the action ran
    pub fn count(&self) -> u64 {
        match self {
            Activation::Fired(n) => *n,
            Activation::Skipped => 0,
        }
    }
}

pub struct Debouncer<F, C = SystemClock> {
    action: F,
    clock: C,
    interval: Duration,
    last_activation: Option<Instant>,
    catch_up: bool,
    catch_up_limit: Option<u64>,
}

impl<F> Debouncer<F> {
    /// disabled until a rate is set
    pub fn new(action: F) -> Self {
        Debouncer {
            action,
            clock: SystemClock,
            interval: Duration::ZERO,
            last_activation: None,
            catch_up: false,
            catch_up_limit: None,
        }
    }

    pub fn with_interval_ms(action: F, interval_ms: f64) -> Self {
        let mut d = Debouncer::new(action);
        d.set_interval(interval_from_ms(interval_ms));
        d
    }
}

impl<F, C: Clock> Debouncer<F, C> {
    /// swap the time source, keeping everything else
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Debouncer<F, C2> {
        Debouncer {
            action: self.action,
            clock,
            interval: self.interval,
            last_activation: self.last_activation,
            catch_up: self.catch_up,
            catch_up_limit: self.catch_up_limit,
        }
    }

    pub fn with_catch_up(mut self, catch_up: bool) -> Self {
        self.catch_up = catch_up;
        self
    }

    /// bound the number of catch-up invocations in one activation
    pub fn with_catch_up_limit(mut self, limit: u64) -> Self {
        self.catch_up_limit = Some(limit.max(1));
        self
    }

    /// `n <= 0` disables; otherwise the interval becomes `floor(1000 / n)` ms
    pub fn set_rate_per_second(&mut self, n: f64) {
        // NaN lands here too
        if !(n > 0.0) {
            self.set_interval(Duration::ZERO);
        } else {
            self.set_interval(interval_from_ms((1000.0 / n).floor()));
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        if interval != self.interval {
            log::trace!("debounce interval {:?} -> {:?}", self.interval, interval);
        }
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn catch_up(&self) -> bool {
        self.catch_up
    }

    pub fn last_activation(&self) -> Option<Instant> {
        self.last_activation
    }

    /// forget the last activation; the next one fires unconditionally
    pub fn reset(&mut self) {
        self.last_activation = None;
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.action
    }

    /// Decide how many times the action runs for an activation right now, and
    /// move the baseline forward if it runs at all.
    fn plan(&mut self) -> u64 {
        let now = self.clock.now();
        if self.interval.is_zero() {
            return 1;
        }
        let last = match self.last_activation {
            Some(last) => last,
            None => {
                self.last_activation = Some(now);
                return 1;
            }
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed <= self.interval {
            return 0;
        }
        let count = if self.catch_up && elapsed > self.interval * 2 {
            let behind = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
            let count = self.catch_up_limit.map_or(behind, |limit| behind.min(limit));
            log::debug!("catching up {} activations after {:?}", count, elapsed);
            count
        } else {
            1
        };
        self.last_activation = Some(now);
        count
    }
}

impl<F: FnMut(), C: Clock> Debouncer<F, C> {
    pub fn activate(&mut self) -> Activation {
        let count = self.plan();
        for _ in 0..count {
            (self.action)();
        }
        outcome(count)
    }
}

impl<F, E, C> Debouncer<F, C>
where
    F: FnMut() -> Result<(), E>,
    C: Clock,
{
    /// As `activate`, for an action that can fail. The baseline has already
    /// moved when the action runs; the first error ends the batch.
    pub fn try_activate(&mut self) -> Result<Activation, E> {
        let count = self.plan();
        for _ in 0..count {
            (self.action)()?;
        }
        Ok(outcome(count))
    }
}

fn outcome(count: u64) -> Activation {
    match count {
        0 => Activation::Skipped,
        n => Activation::Fired(n),
    }
}

fn interval_from_ms(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_nanos((ms * 1_000_000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}
