use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time source. Everything that measures intervals goes through
/// this, so tests can drive time by hand.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// wall-clock monotonic time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same timeline.
///
/// Public so embedders can drive `EventLoop::with_clock` and
/// `LoopDriver::with_clock` deterministically, e.g. replaying a recording.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            origin: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// jump to an absolute offset from the origin; never goes backwards
    pub fn set_ms(&self, ms: u64) {
        let target = Duration::from_millis(ms);
        if target > self.offset.get() {
            self.offset.set(target);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }
}

/// Counts ticks over a reporting window and turns them into a rate in Hz.
///
/// Used by the host to measure the refresh rate it actually achieves, which
/// is rarely the one it asked for.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    started: Option<Instant>,
    count: u64,
    rate: Option<f64>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        RateMeter {
            window,
            started: None,
            count: 0,
            rate: None,
        }
    }

    /// record one tick; returns a fresh measurement when a window closes
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        let started = match self.started {
            Some(s) => s,
            None => {
                // the first tick opens the window, it isn't counted in it
                self.started = Some(now);
                return None;
            }
        };
        self.count += 1;
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.window || elapsed.is_zero() {
            return None;
        }
        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.rate = Some(rate);
        self.started = Some(now);
        self.count = 0;
        Some(rate)
    }

    /// last completed measurement
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
