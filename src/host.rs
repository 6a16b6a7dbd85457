//! # host
//!
//! A single-threaded cooperative event loop with the two scheduling primitives
//! the pacing code is written against:
//!
//! * `request_frame` - run a callback once, at the next refresh
//! * the macrotask queue - `Immediate`, pumped once per loop iteration
//!
//! Nothing here runs in parallel. Callbacks interleave on one thread, which is
//! why the shared state is `Rc`/`RefCell` rather than anything `Sync`.
//!
//! ```text
//! EventLoop::run
//!  |-- immediate.run_pending()           // macrotasks posted so far
//!  |-- if refresh due: host.run_frame()  // every frame callback requested
//!  |                                     // before this refresh, FIFO
//!  `-- nothing pending? spin_sleep until the next refresh
//! ```
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::clock::{Clock, RateMeter, SystemClock};
use crate::config::env_parse;
use crate::immediate::Immediate;

pub const REFRESH_ENV_VAR: &str = "CHIP8_PACER_REFRESH_HZ";

/// Snapshot handed to every frame callback of one refresh.
#[derive(Debug, Copy, Clone)]
pub struct FrameTime {
    /// monotonic timestamp of the refresh
    pub now: Instant,

    /// time since the previous refresh; zero on the first
    pub dt: Duration,

    pub frame_index: u64,

    /// achieved refresh rate, once a measurement window has closed
    pub refresh_hz: Option<f64>,
}

pub type FrameCallback = Box<dyn FnOnce(FrameTime) -> Result<()>>;

type RecurringTask = Rc<RefCell<dyn FnMut(FrameTime) -> Result<()>>>;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// how often the loop offers a refresh
    pub refresh_rate_hz: f64,

    /// window over which the achieved refresh rate is measured
    pub report_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            refresh_rate_hz: 60.0,
            report_interval: Duration::from_secs(1),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        let mut config = HostConfig::default();
        if let Some(hz) = env_parse::<f64>(REFRESH_ENV_VAR) {
            if hz.is_finite() && hz > 0.0 {
                config.refresh_rate_hz = hz;
            } else {
                log::warn!("ignoring {}={}: must be positive", REFRESH_ENV_VAR, hz);
            }
        }
        config
    }

    /// anything below 1Hz (or not a number) is treated as 1Hz
    pub fn refresh_period(&self) -> Duration {
        let hz = if self.refresh_rate_hz.is_finite() {
            self.refresh_rate_hz.max(1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(1.0 / hz)
    }
}

struct HostInner {
    frames: RefCell<Vec<FrameCallback>>,
    immediate: Immediate,
    stopped: Cell<bool>,
    frame_index: Cell<u64>,
    last_frame: Cell<Option<Instant>>,
    meter: RefCell<RateMeter>,
    failures: Cell<u64>,
}

/// Handle onto the host's queues. Cheap to clone; every clone is the same host.
///
/// Recurring tasks only hold the host weakly. A one-off or recurring callback
/// which itself captures a `Host` clone keeps the host alive until `stop`
/// drops the queued callbacks.
#[derive(Clone)]
pub struct Host {
    inner: Rc<HostInner>,
}

impl Host {
    pub fn new() -> Self {
        Self::with_report_interval(HostConfig::default().report_interval)
    }

    pub fn with_report_interval(report_interval: Duration) -> Self {
        Host {
            inner: Rc::new(HostInner {
                frames: RefCell::new(Vec::new()),
                immediate: Immediate::new(),
                stopped: Cell::new(false),
                frame_index: Cell::new(0),
                last_frame: Cell::new(None),
                meter: RefCell::new(RateMeter::new(report_interval)),
                failures: Cell::new(0),
            }),
        }
    }

    /// run `callback` once, at the next refresh
    pub fn request_frame(&self, callback: impl FnOnce(FrameTime) -> Result<()> + 'static) {
        self.inner.frames.borrow_mut().push(Box::new(callback));
    }

    /// Run `task` every refresh until the host stops.
    ///
    /// The next refresh is requested by a guard which is dropped after the
    /// task returns, so a task that errors, or panics, keeps its cadence.
    pub fn request_recurring(&self, task: impl FnMut(FrameTime) -> Result<()> + 'static) {
        let task: RecurringTask = Rc::new(RefCell::new(task));
        self.request_recurring_shared(task);
    }

    fn request_recurring_shared(&self, task: RecurringTask) {
        // weak, so a queued turn never keeps its own host alive
        let host = Rc::downgrade(&self.inner);
        self.request_frame(move |frame| {
            let host = match host.upgrade() {
                Some(inner) => Host { inner },
                None => return Ok(()),
            };
            let _next = Rerequest {
                host,
                task: Rc::clone(&task),
            };
            let mut body = task
                .try_borrow_mut()
                .map_err(|_| anyhow!("recurring frame task re-entered"))?;
            let result = (&mut *body)(frame);
            result
        });
    }

    pub fn immediate(&self) -> &Immediate {
        &self.inner.immediate
    }

    /// Ends every recurring chain and drops any frame callbacks still
    /// waiting; `EventLoop::run` returns after the current iteration.
    pub fn stop(&self) {
        if !self.inner.stopped.replace(true) {
            log::info!("host stopping after {} frames", self.inner.frame_index.get());
        }
        // taken out first: dropping a callback may release the last handle
        // to something which touches the host on drop
        let abandoned = std::mem::take(&mut *self.inner.frames.borrow_mut());
        drop(abandoned);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// frame callbacks waiting for the next refresh
    pub fn pending_frames(&self) -> usize {
        self.inner.frames.borrow().len()
    }

    /// number of frame callbacks which have returned an error so far
    pub fn failures(&self) -> u64 {
        self.inner.failures.get()
    }

    pub fn frame_index(&self) -> u64 {
        self.inner.frame_index.get()
    }

    /// last measured refresh rate
    pub fn refresh_hz(&self) -> Option<f64> {
        self.inner.meter.borrow().rate()
    }

    /// one macrotask turn
    pub fn run_macrotasks(&self) -> usize {
        self.inner.immediate.run_pending()
    }

    /// Deliver one refresh at `now`: every callback requested before this
    /// call runs, in request order. Callbacks requested while it runs wait for
    /// the next refresh. Errors are reported here and go no further.
    pub fn run_frame(&self, now: Instant) -> usize {
        let batch = std::mem::take(&mut *self.inner.frames.borrow_mut());

        let index = self.inner.frame_index.get();
        self.inner.frame_index.set(index.wrapping_add(1));
        let dt = self
            .inner
            .last_frame
            .replace(Some(now))
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        if let Some(hz) = self.inner.meter.borrow_mut().tick(now) {
            log::debug!("refresh rate {:.1}Hz", hz);
        }
        let frame = FrameTime {
            now,
            dt,
            frame_index: index,
            refresh_hz: self.refresh_hz(),
        };

        let count = batch.len();
        for callback in batch {
            if let Err(err) = callback(frame) {
                self.inner.failures.set(self.inner.failures.get() + 1);
                log::error!("frame {} callback failed: {:#}", index, err);
            }
        }
        count
    }

    /// nothing queued anywhere; the loop has nothing left to do
    pub fn is_idle(&self) -> bool {
        self.pending_frames() == 0 && !self.inner.immediate.has_pending()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("pending_frames", &self.pending_frames())
            .field("immediate", &self.inner.immediate)
            .field("frame_index", &self.frame_index())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// requests the next run of a recurring task when dropped
struct Rerequest {
    host: Host,
    task: RecurringTask,
}

impl Drop for Rerequest {
    fn drop(&mut self) {
        if !self.host.is_stopped() {
            self.host.request_recurring_shared(Rc::clone(&self.task));
        }
    }
}

/// Drives a `Host` in real time, offering a refresh every
/// `HostConfig::refresh_period` and sleeping in between.
pub struct EventLoop<C = SystemClock> {
    host: Host,
    period: Duration,
    clock: C,
}

impl EventLoop {
    pub fn new(host: Host, config: &HostConfig) -> Self {
        EventLoop {
            host,
            period: config.refresh_period(),
            clock: SystemClock,
        }
    }
}

impl<C: Clock> EventLoop<C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> EventLoop<C2> {
        EventLoop {
            host: self.host,
            period: self.period,
            clock,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// One loop iteration at the clock's current time. Returns the next
    /// refresh deadline, or `None` if the loop should finish.
    pub fn turn(&mut self, next_refresh: Instant) -> Option<Instant> {
        self.host.run_macrotasks();
        let mut next = next_refresh;
        let now = self.clock.now();
        if now >= next {
            self.host.run_frame(now);
            next += self.period;
            if next <= now {
                // missed refreshes are dropped, not replayed
                next = now + self.period;
            }
        }
        if self.host.is_stopped() || self.host.is_idle() {
            None
        } else {
            Some(next)
        }
    }

    /// Run until the host is stopped or nothing is queued.
    pub fn run(&mut self) -> Result<()> {
        log::info!("event loop running, refresh every {:?}", self.period);
        let mut next = self.clock.now();
        while let Some(deadline) = self.turn(next) {
            next = deadline;
            if !self.host.immediate().has_pending() {
                let now = self.clock.now();
                if deadline > now {
                    spin_sleep::sleep(deadline - now);
                }
            }
        }
        log::info!(
            "event loop finished after {} frames, {} failed callbacks",
            self.host.frame_index(),
            self.host.failures()
        );
        Ok(())
    }
}
