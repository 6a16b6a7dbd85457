//! # rate configuration
//!
//! The tunables the loop driver reads every turn, plus the running flag.
//! Shared by `Rc` on the one event-loop thread; mutation goes through a
//! narrow setter API which clamps bad values instead of failing, since a
//! stalled emulator is worse than a slow one.
use std::cell::{Cell, RefCell};
use std::env;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

pub const DEFAULT_CYCLES_PER_FRAME: u32 = 20;
pub const DEFAULT_FRAME_TIME_MS: f64 = 1000.0 / 60.0;

/// smallest frame time accepted; anything at or below zero is clamped here
pub const MIN_FRAME_TIME_MS: f64 = 1.0;

pub const CYCLES_ENV_VAR: &str = "CHIP8_CYCLES_PER_FRAME";
pub const FRAME_TIME_ENV_VAR: &str = "CHIP8_FRAME_TIME_MS";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateConfig {
    pub cycles_per_frame: u32,
    pub frame_time_ms: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        RateConfig {
            cycles_per_frame: DEFAULT_CYCLES_PER_FRAME,
            frame_time_ms: DEFAULT_FRAME_TIME_MS,
        }
    }
}

impl RateConfig {
    /// defaults, overridden by `CHIP8_CYCLES_PER_FRAME` / `CHIP8_FRAME_TIME_MS`
    pub fn from_env() -> Self {
        let mut config = RateConfig::default();
        if let Some(cycles) = env_parse::<i64>(CYCLES_ENV_VAR) {
            config.cycles_per_frame = clamp_cycles(cycles);
        }
        if let Some(ms) = env_parse::<f64>(FRAME_TIME_ENV_VAR) {
            config.frame_time_ms = clamp_frame_time(ms);
        }
        config
    }

    /// target renders per second implied by the frame time
    pub fn frames_per_second(&self) -> f64 {
        1000.0 / self.frame_time_ms
    }
}

/// read and parse an environment variable; garbage is reported and ignored
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn clamp_cycles(cycles: i64) -> u32 {
    if cycles <= 0 {
        log::warn!("cycles per frame must be positive, got {}; using 1", cycles);
        1
    } else {
        cycles.min(u32::MAX as i64) as u32
    }
}

fn clamp_frame_time(ms: f64) -> f64 {
    if !ms.is_finite() || ms <= 0.0 {
        log::warn!(
            "frame time must be positive, got {}ms; using {}ms",
            ms,
            MIN_FRAME_TIME_MS
        );
        MIN_FRAME_TIME_MS
    } else {
        ms.max(MIN_FRAME_TIME_MS)
    }
}

/// handle returned by `PaceControl::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Rc<dyn Fn(&RateConfig)>;

/// The shared configuration store.
///
/// Observers run synchronously inside the setter that changed the value, in
/// subscription order. Setting a value equal to the current one notifies
/// nobody. The running flag is not observed; the driver reads it once a turn.
pub struct PaceControl {
    rate: Cell<RateConfig>,
    running: Cell<bool>,
    observers: RefCell<Vec<(ObserverId, Observer)>>,
    next_observer: Cell<u64>,
}

impl PaceControl {
    pub fn new(rate: RateConfig) -> Self {
        PaceControl {
            rate: Cell::new(RateConfig {
                cycles_per_frame: rate.cycles_per_frame.max(1),
                frame_time_ms: clamp_frame_time(rate.frame_time_ms),
            }),
            running: Cell::new(true),
            observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(0),
        }
    }

    pub fn rate(&self) -> RateConfig {
        self.rate.get()
    }

    pub fn cycles_per_frame(&self) -> u32 {
        self.rate.get().cycles_per_frame
    }

    pub fn frame_time_ms(&self) -> f64 {
        self.rate.get().frame_time_ms
    }

    /// returns the value actually stored; zero is clamped to one
    pub fn set_cycles_per_frame(&self, cycles: u32) -> u32 {
        let cycles = clamp_cycles(cycles as i64);
        let mut rate = self.rate.get();
        if rate.cycles_per_frame != cycles {
            rate.cycles_per_frame = cycles;
            self.store(rate);
        }
        cycles
    }

    /// returns the value actually stored; non-positive values are clamped
    pub fn set_frame_time_ms(&self, ms: f64) -> f64 {
        let ms = clamp_frame_time(ms);
        let mut rate = self.rate.get();
        if rate.frame_time_ms != ms {
            rate.frame_time_ms = ms;
            self.store(rate);
        }
        ms
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn set_running(&self, running: bool) {
        if self.running.replace(running) != running {
            log::info!("emulation {}", if running { "resumed" } else { "paused" });
        }
    }

    pub fn toggle_running(&self) -> bool {
        let running = !self.is_running();
        self.set_running(running);
        running
    }

    pub fn subscribe(&self, observer: impl Fn(&RateConfig) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer.get());
        self.next_observer.set(id.0 + 1);
        self.observers.borrow_mut().push((id, Rc::new(observer)));
        id
    }

    /// false if the observer was already gone
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    fn store(&self, rate: RateConfig) {
        self.rate.set(rate);
        log::debug!(
            "rate changed: {} cycles/frame, {:.2}ms/frame",
            rate.cycles_per_frame,
            rate.frame_time_ms
        );
        // snapshot so observers may subscribe or set values themselves
        let observers: Vec<Observer> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, o)| Rc::clone(o))
            .collect();
        for observer in observers {
            observer(&rate);
            if self.rate.get() != rate {
                // an observer wrote back; the nested store already told
                // everyone the newer value
                break;
            }
        }
    }
}

impl Default for PaceControl {
    fn default() -> Self {
        Self::new(RateConfig::default())
    }
}

impl fmt::Debug for PaceControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaceControl")
            .field("rate", &self.rate.get())
            .field("running", &self.running.get())
            .field("observers", &self.observers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = PaceControl::default();
        assert_eq!(c.cycles_per_frame(), 20);
        assert!((c.frame_time_ms() - 16.666_666).abs() < 1e-3);
        assert!(c.is_running());
        assert!((c.rate().frames_per_second() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_cycles_clamped_to_one() {
        let c = PaceControl::default();
        assert_eq!(c.set_cycles_per_frame(0), 1);
        assert_eq!(c.cycles_per_frame(), 1);
    }

    #[test]
    fn test_bad_frame_time_clamped() {
        let c = PaceControl::default();
        assert_eq!(c.set_frame_time_ms(-5.0), MIN_FRAME_TIME_MS);
        assert_eq!(c.set_frame_time_ms(f64::NAN), MIN_FRAME_TIME_MS);
        assert_eq!(c.set_frame_time_ms(0.25), MIN_FRAME_TIME_MS);
        assert_eq!(c.set_frame_time_ms(40.0), 40.0);
        assert_eq!(c.frame_time_ms(), 40.0);
    }

    #[test]
    fn test_new_clamps_initial_values() {
        let c = PaceControl::new(RateConfig {
            cycles_per_frame: 0,
            frame_time_ms: 0.0,
        });
        assert_eq!(c.cycles_per_frame(), 1);
        assert_eq!(c.frame_time_ms(), MIN_FRAME_TIME_MS);
    }

    #[test]
    fn test_observers_notified_synchronously_on_change_only() {
        let c = PaceControl::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        c.subscribe(move |r| s.borrow_mut().push(r.cycles_per_frame));

        c.set_cycles_per_frame(30);
        assert_eq!(*seen.borrow(), vec![30]);
        c.set_cycles_per_frame(30);
        assert_eq!(*seen.borrow(), vec![30]);
        c.set_frame_time_ms(10.0);
        assert_eq!(*seen.borrow(), vec![30, 30]);
    }

    #[test]
    fn test_unsubscribe() {
        let c = PaceControl::default();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let id = c.subscribe(move |_| h.set(h.get() + 1));
        c.set_cycles_per_frame(5);
        assert!(c.unsubscribe(id));
        assert!(!c.unsubscribe(id));
        c.set_cycles_per_frame(6);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_observer_may_write_back() {
        let c = Rc::new(PaceControl::default());
        let weak = Rc::downgrade(&c);
        c.subscribe(move |r| {
            // cap at 100 from inside the notification
            if r.cycles_per_frame > 100 {
                if let Some(c) = weak.upgrade() {
                    c.set_cycles_per_frame(100);
                }
            }
        });
        c.set_cycles_per_frame(500);
        assert_eq!(c.cycles_per_frame(), 100);
    }

    #[test]
    fn test_later_observers_never_see_overwritten_value() {
        let c = Rc::new(PaceControl::default());
        let weak = Rc::downgrade(&c);
        c.subscribe(move |r| {
            if r.frame_time_ms > 50.0 {
                if let Some(c) = weak.upgrade() {
                    c.set_frame_time_ms(50.0);
                }
            }
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        c.subscribe(move |r| s.borrow_mut().push(r.frame_time_ms));

        c.set_frame_time_ms(200.0);
        assert_eq!(c.frame_time_ms(), 50.0);
        assert_eq!(*seen.borrow(), vec![50.0]);
    }

    #[test]
    fn test_toggle_running() {
        let c = PaceControl::default();
        assert!(!c.toggle_running());
        assert!(!c.is_running());
        assert!(c.toggle_running());
        c.set_running(false);
        assert!(!c.is_running());
    }
}
