//! # loop driver
//!
//! The recurring task bound to the host's refresh. Each turn:
//!
//! ```text
//! turn
//!  |-- (guard) request the next turn        // runs even if this one fails
//!  |-- apply a pending frame-time change to the render debouncer
//!  |-- paused? -> nothing else this turn
//!  |-- emulator.advance_cycle() x cycles_per_frame
//!  `-- render debouncer: emulator.render_frame() -> display.draw()
//! ```
//!
//! Simulation speed is cycles per turn; how often the picture is actually
//! drawn is capped separately by the frame time, whatever the refresh rate.
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Result};

use crate::clock::{Clock, SystemClock};
use crate::config::{ObserverId, PaceControl};
use crate::debounce::{Activation, Debouncer};
use crate::display::Display;
use crate::host::{FrameTime, Host};
use crate::immediate::{Immediate, Tag};

/// The emulator as seen from the loop. Failures go to the host's error
/// reporting; the loop keeps its cadence either way.
pub trait Emulator {
    /// one logical emulation step
    fn advance_cycle(&mut self) -> Result<()>;

    /// current display state, in whatever format the display takes
    fn render_frame(&mut self) -> Result<&[u8]>;
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// cap rendering at the configured frame time; off draws every turn
    pub throttle_render: bool,

    /// replay missed renders after a stall
    pub render_catch_up: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            throttle_render: true,
            render_catch_up: false,
        }
    }
}

/// what one turn did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Paused,
    Ran { cycles: u32, rendered: Activation },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub turns: u64,
    pub paused_turns: u64,
    pub cycles: u64,
    pub renders: u64,
}

type RenderAction = Box<dyn FnMut() -> Result<()>>;

pub struct LoopDriver<E, C = SystemClock> {
    control: Rc<PaceControl>,
    emulator: Rc<RefCell<E>>,
    render: Debouncer<RenderAction, C>,
    throttle: bool,
    // written by the store observer, applied at the top of the next turn
    pending_frame_time: Rc<Cell<Option<f64>>>,
    refresh_hz: Rc<Cell<Option<f64>>>,
    observer: ObserverId,
    stats: DriverStats,
}

impl<E: Emulator + 'static> LoopDriver<E> {
    pub fn new(
        control: Rc<PaceControl>,
        emulator: Rc<RefCell<E>>,
        display: impl Display + 'static,
    ) -> Self {
        Self::with_clock(control, emulator, display, DriverConfig::default(), SystemClock)
    }
}

impl<E: Emulator + 'static, C: Clock + 'static> LoopDriver<E, C> {
    pub fn with_clock(
        control: Rc<PaceControl>,
        emulator: Rc<RefCell<E>>,
        mut display: impl Display + 'static,
        config: DriverConfig,
        clock: C,
    ) -> Self {
        let refresh_hz = Rc::new(Cell::new(None));
        let action: RenderAction = {
            let emulator = Rc::clone(&emulator);
            let control = Rc::clone(&control);
            let refresh_hz = Rc::clone(&refresh_hz);
            Box::new(move || {
                display.set_status(&status_line(&control, refresh_hz.get()));
                let mut emulator = emulator
                    .try_borrow_mut()
                    .map_err(|_| anyhow!("emulator busy during render"))?;
                let frame = emulator.render_frame()?;
                let expected = display.get_display_size_bytes();
                if frame.len() != expected {
                    return Err(anyhow!(
                        "emulator frame is {} bytes, display takes {}",
                        frame.len(),
                        expected
                    ));
                }
                display.draw(frame)?;
                Ok(())
            })
        };

        let mut render = Debouncer::new(action)
            .with_clock(clock)
            .with_catch_up(config.render_catch_up);
        if config.throttle_render {
            render.set_rate_per_second(control.rate().frames_per_second());
        }

        let pending_frame_time = Rc::new(Cell::new(None));
        let observer = {
            let pending = Rc::clone(&pending_frame_time);
            control.subscribe(move |rate| pending.set(Some(rate.frame_time_ms)))
        };

        LoopDriver {
            control,
            emulator,
            render,
            throttle: config.throttle_render,
            pending_frame_time,
            refresh_hz,
            observer,
            stats: DriverStats::default(),
        }
    }

    /// Hand the driver to the host as a recurring frame task. The returned
    /// handle stays usable for `register_step` and `stats`.
    pub fn start(self, host: &Host) -> Rc<RefCell<Self>> {
        let driver = Rc::new(RefCell::new(self));
        let turn = Rc::clone(&driver);
        host.request_recurring(move |frame| {
            let mut driver = turn
                .try_borrow_mut()
                .map_err(|_| anyhow!("loop driver re-entered"))?;
            driver.turn(frame).map(|_| ())
        });
        log::info!("loop driver started");
        driver
    }

    /// Register a single-step callback: one frame's worth of cycles and an
    /// unthrottled render, delivered on the next macrotask turn whether or
    /// not the loop is running.
    pub fn register_step(driver: &Rc<RefCell<Self>>, immediate: &Immediate) -> Tag {
        let weak: Weak<RefCell<Self>> = Rc::downgrade(driver);
        immediate.register(move || {
            let driver = match weak.upgrade() {
                Some(d) => d,
                None => return,
            };
            let result = match driver.try_borrow_mut() {
                Ok(mut d) => d.step(),
                Err(_) => Err(anyhow!("loop driver busy")),
            };
            if let Err(err) = result {
                log::error!("single step failed: {:#}", err);
            }
        })
    }

    /// One turn of the loop. Callers normally get here through `start`.
    pub fn turn(&mut self, frame: FrameTime) -> Result<Turn> {
        self.stats.turns += 1;
        self.refresh_hz.set(frame.refresh_hz);
        if let Some(ms) = self.pending_frame_time.take() {
            if self.throttle {
                self.render.set_rate_per_second(1000.0 / ms);
            }
        }

        if !self.control.is_running() {
            self.stats.paused_turns += 1;
            return Ok(Turn::Paused);
        }

        let cycles = self.control.cycles_per_frame();
        self.advance(cycles)?;
        let rendered = self.render.try_activate()?;
        self.stats.renders += rendered.count();
        Ok(Turn::Ran { cycles, rendered })
    }

    /// one frame's worth of work right now, ignoring the running flag and
    /// the render cap
    pub fn step(&mut self) -> Result<()> {
        let cycles = self.control.cycles_per_frame();
        self.advance(cycles)?;
        (self.render.inner_mut())()?;
        self.stats.renders += 1;
        Ok(())
    }

    fn advance(&mut self, cycles: u32) -> Result<()> {
        let mut emulator = self
            .emulator
            .try_borrow_mut()
            .map_err(|_| anyhow!("emulator busy during advance"))?;
        for _ in 0..cycles {
            emulator.advance_cycle()?;
            self.stats.cycles += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// the render debouncer's current interval, zero when uncapped
    pub fn render_interval(&self) -> std::time::Duration {
        self.render.interval()
    }
}

impl<E, C> Drop for LoopDriver<E, C> {
    fn drop(&mut self) {
        self.control.unsubscribe(self.observer);
    }
}

fn status_line(control: &PaceControl, refresh_hz: Option<f64>) -> String {
    let rate = control.rate();
    let state = if control.is_running() { "running" } else { "paused" };
    match refresh_hz {
        Some(hz) => format!(
            "{} | {} cycles/frame | {:.1}ms/frame | {:.0}Hz",
            state, rate.cycles_per_frame, rate.frame_time_ms, hz
        ),
        None => format!(
            "{} | {} cycles/frame | {:.1}ms/frame",
            state, rate.cycles_per_frame, rate.frame_time_ms
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::display::DummyDisplay;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Advance,
        Render,
    }

    struct Recorder {
        calls: Vec<Call>,
        frame: Vec<u8>,
        fail_advance_at: Option<usize>,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                calls: Vec::new(),
                frame: vec![0; 0x100],
                fail_advance_at: None,
            }
        }

        fn advances(&self) -> usize {
            self.calls.iter().filter(|c| **c == Call::Advance).count()
        }

        fn renders(&self) -> usize {
            self.calls.iter().filter(|c| **c == Call::Render).count()
        }
    }

    impl Emulator for Recorder {
        fn advance_cycle(&mut self) -> Result<()> {
            if Some(self.advances()) == self.fail_advance_at {
                self.fail_advance_at = None;
                return Err(anyhow!("illegal opcode"));
            }
            self.calls.push(Call::Advance);
            Ok(())
        }

        fn render_frame(&mut self) -> Result<&[u8]> {
            self.calls.push(Call::Render);
            Ok(&self.frame)
        }
    }

    struct Rig {
        control: Rc<PaceControl>,
        emulator: Rc<RefCell<Recorder>>,
        clock: ManualClock,
        draws: Rc<Cell<u64>>,
    }

    fn rig(config: DriverConfig) -> (Rig, LoopDriver<Recorder, ManualClock>) {
        let control = Rc::new(PaceControl::default());
        let emulator = Rc::new(RefCell::new(Recorder::new()));
        let clock = ManualClock::new();
        let display = DummyDisplay::new();
        let draws = display.draw_counter();
        let driver = LoopDriver::with_clock(
            Rc::clone(&control),
            Rc::clone(&emulator),
            display,
            config,
            clock.clone(),
        );
        (
            Rig {
                control,
                emulator,
                clock,
                draws,
            },
            driver,
        )
    }

    fn unthrottled() -> DriverConfig {
        DriverConfig {
            throttle_render: false,
            ..DriverConfig::default()
        }
    }

    fn frame(index: u64) -> FrameTime {
        FrameTime {
            now: std::time::Instant::now(),
            dt: Duration::ZERO,
            frame_index: index,
            refresh_hz: None,
        }
    }

    #[test]
    fn test_twenty_cycles_then_one_render() {
        let (rig, mut driver) = rig(unthrottled());
        let turn = driver.turn(frame(0)).unwrap();
        assert_eq!(
            turn,
            Turn::Ran {
                cycles: 20,
                rendered: Activation::Fired(1)
            }
        );
        let calls = rig.emulator.borrow().calls.clone();
        let mut expected = vec![Call::Advance; 20];
        expected.push(Call::Render);
        assert_eq!(calls, expected);
        assert_eq!(rig.draws.get(), 1);
    }

    #[test]
    fn test_paused_turns_do_no_emulation_then_resume() {
        let (rig, mut driver) = rig(unthrottled());
        rig.control.set_running(false);
        for i in 0..10 {
            assert_eq!(driver.turn(frame(i)).unwrap(), Turn::Paused);
        }
        assert_eq!(rig.emulator.borrow().advances(), 0);
        assert_eq!(rig.emulator.borrow().renders(), 0);

        rig.control.set_running(true);
        driver.turn(frame(10)).unwrap();
        assert_eq!(rig.emulator.borrow().advances(), 20);
        assert_eq!(rig.emulator.borrow().renders(), 1);
        assert_eq!(driver.stats().paused_turns, 10);
    }

    #[test]
    fn test_cycles_change_applies_next_turn() {
        let (rig, mut driver) = rig(unthrottled());
        driver.turn(frame(0)).unwrap();
        rig.control.set_cycles_per_frame(5);
        driver.turn(frame(1)).unwrap();
        assert_eq!(rig.emulator.borrow().advances(), 25);
        assert_eq!(driver.stats().cycles, 25);
    }

    #[test]
    fn test_render_capped_by_frame_time() {
        let (rig, mut driver) = rig(DriverConfig::default());
        assert_eq!(driver.render_interval(), Duration::from_millis(16));

        rig.control.set_frame_time_ms(100.0);
        let mut rendered = Vec::new();
        for i in 0..13 {
            if let Turn::Ran { rendered: r, .. } = driver.turn(frame(i)).unwrap() {
                if r.fired() {
                    rendered.push(i);
                }
            }
            rig.clock.advance_ms(20);
        }
        assert_eq!(driver.render_interval(), Duration::from_millis(100));
        // every turn advances, but the picture only moves past each 100ms
        assert_eq!(rig.emulator.borrow().advances(), 13 * 20);
        assert_eq!(rendered, vec![0, 6, 12]);
    }

    #[test]
    fn test_failing_turn_keeps_cadence() {
        let (rig, driver) = rig(unthrottled());
        rig.emulator.borrow_mut().fail_advance_at = Some(5);
        let host = Host::new();
        let driver = driver.start(&host);

        host.run_frame(rig.clock.now());
        assert_eq!(host.failures(), 1);
        assert_eq!(host.pending_frames(), 1);
        assert_eq!(rig.emulator.borrow().renders(), 0);

        host.run_frame(rig.clock.now());
        assert_eq!(host.failures(), 1);
        assert_eq!(rig.emulator.borrow().advances(), 25);
        assert_eq!(rig.emulator.borrow().renders(), 1);
        assert_eq!(driver.borrow().stats().turns, 2);
    }

    #[test]
    fn test_driver_runs_every_refresh_through_host() {
        let (rig, driver) = rig(unthrottled());
        let host = Host::new();
        let driver = driver.start(&host);
        for _ in 0..3 {
            host.run_frame(rig.clock.now());
        }
        assert_eq!(driver.borrow().stats().turns, 3);
        assert_eq!(rig.emulator.borrow().advances(), 60);
        host.stop();
        host.run_frame(rig.clock.now());
        assert_eq!(host.pending_frames(), 0);
    }

    #[test]
    fn test_step_while_paused() {
        let (rig, driver) = rig(DriverConfig::default());
        let host = Host::new();
        let driver = driver.start(&host);
        let step = LoopDriver::register_step(&driver, host.immediate());
        rig.control.set_running(false);

        host.immediate().schedule(step);
        assert_eq!(rig.emulator.borrow().advances(), 0);
        host.run_macrotasks();
        assert_eq!(rig.emulator.borrow().advances(), 20);
        assert_eq!(rig.draws.get(), 1);

        // stepping bypasses the render cap too
        host.immediate().schedule(step);
        host.run_macrotasks();
        assert_eq!(rig.draws.get(), 2);

        host.run_frame(rig.clock.now());
        assert_eq!(rig.emulator.borrow().advances(), 40);
    }

    #[test]
    fn test_step_after_driver_dropped_is_harmless() {
        let (_rig, driver) = rig(unthrottled());
        let imm = Immediate::new();
        let driver = Rc::new(RefCell::new(driver));
        let step = LoopDriver::register_step(&driver, &imm);
        drop(driver);
        imm.schedule(step);
        assert_eq!(imm.run_pending(), 1);
    }

    #[test]
    fn test_frame_size_mismatch_is_an_error_not_a_draw() {
        let (rig, mut driver) = rig(unthrottled());
        rig.emulator.borrow_mut().frame = vec![0; 10];
        assert!(driver.turn(frame(0)).is_err());
        assert_eq!(rig.draws.get(), 0);
        assert!(driver.step().is_err());

        rig.emulator.borrow_mut().frame = vec![0; 0x100];
        driver.turn(frame(1)).unwrap();
        assert_eq!(rig.draws.get(), 1);
    }

    #[test]
    fn test_frame_time_clamped_by_earlier_observer() {
        let control = Rc::new(PaceControl::default());
        let weak = Rc::downgrade(&control);
        control.subscribe(move |r| {
            if r.frame_time_ms > 50.0 {
                if let Some(c) = weak.upgrade() {
                    c.set_frame_time_ms(50.0);
                }
            }
        });
        let mut driver = LoopDriver::with_clock(
            Rc::clone(&control),
            Rc::new(RefCell::new(Recorder::new())),
            DummyDisplay::new(),
            DriverConfig::default(),
            ManualClock::new(),
        );

        control.set_frame_time_ms(200.0);
        driver.turn(frame(0)).unwrap();
        assert_eq!(control.frame_time_ms(), 50.0);
        assert_eq!(driver.render_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let (rig, driver) = rig(DriverConfig::default());
        assert_eq!(rig.control.observer_count(), 1);
        drop(driver);
        assert_eq!(rig.control.observer_count(), 0);
    }

    #[test]
    fn test_status_line_reflects_controls() {
        let (rig, mut driver) = rig(unthrottled());
        let display = DummyDisplay::new();
        let status = display.clone();
        let mut d2 = LoopDriver::with_clock(
            Rc::clone(&rig.control),
            Rc::clone(&rig.emulator),
            display,
            unthrottled(),
            rig.clock.clone(),
        );
        rig.control.set_cycles_per_frame(7);
        d2.turn(frame(0)).unwrap();
        assert!(status.status().starts_with("running | 7 cycles/frame"));
        driver.turn(frame(0)).unwrap();
    }
}
