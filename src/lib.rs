//!
//! ## Design
//!
//! * pace a fixed-rate emulation loop against an unreliable refresh
//! * simulation speed is "cycles per frame", independent of refresh rate
//! * rendering is capped separately, by a debouncer following the frame time
//! * zero-delay deferral through a real task queue, not a timer
//! * one thread; callbacks interleave, nothing runs in parallel
//! * abstract emulator and display so either can be swapped; the emulator
//!   here is only a collaborator, never implemented by this crate
//!
//! Model
//!
//! Host (event loop)
//!  |-- frame requests      request_frame / request_recurring
//!  |-- macrotask queue     Immediate: register / schedule / cancel
//!  `-- run loop            spin_sleep between refreshes
//!
//! PaceControl (cycles per frame, frame time, running)
//!  `-- observed by the loop driver
//!
//! LoopDriver (recurring frame task)
//!  |   // the next turn is requested by a guard, so a failing turn never
//!  |   // breaks the cadence
//!  |-- paused? do nothing this turn
//!  |-- emulator.advance_cycle() x cycles_per_frame
//!  `-- Debouncer(render) -> emulator.render_frame() -> display.draw()
pub mod clock;
pub mod config;
pub mod debounce;
pub mod demo;
pub mod display;
pub mod driver;
pub mod host;
pub mod immediate;
pub mod input;
pub mod logging;
