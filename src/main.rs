use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};

use chip8_pacer::config::{PaceControl, RateConfig};
use chip8_pacer::demo::{TestCard, HEIGHT, WIDTH};
use chip8_pacer::display::MonoTermDisplay;
use chip8_pacer::driver::LoopDriver;
use chip8_pacer::host::{EventLoop, Host, HostConfig};
use chip8_pacer::input::{Controller, TermInput};
use chip8_pacer::logging::{init_logging, LoggingConfig};

fn main() -> Result<()> {
    // initialise
    init_logging(LoggingConfig::from_env());
    let rate = RateConfig::from_env();
    let host_config = HostConfig::from_env();
    log::info!(
        "starting: {} cycles/frame, {:.2}ms/frame, refresh {}Hz",
        rate.cycles_per_frame,
        rate.frame_time_ms,
        host_config.refresh_rate_hz
    );

    let control = Rc::new(PaceControl::new(rate));
    let host = Host::with_report_interval(host_config.report_interval);
    let emulator = Rc::new(RefCell::new(TestCard::default()));
    let display = MonoTermDisplay::new(WIDTH, HEIGHT).context("failed to set up the terminal")?;

    let driver = LoopDriver::new(Rc::clone(&control), emulator, display).start(&host);
    let step = LoopDriver::register_step(&driver, host.immediate());

    let controller = Controller::new(control, host.clone()).with_step(step);
    let mut input = TermInput::new();
    host.request_recurring(move |_| {
        controller.pump(&mut input)?;
        Ok(())
    });

    EventLoop::new(host, &host_config).run()?;

    // dropping the driver hands the terminal back
    drop(driver);
    Ok(())
}
