use crossterm::event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::config::PaceControl;
use crate::host::Host;
use crate::immediate::Tag;

/// frame time nudge for `[` and `]`, in ms
pub const FRAME_TIME_STEP_MS: f64 = 2.0;

/// External controls the keyboard can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleRunning,
    /// run one frame now, even when paused
    Step,
    MoreCycles,
    FewerCycles,
    LongerFrame,
    ShorterFrame,
    Quit,
}

/// map of keys to the controls they drive
const CONTROL_KEYMAP: [(char, Command); 8] = [
    (' ', Command::ToggleRunning),
    ('n', Command::Step),
    ('+', Command::MoreCycles),
    ('=', Command::MoreCycles),
    ('-', Command::FewerCycles),
    (']', Command::LongerFrame),
    ('[', Command::ShorterFrame),
    ('q', Command::Quit),
];

/// reads control commands
pub trait Input {
    /// get all the commands issued recently, without flushing them from the
    /// buffer
    fn peek_commands(&mut self) -> Result<&[Command], io::Error>;

    /// flush all the commands from the buffer
    fn flush_commands(&mut self) -> Result<(), io::Error>;
}

/// Keyboard input through crossterm. Expects the terminal to be in raw mode
/// already (`MonoTermDisplay` sees to that), so never blocks.
pub struct TermInput {
    buffer: Vec<Command>,
    keymap: HashMap<char, Command>,
}

impl TermInput {
    pub fn new() -> Self {
        TermInput {
            buffer: Vec::new(),
            keymap: HashMap::from(CONTROL_KEYMAP),
        }
    }

    fn map_key(&self, evt: KeyEvent) -> Option<Command> {
        match evt.code {
            KeyCode::Char('c') if evt.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(Command::Quit)
            }
            KeyCode::Char(key) => self.keymap.get(&key).copied(),
            KeyCode::Esc => Some(Command::Quit),
            _ => None,
        }
    }

    fn read_events(&mut self) -> Result<(), io::Error> {
        while poll(Duration::from_millis(0))? {
            match read()? {
                Event::Key(evt) => match self.map_key(evt) {
                    Some(cmd) => self.buffer.push(cmd),
                    None => log::debug!("unmapped key {:?}", evt.code),
                },
                other => log::trace!("ignoring terminal event {:?}", other),
            }
        }
        Ok(())
    }
}

impl Default for TermInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for TermInput {
    fn peek_commands(&mut self) -> Result<&[Command], io::Error> {
        self.read_events()?;
        Ok(self.buffer.as_slice())
    }

    fn flush_commands(&mut self) -> Result<(), io::Error> {
        self.read_events()?;
        self.buffer.clear();
        Ok(())
    }
}

/// dummy Input implementation for testing
pub struct DummyInput {
    commands: Vec<Command>,
}

impl DummyInput {
    pub fn new(commands: &[Command]) -> Self {
        DummyInput {
            commands: Vec::from(commands),
        }
    }
}

impl Input for DummyInput {
    fn peek_commands(&mut self) -> Result<&[Command], io::Error> {
        Ok(self.commands.as_slice())
    }

    fn flush_commands(&mut self) -> Result<(), io::Error> {
        self.commands.clear();
        Ok(())
    }
}

/// Applies commands to the pacing state.
pub struct Controller {
    control: Rc<PaceControl>,
    host: Host,
    step: Option<Tag>,
}

impl Controller {
    pub fn new(control: Rc<PaceControl>, host: Host) -> Self {
        Controller {
            control,
            host,
            step: None,
        }
    }

    /// immediate tag to schedule for `Command::Step`
    pub fn with_step(mut self, tag: Tag) -> Self {
        self.step = Some(tag);
        self
    }

    pub fn apply(&self, command: Command) {
        log::debug!("command {:?}", command);
        match command {
            Command::ToggleRunning => {
                self.control.toggle_running();
            }
            Command::Step => match self.step {
                Some(tag) => self.host.immediate().schedule(tag),
                None => log::debug!("no step handler registered"),
            },
            Command::MoreCycles => {
                let cycles = self.control.cycles_per_frame();
                self.control.set_cycles_per_frame(cycles.saturating_mul(2));
            }
            Command::FewerCycles => {
                let cycles = self.control.cycles_per_frame();
                self.control.set_cycles_per_frame((cycles / 2).max(1));
            }
            Command::LongerFrame => {
                let ms = self.control.frame_time_ms();
                self.control.set_frame_time_ms(ms + FRAME_TIME_STEP_MS);
            }
            Command::ShorterFrame => {
                let ms = self.control.frame_time_ms();
                self.control.set_frame_time_ms(ms - FRAME_TIME_STEP_MS);
            }
            Command::Quit => self.host.stop(),
        }
    }

    /// drain `input` and apply everything it has
    pub fn pump(&self, input: &mut impl Input) -> Result<usize, io::Error> {
        let commands = input.peek_commands()?.to_vec();
        input.flush_commands()?;
        for command in &commands {
            self.apply(*command);
        }
        Ok(commands.len())
    }
}
