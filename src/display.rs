use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use tui::backend::CrosstermBackend;
use tui::layout::Rect;
use tui::style::{Color, Style};
use tui::symbols::Marker;
use tui::widgets::canvas::{Canvas, Points};
use tui::widgets::{Block, Borders};
use tui::Terminal;

/// Display is where the loop driver sends each rendered frame. It should
/// abstract the implementation details, so a variety of kinds of screen would
/// work.
pub trait Display {
    /// draw a packed 1bpp frame, rows top to bottom, msb leftmost
    fn draw(&mut self, data: &[u8]) -> Result<(), io::Error>;

    /// how big the display data should be
    fn get_display_size_bytes(&self) -> usize;

    /// one line of pacing status (rate, paused, ...), shown with the next draw
    fn set_status(&mut self, _status: &str) {}
}

// width, height, bits per pixel
#[derive(Debug, Clone, Copy)]
struct Resolution(usize, usize, usize);

impl Resolution {
    fn pixel_count(&self) -> usize {
        self.0 * self.1
    }

    fn byte_count(&self) -> usize {
        self.0 * self.1 * self.2 / 8
    }

    fn x_bounds(&self) -> [f64; 2] {
        [0.0, (self.0 - 1) as f64]
    }

    fn y_bounds(&self) -> [f64; 2] {
        [-1.0 * (self.1 - 1) as f64, 0.0]
    }

    /// coordinates of every pixel whose bit equals `bitplane`
    fn bitplane_from_data<'a>(
        &self,
        data: &'a [u8],
        bitplane: u8,
    ) -> impl std::iter::Iterator<Item = (f64, f64)> + 'a {
        let mut count = self.pixel_count();
        let w = self.0;
        std::iter::from_fn(move || {
            while count > 0 {
                count -= 1;
                let bit = 1 & (data[count / 8] >> (7 - count % 8));
                if bit == bitplane {
                    return Some((
                        (count % w) as f64,        // x
                        -1.0 * (count / w) as f64, // y
                    ));
                }
            }
            None
        })
    }
}

/// monochrome display in a terminal, rendered using TUI and Crossterm
pub struct MonoTermDisplay {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
    resolution: Resolution,
    status: String,
}

impl MonoTermDisplay {
    /// takes over the terminal (raw mode, alternate screen) until dropped
    pub fn new(x: usize, y: usize) -> Result<MonoTermDisplay, io::Error> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, cursor::Hide)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;
        Ok(MonoTermDisplay {
            terminal,
            resolution: Resolution(x, y, 1),
            status: String::new(),
        })
    }
}

impl Drop for MonoTermDisplay {
    fn drop(&mut self) {
        if let Err(e) = execute!(io::stdout(), LeaveAlternateScreen, cursor::Show) {
            log::warn!("failed to restore terminal screen: {}", e);
        }
        if let Err(e) = terminal::disable_raw_mode() {
            log::warn!("failed to leave raw mode: {}", e);
        }
    }
}

impl Display for MonoTermDisplay {
    fn draw(&mut self, data: &[u8]) -> Result<(), io::Error> {
        // make sure we're given exactly the right amount of data to draw
        if data.len() != self.resolution.byte_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "MonoTermDisplay needs {} bytes per frame, got {}",
                    self.resolution.byte_count(),
                    data.len()
                ),
            ));
        }

        let res = self.resolution;
        let off: Vec<(f64, f64)> = res.bitplane_from_data(data, 0).collect();
        let on: Vec<(f64, f64)> = res.bitplane_from_data(data, 1).collect();
        let title = if self.status.is_empty() {
            "CHIP-8".to_string()
        } else {
            format!("CHIP-8 | {}", self.status)
        };

        // for now this assumes a 1:1 ratio between terminal, chip8 and the
        // internal TUI canvas
        self.terminal.draw(|f| {
            let size = Rect::new(0, 0, 2 + res.0 as u16, 2 + res.1 as u16);
            let canvas = Canvas::default()
                .block(
                    Block::default()
                        .title(title)
                        .borders(Borders::ALL)
                        .style(Style::default().bg(Color::Black)),
                )
                .x_bounds(res.x_bounds())
                .y_bounds(res.y_bounds())
                .marker(Marker::Block)
                .paint(|ctx| {
                    ctx.draw(&Points {
                        coords: &off,
                        color: Color::Black,
                    });
                    ctx.draw(&Points {
                        coords: &on,
                        color: Color::White,
                    });
                });
            f.render_widget(canvas, size);
        })?;
        Ok(())
    }

    fn get_display_size_bytes(&self) -> usize {
        self.resolution.byte_count()
    }

    fn set_status(&mut self, status: &str) {
        self.status.clear();
        self.status.push_str(status);
    }
}

/// useful for testing: counts draws and remembers the last status
#[derive(Debug, Clone, Default)]
pub struct DummyDisplay {
    draws: Rc<Cell<u64>>,
    status: Rc<RefCell<String>>,
}

impl DummyDisplay {
    pub fn new() -> DummyDisplay {
        DummyDisplay::default()
    }

    /// shared counter, still readable once the display has been handed off
    pub fn draw_counter(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.draws)
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }
}

impl Display for DummyDisplay {
    fn draw(&mut self, _data: &[u8]) -> Result<(), io::Error> {
        self.draws.set(self.draws.get() + 1);
        Ok(())
    }

    fn get_display_size_bytes(&self) -> usize {
        0x100
    }

    fn set_status(&mut self, status: &str) {
        *self.status.borrow_mut() = status.to_string();
    }
}
