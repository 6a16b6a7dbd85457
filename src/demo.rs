//! Stand-in emulator for the terminal demo: a 64x32 test card which scrolls
//! one pixel to the right every `cycles_per_shift` cycles, so the effect of
//! cycles per frame and the render cap is visible on screen.
use anyhow::Result;

use crate::driver::Emulator;

pub const WIDTH: usize = 64;
pub const HEIGHT: usize = 32;
pub const FRAME_BYTES: usize = WIDTH * HEIGHT / 8;

pub const DEFAULT_CYCLES_PER_SHIFT: u64 = 20;

pub struct TestCard {
    frame: [u8; FRAME_BYTES],
    cycles: u64,
    cycles_per_shift: u64,
}

impl TestCard {
    pub fn new(cycles_per_shift: u64) -> Self {
        let mut card = TestCard {
            frame: [0; FRAME_BYTES],
            cycles: 0,
            cycles_per_shift: cycles_per_shift.max(1),
        };
        card.paint();
        card
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        let (byte, bit) = locate(x, y);
        (self.frame[byte] >> bit) & 1 == 1
    }

    fn set_pixel(&mut self, x: usize, y: usize) {
        let (byte, bit) = locate(x, y);
        self.frame[byte] |= 1 << bit;
    }

    fn paint(&mut self) {
        for x in 0..WIDTH {
            self.set_pixel(x, 0);
            self.set_pixel(x, HEIGHT - 1);
        }
        // checker block in the middle
        for y in 8..24 {
            for x in 16..48 {
                if (x + y) % 2 == 0 {
                    self.set_pixel(x, y);
                }
            }
        }
        // diagonal, so the scroll direction is obvious
        for i in 2..HEIGHT - 2 {
            self.set_pixel(i * 2, i);
        }
    }

    /// rotate every row between the top and bottom borders right by one pixel
    fn shift(&mut self) {
        for y in 1..HEIGHT - 1 {
            let row = &mut self.frame[y * WIDTH / 8..(y + 1) * WIDTH / 8];
            let mut bits = [0u8; 8];
            bits.copy_from_slice(row);
            let rotated = u64::from_be_bytes(bits).rotate_right(1);
            row.copy_from_slice(&rotated.to_be_bytes());
        }
    }
}

impl Default for TestCard {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLES_PER_SHIFT)
    }
}

impl Emulator for TestCard {
    fn advance_cycle(&mut self) -> Result<()> {
        self.cycles += 1;
        if self.cycles % self.cycles_per_shift == 0 {
            self.shift();
        }
        Ok(())
    }

    fn render_frame(&mut self) -> Result<&[u8]> {
        Ok(&self.frame)
    }
}

// byte offset and bit within it; msb is the leftmost pixel
fn locate(x: usize, y: usize) -> (usize, usize) {
    (y * WIDTH / 8 + x / 8, 7 - x % 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_matches_display() {
        let mut card = TestCard::default();
        assert_eq!(card.render_frame().unwrap().len(), FRAME_BYTES);
        assert_eq!(FRAME_BYTES, 256);
    }

    #[test]
    fn test_card_pattern() {
        let card = TestCard::default();
        assert!(card.pixel(0, 0));
        assert!(card.pixel(63, 31));
        assert!(card.pixel(16, 8));
        assert!(!card.pixel(17, 8));
        assert!(card.pixel(4, 2));
    }

    #[test]
    fn test_scrolls_every_n_cycles() {
        let mut card = TestCard::new(3);
        assert!(card.pixel(4, 2));
        card.advance_cycle().unwrap();
        card.advance_cycle().unwrap();
        assert!(card.pixel(4, 2));
        card.advance_cycle().unwrap();
        assert!(!card.pixel(4, 2));
        assert!(card.pixel(5, 2));
        // borders stay put
        assert!(card.pixel(0, 0));
        assert_eq!(card.cycles(), 3);
    }

    #[test]
    fn test_rows_wrap_around() {
        let mut card = TestCard::new(1);
        // diagonal pixel on row 31 - 2 = 29 sits at x = 58
        for _ in 0..6 {
            card.advance_cycle().unwrap();
        }
        assert!(card.pixel(0, 29));
    }
}
