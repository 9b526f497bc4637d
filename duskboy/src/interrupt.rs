//! Gameboy interrupt controller.
//! There's only a small handful of things that can raise an interrupt: the PPU (VBlank and the STAT line), the timer,
//! the serial port and the joypad. Each has a bit in the IF register (0xFF0F) that gets set when it's requested, and a
//! matching bit in IE (0xFFFF) that decides whether the CPU cares. Before each instruction the CPU looks for a bit
//! that's set in both. If it finds one it wakes from HALT, and if IME is set it pushes PC and jumps to the vector.

use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct InterruptController {
    pub request: u8, // 0xFF0F IF register
    pub enable: u8,  // 0xFFFF IE register
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum Interrupt {
    VBlank = 0b0_0001,
    Stat   = 0b0_0010,
    Timer  = 0b0_0100,
    Serial = 0b0_1000,
    Joypad = 0b1_0000,
}
use Interrupt::*;

impl Interrupt {
    /// Determines the appropriate memory location to jump to when servicing an interrupt.
    pub fn handler_addr(self) -> u16 {
        match self {
            VBlank => 0x40,
            Stat => 0x48,
            Timer => 0x50,
            Serial => 0x58,
            Joypad => 0x60,
        }
    }
}

impl InterruptController {
    pub fn new() -> InterruptController {
        Default::default()
    }

    /// Returns the highest priority interrupt that is both requested and enabled, if any.
    pub fn next_interrupt(&self) -> Option<Interrupt> {
        let pending = self.enable & self.request & 0x1F;
        if pending == 0 {
            return None;
        }

        // Lowest bit wins.
        Some(match pending.trailing_zeros() {
            0 => VBlank,
            1 => Stat,
            2 => Timer,
            3 => Serial,
            _ => Joypad,
        })
    }

    /// Request an interrupt.
    pub fn request(&mut self, intr: Interrupt) {
        self.request |= intr as u8;
    }

    /// Clear an interrupt request.
    pub fn clear(&mut self, intr: Interrupt) {
        self.request &= !(intr as u8);
    }

    /// Read from the 0xFF0F IF register. The top 3 bits don't exist and read back as 1.
    pub fn reg_if_read(&self) -> u8 {
        0xE0 | self.request
    }

    /// Write to the 0xFF0F IF register.
    pub fn reg_if_write(&mut self, v: u8) {
        self.request = v & 0x1F;
    }

    /// Write to the 0xFFFF IE register. All 8 bits are writable, even though only 5 of them do anything.
    pub fn reg_ie_write(&mut self, v: u8) {
        self.enable = v;
    }
}
