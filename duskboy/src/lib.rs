//! duskboy is a cycle accurate Gameboy (DMG) and Gameboy Color (CGB) emulator core.
//!
//! Everything is driven from a single master clock. The CPU executes an instruction, the time it took is handed to the
//! scheduler, and whichever devices have something due (a PPU mode change, a timer tick, an audio sample) get to run.
//! The `GameBoy` type wraps that up into the handful of operations a frontend needs: load a ROM, run a frame, grab
//! the screen and audio, push input, save/restore state.

pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod dma;
pub mod error;
pub mod gameboy;
pub mod hardware;
pub mod interrupt;
pub mod joypad;
pub mod ppu;
pub mod rom;
pub mod savestate;
pub mod scheduler;
pub mod serial;
pub mod timer;
pub mod util;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use gameboy::{FrameResult, GameBoy};
pub use joypad::Button;
pub use ppu::{SCREEN_HEIGHT, SCREEN_WIDTH};

/// There are different models of the Gameboy that each behave slightly differently (extra registers, double speed,
/// colour). The model is chosen when the emulation context is created and can't change afterwards.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Model {
    Dmg,
    Cgb,
}

impl Default for Model {
    fn default() -> Model {
        Model::Dmg
    }
}

/// This trait can be implemented to get notified when interesting things occur inside the emulator. Used to implement
/// debuggers and tracing tools.
pub trait Debugger {
    /// Called before each instruction step is run. If this method returns false the instruction is not run, and
    /// `run_frame` returns early with `FrameResult::Breakpoint`.
    fn before_instruction(&mut self, _pc: u16) -> bool {
        true
    }

    /// Called when the CPU reads from a memory address.
    fn on_memory_read(&mut self, _addr: u16, _v: u8) {}

    /// Called when the CPU writes to a memory address, before the write lands.
    fn on_memory_write(&mut self, _addr: u16, _v: u8) {}
}

/// Receives the audio produced by each frame, as interleaved stereo 16-bit little-endian samples.
pub trait AudioSink {
    fn write_samples(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

impl<W: std::io::Write> AudioSink for W {
    fn write_samples(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes)
    }
}
