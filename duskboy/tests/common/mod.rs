#![allow(dead_code)]

use duskboy::{GameBoy, Model};
use lazy_static::lazy_static;

/// Program entrypoint for every ROM built here. The header jumps to it.
pub const ENTRY: usize = 0x150;

/// Builds small ROM images in memory: a valid header plus some hand assembled code.
pub struct RomBuilder {
    data: Vec<u8>,
}

impl RomBuilder {
    /// `rom_size` and `ram_size` are the header codes (0x148 and 0x149).
    pub fn new(cart_type: u8, rom_size: u8, ram_size: u8) -> RomBuilder {
        let mut data = vec![0; 0x8000 << rom_size];
        data[0x100..0x104].copy_from_slice(&[0x00, 0xC3, ENTRY as u8, (ENTRY >> 8) as u8]); // NOP; JP ENTRY
        data[0x134..0x13C].copy_from_slice(b"DUSKTEST");
        data[0x147] = cart_type;
        data[0x148] = rom_size;
        data[0x149] = ram_size;
        RomBuilder { data }
    }

    pub fn rom_only() -> RomBuilder {
        RomBuilder::new(0x00, 0x00, 0x00)
    }

    pub fn cgb(mut self) -> RomBuilder {
        self.data[0x143] = 0x80;
        self
    }

    /// Places bytes at an absolute ROM offset.
    pub fn at(mut self, offset: usize, bytes: &[u8]) -> RomBuilder {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn program(self, bytes: &[u8]) -> RomBuilder {
        self.at(ENTRY, bytes)
    }

    pub fn build(mut self) -> Vec<u8> {
        self.data[0x14D] = self.data[0x134..=0x14C]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_sub(*b).wrapping_sub(1));
        self.data
    }
}

#[rustfmt::skip]
lazy_static! {
    /// Enables the VBlank interrupt and HALTs forever. The handler counts VBlanks in HRAM at $FF80.
    pub static ref IDLE_ROM: Vec<u8> = RomBuilder::rom_only()
        .at(0x40, &[
            0xF5,             // PUSH AF
            0xF0, 0x80,       // LDH A,($80)
            0x3C,             // INC A
            0xE0, 0x80,       // LDH ($80),A
            0xF1,             // POP AF
            0xD9,             // RETI
        ])
        .program(&[
            0x3E, 0x01,       // LD A,$01
            0xE0, 0xFF,       // LDH ($FF),A
            0xFB,             // EI
            0x76,             // HALT
            0x18, 0xFD,       // JR -3
        ])
        .build();

    /// Scribbles a running counter over the tile data, so the picture changes every frame. The VBlank handler copies
    /// the joypad direction lines into SCX and counts frames at $FF80.
    pub static ref BUSY_ROM: Vec<u8> = RomBuilder::rom_only()
        .at(0x40, &[
            0xF5,             // PUSH AF
            0x3E, 0x20,       // LD A,$20
            0xE0, 0x00,       // LDH ($00),A
            0xF0, 0x00,       // LDH A,($00)
            0xE0, 0x43,       // LDH ($43),A
            0xF0, 0x80,       // LDH A,($80)
            0x3C,             // INC A
            0xE0, 0x80,       // LDH ($80),A
            0xF1,             // POP AF
            0xD9,             // RETI
        ])
        .program(&[
            0x21, 0x00, 0x80, // LD HL,$8000
            0x3E, 0x01,       // LD A,$01
            0xE0, 0xFF,       // LDH ($FF),A
            0xFB,             // EI
            0x0C,             // INC C
            0x79,             // LD A,C
            0x22,             // LD (HL+),A
            0x7C,             // LD A,H
            0xFE, 0x98,       // CP $98
            0x20, 0xF8,       // JR NZ,-8
            0x21, 0x00, 0x80, // LD HL,$8000
            0x18, 0xF3,       // JR -13
        ])
        .build();
}

pub fn boot(model: Model, rom: &[u8]) -> GameBoy {
    let mut gb = GameBoy::new(model);
    gb.load_rom(rom).unwrap();
    gb
}

pub fn run_frames(gb: &mut GameBoy, frames: usize) {
    for _ in 0..frames {
        gb.run_frame().unwrap();
    }
}
