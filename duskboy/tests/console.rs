mod common;

use common::*;
use duskboy::{Debugger, Error, FrameResult, GameBoy, Model};
use paste;
use std::cell::RefCell;
use std::rc::Rc;

const FRAME: u64 = 70224;

#[test]
fn no_cartridge() {
    let mut gb = GameBoy::new(Model::Cgb);
    assert!(matches!(gb.run_frame(), Err(Error::NoCartridge)));
}

// With the CPU halted between VBlanks, frames line up exactly with the PPU.
#[test]
fn frame_timing() {
    let mut gb = boot(Model::Dmg, &IDLE_ROM);
    gb.run_frame().unwrap();
    assert_eq!(gb.frame_count(), 1);
    assert_eq!(gb.hw.sched.now(), FRAME);

    let vblanks = gb.read(0xFF80);
    run_frames(&mut gb, 10);
    assert_eq!(gb.hw.sched.now(), 11 * FRAME);
    assert_eq!(gb.frame_count(), 11);
    assert_eq!(gb.read(0xFF80), vblanks + 10);

    // A new frame starts in OAM scan on line 0.
    assert_eq!(gb.read(0xFF44), 0);
    assert_eq!(gb.read(0xFF41) & 0b11, 2);
}

// With the LCD off there are no frames, but run_frame still returns after a frame's worth of time.
#[test]
fn lcd_off_frame() {
    let mut gb = boot(Model::Dmg, &IDLE_ROM);
    gb.write(0xFF40, 0x00);
    let start = gb.hw.sched.now();
    assert_eq!(gb.run_frame().unwrap(), FrameResult::Completed);
    assert_eq!(gb.frame_count(), 0);
    assert!(gb.hw.sched.now() - start >= FRAME);
    assert!(gb.screen().iter().all(|b| *b == 0xFF));
}

#[rustfmt::skip]
fn timer_rom(speed_switch: bool) -> Vec<u8> {
    let mut program = Vec::new();
    if speed_switch {
        program.extend_from_slice(&[
            0x3E, 0x01,       // LD A,$01
            0xE0, 0x4D,       // LDH ($4D),A
            0x10, 0x00,       // STOP
        ]);
    }
    program.extend_from_slice(&[
        0x3E, 0x05,           // LD A,$05
        0xE0, 0x07,           // LDH ($07),A
        0x3E, 0x04,           // LD A,$04
        0xE0, 0xFF,           // LDH ($FF),A
        0xAF,                 // XOR A
        0xE0, 0x0F,           // LDH ($0F),A
        0xFB,                 // EI
        0x76,                 // HALT
        0x18, 0xFD,           // JR -3
    ]);

    RomBuilder::rom_only()
        .cgb()
        .at(0x50, &[
            0xF5,             // PUSH AF
            0xF0, 0x80,       // LDH A,($80)
            0x3C,             // INC A
            0xE0, 0x80,       // LDH ($80),A
            0xF1,             // POP AF
            0xD9,             // RETI
        ])
        .program(&program)
        .build()
}

/// Counts timer interrupts over 10 frames, after letting the first frame settle. The counter in HRAM is only 8 bits,
/// so it's sampled every frame.
fn timer_interrupts(gb: &mut GameBoy) -> u32 {
    gb.run_frame().unwrap();
    let mut last = gb.read(0xFF80);
    let mut total = 0;
    for _ in 0..10 {
        gb.run_frame().unwrap();
        let count = gb.read(0xFF80);
        total += u32::from(count.wrapping_sub(last));
        last = count;
    }
    total
}

// TAC=5 overflows TIMA every 256 * 16 CPU clocks.
#[test]
fn timer_interrupt_rate() {
    let mut gb = boot(Model::Dmg, &timer_rom(false));
    let count = timer_interrupts(&mut gb);
    assert!(count == 171 || count == 172, "{} interrupts", count);
}

// In double speed the timer runs off the faster CPU clock, so it overflows twice as often.
#[test]
fn cgb_speed_switch() {
    let mut gb = boot(Model::Cgb, &timer_rom(true));
    let count = timer_interrupts(&mut gb);
    assert!(gb.hw.double_speed);
    assert_eq!(gb.read(0xFF4D), 0xFE);
    assert!(count == 342 || count == 343, "{} interrupts", count);
}

#[test]
#[rustfmt::skip]
fn serial_output() {
    let rom = RomBuilder::rom_only()
        .program(&[
            0x3E, b'O',       // LD A,'O'
            0xE0, 0x01,       // LDH ($01),A
            0x3E, 0x81,       // LD A,$81
            0xE0, 0x02,       // LDH ($02),A
            0xF0, 0x02,       // LDH A,($02)
            0xCB, 0x7F,       // BIT 7,A
            0x20, 0xFA,       // JR NZ,-6
            0x3E, b'K',       // LD A,'K'
            0xE0, 0x01,       // LDH ($01),A
            0x3E, 0x81,       // LD A,$81
            0xE0, 0x02,       // LDH ($02),A
            0x18, 0xFE,       // JR -2
        ])
        .build();
    let mut gb = boot(Model::Dmg, &rom);
    gb.run_frame().unwrap();
    assert_eq!(gb.take_serial_output(), b"OK");
    assert!(gb.take_serial_output().is_empty());
}

#[test]
fn bootrom_handoff() {
    // A stand-in boot ROM that just unmaps itself and slides into the cartridge entrypoint.
    let mut bootrom = vec![0; 0x100];
    bootrom[0..4].copy_from_slice(&[0x3E, 0x01, 0xE0, 0x50]); // LD A,$01; LDH ($50),A

    let rom = RomBuilder::rom_only().program(&[0x18, 0xFE]).build();
    let mut gb = GameBoy::new(Model::Dmg);
    gb.load_bootrom(&bootrom).unwrap();
    gb.load_rom(&rom).unwrap();
    assert_eq!(gb.cpu.pc, 0x0000);
    assert_eq!(gb.read(0x0000), 0x3E);

    gb.run_frame().unwrap();
    assert!(!gb.hw.bootrom_mapped);
    assert_eq!(gb.cpu.pc, 0x0150);
    assert_eq!(gb.read(0x0000), 0x00);

    gb.reset(true);
    assert_eq!(gb.cpu.pc, 0x0100);
    gb.reset(false);
    assert_eq!(gb.cpu.pc, 0x0000);
    assert!(gb.hw.bootrom_mapped);
}

#[derive(Default)]
struct Recorder {
    writes: Vec<(u16, u8)>,
}

struct SharedRecorder(Rc<RefCell<Recorder>>);

impl Debugger for SharedRecorder {
    fn on_memory_write(&mut self, addr: u16, v: u8) {
        self.0.borrow_mut().writes.push((addr, v));
    }
}

#[test]
fn debugger_sees_writes() {
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut gb = boot(Model::Dmg, &IDLE_ROM);
    gb.set_debugger(Some(Box::new(SharedRecorder(recorder.clone()))));
    gb.run_frame().unwrap();

    let writes = &recorder.borrow().writes;
    assert_eq!(writes[0], (0xFFFF, 0x01));
    assert!(writes.contains(&(0xFF80, 0x01)), "VBlank handler ran");

    // Debug view accesses don't show up.
    let seen = writes.len();
    gb.write(0xC000, 0x12);
    assert_eq!(recorder.borrow().writes.len(), seen);
}

fn run_illegal_opcode(opcode: u8) {
    let rom = RomBuilder::rom_only().program(&[0x00, opcode]).build();
    let mut gb = boot(Model::Dmg, &rom);
    match gb.run_frame() {
        Err(Error::IllegalOpcode { opcode: op, addr }) => {
            assert_eq!(op, opcode);
            assert_eq!(addr, 0x0151);
        }
        Err(err) => panic!("unexpected error: {}", err),
        Ok(_) => panic!("opcode ${:02x} executed", opcode),
    }
}

macro_rules! illegal_opcode_cases {
    ( $( $name:ident: $opcode:expr, )* ) => {
        $(
        paste::item! {
            #[test]
            fn [<illegal_opcode_ $name>] () {
                run_illegal_opcode($opcode);
            }
        }
        )*
    }
}

illegal_opcode_cases! {
    d3: 0xD3,
    db: 0xDB,
    dd: 0xDD,
    e3: 0xE3,
    e4: 0xE4,
    eb: 0xEB,
    ec: 0xEC,
    ed: 0xED,
    f4: 0xF4,
    fc: 0xFC,
    fd: 0xFD,
}
