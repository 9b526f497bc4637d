//! The main entrypoint into duskboy. A `GameBoy` is an emulation session for one console: it owns the CPU and the rest
//! of the hardware, and drives them a frame at a time.

use crate::cartridge::Cartridge;
use crate::cpu::{self, Cpu};
use crate::error::{Error, Result};
use crate::hardware::Hardware;
use crate::interrupt::Interrupt;
use crate::joypad::Button;
use crate::rom::{CgbMode, RomHeader};
use crate::savestate;
use crate::{AudioSink, Debugger, Model};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

/// Master clock cycles in a full frame (154 lines of 456 dots).
pub const FRAME_DOTS: u64 = 70224;

const DMG_BOOTROM_LEN: usize = 0x100;
const CGB_BOOTROM_LEN: usize = 0x800;
const CGB_BOOTROM_PADDED_LEN: usize = 0x900;

/// How a call to `run_frame` ended.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameResult {
    /// The PPU finished a frame (or a frame's worth of time passed with the LCD off).
    Completed,
    /// The debugger asked to stop before the instruction at PC.
    Breakpoint,
}

pub struct GameBoy {
    pub cpu: Cpu,
    pub hw: Hardware,
    title: String,
    audio_sink: Option<Box<dyn AudioSink>>,
    audio_bytes: Vec<u8>,
}

impl GameBoy {
    pub fn new(model: Model) -> GameBoy {
        GameBoy {
            cpu: Cpu::new(),
            hw: Hardware::new(model),
            title: String::new(),
            audio_sink: None,
            audio_bytes: Vec::new(),
        }
    }

    pub fn model(&self) -> Model {
        self.hw.model
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Inserts a cartridge and powers the console on. If a boot ROM has been loaded it runs, otherwise the console
    /// starts directly at the cartridge entrypoint. A ROM that can't be loaded leaves the current session alone.
    pub fn load_rom(&mut self, rom: &[u8]) -> Result<()> {
        let header = RomHeader::parse(rom)?;
        info!(
            "loaded \"{}\": {:?}, {} KiB ROM, {} KiB RAM, battery: {}, CGB: {:?}",
            header.title,
            header.cart_type,
            header.rom_size / 1024,
            header.ram_size / 1024,
            header.has_battery,
            header.cgb_mode
        );
        if header.cgb_mode == CgbMode::CgbOnly && self.model() == Model::Dmg {
            warn!("\"{}\" requires a Gameboy Color", header.title);
        }

        let cart = Cartridge::from_rom(&header, rom);
        self.hw.insert_cartridge(cart, header.cgb_mode != CgbMode::None);
        self.title = header.title;
        let skip = !self.hw.has_bootrom();
        self.reset(skip);
        Ok(())
    }

    /// Installs a boot ROM image, used by subsequent resets. The CGB image can be given either without the 256 byte
    /// hole where the cartridge header shows through, or with it.
    pub fn load_bootrom(&mut self, data: &[u8]) -> Result<()> {
        let image = match (self.model(), data.len()) {
            (Model::Dmg, DMG_BOOTROM_LEN) | (Model::Cgb, CGB_BOOTROM_PADDED_LEN) => data.to_vec(),
            (Model::Cgb, CGB_BOOTROM_LEN) => {
                let mut image = Vec::with_capacity(CGB_BOOTROM_PADDED_LEN);
                image.extend_from_slice(&data[..0x100]);
                image.resize(0x200, 0);
                image.extend_from_slice(&data[0x100..]);
                image
            }
            (_, len) => return Err(Error::InvalidBootRom(len)),
        };
        self.hw.set_bootrom(image);
        Ok(())
    }

    /// Power cycles the console. The cartridge and its RAM stay put.
    pub fn reset(&mut self, skip_bootrom: bool) {
        let mut skip = skip_bootrom;
        if !skip && !self.hw.has_bootrom() {
            warn!("no boot ROM loaded, skipping straight to the cartridge");
            skip = true;
        }

        self.hw.reset(skip);
        if skip {
            self.cpu.skip_bootrom(self.model());
        } else {
            self.cpu = Cpu::new();
        }
        info!("reset {:?}, boot ROM: {}", self.model(), !skip);
    }

    /// Runs until the PPU completes a frame. If the LCD is off, a frame's worth of time is run instead.
    pub fn run_frame(&mut self) -> Result<FrameResult> {
        if !self.hw.has_cartridge() {
            return Err(Error::NoCartridge);
        }

        self.hw.apu.samples.clear();
        let frame = self.hw.ppu.frame;
        let deadline = self.hw.sched.now() + FRAME_DOTS;
        let mut result = FrameResult::Completed;

        while self.hw.ppu.frame == frame && self.hw.sched.now() < deadline {
            if let Some(debugger) = self.hw.debugger.as_mut() {
                if !debugger.before_instruction(self.cpu.pc) {
                    result = FrameResult::Breakpoint;
                    break;
                }
            }
            self.step()?;
        }

        self.flush_audio()?;
        Ok(result)
    }

    /// Runs a single CPU step (an instruction, an interrupt dispatch, or a stretch of HALT) and everything that falls
    /// due during it. Returns the master clock cycles that passed.
    pub fn step(&mut self) -> Result<u64> {
        if log::log_enabled!(log::Level::Trace) && !self.cpu.halted {
            self.trace_instruction();
        }

        let mcycle = self.hw.mcycle_dots();
        let cycles = self.cpu.step(&mut self.hw)?;
        let mut dots = if cycles == 0 {
            // Halted. Skip ahead to whatever happens next, in whole machine cycles.
            let idle = self.hw.sched.until_next_event().max(1);
            (idle + mcycle - 1) / mcycle * mcycle
        } else {
            u64::from(cycles) * mcycle
        };
        self.hw.run_for(dots);

        // VRAM DMA holds the CPU off the bus. Events keep firing meanwhile, which can queue up more HDMA blocks.
        while self.hw.stall > 0 {
            let stall = std::mem::replace(&mut self.hw.stall, 0);
            self.hw.run_for(stall);
            dots += stall;
        }
        Ok(dots)
    }

    fn trace_instruction(&mut self) {
        let mut pc = self.cpu.pc;
        let hw = &mut self.hw;
        let instruction = cpu::decode_instruction(|| {
            let v = hw.bus_read(pc);
            pc = pc.wrapping_add(1);
            v
        });
        log::trace!("${:04x}: {}", self.cpu.pc, instruction);
    }

    fn flush_audio(&mut self) -> Result<()> {
        let sink = match self.audio_sink.as_mut() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        let samples = &self.hw.apu.samples;
        if samples.is_empty() {
            return Ok(());
        }

        self.audio_bytes.resize(samples.len() * 2, 0);
        LittleEndian::write_i16_into(samples, &mut self.audio_bytes);
        sink.write_samples(&self.audio_bytes)?;
        Ok(())
    }

    /// The current frame as RGBA8888, `SCREEN_WIDTH` x `SCREEN_HEIGHT`.
    pub fn screen(&self) -> &[u8] {
        &self.hw.ppu.framebuffer
    }

    pub fn frame_count(&self) -> u64 {
        self.hw.ppu.frame
    }

    pub fn set_key_input(&mut self, button: Button, pressed: bool) {
        if self.hw.joypad.set_button(button, pressed) {
            self.hw.interrupts.request(Interrupt::Joypad);
        }
    }

    /// Interleaved stereo samples produced by the last `run_frame`.
    pub fn audio_samples(&self) -> &[i16] {
        &self.hw.apu.samples
    }

    pub fn set_audio_sink(&mut self, sink: Option<Box<dyn AudioSink>>) {
        self.audio_sink = sink;
    }

    pub fn set_debugger(&mut self, debugger: Option<Box<dyn Debugger>>) {
        self.hw.debugger = debugger;
    }

    /// Bytes sent out of the serial port since the last call.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.hw.serial.output)
    }

    /// Reads memory the way the CPU would see it, without notifying the debugger.
    pub fn read(&mut self, addr: u16) -> u8 {
        self.hw.bus_read(addr)
    }

    /// Writes memory the way the CPU would, without notifying the debugger.
    pub fn write(&mut self, addr: u16, v: u8) {
        self.hw.bus_write(addr, v);
    }

    /// Battery backed cartridge RAM, if the cartridge has any.
    pub fn save_ram(&self) -> Option<&[u8]> {
        if self.hw.cart.has_battery && !self.hw.cart.ram.is_empty() {
            Some(&self.hw.cart.ram)
        } else {
            None
        }
    }

    pub fn load_save_ram(&mut self, data: &[u8]) -> Result<()> {
        self.hw.cart.load_ram(data)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        savestate::save(&self.cpu, &self.hw)
    }

    /// Restores a save state made with the same model and ROM. On error the session is left as it was.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        if !self.hw.has_cartridge() {
            return Err(Error::NoCartridge);
        }

        let (cpu, mut hw) = savestate::load(data)?;
        if hw.model != self.model() {
            warn!("save state is for a {:?}, this is a {:?}", hw.model, self.model());
            return Err(Error::SaveStateMismatch("model"));
        }
        if hw.cgb_cart != self.hw.cgb_cart || !hw.cart.same_hardware(&self.hw.cart) {
            warn!("save state doesn't match the loaded cartridge");
            return Err(Error::SaveStateMismatch("cartridge"));
        }

        hw.adopt_host_state(&mut self.hw);
        self.cpu = cpu;
        self.hw = hw;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom() -> Vec<u8> {
        let mut rom = vec![0; 0x8000];
        rom[0x134..0x138].copy_from_slice(b"TEST");
        // JR -2
        rom[0x100] = 0x18;
        rom[0x101] = 0xFE;
        rom
    }

    #[test]
    fn test_no_cartridge() {
        let mut gb = GameBoy::new(Model::Dmg);
        assert!(matches!(gb.run_frame(), Err(Error::NoCartridge)));
    }

    #[test]
    fn test_load_rom() {
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        assert_eq!(gb.title(), "TEST");
        assert_eq!(gb.cpu.pc, 0x0100);
        assert!(matches!(gb.load_rom(&[0; 0x20]), Err(Error::RomTooSmall(0x20))));
        assert_eq!(gb.title(), "TEST");
    }

    #[test]
    fn test_bootrom_sizes() {
        let mut gb = GameBoy::new(Model::Dmg);
        assert!(matches!(gb.load_bootrom(&[0; 0x800]), Err(Error::InvalidBootRom(0x800))));
        gb.load_bootrom(&[0; 0x100]).unwrap();

        let mut gb = GameBoy::new(Model::Cgb);
        assert!(matches!(gb.load_bootrom(&[0; 0x100]), Err(Error::InvalidBootRom(0x100))));
        let mut image = vec![0x11; 0x800];
        image[0x100] = 0x22;
        gb.load_bootrom(&image).unwrap();
        gb.load_rom(&rom()).unwrap();
        assert_eq!(gb.cpu.pc, 0x0000);
        assert_eq!(gb.read(0x00FF), 0x11);
        assert_eq!(gb.read(0x0100), 0x18);
        assert_eq!(gb.read(0x0200), 0x22);
    }

    #[test]
    fn test_reset_without_bootrom() {
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        gb.reset(false);
        assert_eq!(gb.cpu.pc, 0x0100);
        assert!(!gb.hw.bootrom_mapped);
    }

    #[test]
    fn test_frame_length() {
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        gb.run_frame().unwrap();
        let start = gb.hw.sched.now();
        assert_eq!(gb.run_frame().unwrap(), FrameResult::Completed);
        // A frame can overrun by up to one instruction (JR takes 12 dots).
        let elapsed = gb.hw.sched.now() - start;
        assert!(elapsed > FRAME_DOTS - 12 && elapsed < FRAME_DOTS + 12, "frame took {}", elapsed);
    }

    #[test]
    fn test_audio_sink() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Capture(Rc<RefCell<Vec<u8>>>);
        impl AudioSink for Capture {
            fn write_samples(&mut self, bytes: &[u8]) -> std::io::Result<()> {
                self.0.borrow_mut().extend_from_slice(bytes);
                Ok(())
            }
        }

        let captured = Rc::new(RefCell::new(Vec::new()));
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        gb.set_audio_sink(Some(Box::new(Capture(captured.clone()))));
        gb.run_frame().unwrap();

        let samples = gb.audio_samples().len();
        assert!(samples > 0 && samples % 2 == 0);
        assert_eq!(captured.borrow().len(), samples * 2);
        assert_eq!(LittleEndian::read_i16(&captured.borrow()[0..2]), gb.audio_samples()[0]);
    }

    #[test]
    fn test_breakpoint() {
        struct BreakAt(u16);
        impl Debugger for BreakAt {
            fn before_instruction(&mut self, pc: u16) -> bool {
                pc != self.0
            }
        }

        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        gb.set_debugger(Some(Box::new(BreakAt(0x0100))));
        assert_eq!(gb.run_frame().unwrap(), FrameResult::Breakpoint);
        assert_eq!(gb.cpu.pc, 0x0100);
        assert_eq!(gb.hw.sched.now(), 0);
    }

    #[test]
    fn test_joypad_interrupt() {
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        gb.hw.interrupts.request = 0;
        gb.write(0xFF00, 0x10); // Select buttons.
        gb.set_key_input(Button::Up, true);
        assert_eq!(gb.hw.interrupts.request, 0);
        gb.set_key_input(Button::Start, true);
        assert_eq!(gb.hw.interrupts.request, Interrupt::Joypad as u8);
        assert_eq!(gb.read(0xFF00) & 0x0F, 0x07);
    }

    #[test]
    fn test_deserialize_wrong_model() {
        let mut dmg = GameBoy::new(Model::Dmg);
        dmg.load_rom(&rom()).unwrap();
        let state = dmg.serialize().unwrap();

        let mut cgb = GameBoy::new(Model::Cgb);
        cgb.load_rom(&rom()).unwrap();
        assert!(matches!(cgb.deserialize(&state), Err(Error::SaveStateMismatch("model"))));
        assert_eq!(cgb.model(), Model::Cgb);
    }

    #[test]
    fn test_deserialize_wrong_cartridge() {
        let mut gb = GameBoy::new(Model::Dmg);
        gb.load_rom(&rom()).unwrap();
        let state = gb.serialize().unwrap();

        // MBC1+RAM+BATTERY
        let mut mbc1 = rom();
        mbc1[0x147] = 0x03;
        mbc1[0x149] = 0x02;
        let mut other = GameBoy::new(Model::Dmg);
        other.load_rom(&mbc1).unwrap();
        other.run_frame().unwrap();
        let now = other.hw.sched.now();
        assert!(matches!(other.deserialize(&state), Err(Error::SaveStateMismatch("cartridge"))));
        assert_eq!(other.hw.sched.now(), now);
        let own = other.serialize().unwrap();
        other.deserialize(&own).unwrap();

        let mut empty = GameBoy::new(Model::Dmg);
        assert!(matches!(empty.deserialize(&state), Err(Error::NoCartridge)));
    }
}
