//! Hardware interface for the Gameboy. Implements the 16-bit memory bus that the CPU is connected to, and dispatches
//! scheduler events to the components that booked them.

use crate::apu::Apu;
use crate::bus::{AddressMap, High, IoPort, Region};
use crate::cartridge::Cartridge;
use crate::cpu;
use crate::dma::{OamDma, VramDma, VramDmaRequest, VRAM_DMA_BLOCK_DOTS};
use crate::interrupt::InterruptController;
use crate::joypad::Joypad;
use crate::memory_segment;
use crate::ppu::{self, Ppu};
use crate::scheduler::{EventKind, Scheduler};
use crate::serial::Serial;
use crate::timer::Timer;
use crate::{Debugger, Model};
use serde::{Deserialize, Serialize};

memory_segment! { Wram; u8; 0x8000 }
memory_segment! { Hram; u8; 0x7F }

/// Internal counter value the DMG boot ROM hands over with.
const DMG_BOOT_DIV: u16 = 0xABC8;

/// Holds all the various components of the Gameboy, aside from the CPU.
#[derive(Deserialize, Serialize)]
pub struct Hardware {
    pub model: Model,
    pub cgb_mode: bool, // CGB features are active. False on a DMG, or a CGB running a DMG cartridge.
    pub cgb_cart: bool,

    #[serde(skip)]
    map: AddressMap,

    pub sched: Scheduler,
    pub interrupts: InterruptController,
    pub timer: Timer,
    pub ppu: Ppu,
    pub apu: Apu,
    pub oam_dma: OamDma,
    pub vram_dma: VramDma,
    pub cart: Cartridge,
    pub joypad: Joypad,
    pub serial: Serial,
    pub wram: Wram, // 0xC000 - 0xDFFF, 8 banks of 0x1000 on the CGB.
    wram_bank: u8,  // 0xFF70 SVBK register
    pub hram: Hram, // 0xFF80 - 0xFFFE
    scratch: [u8; 3],

    #[serde(skip)]
    bootrom: Vec<u8>,
    pub bootrom_mapped: bool,
    key0: u8,          // 0xFF4C KEY0 register, written by the CGB boot ROM.
    key1_armed: bool,  // 0xFF4D KEY1 register bit 0
    pub double_speed: bool,

    /// Master clock cycles the CPU is held off the bus for (VRAM DMA). Paid off by the console after each step.
    pub stall: u64,

    #[serde(skip)]
    pub debugger: Option<Box<dyn Debugger>>,
}

impl Hardware {
    pub fn new(model: Model) -> Hardware {
        Hardware {
            model,
            cgb_mode: model == Model::Cgb,
            cgb_cart: false,
            map: AddressMap::new(model),
            sched: Scheduler::new(),
            interrupts: InterruptController::new(),
            timer: Timer::new(),
            ppu: Ppu::new(model),
            apu: Apu::new(),
            oam_dma: Default::default(),
            vram_dma: Default::default(),
            cart: Default::default(),
            joypad: Default::default(),
            serial: Serial::new(),
            wram: Default::default(),
            wram_bank: 1,
            hram: Default::default(),
            scratch: [0; 3],
            bootrom: Vec::new(),
            bootrom_mapped: false,
            key0: 0,
            key1_armed: false,
            double_speed: false,
            stall: 0,
            debugger: None,
        }
    }

    pub fn insert_cartridge(&mut self, cart: Cartridge, cgb_cart: bool) {
        self.cart = cart;
        self.cgb_cart = cgb_cart;
    }

    pub fn has_cartridge(&self) -> bool {
        !self.cart.rom.is_empty()
    }

    pub fn set_bootrom(&mut self, data: Vec<u8>) {
        self.bootrom = data;
    }

    pub fn has_bootrom(&self) -> bool {
        !self.bootrom.is_empty()
    }

    /// Powers the hardware back on. The cartridge (including its RAM), boot ROM and debugger survive.
    pub fn reset(&mut self, skip_bootrom: bool) {
        let model = self.model;
        let mut cart = std::mem::take(&mut self.cart);
        cart.reset();
        let bootrom = std::mem::take(&mut self.bootrom);
        let debugger = self.debugger.take();
        let cgb_cart = self.cgb_cart;

        *self = Hardware::new(model);
        self.cart = cart;
        self.cgb_cart = cgb_cart;
        self.bootrom = bootrom;
        self.debugger = debugger;
        self.ppu.cgb = self.cgb_mode;
        self.apu.start(&mut self.sched);

        if skip_bootrom || self.bootrom.is_empty() {
            self.skip_bootrom();
        } else {
            self.bootrom_mapped = true;
            self.map.map_bootrom(self.bootrom.len());
        }
    }

    /// Puts the hardware into the state the boot ROM leaves it in.
    fn skip_bootrom(&mut self) {
        self.cgb_mode = self.model == Model::Cgb && self.cgb_cart;
        self.ppu.cgb = self.cgb_mode;
        if self.model == Model::Cgb {
            if self.cgb_cart {
                self.ppu.whiten_palettes();
            } else {
                self.key0 = 0x04;
                self.ppu.colorize_dmg();
            }
        } else {
            self.timer.set_counter(&mut self.sched, DMG_BOOT_DIV);
        }

        self.ppu.reg_lcdc_write(&mut self.sched, &mut self.interrupts, 0x91);
        self.ppu.bgp = 0xFC;
        self.joypad.reg_p1_write(0xCF);
        self.serial.reg_sc_write(&mut self.sched, 0x7F, self.cgb_mode, false);
        self.interrupts.reg_if_write(0xE1);
        self.timer.reg_tac_write(&mut self.sched, 0xF8);
        self.oam_dma.reg = 0xFF;
        self.apu.skip_bootrom();
    }

    /// Takes over the parts of a console that save states don't carry: the ROM, boot ROM and debugger.
    pub fn adopt_host_state(&mut self, old: &mut Hardware) {
        self.cart.rom = std::mem::take(&mut old.cart.rom);
        self.bootrom = std::mem::take(&mut old.bootrom);
        self.debugger = old.debugger.take();
        self.serial.output = std::mem::take(&mut old.serial.output);

        self.map = AddressMap::new(self.model);
        if self.bootrom_mapped {
            self.map.map_bootrom(self.bootrom.len());
        }
    }

    /// Length of a CPU machine cycle in master clock cycles.
    pub fn mcycle_dots(&self) -> u64 {
        if self.double_speed {
            2
        } else {
            4
        }
    }

    /// Moves the master clock forward and runs every event that falls due.
    pub fn run_for(&mut self, dots: u64) {
        self.sched.advance(dots);
        self.sched.commit();
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        while let Some((kind, late)) = self.sched.pop_due() {
            match kind {
                EventKind::PpuMode => {
                    let hblank = self.ppu.on_mode_event(&mut self.sched, &mut self.interrupts, late);
                    if hblank && self.vram_dma.hblank {
                        self.copy_vram_dma_block();
                    }
                }
                EventKind::TimerTick => self.timer.on_tick(&mut self.sched, late),
                EventKind::TimerReload => self.timer.on_reload(&mut self.interrupts),
                EventKind::ApuFrameSequencer => self.apu.on_frame_sequencer(&mut self.sched, late),
                EventKind::ApuSample => self.apu.on_sample(&mut self.sched, late),
                EventKind::OamDma => {
                    let src = self.oam_dma.on_complete();
                    for i in 0..0xA0 {
                        self.ppu.oam[usize::from(i)] = self.bus_read(src.wrapping_add(i));
                    }
                }
                EventKind::SerialTransfer => self.serial.on_transfer_complete(&mut self.interrupts),
            }
        }
    }

    /// Copies the next 16 byte VRAM DMA block, charging the CPU for it. Returns false if there was nothing to copy.
    fn copy_vram_dma_block(&mut self) -> bool {
        let (src, dest) = match self.vram_dma.next_block() {
            Some(block) => block,
            None => return false,
        };
        for i in 0..0x10 {
            let v = self.bus_read(src.wrapping_add(i));
            self.ppu.vram_dma_write(dest + i, v);
        }
        self.stall += VRAM_DMA_BLOCK_DOTS;
        true
    }

    fn start_vram_dma(&mut self, v: u8) {
        match self.vram_dma.reg_hdma5_write(v) {
            VramDmaRequest::General(blocks) => {
                for _ in 0..blocks {
                    self.copy_vram_dma_block();
                }
            }
            VramDmaRequest::HBlank => {
                // Starting during HBlank (or with the LCD off) copies the first block straight away.
                if !self.ppu.enabled || self.ppu.mode == ppu::Mode::HBlank {
                    self.copy_vram_dma_block();
                }
            }
            VramDmaRequest::Cancelled => {}
        }
    }

    fn wram_index(&self, addr: u16) -> usize {
        let bank = if self.cgb_mode { self.wram_bank.max(1) } else { 1 };
        (usize::from(bank) << 12) | usize::from(addr & 0x0FFF)
    }

    fn apu_sync(&mut self) -> &mut Apu {
        self.apu.catch_up(self.sched.cycle());
        &mut self.apu
    }

    /// Reads from the memory bus, without notifying the debugger.
    pub fn bus_read(&mut self, addr: u16) -> u8 {
        match self.map.region(addr) {
            Region::BootRom => self.bootrom.get(usize::from(addr)).copied().unwrap_or(0xFF),
            Region::CartRom => self.cart.read_rom(addr),
            Region::Vram => self.ppu.vram_read(addr),
            Region::CartRam => self.cart.read_ram(addr, self.sched.cycle()),
            Region::Wram0 => self.wram[usize::from(addr & 0x0FFF)],
            Region::WramX => self.wram[self.wram_index(addr)],
            Region::High => match self.map.high(addr) {
                High::Oam => self.ppu.oam_read(addr, self.oam_dma.active),
                High::Hram => self.hram[usize::from(addr - 0xFF80)],
                High::InterruptEnable => self.interrupts.enable,
                High::Io(port) => self.io_read(port, addr),
                High::Unusable | High::Unmapped => {
                    log::trace!("read from unmapped ${:04x}", addr);
                    0xFF
                }
            },
        }
    }

    /// Writes to the memory bus, without notifying the debugger.
    pub fn bus_write(&mut self, addr: u16, v: u8) {
        match self.map.region(addr) {
            Region::BootRom | Region::CartRom => self.cart.write(addr, v, self.sched.cycle()),
            Region::Vram => self.ppu.vram_write(addr, v),
            Region::CartRam => self.cart.write(addr, v, self.sched.cycle()),
            Region::Wram0 => self.wram[usize::from(addr & 0x0FFF)] = v,
            Region::WramX => {
                let idx = self.wram_index(addr);
                self.wram[idx] = v;
            }
            Region::High => match self.map.high(addr) {
                High::Oam => self.ppu.oam_write(addr, v, self.oam_dma.active),
                High::Hram => self.hram[usize::from(addr - 0xFF80)] = v,
                High::InterruptEnable => self.interrupts.reg_ie_write(v),
                High::Io(port) => self.io_write(port, addr, v),
                High::Unusable | High::Unmapped => log::trace!("write ${:02x} to unmapped ${:04x}", v, addr),
            },
        }
    }

    fn io_read(&mut self, port: IoPort, addr: u16) -> u8 {
        let now = self.sched.cycle();
        match port {
            IoPort::P1 => self.joypad.reg_p1_read(),
            IoPort::Sb => self.serial.reg_sb_read(),
            IoPort::Sc => self.serial.reg_sc_read(self.cgb_mode),
            IoPort::Div => self.timer.reg_div_read(now),
            IoPort::Tima => self.timer.tima,
            IoPort::Tma => self.timer.tma,
            IoPort::Tac => self.timer.reg_tac_read(),
            IoPort::If => self.interrupts.reg_if_read(),
            IoPort::Nr10 => self.apu_sync().reg_nr10_read(),
            IoPort::Nr11 => self.apu_sync().reg_nr11_read(),
            IoPort::Nr12 => self.apu_sync().reg_nr12_read(),
            IoPort::Nr13 => self.apu_sync().reg_nr13_read(),
            IoPort::Nr14 => self.apu_sync().reg_nr14_read(),
            IoPort::Nr21 => self.apu_sync().reg_nr21_read(),
            IoPort::Nr22 => self.apu_sync().reg_nr22_read(),
            IoPort::Nr23 => self.apu_sync().reg_nr23_read(),
            IoPort::Nr24 => self.apu_sync().reg_nr24_read(),
            IoPort::Nr30 => self.apu_sync().reg_nr30_read(),
            IoPort::Nr31 => self.apu_sync().reg_nr31_read(),
            IoPort::Nr32 => self.apu_sync().reg_nr32_read(),
            IoPort::Nr33 => self.apu_sync().reg_nr33_read(),
            IoPort::Nr34 => self.apu_sync().reg_nr34_read(),
            IoPort::Nr41 => self.apu_sync().reg_nr41_read(),
            IoPort::Nr42 => self.apu_sync().reg_nr42_read(),
            IoPort::Nr43 => self.apu_sync().reg_nr43_read(),
            IoPort::Nr44 => self.apu_sync().reg_nr44_read(),
            IoPort::Nr50 => self.apu_sync().reg_nr50_read(),
            IoPort::Nr51 => self.apu_sync().reg_nr51_read(),
            IoPort::Nr52 => self.apu_sync().reg_nr52_read(),
            IoPort::WaveRam => self.apu_sync().wave_read(addr),
            IoPort::Lcdc => self.ppu.reg_lcdc_read(),
            IoPort::Stat => self.ppu.reg_stat_read(),
            IoPort::Scy => self.ppu.scy,
            IoPort::Scx => self.ppu.scx,
            IoPort::Ly => self.ppu.ly,
            IoPort::Lyc => self.ppu.lyc,
            IoPort::Dma => self.oam_dma.reg,
            IoPort::Bgp => self.ppu.bgp,
            IoPort::Obp0 => self.ppu.obp0,
            IoPort::Obp1 => self.ppu.obp1,
            IoPort::Wy => self.ppu.wy,
            IoPort::Wx => self.ppu.wx,
            IoPort::BootRomDisable => 0xFF,
            IoPort::Key0 => self.key0,
            IoPort::Key1 if self.cgb_mode => {
                0x7E | (u8::from(self.double_speed) << 7) | u8::from(self.key1_armed)
            }
            IoPort::Vbk => self.ppu.reg_vbk_read(),
            IoPort::Hdma5 if self.cgb_mode => self.vram_dma.reg_hdma5_read(),
            IoPort::Rp => 0x02,
            IoPort::Bgpi => self.ppu.reg_bgpi_read(),
            IoPort::Bgpd => self.ppu.reg_bgpd_read(),
            IoPort::Obpi => self.ppu.reg_obpi_read(),
            IoPort::Obpd => self.ppu.reg_obpd_read(),
            IoPort::Svbk if self.cgb_mode => 0xF8 | self.wram_bank,
            IoPort::Scratch(i) => self.scratch[usize::from(i)],
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: IoPort, addr: u16, v: u8) {
        match port {
            IoPort::P1 => self.joypad.reg_p1_write(v),
            IoPort::Sb => self.serial.reg_sb_write(v),
            IoPort::Sc => self.serial.reg_sc_write(&mut self.sched, v, self.cgb_mode, self.double_speed),
            IoPort::Div => self.timer.reg_div_write(&mut self.sched),
            IoPort::Tima => self.timer.reg_tima_write(&mut self.sched, v),
            IoPort::Tma => self.timer.reg_tma_write(v),
            IoPort::Tac => self.timer.reg_tac_write(&mut self.sched, v),
            IoPort::If => self.interrupts.reg_if_write(v),
            IoPort::Nr10 => self.apu_sync().reg_nr10_write(v),
            IoPort::Nr11 => self.apu_sync().reg_nr11_write(v),
            IoPort::Nr12 => self.apu_sync().reg_nr12_write(v),
            IoPort::Nr13 => self.apu_sync().reg_nr13_write(v),
            IoPort::Nr14 => self.apu_sync().reg_nr14_write(v),
            IoPort::Nr21 => self.apu_sync().reg_nr21_write(v),
            IoPort::Nr22 => self.apu_sync().reg_nr22_write(v),
            IoPort::Nr23 => self.apu_sync().reg_nr23_write(v),
            IoPort::Nr24 => self.apu_sync().reg_nr24_write(v),
            IoPort::Nr30 => self.apu_sync().reg_nr30_write(v),
            IoPort::Nr31 => self.apu_sync().reg_nr31_write(v),
            IoPort::Nr32 => self.apu_sync().reg_nr32_write(v),
            IoPort::Nr33 => self.apu_sync().reg_nr33_write(v),
            IoPort::Nr34 => self.apu_sync().reg_nr34_write(v),
            IoPort::Nr41 => self.apu_sync().reg_nr41_write(v),
            IoPort::Nr42 => self.apu_sync().reg_nr42_write(v),
            IoPort::Nr43 => self.apu_sync().reg_nr43_write(v),
            IoPort::Nr44 => self.apu_sync().reg_nr44_write(v),
            IoPort::Nr50 => self.apu_sync().reg_nr50_write(v),
            IoPort::Nr51 => self.apu_sync().reg_nr51_write(v),
            IoPort::Nr52 => self.apu_sync().reg_nr52_write(v),
            IoPort::WaveRam => self.apu_sync().wave_write(addr, v),
            IoPort::Lcdc => self.ppu.reg_lcdc_write(&mut self.sched, &mut self.interrupts, v),
            IoPort::Stat => self.ppu.reg_stat_write(&mut self.interrupts, v),
            IoPort::Scy => self.ppu.scy = v,
            IoPort::Scx => self.ppu.scx = v,
            IoPort::Ly => {} // Read only.
            IoPort::Lyc => self.ppu.reg_lyc_write(&mut self.interrupts, v),
            IoPort::Dma => self.oam_dma.reg_dma_write(&mut self.sched, v, self.double_speed),
            IoPort::Bgp => self.ppu.bgp = v,
            IoPort::Obp0 => self.ppu.obp0 = v,
            IoPort::Obp1 => self.ppu.obp1 = v,
            IoPort::Wy => self.ppu.wy = v,
            IoPort::Wx => self.ppu.wx = v,
            IoPort::BootRomDisable => {
                if v & 1 != 0 && self.bootrom_mapped {
                    self.disable_bootrom();
                }
            }
            IoPort::Key0 => {
                if self.bootrom_mapped {
                    self.key0 = v;
                }
            }
            IoPort::Key1 => {
                if self.cgb_mode {
                    self.key1_armed = v & 1 != 0;
                }
            }
            IoPort::Vbk => self.ppu.reg_vbk_write(v),
            IoPort::Hdma1 if self.cgb_mode => self.vram_dma.reg_hdma1_write(v),
            IoPort::Hdma2 if self.cgb_mode => self.vram_dma.reg_hdma2_write(v),
            IoPort::Hdma3 if self.cgb_mode => self.vram_dma.reg_hdma3_write(v),
            IoPort::Hdma4 if self.cgb_mode => self.vram_dma.reg_hdma4_write(v),
            IoPort::Hdma5 if self.cgb_mode => self.start_vram_dma(v),
            IoPort::Bgpi => self.ppu.reg_bgpi_write(v),
            IoPort::Bgpd => self.ppu.reg_bgpd_write(v),
            IoPort::Obpi => self.ppu.reg_obpi_write(v),
            IoPort::Obpd => self.ppu.reg_obpd_write(v),
            IoPort::Svbk if self.cgb_mode => self.wram_bank = v & 0b111,
            IoPort::Scratch(i) => self.scratch[usize::from(i)] = v,
            _ => log::trace!("ignored write ${:02x} to {:?}", v, port),
        }
    }

    /// The boot ROM unmaps itself as its last act. On the CGB, KEY0 decides whether the cartridge runs with CGB
    /// features or in DMG compatibility mode.
    fn disable_bootrom(&mut self) {
        self.bootrom_mapped = false;
        self.map.unmap_bootrom();
        if self.model == Model::Cgb {
            self.cgb_mode = self.key0 & 0x04 == 0;
            self.ppu.cgb = self.cgb_mode;
        }
        log::debug!("boot ROM unmapped, CGB mode: {}", self.cgb_mode);
    }
}

impl cpu::Bus for Hardware {
    fn memory_read(&mut self, addr: u16) -> u8 {
        let v = self.bus_read(addr);
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.on_memory_read(addr, v);
        }
        v
    }

    fn memory_write(&mut self, addr: u16, v: u8) {
        if let Some(debugger) = self.debugger.as_mut() {
            debugger.on_memory_write(addr, v);
        }
        self.bus_write(addr, v);
    }

    fn interrupt_controller(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    /// An armed speed switch happens here. Otherwise STOP is treated as a no-op.
    fn stop(&mut self) {
        if !(self.cgb_mode && self.key1_armed) {
            log::trace!("STOP without a speed switch armed");
            return;
        }
        self.key1_armed = false;
        self.double_speed = !self.double_speed;
        self.timer.set_double_speed(&mut self.sched, self.double_speed);
        log::debug!("speed switch, double speed: {}", self.double_speed);
    }
}
