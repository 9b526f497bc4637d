//! The PPU is responsible for rasterizing a pretty 160x144 picture to the Gameboy LCD screen 59.7 times a second. It's
//! easily the most complicated part of the Gameboy system.
//!
//! Each visible line goes OAM scan (mode 2) -> pixel transfer (mode 3) -> HBlank (mode 0), 456 dots in total. Then
//! there's 10 lines of VBlank (mode 1). We don't clock the PPU dot by dot, instead each mode boundary is an event
//! booked with the scheduler. Pixels aren't pushed out one at a time either: the whole line is drawn in one go once
//! it reaches HBlank. That means mid-line register tricks won't show up, but everything the CPU can observe about
//! timing (STAT, LY, interrupts, VRAM/OAM locking) is exact.

mod renderer;

use crate::interrupt::{Interrupt, InterruptController};
use crate::memory_segment;
use crate::scheduler::{EventKind, Scheduler};
use crate::Model;
use serde::{Deserialize, Serialize};

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

const LINE_DOTS: u64 = 456;
const OAM_SCAN_DOTS: u64 = 80;
const DRAWING_DOTS: u64 = 172;
const SPRITE_DOTS: u64 = 6; // Extra mode 3 length for each sprite on the line.
const MAX_LINE_SPRITES: usize = 10;
const VBLANK_LINES_END: u8 = 154;

// RGB555 shades. Index 0 is the lightest.
const DMG_SHADES: [u16; 4] = [0x7FFF, 0x56B5, 0x294A, 0x0000];

// The CGB boot ROM picks palettes for DMG games. This is the default (no title match) choice.
const COLORIZED_BG: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];
const COLORIZED_OBJ: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];

/// Palette RAM indexes. BG palettes fill the first half, OBJ palettes the second.
const OBJ_PALETTES: usize = 32;

memory_segment! { Vram; u8; 0x4000 }
memory_segment! { Oam; u8; 0xA0 }
memory_segment! { PaletteRam; u16; 64 }
memory_segment! { Framebuffer; u8; 92160 }

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum Mode {
    HBlank = 0,
    VBlank = 1,
    OamScan = 2,
    Drawing = 3,
}

/// What happens when the pending PpuMode event fires.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
enum Phase {
    Drawing,
    HBlank,
    LineEnd,
}

/// A sprite picked by OAM scan. It's copied out of OAM, so the line is drawn with what the scan saw even if OAM is
/// rewritten before HBlank.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
struct LineSprite {
    y: u8,
    x: u8,
    tile: u8,
    attrs: u8,
    index: u8,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
struct StatInterrupts {
    lyc_enabled: bool,    // 0xFF41 STAT register bit 6
    oam_enabled: bool,    // 0xFF41 STAT register bit 5
    vblank_enabled: bool, // 0xFF41 STAT register bit 4
    hblank_enabled: bool, // 0xFF41 STAT register bit 3
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Ppu {
    pub vram: Vram, // 0x8000 - 0x9FFF, 2 banks of 0x2000 back to back.
    vram_bank: u8,  // 0xFF4F VBK register
    pub oam: Oam,   // 0xFE00 - 0xFE9F
    pub palettes: PaletteRam,
    bgpi: u8, // 0xFF68 BCPS/BGPI register
    obpi: u8, // 0xFF6A OCPS/OBPI register

    pub enabled: bool,    // 0xFF40 LCDC register bit 7
    win_map_hi: bool,     // 0xFF40 LCDC register bit 6
    win_enabled: bool,    // 0xFF40 LCDC register bit 5
    bg_tiles_lo: bool,    // 0xFF40 LCDC register bit 4
    bg_map_hi: bool,      // 0xFF40 LCDC register bit 3
    obj_tall: bool,       // 0xFF40 LCDC register bit 2
    obj_enabled: bool,    // 0xFF40 LCDC register bit 1
    bg_enabled: bool,     // 0xFF40 LCDC register bit 0 (BG/OBJ master priority on CGB)
    stat_interrupts: StatInterrupts,
    lyc_match: bool,      // 0xFF41 STAT register bit 2
    // The 4 STAT sources ORed together. Only a rising edge requests the interrupt.
    stat_line: bool,
    pub scy: u8,          // 0xFF42 SCY register
    pub scx: u8,          // 0xFF43 SCX register
    pub ly: u8,           // 0xFF44 LY register
    pub lyc: u8,          // 0xFF45 LYC register
    pub bgp: u8,          // 0xFF47 BGP register
    pub obp0: u8,         // 0xFF48 OBP0 register
    pub obp1: u8,         // 0xFF49 OBP1 register
    pub wy: u8,           // 0xFF4A WY register
    pub wx: u8,           // 0xFF4B WX register

    pub mode: Mode,
    phase: Phase,
    pub cgb: bool,          // CGB features (attributes, colour palettes, VRAM banking) are active.
    line_sprites: [LineSprite; MAX_LINE_SPRITES], // Sprites on this line, in OAM order.
    line_sprite_count: u8,
    line_sprite_height: u8, // Sprite height when the line was scanned.
    window_line: u8,        // Internal window line counter, only advances on lines the window was drawn.
    // The first frame after the LCD is switched on isn't shown on real hardware.
    enable_latch: bool,
    pub frame: u64,

    pub framebuffer: Framebuffer, // RGBA8888
}

impl Ppu {
    pub fn new(model: Model) -> Ppu {
        let mut ppu = Ppu {
            vram: Default::default(),
            vram_bank: 0,
            oam: Default::default(),
            palettes: Default::default(),
            bgpi: 0,
            obpi: 0,
            enabled: false,
            win_map_hi: false,
            win_enabled: false,
            bg_tiles_lo: false,
            bg_map_hi: false,
            obj_tall: false,
            obj_enabled: false,
            bg_enabled: false,
            stat_interrupts: Default::default(),
            lyc_match: false,
            stat_line: false,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            mode: Mode::HBlank,
            phase: Phase::Drawing,
            cgb: false,
            line_sprites: [LineSprite::default(); MAX_LINE_SPRITES],
            line_sprite_count: 0,
            line_sprite_height: 8,
            window_line: 0,
            enable_latch: false,
            frame: 0,
            framebuffer: Default::default(),
        };

        if model == Model::Dmg {
            // There's no palette RAM on the DMG, but the shades it produces can be expressed as a fixed one.
            ppu.load_dmg_palettes(&DMG_SHADES, &DMG_SHADES);
        }
        ppu.blank();
        ppu
    }

    fn load_dmg_palettes(&mut self, bg: &[u16; 4], obj: &[u16; 4]) {
        self.palettes[0..4].copy_from_slice(bg);
        self.palettes[OBJ_PALETTES..OBJ_PALETTES + 4].copy_from_slice(obj);
        self.palettes[OBJ_PALETTES + 4..OBJ_PALETTES + 8].copy_from_slice(obj);
    }

    /// What the CGB boot ROM does for games without CGB support.
    pub fn colorize_dmg(&mut self) {
        self.load_dmg_palettes(&COLORIZED_BG, &COLORIZED_OBJ);
    }

    /// CGB games expect the boot ROM to have left every palette white.
    pub fn whiten_palettes(&mut self) {
        for c in self.palettes.iter_mut() {
            *c = 0x7FFF;
        }
    }

    /// Fills the framebuffer with white, which is what a disabled LCD shows.
    fn blank(&mut self) {
        for b in self.framebuffer.iter_mut() {
            *b = 0xFF;
        }
    }

    fn stat_condition(&self) -> bool {
        if !self.enabled {
            return false;
        }
        (self.stat_interrupts.lyc_enabled && self.lyc_match)
            || match self.mode {
                Mode::HBlank => self.stat_interrupts.hblank_enabled,
                Mode::VBlank => self.stat_interrupts.vblank_enabled,
                Mode::OamScan => self.stat_interrupts.oam_enabled,
                Mode::Drawing => false,
            }
    }

    /// STAT interrupts can behave kinda strangely. The 4 comparators are running constantly, and their outputs are
    /// ORed onto a single line. Only when that line goes from low to high is an interrupt requested. So if the line
    /// is already high because some condition is met, a second condition becoming true does nothing. For example with
    /// HBlank + OAM interrupts enabled, the HBlank interrupt fires but the move to OAM scan on the next line does not.
    fn update_stat(&mut self, interrupts: &mut InterruptController) {
        let line = self.stat_condition();
        self.set_stat_line(interrupts, line);
    }

    fn set_stat_line(&mut self, interrupts: &mut InterruptController, line: bool) {
        if line && !self.stat_line {
            interrupts.request(Interrupt::Stat);
        }
        self.stat_line = line;
    }

    fn compare_lyc(&mut self) {
        self.lyc_match = self.ly == self.lyc;
    }

    fn sprite_height(&self) -> u8 {
        if self.obj_tall {
            16
        } else {
            8
        }
    }

    /// Finds the first 10 sprites (in OAM order) that intersect the current line.
    fn scan_oam(&mut self) {
        let height = self.sprite_height();
        let ly = u16::from(self.ly) + 16;
        self.line_sprite_height = height;
        self.line_sprite_count = 0;
        for i in 0..40 {
            let base = i * 4;
            let y = u16::from(self.oam[base]);
            if ly >= y && ly < y + u16::from(height) {
                self.line_sprites[usize::from(self.line_sprite_count)] = LineSprite {
                    y: self.oam[base],
                    x: self.oam[base + 1],
                    tile: self.oam[base + 2],
                    attrs: self.oam[base + 3],
                    index: i as u8,
                };
                self.line_sprite_count += 1;
                if usize::from(self.line_sprite_count) == MAX_LINE_SPRITES {
                    break;
                }
            }
        }
    }

    fn drawing_dots(&self) -> u64 {
        let sprites = if self.obj_enabled {
            u64::from(self.line_sprite_count)
        } else {
            0
        };
        DRAWING_DOTS + SPRITE_DOTS * sprites
    }

    fn enter_oam_scan(&mut self, sched: &mut Scheduler, interrupts: &mut InterruptController, late: u64) {
        self.mode = Mode::OamScan;
        self.phase = Phase::Drawing;
        self.update_stat(interrupts);
        sched.schedule_late(EventKind::PpuMode, OAM_SCAN_DOTS, late);
    }

    /// PpuMode handler. Returns true if the PPU just entered HBlank, which is when HDMA blocks get copied.
    pub fn on_mode_event(&mut self, sched: &mut Scheduler, interrupts: &mut InterruptController, late: u64) -> bool {
        match self.phase {
            Phase::Drawing => {
                self.scan_oam();
                self.mode = Mode::Drawing;
                self.phase = Phase::HBlank;
                self.update_stat(interrupts);
                sched.schedule_late(EventKind::PpuMode, self.drawing_dots(), late);
                false
            }
            Phase::HBlank => {
                if !self.enable_latch {
                    renderer::draw_line(self);
                }
                self.mode = Mode::HBlank;
                self.phase = Phase::LineEnd;
                self.update_stat(interrupts);
                let hblank = LINE_DOTS - OAM_SCAN_DOTS - self.drawing_dots();
                sched.schedule_late(EventKind::PpuMode, hblank, late);
                true
            }
            Phase::LineEnd => {
                self.ly += 1;
                if self.ly == VBLANK_LINES_END {
                    self.ly = 0;
                    self.frame += 1;
                    self.window_line = 0;
                    self.enable_latch = false;
                }
                self.compare_lyc();

                if self.ly < SCREEN_HEIGHT as u8 {
                    self.enter_oam_scan(sched, interrupts, late);
                } else if self.ly == SCREEN_HEIGHT as u8 {
                    self.mode = Mode::VBlank;
                    interrupts.request(Interrupt::VBlank);
                    // Line 144 starts out like any other line, so the OAM source sees it too.
                    let line = self.stat_condition() || self.stat_interrupts.oam_enabled;
                    self.set_stat_line(interrupts, line);
                    sched.schedule_late(EventKind::PpuMode, LINE_DOTS, late);
                } else {
                    self.update_stat(interrupts);
                    sched.schedule_late(EventKind::PpuMode, LINE_DOTS, late);
                }
                false
            }
        }
    }

    fn vram_locked(&self) -> bool {
        self.enabled && self.mode == Mode::Drawing
    }

    fn oam_locked(&self) -> bool {
        self.enabled && (self.mode == Mode::OamScan || self.mode == Mode::Drawing)
    }

    fn vram_index(&self, addr: u16) -> usize {
        (usize::from(self.vram_bank) << 13) | usize::from(addr & 0x1FFF)
    }

    /// Reads VRAM through the currently selected bank. Locked during pixel transfer.
    pub fn vram_read(&self, addr: u16) -> u8 {
        if self.vram_locked() {
            log::trace!("VRAM read ${:04x} while locked", addr);
            return 0xFF;
        }
        self.vram[self.vram_index(addr)]
    }

    pub fn vram_write(&mut self, addr: u16, v: u8) {
        if self.vram_locked() {
            log::trace!("VRAM write ${:04x} while locked", addr);
            return;
        }
        let idx = self.vram_index(addr);
        self.vram[idx] = v;
    }

    /// VRAM DMA writes go straight in, they're timed so the PPU isn't using VRAM.
    pub fn vram_dma_write(&mut self, offset: u16, v: u8) {
        let idx = self.vram_index(offset);
        self.vram[idx] = v;
    }

    /// Reads OAM. Locked during OAM scan and pixel transfer, or while an OAM DMA is running.
    pub fn oam_read(&self, addr: u16, dma_active: bool) -> u8 {
        if dma_active || self.oam_locked() {
            return 0xFF;
        }
        self.oam[usize::from(addr & 0xFF)]
    }

    pub fn oam_write(&mut self, addr: u16, v: u8, dma_active: bool) {
        if dma_active || self.oam_locked() {
            return;
        }
        self.oam[usize::from(addr & 0xFF)] = v;
    }

    /// Read from the 0xFF40 LCDC register
    pub fn reg_lcdc_read(&self) -> u8 {
        (if self.enabled { 0b1000_0000 } else { 0 })
            | if self.win_map_hi { 0b0100_0000 } else { 0 }
            | if self.win_enabled { 0b0010_0000 } else { 0 }
            | if self.bg_tiles_lo { 0b0001_0000 } else { 0 }
            | if self.bg_map_hi { 0b0000_1000 } else { 0 }
            | if self.obj_tall { 0b0000_0100 } else { 0 }
            | if self.obj_enabled { 0b0000_0010 } else { 0 }
            | if self.bg_enabled { 0b0000_0001 } else { 0 }
    }

    /// Write to the 0xFF40 LCDC register
    pub fn reg_lcdc_write(&mut self, sched: &mut Scheduler, interrupts: &mut InterruptController, v: u8) {
        let enabled = v & 0b1000_0000 > 0;

        self.win_map_hi = v & 0b0100_0000 > 0;
        self.win_enabled = v & 0b0010_0000 > 0;
        self.bg_tiles_lo = v & 0b0001_0000 > 0;
        self.bg_map_hi = v & 0b0000_1000 > 0;
        self.obj_tall = v & 0b0000_0100 > 0;
        self.obj_enabled = v & 0b0000_0010 > 0;
        self.bg_enabled = v & 0b0000_0001 > 0;

        if enabled && !self.enabled {
            log::debug!("LCD on");
            self.enabled = true;
            self.ly = 0;
            self.window_line = 0;
            self.enable_latch = true;
            self.compare_lyc();
            sched.cancel(EventKind::PpuMode);
            self.enter_oam_scan(sched, interrupts, 0);
        } else if !enabled && self.enabled {
            log::debug!("LCD off at LY={}", self.ly);
            if self.mode != Mode::VBlank {
                log::warn!("LCD switched off outside of VBlank");
            }
            sched.cancel(EventKind::PpuMode);
            self.enabled = false;
            self.ly = 0;
            self.mode = Mode::HBlank;
            self.stat_line = false;
            self.blank();
        }
    }

    /// Read from the 0xFF41 STAT register. The mode and coincidence bits read as 0 while the LCD is off.
    pub fn reg_stat_read(&self) -> u8 {
        let live = if self.enabled {
            self.mode as u8 | if self.lyc_match { 0b0000_0100 } else { 0 }
        } else {
            0
        };
        0b1000_0000 // Unused bit
            | live
            | if self.stat_interrupts.hblank_enabled { 0b0000_1000 } else { 0 }
            | if self.stat_interrupts.vblank_enabled { 0b0001_0000 } else { 0 }
            | if self.stat_interrupts.oam_enabled    { 0b0010_0000 } else { 0 }
            | if self.stat_interrupts.lyc_enabled    { 0b0100_0000 } else { 0 }
    }

    /// Write to the 0xFF41 STAT register. Only the interrupt selects are writable.
    pub fn reg_stat_write(&mut self, interrupts: &mut InterruptController, v: u8) {
        self.stat_interrupts = StatInterrupts {
            hblank_enabled: v & 0b0000_1000 > 0,
            vblank_enabled: v & 0b0001_0000 > 0,
            oam_enabled: v & 0b0010_0000 > 0,
            lyc_enabled: v & 0b0100_0000 > 0,
        };
        self.update_stat(interrupts);
    }

    /// Write to the 0xFF45 LYC register. The comparison only runs while the LCD is on.
    pub fn reg_lyc_write(&mut self, interrupts: &mut InterruptController, v: u8) {
        self.lyc = v;
        if self.enabled {
            self.compare_lyc();
            self.update_stat(interrupts);
        }
    }

    /// Read from the 0xFF4F VBK register.
    pub fn reg_vbk_read(&self) -> u8 {
        0xFE | self.vram_bank
    }

    /// Write to the 0xFF4F VBK register.
    pub fn reg_vbk_write(&mut self, v: u8) {
        if self.cgb {
            self.vram_bank = v & 1;
        }
    }

    pub fn reg_bgpi_read(&self) -> u8 {
        0x40 | self.bgpi
    }

    pub fn reg_bgpi_write(&mut self, v: u8) {
        self.bgpi = v & 0xBF;
    }

    pub fn reg_bgpd_read(&self) -> u8 {
        self.palette_read(self.bgpi, 0)
    }

    pub fn reg_bgpd_write(&mut self, v: u8) {
        let idx = self.bgpi;
        self.palette_write(idx, 0, v);
        self.bgpi = auto_increment(idx);
    }

    pub fn reg_obpi_read(&self) -> u8 {
        0x40 | self.obpi
    }

    pub fn reg_obpi_write(&mut self, v: u8) {
        self.obpi = v & 0xBF;
    }

    pub fn reg_obpd_read(&self) -> u8 {
        self.palette_read(self.obpi, OBJ_PALETTES)
    }

    pub fn reg_obpd_write(&mut self, v: u8) {
        let idx = self.obpi;
        self.palette_write(idx, OBJ_PALETTES, v);
        self.obpi = auto_increment(idx);
    }

    /// Palette RAM can't be touched during pixel transfer.
    fn palette_read(&self, index: u8, base: usize) -> u8 {
        if self.vram_locked() {
            return 0xFF;
        }
        let c = self.palettes[base + usize::from((index & 0x3F) >> 1)];
        if index & 1 == 0 {
            c as u8
        } else {
            (c >> 8) as u8
        }
    }

    fn palette_write(&mut self, index: u8, base: usize, v: u8) {
        if self.vram_locked() {
            return;
        }
        let c = &mut self.palettes[base + usize::from((index & 0x3F) >> 1)];
        *c = if index & 1 == 0 {
            (*c & 0xFF00) | u16::from(v)
        } else {
            (*c & 0x00FF) | (u16::from(v & 0x7F) << 8)
        };
    }
}

/// BGPI/OBPI bit 7 makes the index step forward after each data write.
fn auto_increment(index: u8) -> u8 {
    if index & 0x80 != 0 {
        0x80 | (index.wrapping_add(1) & 0x3F)
    } else {
        index
    }
}
