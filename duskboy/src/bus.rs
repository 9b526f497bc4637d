//! Address decoding for the 16-bit memory bus.
//!
//! Rather than matching on address ranges for every access, the map is resolved once up front into two lookup tables:
//! one entry per 256 byte page for 0x0000 - 0xFDFF, and one entry per address for 0xFE00 - 0xFFFF where the I/O
//! registers live. Ports that only exist on the CGB are simply never mapped on a DMG.

use crate::Model;

/// What backs a 256 byte page of the 0x0000 - 0xFDFF range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Region {
    BootRom,
    CartRom,
    Vram,
    CartRam,
    Wram0, // Fixed bank, including its echo at 0xE000.
    WramX, // Switchable bank (always bank 1 on the DMG), including its echo at 0xF000.
    High,  // 0xFE00 - 0xFFFF, see `High`.
}

/// What sits at a single address in 0xFE00 - 0xFFFF.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum High {
    Oam,
    Unusable, // 0xFEA0 - 0xFEFF
    Unmapped,
    Io(IoPort),
    Hram,
    InterruptEnable,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[rustfmt::skip]
pub enum IoPort {
    P1, Sb, Sc,
    Div, Tima, Tma, Tac,
    If,
    Nr10, Nr11, Nr12, Nr13, Nr14,
    Nr21, Nr22, Nr23, Nr24,
    Nr30, Nr31, Nr32, Nr33, Nr34,
    Nr41, Nr42, Nr43, Nr44,
    Nr50, Nr51, Nr52,
    WaveRam,
    Lcdc, Stat, Scy, Scx, Ly, Lyc, Dma, Bgp, Obp0, Obp1, Wy, Wx,
    BootRomDisable,
    // CGB only.
    Key0, Key1, Vbk,
    Hdma1, Hdma2, Hdma3, Hdma4, Hdma5,
    Rp,
    Bgpi, Bgpd, Obpi, Obpd,
    Svbk,
    Scratch(u8),
}

#[rustfmt::skip]
const DMG_PORTS: &[(u16, IoPort)] = &[
    (0xFF00, IoPort::P1), (0xFF01, IoPort::Sb), (0xFF02, IoPort::Sc),
    (0xFF04, IoPort::Div), (0xFF05, IoPort::Tima), (0xFF06, IoPort::Tma), (0xFF07, IoPort::Tac),
    (0xFF0F, IoPort::If),
    (0xFF10, IoPort::Nr10), (0xFF11, IoPort::Nr11), (0xFF12, IoPort::Nr12), (0xFF13, IoPort::Nr13),
    (0xFF14, IoPort::Nr14),
    (0xFF16, IoPort::Nr21), (0xFF17, IoPort::Nr22), (0xFF18, IoPort::Nr23), (0xFF19, IoPort::Nr24),
    (0xFF1A, IoPort::Nr30), (0xFF1B, IoPort::Nr31), (0xFF1C, IoPort::Nr32), (0xFF1D, IoPort::Nr33),
    (0xFF1E, IoPort::Nr34),
    (0xFF20, IoPort::Nr41), (0xFF21, IoPort::Nr42), (0xFF22, IoPort::Nr43), (0xFF23, IoPort::Nr44),
    (0xFF24, IoPort::Nr50), (0xFF25, IoPort::Nr51), (0xFF26, IoPort::Nr52),
    (0xFF40, IoPort::Lcdc), (0xFF41, IoPort::Stat), (0xFF42, IoPort::Scy), (0xFF43, IoPort::Scx),
    (0xFF44, IoPort::Ly), (0xFF45, IoPort::Lyc), (0xFF46, IoPort::Dma), (0xFF47, IoPort::Bgp),
    (0xFF48, IoPort::Obp0), (0xFF49, IoPort::Obp1), (0xFF4A, IoPort::Wy), (0xFF4B, IoPort::Wx),
    (0xFF50, IoPort::BootRomDisable),
];

#[rustfmt::skip]
const CGB_PORTS: &[(u16, IoPort)] = &[
    (0xFF4C, IoPort::Key0), (0xFF4D, IoPort::Key1), (0xFF4F, IoPort::Vbk),
    (0xFF51, IoPort::Hdma1), (0xFF52, IoPort::Hdma2), (0xFF53, IoPort::Hdma3), (0xFF54, IoPort::Hdma4),
    (0xFF55, IoPort::Hdma5),
    (0xFF56, IoPort::Rp),
    (0xFF68, IoPort::Bgpi), (0xFF69, IoPort::Bgpd), (0xFF6A, IoPort::Obpi), (0xFF6B, IoPort::Obpd),
    (0xFF70, IoPort::Svbk),
    (0xFF72, IoPort::Scratch(0)), (0xFF73, IoPort::Scratch(1)), (0xFF74, IoPort::Scratch(2)),
];

#[derive(Clone)]
pub struct AddressMap {
    pages: [Region; 256],
    high: [High; 512],
}

impl Default for AddressMap {
    fn default() -> AddressMap {
        AddressMap::new(Model::Dmg)
    }
}

impl AddressMap {
    pub fn new(model: Model) -> AddressMap {
        let mut pages = [Region::CartRom; 256];
        for (page, region) in pages.iter_mut().enumerate() {
            *region = match page {
                0x00..=0x7F => Region::CartRom,
                0x80..=0x9F => Region::Vram,
                0xA0..=0xBF => Region::CartRam,
                0xC0..=0xCF | 0xE0..=0xEF => Region::Wram0,
                0xD0..=0xDF | 0xF0..=0xFD => Region::WramX,
                _ => Region::High,
            };
        }

        let mut high = [High::Unmapped; 512];
        for (i, entry) in high.iter_mut().enumerate() {
            *entry = match 0xFE00 + i {
                0xFE00..=0xFE9F => High::Oam,
                0xFEA0..=0xFEFF => High::Unusable,
                0xFF30..=0xFF3F => High::Io(IoPort::WaveRam),
                0xFF80..=0xFFFE => High::Hram,
                0xFFFF => High::InterruptEnable,
                _ => High::Unmapped,
            };
        }

        let mut map = AddressMap { pages, high };
        map.map_ports(DMG_PORTS);
        if model == Model::Cgb {
            map.map_ports(CGB_PORTS);
        }
        map
    }

    fn map_ports(&mut self, ports: &[(u16, IoPort)]) {
        for (addr, port) in ports {
            self.high[usize::from(addr - 0xFE00)] = High::Io(*port);
        }
    }

    /// Overlays a boot ROM of the given size. The CGB boot ROM has a hole at 0x100 - 0x1FF where the cartridge header
    /// shows through.
    pub fn map_bootrom(&mut self, len: usize) {
        for page in 0..(len / 0x100).min(0x09) {
            if page != 1 {
                self.pages[page] = Region::BootRom;
            }
        }
    }

    pub fn unmap_bootrom(&mut self) {
        for page in self.pages.iter_mut().take(0x09) {
            *page = Region::CartRom;
        }
    }

    pub fn region(&self, addr: u16) -> Region {
        self.pages[usize::from(addr >> 8)]
    }

    /// Looks up an address in 0xFE00 - 0xFFFF.
    pub fn high(&self, addr: u16) -> High {
        self.high[usize::from(addr.wrapping_sub(0xFE00) & 0x1FF)]
    }
}
