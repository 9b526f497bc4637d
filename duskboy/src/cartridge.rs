//! Gameboy cartridges themselves contain some hardware. The CPU assigns the address space 0x0000 ... 0x7FFF and
//! 0xA000 ... 0xBFFF to the cartridge, and reads/writes there are handled by whatever chip is sitting inside it. The
//! simplest carts only have ROM. Others have battery backed RAM (which is used for savegames), or more ROM than fits
//! in the address space, paged in via writes to the ROM area. We implement the various MBCs (Memory Bank Controllers)
//! here.

use crate::error::{Error, Result};
use crate::rom::{CartridgeType, RomHeader};
use serde::{Deserialize, Serialize};

/// The MBC3 clock counts real seconds, which is this many master clock cycles.
const RTC_SECOND: u64 = 4_194_304;

#[derive(Default, Deserialize, Serialize)]
pub struct Cartridge {
    #[serde(skip)]
    pub rom: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ram: Vec<u8>,
    pub has_battery: bool,

    mbc: Mbc,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
enum Mbc {
    RomOnly,
    Mbc1 {
        ram_enabled: bool,
        bank_lo: u8,       // 5 bit ROM bank register.
        bank_hi: u8,       // 2 bit RAM bank / upper ROM bank register.
        advanced: bool,    // Banking mode select.
    },
    Mbc2 {
        ram_enabled: bool,
        rom_bank: u8,
    },
    Mbc3 {
        ram_enabled: bool,
        rom_bank: u8,
        ram_select: u8,    // 0-3 (7 on MBC30) for RAM banks, 8-C for the clock registers.
        rtc: Rtc,
    },
    Mbc5 {
        ram_enabled: bool,
        rom_bank: u16,
        ram_bank: u8,
    },
}

impl Default for Mbc {
    fn default() -> Mbc {
        Mbc::RomOnly
    }
}

/// MBC3 real time clock. Time is measured against the emulated master clock.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
struct Rtc {
    regs: [u8; 5],    // Seconds, minutes, hours, day low, day high/halt/carry.
    latched: [u8; 5], // What the CPU reads.
    latch_armed: bool,
    last_sync: u64,
    subsecond: u64,
}

impl Rtc {
    fn halted(&self) -> bool {
        self.regs[4] & 0x40 != 0
    }

    fn sync(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_sync);
        self.last_sync = now;
        if self.halted() {
            return;
        }

        self.subsecond += elapsed;
        let mut seconds = self.subsecond / RTC_SECOND;
        self.subsecond %= RTC_SECOND;
        while seconds > 0 {
            self.tick_second();
            seconds -= 1;
        }
    }

    fn tick_second(&mut self) {
        self.regs[0] = (self.regs[0] + 1) & 0x3F;
        if self.regs[0] != 60 {
            return;
        }
        self.regs[0] = 0;
        self.regs[1] = (self.regs[1] + 1) & 0x3F;
        if self.regs[1] != 60 {
            return;
        }
        self.regs[1] = 0;
        self.regs[2] = (self.regs[2] + 1) & 0x1F;
        if self.regs[2] != 24 {
            return;
        }
        self.regs[2] = 0;

        let day = (u16::from(self.regs[4] & 1) << 8 | u16::from(self.regs[3])) + 1;
        self.regs[3] = day as u8;
        self.regs[4] = (self.regs[4] & 0xFE) | ((day >> 8) & 1) as u8;
        if day > 0x1FF {
            self.regs[4] |= 0x80; // Day counter overflowed.
        }
    }

    fn write(&mut self, reg: usize, v: u8) {
        const MASKS: [u8; 5] = [0x3F, 0x3F, 0x1F, 0xFF, 0xC1];
        self.regs[reg] = v & MASKS[reg];
        if reg == 0 {
            self.subsecond = 0;
        }
    }
}

impl Cartridge {
    /// Whether another cartridge's state could have come from this one: same bank controller, RAM and battery.
    pub fn same_hardware(&self, other: &Cartridge) -> bool {
        std::mem::discriminant(&self.mbc) == std::mem::discriminant(&other.mbc)
            && self.ram.len() == other.ram.len()
            && self.has_battery == other.has_battery
    }

    /// Builds the cartridge hardware for a ROM image. The ROM is padded out to the size the header claims.
    pub fn from_rom(header: &RomHeader, data: &[u8]) -> Cartridge {
        let mut rom = data.to_vec();
        if rom.len() < header.rom_size {
            rom.resize(header.rom_size, 0xFF);
        }

        let mbc = match header.cart_type {
            CartridgeType::RomOnly => Mbc::RomOnly,
            CartridgeType::Mbc1 => Mbc::Mbc1 {
                ram_enabled: false,
                bank_lo: 1,
                bank_hi: 0,
                advanced: false,
            },
            CartridgeType::Mbc2 => Mbc::Mbc2 {
                ram_enabled: false,
                rom_bank: 1,
            },
            CartridgeType::Mbc3 => Mbc::Mbc3 {
                ram_enabled: false,
                rom_bank: 1,
                ram_select: 0,
                rtc: Default::default(),
            },
            CartridgeType::Mbc5 => Mbc::Mbc5 {
                ram_enabled: false,
                rom_bank: 1,
                ram_bank: 0,
            },
        };

        Cartridge {
            rom,
            ram: vec![0; header.ram_size],
            has_battery: header.has_battery,
            mbc,
        }
    }

    /// Returns the MBC to its power-on state, leaving RAM (and the clock) alone.
    pub fn reset(&mut self) {
        match &mut self.mbc {
            Mbc::RomOnly => {}
            Mbc::Mbc1 {
                ram_enabled,
                bank_lo,
                bank_hi,
                advanced,
            } => {
                *ram_enabled = false;
                *bank_lo = 1;
                *bank_hi = 0;
                *advanced = false;
            }
            Mbc::Mbc2 { ram_enabled, rom_bank } => {
                *ram_enabled = false;
                *rom_bank = 1;
            }
            Mbc::Mbc3 {
                ram_enabled,
                rom_bank,
                ram_select,
                ..
            } => {
                *ram_enabled = false;
                *rom_bank = 1;
                *ram_select = 0;
            }
            Mbc::Mbc5 {
                ram_enabled,
                rom_bank,
                ram_bank,
            } => {
                *ram_enabled = false;
                *rom_bank = 1;
                *ram_bank = 0;
            }
        }
    }

    pub fn cart_type(&self) -> CartridgeType {
        match self.mbc {
            Mbc::RomOnly => CartridgeType::RomOnly,
            Mbc::Mbc1 { .. } => CartridgeType::Mbc1,
            Mbc::Mbc2 { .. } => CartridgeType::Mbc2,
            Mbc::Mbc3 { .. } => CartridgeType::Mbc3,
            Mbc::Mbc5 { .. } => CartridgeType::Mbc5,
        }
    }

    fn rom_byte(&self, bank: usize, addr: u16) -> u8 {
        if self.rom.is_empty() {
            return 0xFF;
        }
        let banks = (self.rom.len() / 0x4000).max(1);
        self.rom
            .get((bank % banks) * 0x4000 + (addr & 0x3FFF) as usize)
            .copied()
            .unwrap_or(0xFF)
    }

    fn mbc30(&self) -> bool {
        self.rom.len() > 2 * 1024 * 1024 || self.ram.len() > 32 * 1024
    }

    /// Reads from the 0x0000 - 0x7FFF ROM area.
    pub fn read_rom(&self, addr: u16) -> u8 {
        let upper = addr >= 0x4000;
        let bank = match self.mbc {
            Mbc::RomOnly => upper as usize,
            Mbc::Mbc1 {
                bank_lo,
                bank_hi,
                advanced,
                ..
            } => {
                if upper {
                    (usize::from(bank_hi) << 5) | usize::from(bank_lo)
                } else if advanced {
                    usize::from(bank_hi) << 5
                } else {
                    0
                }
            }
            Mbc::Mbc2 { rom_bank, .. } | Mbc::Mbc3 { rom_bank, .. } => {
                if upper {
                    usize::from(rom_bank)
                } else {
                    0
                }
            }
            Mbc::Mbc5 { rom_bank, .. } => {
                if upper {
                    usize::from(rom_bank)
                } else {
                    0
                }
            }
        };
        self.rom_byte(bank, addr)
    }

    /// Offset into `ram` for an access to 0xA000 - 0xBFFF with the given bank, mirroring small RAMs.
    fn ram_offset(&self, bank: usize, addr: u16) -> Option<usize> {
        if self.ram.is_empty() {
            return None;
        }
        Some(((bank << 13) | (addr & 0x1FFF) as usize) % self.ram.len())
    }

    /// Reads from the 0xA000 - 0xBFFF cartridge RAM area. `now` is the master clock, for the MBC3 clock.
    pub fn read_ram(&mut self, addr: u16, now: u64) -> u8 {
        let offset = match &mut self.mbc {
            Mbc::RomOnly => Some(0),
            Mbc::Mbc1 {
                ram_enabled: true,
                bank_hi,
                advanced,
                ..
            } => Some(if *advanced { usize::from(*bank_hi) } else { 0 }),
            Mbc::Mbc2 { ram_enabled: true, .. } => {
                // 512 half-bytes, mirrored through the whole area. The top nibble floats high.
                return 0xF0 | self.ram.get((addr & 0x1FF) as usize).copied().unwrap_or(0x0F);
            }
            Mbc::Mbc3 {
                ram_enabled: true,
                ram_select,
                rtc,
                ..
            } => {
                if *ram_select >= 0x08 {
                    rtc.sync(now);
                    return rtc.latched.get(usize::from(*ram_select - 8)).copied().unwrap_or(0xFF);
                }
                Some(usize::from(*ram_select))
            }
            Mbc::Mbc5 {
                ram_enabled: true,
                ram_bank,
                ..
            } => Some(usize::from(*ram_bank)),
            _ => None,
        };

        match offset.and_then(|bank| self.ram_offset(bank, addr)) {
            Some(i) => self.ram[i],
            None => 0xFF,
        }
    }

    /// Handles a write anywhere in the cartridge address space.
    pub fn write(&mut self, addr: u16, v: u8, now: u64) {
        if addr >= 0xA000 {
            self.write_ram(addr, v, now);
            return;
        }

        let mbc30 = self.mbc30();
        match &mut self.mbc {
            Mbc::RomOnly => {}
            Mbc::Mbc1 {
                ram_enabled,
                bank_lo,
                bank_hi,
                advanced,
            } => match addr >> 13 {
                0 => *ram_enabled = v & 0x0F == 0x0A,
                1 => *bank_lo = (v & 0x1F).max(1),
                2 => *bank_hi = v & 0b11,
                _ => *advanced = v & 1 == 1,
            },
            Mbc::Mbc2 { ram_enabled, rom_bank } => {
                // Bit 8 of the address decides whether this is the RAM enable or ROM bank register.
                if addr < 0x4000 {
                    if addr & 0x100 == 0 {
                        *ram_enabled = v & 0x0F == 0x0A;
                    } else {
                        *rom_bank = (v & 0x0F).max(1);
                    }
                }
            }
            Mbc::Mbc3 {
                ram_enabled,
                rom_bank,
                ram_select,
                rtc,
            } => match addr >> 13 {
                0 => *ram_enabled = v & 0x0F == 0x0A,
                1 => *rom_bank = if mbc30 { v.max(1) } else { (v & 0x7F).max(1) },
                2 => {
                    if v <= 0x0C {
                        *ram_select = v;
                    }
                }
                _ => {
                    // Writing 0 then 1 latches the clock.
                    if rtc.latch_armed && v == 1 {
                        rtc.sync(now);
                        rtc.latched = rtc.regs;
                    }
                    rtc.latch_armed = v == 0;
                }
            },
            Mbc::Mbc5 {
                ram_enabled,
                rom_bank,
                ram_bank,
            } => match addr >> 12 {
                0 | 1 => *ram_enabled = v & 0x0F == 0x0A,
                2 => *rom_bank = (*rom_bank & 0x100) | u16::from(v),
                3 => *rom_bank = (*rom_bank & 0xFF) | (u16::from(v & 1) << 8),
                4 | 5 => *ram_bank = v & 0x0F,
                _ => {}
            },
        }
    }

    fn write_ram(&mut self, addr: u16, v: u8, now: u64) {
        let bank = match &mut self.mbc {
            Mbc::RomOnly => Some(0),
            Mbc::Mbc1 {
                ram_enabled: true,
                bank_hi,
                advanced,
                ..
            } => Some(if *advanced { usize::from(*bank_hi) } else { 0 }),
            Mbc::Mbc2 { ram_enabled: true, .. } => {
                if let Some(b) = self.ram.get_mut((addr & 0x1FF) as usize) {
                    *b = v & 0x0F;
                }
                return;
            }
            Mbc::Mbc3 {
                ram_enabled: true,
                ram_select,
                rtc,
                ..
            } => {
                if *ram_select >= 0x08 {
                    rtc.sync(now);
                    rtc.write(usize::from(*ram_select - 8), v);
                    return;
                }
                Some(usize::from(*ram_select))
            }
            Mbc::Mbc5 {
                ram_enabled: true,
                ram_bank,
                ..
            } => Some(usize::from(*ram_bank)),
            _ => None,
        };

        if let Some(i) = bank.and_then(|bank| self.ram_offset(bank, addr)) {
            self.ram[i] = v;
        }
    }

    /// Replaces battery backed RAM with a previously saved copy.
    pub fn load_ram(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.ram.len() {
            return Err(Error::SaveRamSize {
                expected: self.ram.len(),
                found: data.len(),
            });
        }
        self.ram.copy_from_slice(data);
        Ok(())
    }
}
