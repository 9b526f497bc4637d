//! Utilities for extracting metadata from Gameboy ROM headers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The cartridge header lives at 0x100-0x14F, so anything smaller can't be a ROM.
pub const HEADER_END: usize = 0x150;

#[derive(Clone, Debug)]
pub struct RomHeader {
    pub title: String,
    pub cgb_mode: CgbMode,
    pub cart_type: CartridgeType,
    pub has_battery: bool,
    pub rom_size: usize,
    pub ram_size: usize,
    pub checksum_ok: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum CartridgeType {
    RomOnly,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CgbMode {
    None,
    BackwardsCompatible,
    CgbOnly,
}

impl RomHeader {
    pub fn parse(data: &[u8]) -> Result<RomHeader> {
        if data.len() < HEADER_END {
            return Err(Error::RomTooSmall(data.len()));
        }

        let header_checksum = data[0x134..=0x14C]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_sub(*b).wrapping_sub(1));
        let checksum_ok = data[0x14D] == header_checksum;
        if !checksum_ok {
            log::warn!(
                "ROM header checksum mismatch (expected ${:02x}, found ${:02x})",
                header_checksum,
                data[0x14D]
            );
        }

        let cgb_mode = match data[0x143] {
            0x80 => CgbMode::BackwardsCompatible,
            0xC0 => CgbMode::CgbOnly,
            _ => CgbMode::None,
        };

        let mut title_range = 0x134..0x144;
        if cgb_mode != CgbMode::None {
            // CGB roms use the last byte of what used to be the title sequence to denote CGB mode.
            title_range.end -= 1;
        }
        let title = data[title_range]
            .split(|b| *b == 0)
            .next()
            .map(|v| String::from_utf8_lossy(v).trim_end().to_string())
            .unwrap_or_default();

        let (cart_type, has_battery) = match data[0x147] {
            0x00 | 0x08 => (CartridgeType::RomOnly, false),
            0x09 => (CartridgeType::RomOnly, true),
            0x01 | 0x02 => (CartridgeType::Mbc1, false),
            0x03 => (CartridgeType::Mbc1, true),
            0x05 => (CartridgeType::Mbc2, false),
            0x06 => (CartridgeType::Mbc2, true),
            0x0F | 0x10 | 0x13 => (CartridgeType::Mbc3, true),
            0x11 | 0x12 => (CartridgeType::Mbc3, false),
            0x19 | 0x1A | 0x1C | 0x1D => (CartridgeType::Mbc5, false),
            0x1B | 0x1E => (CartridgeType::Mbc5, true),
            v => return Err(Error::UnsupportedCartridge(v)),
        };

        let rom_size = match data[0x148] {
            v @ 0..=8 => 0x8000 << v,
            v => return Err(Error::UnsupportedRomSize(v)),
        };

        let ram_size = match cart_type {
            // MBC2 has 512 nibbles built in, regardless of what the header claims.
            CartridgeType::Mbc2 => 512,
            _ => match data[0x149] {
                0 => 0,
                1 => 2048,
                2 => 8192,
                3 => 32768,
                4 => 131_072,
                5 => 65_536,
                v => return Err(Error::UnsupportedRamSize(v)),
            },
        };

        Ok(RomHeader {
            title,
            cgb_mode,
            cart_type,
            has_battery,
            rom_size,
            ram_size,
            checksum_ok,
        })
    }
}
