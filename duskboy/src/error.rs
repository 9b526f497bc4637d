//! Errors that can surface from the emulator core. Most of the emulated hardware can't fail (a real Gameboy doesn't
//! report errors, it just does weird things), so these are mostly about bad input: ROM images, boot ROMs, save states.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ROM image is too small to contain a cartridge header ({0} bytes)")]
    RomTooSmall(usize),

    #[error("unsupported cartridge type ${0:02x}")]
    UnsupportedCartridge(u8),

    #[error("unsupported ROM size code ${0:02x}")]
    UnsupportedRomSize(u8),

    #[error("unsupported RAM size code ${0:02x}")]
    UnsupportedRamSize(u8),

    #[error("no cartridge has been loaded")]
    NoCartridge,

    #[error("boot ROM has an unexpected size of {0} bytes")]
    InvalidBootRom(usize),

    #[error("illegal opcode ${opcode:02x} at ${addr:04x}")]
    IllegalOpcode { opcode: u8, addr: u16 },

    #[error("save state has a bad header")]
    BadSaveState,

    #[error("save state was made with a different {0}")]
    SaveStateMismatch(&'static str),

    #[error("save state version {found} does not match expected version {expected}")]
    SaveStateVersion { found: u32, expected: u32 },

    #[error("save state body could not be encoded/decoded: {0}")]
    SaveStateBody(#[from] bincode::Error),

    #[error("cartridge RAM is {expected} bytes, but {found} bytes were provided")]
    SaveRamSize { expected: usize, found: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
