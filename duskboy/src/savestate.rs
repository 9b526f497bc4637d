//! Save states are a snapshot of the whole console: CPU, every device, and the scheduler with all of its in-flight
//! events. Restoring one and running forward produces exactly the same frames as the original session did.
//!
//! The layout is a 4 byte magic and a little-endian u32 version, followed by the bincode encoded state. The cartridge
//! ROM and any boot ROM aren't stored, so the same ROM has to be loaded before a state can be restored.

use crate::cpu::Cpu;
use crate::error::{Error, Result};
use crate::hardware::Hardware;
use bincode::Options;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const MAGIC: &[u8; 4] = b"DUSK";
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

#[derive(Serialize)]
struct StateRef<'a> {
    cpu: &'a Cpu,
    hw: &'a Hardware,
}

#[derive(Deserialize)]
struct State {
    cpu: Cpu,
    hw: Hardware,
}

pub fn save(cpu: &Cpu, hw: &Hardware) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.write_u32::<LittleEndian>(VERSION)?;
    bincode::serialize_into(&mut out, &StateRef { cpu, hw })?;
    log::debug!("saved state, {} bytes", out.len());
    Ok(out)
}

/// Decodes a save state. Nothing is touched unless the whole state decodes.
pub fn load(data: &[u8]) -> Result<(Cpu, Hardware)> {
    if data.len() < HEADER_LEN || &data[0..4] != MAGIC {
        return Err(Error::BadSaveState);
    }

    let version = (&data[4..HEADER_LEN]).read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::SaveStateVersion {
            found: version,
            expected: VERSION,
        });
    }

    let state: State = decode_body(&data[HEADER_LEN..])?;
    log::debug!("loaded state, {} bytes", data.len());
    Ok((state.cpu, state.hw))
}

/// Decodes with the same encoding `bincode::serialize_into` uses. A length prefix can't claim more bytes than the body
/// holds, so a corrupt one fails before anything gets allocated for it.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let options = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(body.len() as u64);
    Ok(options.deserialize(body)?)
}
