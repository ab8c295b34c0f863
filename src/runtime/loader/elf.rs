//! ELF header check used to explain a failed load

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::runtime::error::{PipError, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_DATA: usize = 5;
const ELFDATA2MSB: u8 = 2;
const E_TYPE: usize = 16;
const ET_DYN: u16 = 3;

/// Succeeds only for a readable, position-independent ELF image.
pub fn check_pie(path: &Path) -> Result<()> {
    let shown = path.display().to_string();
    let mut header = [0u8; E_TYPE + 2];
    let mut file = File::open(path)?;
    if file.read_exact(&mut header).is_err() || header[..4] != ELF_MAGIC {
        return Err(PipError::CorruptImage(shown));
    }

    let raw = [header[E_TYPE], header[E_TYPE + 1]];
    let e_type = if header[EI_DATA] == ELFDATA2MSB {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    };
    if e_type != ET_DYN {
        return Err(PipError::NotRelocatable(shown));
    }
    Ok(())
}
