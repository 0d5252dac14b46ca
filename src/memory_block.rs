use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::Path,
};

use anyhow::{bail, Context};
use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::io_block::IoBlock;

pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryKind {
    Ram,
    Rom,
    Io,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Ram => write!(f, "RAM"),
            MemoryKind::Rom => write!(f, "ROM"),
            MemoryKind::Io => write!(f, "IO"),
        }
    }
}

/// Which half of an interleaved 16-bit ROM pair an image holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OddEven {
    Even = 0,
    Odd = 1,
}

enum Storage {
    Bytes(Vec<u8>),
    Io(IoBlock),
}

/// A named, fixed-size piece of the address space.
///
/// RAM and ROM blocks own their bytes. IO blocks own no bytes and forward
/// every access to the handlers registered on their [`IoBlock`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemoryBlock {
    id: String,
    kind: MemoryKind,
    size: u32,
    #[derivative(Debug = "ignore")]
    storage: Storage,
}

impl MemoryBlock {
    /// Creates a zero-filled RAM or ROM block.
    pub fn new(id: &str, size: u32, kind: MemoryKind) -> anyhow::Result<Self> {
        if kind == MemoryKind::Io {
            bail!("block [{}]: IO blocks are created with MemoryBlock::io", id);
        }
        if size == 0 || size > MAX_BLOCK_SIZE {
            bail!("block [{}]: invalid block size {}", id, size);
        }

        Ok(Self {
            id: id.to_string(),
            kind,
            size,
            storage: Storage::Bytes(vec![0; size as usize]),
        })
    }

    pub fn from_data(id: &str, data: &[u8], kind: MemoryKind) -> anyhow::Result<Self> {
        let mut block = Self::new(id, data.len() as u32, kind)?;
        if let Storage::Bytes(bytes) = &mut block.storage {
            bytes.copy_from_slice(data);
        }
        Ok(block)
    }

    pub fn io(id: &str, io: IoBlock) -> Self {
        Self {
            id: id.to_string(),
            kind: MemoryKind::Io,
            size: io.size(),
            storage: Storage::Io(io),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Grows the block so its size is a multiple of `granularity`.
    pub(crate) fn round_to(&mut self, granularity: u32) {
        let rounded = self.size.div_ceil(granularity) * granularity;
        if rounded == self.size {
            return;
        }

        tracing::debug!(
            "[MEM] Block [{}] rounded up from {} to {} bytes",
            self.id,
            self.size,
            rounded
        );
        self.size = rounded;
        match &mut self.storage {
            Storage::Bytes(bytes) => bytes.resize(rounded as usize, 0),
            Storage::Io(io) => io.resize(rounded),
        }
    }

    pub fn read(&self, offset: u32) -> u8 {
        match &self.storage {
            Storage::Bytes(bytes) => match bytes.get(offset as usize) {
                Some(value) => *value,
                None => {
                    tracing::warn!(
                        "[MEM] Read past end of block [{}] at offset {:#X}",
                        self.id,
                        offset
                    );
                    0xFF
                }
            },
            Storage::Io(io) => io.read(offset),
        }
    }

    pub fn write(&mut self, offset: u32, value: u8) {
        match &mut self.storage {
            Storage::Bytes(bytes) => {
                if self.kind == MemoryKind::Rom {
                    tracing::trace!(
                        "[MEM] Attempt to write to ROM [{}] offset {:#06X}",
                        self.id,
                        offset
                    );
                    return;
                }
                if let Some(slot) = bytes.get_mut(offset as usize) {
                    *slot = value;
                }
            }
            Storage::Io(io) => io.write(offset, value),
        }
    }

    pub fn clear(&mut self, filler: u8) {
        if let Storage::Bytes(bytes) = &mut self.storage {
            bytes.fill(filler);
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Bytes(bytes) => Some(bytes),
            Storage::Io(_) => None,
        }
    }

    pub fn io_block(&self) -> Option<&IoBlock> {
        match &self.storage {
            Storage::Io(io) => Some(io),
            Storage::Bytes(_) => None,
        }
    }

    pub fn io_block_mut(&mut self) -> Option<&mut IoBlock> {
        match &mut self.storage {
            Storage::Io(io) => Some(io),
            Storage::Bytes(_) => None,
        }
    }

    /// Copies raw bytes into the block. Writing into ROM is allowed here.
    pub fn fill(&mut self, offset: u32, data: &[u8]) -> bool {
        let Storage::Bytes(bytes) = &mut self.storage else {
            tracing::error!("[MEM] Fill: block [{}] has no backing bytes", self.id);
            return false;
        };

        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            tracing::error!(
                "[MEM] Fill: {} bytes at {:#06X} do not fit in block [{}] of size {:#06X}",
                data.len(),
                offset,
                self.id,
                self.size
            );
            return false;
        }

        bytes[start..end].copy_from_slice(data);
        true
    }

    /// Loads a binary file at `offset`, truncating whatever does not fit.
    /// Returns the number of bytes copied.
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P, offset: u32) -> anyhow::Result<usize> {
        let path = path.as_ref();
        if offset >= self.size {
            bail!(
                "block [{}]: load offset {:#06X} out of range",
                self.id,
                offset
            );
        }
        let Storage::Bytes(bytes) = &mut self.storage else {
            bail!("block [{}]: cannot load a file into an IO block", self.id);
        };

        let buffer = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if buffer.is_empty() {
            bail!("{} is empty", path.display());
        }

        let start = offset as usize;
        let len = buffer.len().min(bytes.len() - start);
        bytes[start..start + len].copy_from_slice(&buffer[..len]);

        tracing::info!(
            "[MEM] Loaded {} bytes from {} into [{}] at offset {:#06X}",
            len,
            path.display(),
            self.id,
            offset
        );
        Ok(len)
    }

    /// Spreads `data` over every other byte of the block, starting at the
    /// even or odd address.
    pub fn load_odd_even(&mut self, data: &[u8], odd_even: OddEven) -> bool {
        let Storage::Bytes(bytes) = &mut self.storage else {
            return false;
        };

        let half = bytes.len() / 2;
        if data.is_empty() {
            tracing::error!("[MEM] LoadOddEven: no data for block [{}]", self.id);
            return false;
        }

        for (i, value) in data.iter().take(half).enumerate() {
            bytes[2 * i + odd_even as usize] = *value;
        }
        true
    }

    /// Writes `len` bytes starting at `offset` to a file. A `len` of zero
    /// dumps through the end of the block.
    pub fn dump<P: AsRef<Path>>(&self, offset: u32, len: u32, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let Storage::Bytes(bytes) = &self.storage else {
            bail!("block [{}]: cannot dump an IO block", self.id);
        };
        if offset > self.size {
            bail!("block [{}]: dump offset {:#06X} out of range", self.id, offset);
        }

        let len = if len == 0 { self.size } else { len };
        let len = len.min(self.size - offset) as usize;
        let start = offset as usize;

        let mut file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        file.write_all(&bytes[start..start + len])?;

        tracing::debug!(
            "[MEM] Dumped {} bytes of [{}] to {}",
            len,
            self.id,
            path.display()
        );
        Ok(())
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] size={:#06X}", self.kind, self.id, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_ignores_writes() {
        let mut rom = MemoryBlock::from_data("rom", &[1, 2, 3, 4], MemoryKind::Rom).unwrap();
        rom.write(1, 0xAA);
        assert_eq!(rom.read(1), 2);

        assert!(rom.fill(1, &[9]));
        assert_eq!(rom.read(1), 9);
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert!(MemoryBlock::new("zero", 0, MemoryKind::Ram).is_err());
        assert!(MemoryBlock::new("huge", MAX_BLOCK_SIZE + 1, MemoryKind::Ram).is_err());
        assert!(MemoryBlock::new("io", 16, MemoryKind::Io).is_err());
    }

    #[test]
    fn round_to_granularity() {
        let mut ram = MemoryBlock::new("ram", 1000, MemoryKind::Ram).unwrap();
        ram.round_to(1024);
        assert_eq!(ram.size(), 1024);
        assert_eq!(ram.data().unwrap().len(), 1024);
    }

    #[test]
    fn odd_even_interleave() {
        let mut rom = MemoryBlock::new("bios", 8, MemoryKind::Rom).unwrap();
        assert!(rom.load_odd_even(&[1, 2, 3, 4], OddEven::Even));
        assert!(rom.load_odd_even(&[5, 6, 7, 8], OddEven::Odd));
        assert_eq!(rom.data().unwrap(), &[1, 5, 2, 6, 3, 7, 4, 8]);
    }

    #[test]
    fn fill_out_of_range_fails() {
        let mut ram = MemoryBlock::new("ram", 4, MemoryKind::Ram).unwrap();
        assert!(!ram.fill(2, &[1, 2, 3]));
        assert_eq!(ram.data().unwrap(), &[0, 0, 0, 0]);
    }
}
