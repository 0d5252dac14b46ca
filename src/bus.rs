use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    error::SnapshotError,
    memory_block::{MemoryBlock, MemoryKind},
    snapshot::{BlockEntry, MemorySnapshot},
};

pub const MIN_GRANULARITY: u32 = 8;
pub const MAX_GRANULARITY: u32 = 0x10000;

/// Unmapped reads float to this value.
pub const UNMAPPED_READ: u8 = 0x55;

/// Upper bound on the slot table length, per direction.
const MAX_SLOTS: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// One slot table entry. The block's byte 0 sits at `base`, so the offset of
/// any address inside the slot is `address - base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    block: BlockId,
    base: u32,
}

impl Mapping {
    fn offset(&self, address: u32) -> u32 {
        address.wrapping_sub(self.base)
    }
}

/// Memory bus built from fixed-granularity slots.
///
/// Reads and writes are routed separately, so a ROM can shadow RAM for
/// reads while writes still land in the RAM underneath.
#[derive(Debug)]
pub struct Bus {
    granularity: u32,
    address_bits: u32,
    address_mask: u32,
    blocks: Vec<Option<MemoryBlock>>,
    read_map: Vec<Option<Mapping>>,
    write_map: Vec<Option<Mapping>>,
}

impl Bus {
    pub fn new(granularity: u32) -> anyhow::Result<Self> {
        ensure!(
            granularity.is_power_of_two()
                && (MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity),
            "block granularity {:#X} must be a power of two between {:#X} and {:#X}",
            granularity,
            MIN_GRANULARITY,
            MAX_GRANULARITY
        );

        Ok(Self {
            granularity,
            address_bits: 0,
            address_mask: 0,
            blocks: Vec::new(),
            read_map: Vec::new(),
            write_map: Vec::new(),
        })
    }

    /// Sizes the slot tables for an address space of `address_bits` bits.
    /// Any previous mapping is discarded; blocks stay registered.
    pub fn init(&mut self, address_bits: u32) -> bool {
        if !(1..=32).contains(&address_bits) {
            tracing::error!("[BUS] Invalid address width: {} bits", address_bits);
            return false;
        }

        let space = 1u64 << address_bits;
        let slots = space / self.granularity as u64;
        if slots == 0 || slots > MAX_SLOTS {
            tracing::error!(
                "[BUS] Granularity {:#X} gives {} slots for a {}-bit bus",
                self.granularity,
                slots,
                address_bits
            );
            return false;
        }

        self.address_bits = address_bits;
        self.address_mask = (space - 1) as u32;
        self.read_map = vec![None; slots as usize];
        self.write_map = vec![None; slots as usize];

        tracing::info!(
            "[BUS] {}-bit address space, {} slots of {:#X} bytes",
            address_bits,
            slots,
            self.granularity
        );
        true
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    pub fn address_bits(&self) -> u32 {
        self.address_bits
    }

    pub fn address_mask(&self) -> u32 {
        self.address_mask
    }

    /// Narrows the decoded address lines, as on machines that gate the top
    /// address bit.
    pub fn set_address_mask(&mut self, mask: u32) {
        let full = if self.address_bits == 0 {
            0
        } else {
            ((1u64 << self.address_bits) - 1) as u32
        };
        self.address_mask = mask & full;
    }

    /// Registers a block with the bus. Its size is rounded up to the slot
    /// granularity. Block names must be unique.
    pub fn add_block(&mut self, mut block: MemoryBlock) -> Option<BlockId> {
        if self.find_block(block.id()).is_some() {
            tracing::error!("[BUS] Duplicate block id [{}]", block.id());
            return None;
        }

        block.round_to(self.granularity);
        tracing::debug!("[BUS] Added {}", block);

        self.blocks.push(Some(block));
        Some(BlockId(self.blocks.len() - 1))
    }

    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.get(id.0).and_then(Option::as_ref)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.blocks.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn find_block(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.id() == name))
            .map(BlockId)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &MemoryBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i), b)))
    }

    /// Maps `block` at `base`. With `len` of `None` the whole block is
    /// mapped. Fails without touching the tables if any slot in range is
    /// already mapped in one of the requested directions.
    pub fn allocate(&mut self, block: BlockId, base: u32, len: Option<u32>, mode: AccessMode) -> bool {
        self.map(block, 0, base, len, mode, false)
    }

    /// Maps part of `block`, starting `block_offset` bytes into it.
    pub fn allocate_offset(
        &mut self,
        block: BlockId,
        block_offset: u32,
        base: u32,
        len: Option<u32>,
        mode: AccessMode,
    ) -> bool {
        self.map(block, block_offset, base, len, mode, false)
    }

    /// Like [`Bus::allocate_offset`] but replaces whatever was mapped in the
    /// range. Used for ROM overlays and bank switching.
    pub fn overlay(
        &mut self,
        block: BlockId,
        block_offset: u32,
        base: u32,
        len: Option<u32>,
        mode: AccessMode,
    ) -> bool {
        self.map(block, block_offset, base, len, mode, true)
    }

    fn map(
        &mut self,
        id: BlockId,
        block_offset: u32,
        base: u32,
        len: Option<u32>,
        mode: AccessMode,
        replace: bool,
    ) -> bool {
        let Some(block) = self.block(id) else {
            tracing::error!("[BUS] Allocate: unknown block {:?}", id);
            return false;
        };
        let name = block.id().to_string();
        let block_size = block.size();

        if block_offset >= block_size {
            tracing::error!(
                "[BUS] Allocate [{}]: offset {:#X} outside block of size {:#X}",
                name,
                block_offset,
                block_size
            );
            return false;
        }
        let len = len.unwrap_or(block_size - block_offset);
        if len > block_size - block_offset {
            tracing::error!(
                "[BUS] Allocate [{}]: {:#X} bytes from offset {:#X} exceed block size {:#X}",
                name,
                len,
                block_offset,
                block_size
            );
            return false;
        }
        if block_offset % self.granularity != 0 {
            tracing::error!(
                "[BUS] Allocate [{}]: block offset {:#X} not aligned to {:#X}",
                name,
                block_offset,
                self.granularity
            );
            return false;
        }
        let Some(slots) = self.slot_range(base, len) else {
            return false;
        };

        let mapping = Mapping {
            block: id,
            base: base.wrapping_sub(block_offset),
        };

        if !replace {
            for slot in slots.clone() {
                let taken = (mode.reads() && self.read_map[slot].is_some())
                    || (mode.writes() && self.write_map[slot].is_some());
                if taken {
                    tracing::error!(
                        "[BUS] Allocate [{}]: address {:#X} already mapped",
                        name,
                        slot as u64 * self.granularity as u64
                    );
                    return false;
                }
            }
        }

        for slot in slots {
            if mode.reads() {
                Self::replace_slot(&mut self.read_map[slot], mapping, &name, slot, self.granularity);
            }
            if mode.writes() {
                Self::replace_slot(&mut self.write_map[slot], mapping, &name, slot, self.granularity);
            }
        }

        tracing::debug!(
            "[BUS] Mapped [{}] at {:#X}..{:#X} ({:?})",
            name,
            base,
            base as u64 + len as u64,
            mode
        );
        true
    }

    fn replace_slot(entry: &mut Option<Mapping>, mapping: Mapping, name: &str, slot: usize, granularity: u32) {
        if let Some(old) = entry {
            if old.block != mapping.block {
                tracing::warn!(
                    "[BUS] [{}] replaces block {:?} at {:#X}",
                    name,
                    old.block,
                    slot as u64 * granularity as u64
                );
            }
        }
        *entry = Some(mapping);
    }

    /// Validates that `base..base+len` is aligned and inside the address
    /// space, and returns the slot indices it covers.
    fn slot_range(&self, base: u32, len: u32) -> Option<std::ops::Range<usize>> {
        if self.read_map.is_empty() {
            tracing::error!("[BUS] Bus not initialized");
            return None;
        }
        if len == 0 || base % self.granularity != 0 || len % self.granularity != 0 {
            tracing::error!(
                "[BUS] Range {:#X}+{:#X} must be non-empty and aligned to {:#X}",
                base,
                len,
                self.granularity
            );
            return None;
        }
        let end = base as u64 + len as u64;
        if end > 1u64 << self.address_bits {
            tracing::error!(
                "[BUS] Range {:#X}+{:#X} exceeds {}-bit address space",
                base,
                len,
                self.address_bits
            );
            return None;
        }

        let first = (base / self.granularity) as usize;
        let last = (end / self.granularity as u64) as usize;
        Some(first..last)
    }

    /// Makes one direction of `base..base+len` mirror the other: restoring
    /// reads copies the write mapping and vice versa.
    pub fn restore(&mut self, base: u32, len: u32, mode: AccessMode) -> bool {
        let Some(slots) = self.slot_range(base, len) else {
            return false;
        };

        match mode {
            AccessMode::Read => {
                for slot in slots {
                    self.read_map[slot] = self.write_map[slot];
                }
            }
            AccessMode::Write => {
                for slot in slots {
                    self.write_map[slot] = self.read_map[slot];
                }
            }
            AccessMode::ReadWrite => {
                tracing::error!("[BUS] Restore needs a single direction");
                return false;
            }
        }
        true
    }

    /// Repeats the mapping at `source` in the window at `window`.
    pub fn map_window(&mut self, source: u32, window: u32, len: u32) -> bool {
        let (Some(src), Some(dst)) = (self.slot_range(source, len), self.slot_range(window, len)) else {
            return false;
        };

        let delta = window.wrapping_sub(source);
        for (s, d) in src.zip(dst) {
            self.read_map[d] = self.read_map[s].map(|m| Mapping {
                block: m.block,
                base: m.base.wrapping_add(delta),
            });
            self.write_map[d] = self.write_map[s].map(|m| Mapping {
                block: m.block,
                base: m.base.wrapping_add(delta),
            });
        }
        true
    }

    /// Unmaps every slot pointing at `id` and hands the block back.
    pub fn free(&mut self, id: BlockId) -> Option<MemoryBlock> {
        let block = self.blocks.get_mut(id.0)?.take()?;
        for entry in self.read_map.iter_mut().chain(self.write_map.iter_mut()) {
            if entry.is_some_and(|m| m.block == id) {
                *entry = None;
            }
        }
        tracing::debug!("[BUS] Freed [{}]", block.id());
        Some(block)
    }

    fn slot_of(&self, address: u32) -> usize {
        (address / self.granularity) as usize
    }

    /// Block and offset currently answering reads at `address`.
    pub fn read_mapping(&self, address: u32) -> Option<(BlockId, u32)> {
        let address = address & self.address_mask;
        self.read_map
            .get(self.slot_of(address))
            .copied()
            .flatten()
            .map(|m| (m.block, m.offset(address)))
    }

    pub fn write_mapping(&self, address: u32) -> Option<(BlockId, u32)> {
        let address = address & self.address_mask;
        self.write_map
            .get(self.slot_of(address))
            .copied()
            .flatten()
            .map(|m| (m.block, m.offset(address)))
    }

    pub fn read8(&self, address: u32) -> u8 {
        match self.read_mapping(address) {
            Some((id, offset)) => match self.block(id) {
                Some(block) => block.read(offset),
                None => UNMAPPED_READ,
            },
            None => {
                tracing::warn!("[BUS] Read from unmapped address {:#06X}", address & self.address_mask);
                UNMAPPED_READ
            }
        }
    }

    pub fn write8(&mut self, address: u32, value: u8) {
        match self.write_mapping(address) {
            Some((id, offset)) => {
                if let Some(block) = self.block_mut(id) {
                    block.write(offset, value);
                }
            }
            None => {
                tracing::warn!(
                    "[BUS] Write {:#04X} to unmapped address {:#06X}",
                    value,
                    address & self.address_mask
                );
            }
        }
    }

    pub fn read16(&self, address: u32) -> u16 {
        let low = self.read8(address) as u16;
        let high = self.read8(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    pub fn read16_be(&self, address: u32) -> u16 {
        let high = self.read8(address) as u16;
        let low = self.read8(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    pub fn write16(&mut self, address: u32, value: u16) {
        self.write8(address, (value & 0x00FF) as u8);
        self.write8(address.wrapping_add(1), (value >> 8) as u8);
    }

    pub fn write16_be(&mut self, address: u32, value: u16) {
        self.write8(address, (value >> 8) as u8);
        self.write8(address.wrapping_add(1), (value & 0x00FF) as u8);
    }

    /// Fills every RAM block with `filler`. ROM and IO blocks are left alone.
    pub fn clear(&mut self, filler: u8) {
        for block in self.blocks.iter_mut().flatten() {
            if block.kind() == MemoryKind::Ram {
                block.clear(filler);
            }
        }
    }

    /// Loads a binary file into whatever block answers reads at `address`.
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P, address: u32) -> anyhow::Result<usize> {
        let (id, offset) = self
            .read_mapping(address)
            .ok_or_else(|| anyhow!("no block mapped at {:#06X}", address))?;
        let block = self
            .block_mut(id)
            .ok_or_else(|| anyhow!("block {:?} was freed", id))?;
        block.load_from_file(path, offset)
    }

    /// Writes the bytes visible to reads in `start..start+len` to a file.
    pub fn dump<P: AsRef<Path>>(&self, start: u32, len: u32, path: P) -> anyhow::Result<()> {
        if len == 0 {
            bail!("nothing to dump");
        }
        let bytes: Vec<u8> = (0..len).map(|i| self.read8(start.wrapping_add(i))).collect();
        fs::write(path.as_ref(), bytes)?;
        Ok(())
    }

    /// Writes the contents of every RAM and ROM block to
    /// `memory_<id>.bin` in `dir` and returns the block table.
    pub fn serialize(&self, dir: &Path) -> Result<MemorySnapshot, SnapshotError> {
        let mut snapshot = MemorySnapshot::default();

        for (_, block) in self.blocks() {
            let file = match block.data() {
                Some(data) => {
                    let file = format!("memory_{}.bin", block.id());
                    fs::write(dir.join(&file), data)?;
                    Some(file)
                }
                None => None,
            };

            snapshot.blocks.insert(
                block.id().to_string(),
                BlockEntry {
                    size: block.size(),
                    kind: block.kind(),
                    file,
                },
            );
        }

        tracing::debug!("[BUS] Serialized {} blocks", snapshot.blocks.len());
        Ok(snapshot)
    }

    /// Restores block contents. The snapshot must describe exactly the RAM
    /// and ROM blocks of this bus, with matching sizes and kinds, and every
    /// payload is read before any block is modified.
    pub fn deserialize(&mut self, snapshot: &MemorySnapshot, dir: &Path) -> Result<(), SnapshotError> {
        for (_, block) in self.blocks() {
            if block.kind() != MemoryKind::Io && !snapshot.blocks.contains_key(block.id()) {
                return Err(SnapshotError::compat(format!(
                    "block [{}] missing from snapshot",
                    block.id()
                )));
            }
        }

        let mut pending: Vec<(BlockId, Vec<u8>)> = Vec::new();

        for (name, entry) in &snapshot.blocks {
            let id = self
                .find_block(name)
                .ok_or_else(|| SnapshotError::compat(format!("block [{}] not found", name)))?;
            let Some(block) = self.block(id) else {
                return Err(SnapshotError::compat(format!("block [{}] not found", name)));
            };

            if block.kind() != entry.kind {
                return Err(SnapshotError::compat(format!(
                    "block [{}] is {}, snapshot has {}",
                    name,
                    block.kind(),
                    entry.kind
                )));
            }
            if block.size() != entry.size {
                return Err(SnapshotError::compat(format!(
                    "block [{}] size {:#X}, snapshot has {:#X}",
                    name,
                    block.size(),
                    entry.size
                )));
            }
            if entry.kind == MemoryKind::Io {
                continue;
            }

            let file = entry
                .file
                .as_ref()
                .ok_or_else(|| SnapshotError::Missing(format!("data file for block [{}]", name)))?;
            let path: PathBuf = dir.join(file);
            if !path.exists() {
                return Err(SnapshotError::Missing(path.display().to_string()));
            }
            let data = fs::read(&path)?;
            if data.len() != entry.size as usize {
                return Err(SnapshotError::compat(format!(
                    "{} holds {} bytes, expected {}",
                    path.display(),
                    data.len(),
                    entry.size
                )));
            }

            pending.push((id, data));
        }

        for (id, data) in pending {
            if let Some(block) = self.block_mut(id) {
                block.fill(0, &data);
            }
        }

        tracing::debug!("[BUS] Restored {} blocks", snapshot.blocks.len());
        Ok(())
    }
}
