use std::{fmt, rc::Rc, str::FromStr};

use derivative::Derivative;

use crate::error::BitMaskError;

/// Read handler. Receives the device-local address and returns the value on
/// the data bus.
pub type ReadHandler = Rc<dyn Fn(u16) -> u8>;

/// Write handler. Receives the device-local address and the value written.
pub type WriteHandler = Rc<dyn Fn(u16, u8)>;

/// An address pattern such as `"xxxxx0x1"`: `0` and `1` must match exactly,
/// `x` matches anything. The rightmost character is bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitMask {
    value: u16,
    care: u16,
}

impl BitMask {
    pub fn new(value: u16, care: u16) -> Self {
        Self {
            value: value & care,
            care,
        }
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn care(&self) -> u16 {
        self.care
    }

    pub fn is_match(&self, addr: u16) -> bool {
        addr & self.care == self.value
    }
}

impl FromStr for BitMask {
    type Err = BitMaskError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        if pattern.is_empty() {
            return Err(BitMaskError::Empty);
        }
        if pattern.len() > 16 {
            return Err(BitMaskError::TooWide(pattern.to_string()));
        }

        let mut value = 0u16;
        let mut care = 0u16;
        for c in pattern.chars() {
            value <<= 1;
            care <<= 1;
            match c {
                '0' => care |= 1,
                '1' => {
                    value |= 1;
                    care |= 1;
                }
                'x' | 'X' => {}
                _ => return Err(BitMaskError::InvalidChar(pattern.to_string(), c)),
            }
        }

        Ok(Self { value, care })
    }
}

impl fmt::Display for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}/{:#06X}", self.value, self.care)
    }
}

/// The set of read and write handlers a single device exposes, indexed by
/// device-local address.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct IoConnector {
    name: String,
    io_mask: u16,
    #[derivative(Debug = "ignore")]
    readers: Vec<Option<ReadHandler>>,
    #[derivative(Debug = "ignore")]
    writers: Vec<Vec<WriteHandler>>,
}

impl IoConnector {
    /// `io_mask` selects the address bits the device decodes. A device with
    /// 16 registers uses 0x0F.
    pub fn new(name: &str, io_mask: u16) -> Self {
        let len = io_mask as usize + 1;
        Self {
            name: name.to_string(),
            io_mask,
            readers: vec![None; len],
            writers: vec![Vec::new(); len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn io_mask(&self) -> u16 {
        self.io_mask
    }

    pub fn connect_read(&mut self, addr: u16, handler: ReadHandler) -> bool {
        let Some(slot) = self.readers.get_mut(addr as usize) else {
            tracing::error!(
                "[IO] {}: read address {:#06X} outside mask {:#06X}",
                self.name,
                addr,
                self.io_mask
            );
            return false;
        };

        if slot.is_some() {
            tracing::error!("[IO] {}: read address {:#06X} already connected", self.name, addr);
            return false;
        }

        *slot = Some(handler);
        true
    }

    /// Adds a write handler. With `share`, further handlers are chained and
    /// all of them run on every write.
    pub fn connect_write(&mut self, addr: u16, handler: WriteHandler, share: bool) -> bool {
        let Some(chain) = self.writers.get_mut(addr as usize) else {
            tracing::error!(
                "[IO] {}: write address {:#06X} outside mask {:#06X}",
                self.name,
                addr,
                self.io_mask
            );
            return false;
        };

        if !chain.is_empty() && !share {
            tracing::error!("[IO] {}: write address {:#06X} already connected", self.name, addr);
            return false;
        }

        chain.push(handler);
        true
    }

    pub fn io_read(&self, addr: u16) -> u8 {
        let addr = addr & self.io_mask;
        match &self.readers[addr as usize] {
            Some(handler) => handler(addr),
            None => {
                tracing::debug!("[IO] {}: read from unbound address {:#06X}", self.name, addr);
                0xFF
            }
        }
    }

    pub fn io_write(&self, addr: u16, value: u8) {
        let addr = addr & self.io_mask;
        let chain = &self.writers[addr as usize];
        if chain.is_empty() {
            tracing::debug!(
                "[IO] {}: write {:#04X} to unbound address {:#06X}",
                self.name,
                value,
                addr
            );
        }
        for handler in chain {
            handler(addr, value);
        }
    }

    fn reader(&self, addr: u16) -> Option<ReadHandler> {
        self.readers[(addr & self.io_mask) as usize].clone()
    }

    fn writers(&self, addr: u16) -> &[WriteHandler] {
        &self.writers[(addr & self.io_mask) as usize]
    }
}

/// Backing store of an IO-kind memory block: one handler slot per byte of
/// the block, filled by attaching device connectors.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct IoBlock {
    size: u32,
    #[derivative(Debug = "ignore")]
    readers: Vec<Option<(ReadHandler, u16)>>,
    #[derivative(Debug = "ignore")]
    writers: Vec<Vec<(WriteHandler, u16)>>,
}

impl IoBlock {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            readers: vec![None; size as usize],
            writers: vec![Vec::new(); size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn resize(&mut self, size: u32) {
        self.size = size;
        self.readers.resize(size as usize, None);
        self.writers.resize(size as usize, Vec::new());
    }

    /// Maps `conn` onto every offset matching `mask` under `mask_bits`. A
    /// `mask_bits` of zero means the mask value itself selects the bits.
    /// Each matching offset is decoded to `offset & conn.io_mask()`.
    pub fn add_device(&mut self, conn: &IoConnector, mask: u16, mask_bits: u16) -> usize {
        let mask_bits = if mask_bits == 0 { mask } else { mask_bits };
        let pattern = BitMask::new(mask, mask_bits);
        self.attach(conn, pattern)
    }

    pub fn attach(&mut self, conn: &IoConnector, pattern: BitMask) -> usize {
        let mut mapped = 0;
        for offset in 0..self.size {
            let addr = offset as u16;
            if !pattern.is_match(addr) {
                continue;
            }

            let local = addr & conn.io_mask();
            let slot = offset as usize;

            if let Some(handler) = conn.reader(local) {
                if self.readers[slot].is_some() {
                    tracing::warn!(
                        "[IO] {}: overwriting read handler at offset {:#06X}",
                        conn.name(),
                        offset
                    );
                }
                self.readers[slot] = Some((handler, local));
            }

            let chain = conn.writers(local);
            if !chain.is_empty() {
                if !self.writers[slot].is_empty() {
                    tracing::warn!(
                        "[IO] {}: overwriting write handler at offset {:#06X}",
                        conn.name(),
                        offset
                    );
                }
                self.writers[slot] = chain.iter().map(|h| (h.clone(), local)).collect();
            }

            mapped += 1;
        }

        tracing::debug!(
            "[IO] {}: attached at {} offsets matching {}",
            conn.name(),
            mapped,
            pattern
        );
        mapped
    }

    pub fn read(&self, offset: u32) -> u8 {
        match self.readers.get(offset as usize) {
            Some(Some((handler, local))) => handler(*local),
            _ => 0xFF,
        }
    }

    pub fn write(&self, offset: u32, value: u8) {
        if let Some(chain) = self.writers.get(offset as usize) {
            for (handler, local) in chain {
                handler(*local, value);
            }
        }
    }
}
