use std::collections::BTreeMap;
use std::ops::Range;

use bitflags::bitflags;
use friscy_checkpoint::ExecPageSet;
use tracing::trace;

use crate::error::{MachineError, Result};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageAttributes: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PageAttributes {
    /// Attributes of a page nobody has mapped explicitly.
    pub const DEFAULT: PageAttributes = PageAttributes::READ.union(PageAttributes::WRITE);
    /// Code pages: readable and executable, never writable.
    pub const CODE: PageAttributes = PageAttributes::READ.union(PageAttributes::EXEC);
}

/// Instruction words already fetched from executable pages, keyed by address.
#[derive(Debug, Default)]
pub struct DecoderCache {
    words: BTreeMap<u64, u32>,
}

impl DecoderCache {
    pub fn get(&self, pc: u64) -> Option<u32> {
        self.words.get(&pc).copied()
    }

    pub fn insert(&mut self, pc: u64, word: u32) {
        self.words.insert(pc, word);
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn invalidate_range(&mut self, range: Range<u64>) {
        // An instruction starting up to 3 bytes before the range still overlaps it.
        let start = range.start.saturating_sub(3);
        let stale: Vec<u64> = self.words.range(start..range.end).map(|(&pc, _)| pc).collect();
        for pc in stale {
            self.words.remove(&pc);
        }
    }
}

/// Flat guest memory with page permissions and a decoded-instruction cache.
pub struct Memory {
    arena: Vec<u8>,
    page_size: u64,
    attrs: BTreeMap<u64, PageAttributes>,
    decoded: DecoderCache,
}

impl Memory {
    pub fn new(arena_size: usize, page_size: u64) -> Result<Self> {
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(arena_size)
            .map_err(|_| MachineError::OutOfMemory { len: arena_size })?;
        arena.resize(arena_size, 0);
        Ok(Self {
            arena,
            page_size,
            attrs: BTreeMap::new(),
            decoded: DecoderCache::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_of(&self, addr: u64) -> u64 {
        addr / self.page_size
    }

    pub fn arena(&self) -> &[u8] {
        &self.arena
    }

    /// Raw mutable access. Any decoded instruction may be stale afterwards, so the cache is
    /// dropped.
    pub fn arena_mut(&mut self) -> &mut [u8] {
        self.decoded.clear();
        &mut self.arena
    }

    fn range(&self, addr: u64, len: usize) -> Result<Range<usize>> {
        let fault = MachineError::Fault { addr, len };
        let start = usize::try_from(addr).map_err(|_| MachineError::Fault { addr, len })?;
        let end = start.checked_add(len).ok_or(fault)?;
        if end > self.arena.len() {
            return Err(MachineError::Fault { addr, len });
        }
        Ok(start..end)
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.arena[range])
    }

    /// Host-side store (loader, embedder). Ignores page permissions.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range(addr, bytes.len())?;
        self.arena[range].copy_from_slice(bytes);
        self.decoded
            .invalidate_range(addr..addr + bytes.len() as u64);
        Ok(())
    }

    pub fn attributes(&self, page: u64) -> PageAttributes {
        self.attrs
            .get(&page)
            .copied()
            .unwrap_or(PageAttributes::DEFAULT)
    }

    pub fn set_attributes(&mut self, page: u64, attrs: PageAttributes) {
        if attrs == PageAttributes::DEFAULT {
            self.attrs.remove(&page);
        } else {
            self.attrs.insert(page, attrs);
        }
        let start = page.saturating_mul(self.page_size);
        self.decoded
            .invalidate_range(start..start.saturating_add(self.page_size));
    }

    /// Apply `attrs` to every page overlapping `addr..addr + len`.
    pub fn protect(&mut self, addr: u64, len: u64, attrs: PageAttributes) {
        if len == 0 {
            return;
        }
        let first = self.page_of(addr);
        let last = self.page_of(addr.saturating_add(len - 1));
        for page in first..=last {
            self.set_attributes(page, attrs);
        }
    }

    /// Forget every explicit page permission.
    pub fn reset_attributes(&mut self) {
        self.attrs.clear();
        self.decoded.clear();
    }

    pub fn exec_pages(&self) -> ExecPageSet {
        self.attrs
            .iter()
            .filter(|(_, attrs)| attrs.contains(PageAttributes::EXEC))
            .map(|(&page, _)| page)
            .collect()
    }

    pub fn decoded(&self) -> &DecoderCache {
        &self.decoded
    }

    pub fn invalidate_decoded(&mut self) {
        trace!(entries = self.decoded.len(), "decoded instruction cache invalidated");
        self.decoded.clear();
    }

    /// Fetch the 32-bit instruction word at `pc`.
    pub fn fetch(&mut self, pc: u64) -> Result<u32> {
        if let Some(word) = self.decoded.get(pc) {
            return Ok(word);
        }
        if !self.attributes(self.page_of(pc)).contains(PageAttributes::EXEC) {
            return Err(MachineError::NotExecutable { pc });
        }
        let bytes: [u8; 4] = self
            .read(pc, 4)?
            .try_into()
            .map_err(|_| MachineError::Fault { addr: pc, len: 4 })?;
        let word = u32::from_le_bytes(bytes);
        self.decoded.insert(pc, word);
        Ok(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOP: u32 = 0x0000_0013;
    const ECALL: u32 = 0x0000_0073;

    fn memory() -> Memory {
        Memory::new(16 * 4096, 4096).unwrap()
    }

    #[test]
    fn fetch_requires_exec_and_caches() {
        let mut m = memory();
        m.write(0x1000, &NOP.to_le_bytes()).unwrap();
        assert!(matches!(
            m.fetch(0x1000),
            Err(MachineError::NotExecutable { pc: 0x1000 })
        ));

        m.protect(0x1000, 4096, PageAttributes::CODE);
        assert_eq!(m.fetch(0x1000).unwrap(), NOP);
        assert_eq!(m.decoded().len(), 1);

        m.write(0x1002, &[0, 0]).unwrap();
        assert!(m.decoded().is_empty());
        assert_eq!(m.fetch(0x1000).unwrap(), 0x13);

        m.arena_mut()[0x1000..0x1004].copy_from_slice(&ECALL.to_le_bytes());
        assert_eq!(m.fetch(0x1000).unwrap(), ECALL);
    }

    #[test]
    fn exec_pages_track_attributes() {
        let mut m = memory();
        m.protect(0x2000, 0x2001, PageAttributes::CODE);
        assert_eq!(m.exec_pages().iter().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(m.attributes(5), PageAttributes::DEFAULT);

        m.set_attributes(3, PageAttributes::DEFAULT);
        assert_eq!(m.exec_pages().iter().collect::<Vec<_>>(), vec![2, 4]);

        m.reset_attributes();
        assert!(m.exec_pages().is_empty());
    }

    #[test]
    fn out_of_range_access_faults() {
        let mut m = memory();
        let end = m.len() as u64;
        assert!(m.read(end - 4, 4).is_ok());
        assert!(matches!(m.read(end - 3, 4), Err(MachineError::Fault { .. })));
        assert!(matches!(m.write(u64::MAX, &[1]), Err(MachineError::Fault { .. })));
    }
}
