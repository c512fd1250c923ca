use core::ops::Range;

use friscy_checkpoint::EmulatedKernelState;

use crate::errno::Errno;

/// The execution context a hypercall runs against.
///
/// Arguments follow the RISC-V calling convention (`a0..a5`); the single scalar result goes
/// back into `a0`. Guest pointers are offsets into the flat memory arena.
pub trait Guest {
    fn sysarg(&self, index: usize) -> u64;

    fn set_result(&mut self, value: i64);

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    fn kernel_mut(&mut self) -> &mut EmulatedKernelState;

    fn view(&self, addr: u64, len: usize) -> Result<&[u8], Errno> {
        let range = guest_range(self.memory().len(), addr, len)?;
        Ok(&self.memory()[range])
    }

    fn view_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], Errno> {
        let range = guest_range(self.memory().len(), addr, len)?;
        Ok(&mut self.memory_mut()[range])
    }

    fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Errno> {
        self.view_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn write_i64_le(&mut self, addr: u64, value: i64) -> Result<(), Errno> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Copy a NUL-terminated string out of guest memory, scanning at most `max_len` bytes.
    fn read_cstr(&self, addr: u64, max_len: usize) -> Result<Vec<u8>, Errno> {
        let mem = self.memory();
        let start = guest_range(mem.len(), addr, 1)?.start;
        let window = &mem[start..mem.len().min(start.saturating_add(max_len))];
        match window.iter().position(|&b| b == 0) {
            Some(nul) => Ok(window[..nul].to_vec()),
            None if window.len() == max_len => Err(Errno::ENAMETOOLONG),
            None => Err(Errno::EFAULT),
        }
    }

    /// `memmove` semantics: overlapping ranges are copied as if through a temporary buffer.
    fn copy_within(&mut self, dst: u64, src: u64, len: usize) -> Result<(), Errno> {
        let mem_len = self.memory().len();
        let src = guest_range(mem_len, src, len)?;
        let dst = guest_range(mem_len, dst, len)?;
        self.memory_mut().copy_within(src, dst.start);
        Ok(())
    }
}

/// Bounds-check a guest `(pointer, length)` pair against the arena.
///
/// The zero page is never mapped, so a null pointer with a non-zero length faults.
pub fn guest_range(mem_len: usize, addr: u64, len: usize) -> Result<Range<usize>, Errno> {
    if len == 0 {
        return Ok(0..0);
    }
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let start = usize::try_from(addr).map_err(|_| Errno::EFAULT)?;
    let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
    if end > mem_len {
        return Err(Errno::EFAULT);
    }
    Ok(start..end)
}
