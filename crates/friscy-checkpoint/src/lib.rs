//! Save and restore the complete runtime state of an emulated RISC-V machine.
//!
//! A checkpoint is a single blob: a fixed header, the CPU register file, allocator cursors, the
//! executable layout, the emulated-kernel tables, the list of executable pages, and finally the
//! guest memory arena as a sparse chunk stream (see [`arena`]). Field order is fixed and all
//! integers are little-endian.
//!
//! Restoring follows a strict order: the header and every section are parsed into a staging copy
//! first, so a rejected or truncated blob leaves the machine untouched. Only then is the decoded
//! instruction cache invalidated, the arena zeroed and refilled, exec permissions reapplied, and
//! registers written (program counter last).

pub mod arena;
mod error;
mod file;
mod format;
mod io;
mod kernel;
mod types;

pub use crate::arena::{ArenaRecord, ArenaSnapshot, ArenaStats};
pub use crate::error::{CheckpointError, KernelError, Result};
pub use crate::file::{load_checkpoint_file, save_checkpoint_file};
pub use crate::format::{
    CHECKPOINT_MAGIC, CHECKPOINT_VERSION, CHUNK_HEADER_LEN, DEFAULT_CHUNK_SIZE, FP_REGS,
    HEADER_LEN, INT_REGS, SCHED_MAX_THREADS, SENTINEL_OFFSET,
};
pub use crate::io::ByteReader;
pub use crate::kernel::{EpollOp, EPOLL_FD_BASE, EVENTFD_MAX, FIRST_CHILD_PID};
pub use crate::types::{
    CpuState, EmulatedKernelState, EpollInstance, EpollInterest, ExecContext, ExecPageSet,
    MemoryManagementState, SchedulerState, ThreadSlot, ThreadStatus,
};

use std::io::Write;

use tracing::{debug, info};

use crate::io::WriteLeExt;

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Window size of the sparse arena scan. Must be a non-zero multiple of 8.
    pub chunk_size: usize,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub exec_pages: usize,
    pub chunks: usize,
    pub arena_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub chunks: usize,
    pub arena_bytes: u64,
    pub skipped_chunks: usize,
    pub exec_pages: usize,
    pub epoll_instances: usize,
    pub eventfds: usize,
    pub pc: u64,
}

/// Read side of a machine at a quiescent point.
pub trait CheckpointSource {
    fn cpu_state(&self) -> CpuState;
    fn memory_state(&self) -> MemoryManagementState;
    fn exec_context(&self) -> ExecContext;
    fn kernel_state(&self) -> &EmulatedKernelState;
    fn exec_pages(&self) -> ExecPageSet;
    fn arena(&self) -> &[u8];

    /// Whether a suspended hypercall is outstanding. Saving in that state is refused.
    fn hypercall_in_flight(&self) -> bool {
        false
    }
}

/// Write side of a machine. [`load_checkpoint`] calls these in a fixed order; see the crate
/// docs.
pub trait CheckpointTarget {
    fn arena_len(&self) -> usize;

    fn hypercall_in_flight(&self) -> bool {
        false
    }

    /// Drop every cached decoded or translated view of guest memory. Called before the arena is
    /// rewritten.
    fn invalidate_decoded_cache(&mut self);

    fn arena_mut(&mut self) -> &mut [u8];

    /// Mark `page` readable and executable with write cleared.
    fn restore_exec_page(&mut self, page: u64);

    /// Integer and floating-point registers plus `fcsr`. The program counter follows separately
    /// through [`CheckpointTarget::restore_pc`].
    fn restore_registers(&mut self, cpu: &CpuState);
    fn restore_pc(&mut self, pc: u64);

    fn restore_memory_state(&mut self, state: MemoryManagementState);
    fn restore_exec_context(&mut self, ctx: ExecContext);
    fn restore_kernel_state(&mut self, state: EmulatedKernelState);

    /// Tell the execution loop that the next step continues a restored machine.
    fn mark_resumed(&mut self);
}

struct CountingWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write + ?Sized> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Refusals that must happen before any output exists.
pub(crate) fn check_saveable<S: CheckpointSource + ?Sized>(
    source: &S,
    options: SaveOptions,
) -> Result<()> {
    if source.hypercall_in_flight() {
        return Err(CheckpointError::NotQuiescent);
    }
    arena::validate_chunk_size(options.chunk_size)
}

pub fn save_checkpoint<W: Write + ?Sized, S: CheckpointSource + ?Sized>(
    w: &mut W,
    source: &S,
    options: SaveOptions,
) -> Result<SaveStats> {
    check_saveable(source, options)?;

    let mut w = CountingWriter {
        inner: w,
        written: 0,
    };

    write_header(&mut w)?;
    source.cpu_state().encode(&mut w)?;
    source.memory_state().encode(&mut w)?;
    source.exec_context().encode(&mut w)?;
    source.kernel_state().encode(&mut w)?;

    let exec_pages = source.exec_pages();
    exec_pages.encode(&mut w)?;
    debug!(exec_pages = exec_pages.len(), "saved exec pages");

    let arena = arena::encode_arena(&mut w, source.arena(), options.chunk_size)?;

    let stats = SaveStats {
        exec_pages: exec_pages.len(),
        chunks: arena.chunks,
        arena_bytes: arena.bytes,
        total_bytes: w.written,
    };
    info!(
        chunks = stats.chunks,
        arena_bytes = stats.arena_bytes,
        total_bytes = stats.total_bytes,
        exec_pages = stats.exec_pages,
        "checkpoint saved"
    );
    Ok(stats)
}

pub fn save_checkpoint_to_vec<S: CheckpointSource + ?Sized>(
    source: &S,
    options: SaveOptions,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    save_checkpoint(&mut out, source, options)?;
    Ok(out)
}

/// Everything a blob says, parsed but not yet applied.
struct Staged<'a> {
    cpu: CpuState,
    memory: MemoryManagementState,
    exec: ExecContext,
    kernel: EmulatedKernelState,
    exec_pages: ExecPageSet,
    arena: ArenaSnapshot<'a>,
}

impl<'a> Staged<'a> {
    fn parse(blob: &'a [u8], arena_len: usize) -> Result<Self> {
        let mut r = ByteReader::new(blob);
        read_header(&mut r)?;
        let staged = Staged {
            cpu: CpuState::decode(&mut r)?,
            memory: MemoryManagementState::decode(&mut r)?,
            exec: ExecContext::decode(&mut r)?,
            kernel: EmulatedKernelState::decode(&mut r)?,
            exec_pages: ExecPageSet::decode(&mut r)?,
            arena: ArenaSnapshot::parse(&mut r, arena_len)?,
        };
        if r.remaining() != 0 {
            debug!(
                at = r.position(),
                trailing = r.remaining(),
                "ignoring bytes after arena sentinel"
            );
        }
        Ok(staged)
    }
}

/// Restore a machine from a checkpoint blob.
///
/// Any error is returned before the target is touched. Arena records that do not fit the
/// target arena are skipped and counted in [`LoadStats::skipped_chunks`].
pub fn load_checkpoint<T: CheckpointTarget + ?Sized>(blob: &[u8], target: &mut T) -> Result<LoadStats> {
    if target.hypercall_in_flight() {
        return Err(CheckpointError::NotQuiescent);
    }
    let staged = Staged::parse(blob, target.arena_len())?;

    target.invalidate_decoded_cache();

    let arena = target.arena_mut();
    arena.fill(0);
    let applied = staged.arena.apply(arena);

    for page in staged.exec_pages.iter() {
        target.restore_exec_page(page);
    }

    target.restore_registers(&staged.cpu);
    target.restore_pc(staged.cpu.pc);
    target.restore_memory_state(staged.memory);
    target.restore_exec_context(staged.exec);

    let stats = LoadStats {
        chunks: applied.chunks,
        arena_bytes: applied.bytes,
        skipped_chunks: applied.skipped,
        exec_pages: staged.exec_pages.len(),
        epoll_instances: staged.kernel.epoll_instances.len(),
        eventfds: staged.kernel.eventfd_counters.len(),
        pc: staged.cpu.pc,
    };
    target.restore_kernel_state(staged.kernel);

    target.mark_resumed();

    info!(
        chunks = stats.chunks,
        arena_bytes = stats.arena_bytes,
        skipped = stats.skipped_chunks,
        exec_pages = stats.exec_pages,
        epoll_instances = stats.epoll_instances,
        eventfds = stats.eventfds,
        pc = format_args!("{:#x}", stats.pc),
        mmap = format_args!("{:#x}", staged.memory.mmap_address),
        heap = format_args!("{:#x}..{:#x}", staged.memory.heap_base, staged.memory.heap_pointer),
        "checkpoint loaded"
    );
    Ok(stats)
}

fn write_header<W: Write + ?Sized>(w: &mut W) -> Result<()> {
    w.write_bytes(CHECKPOINT_MAGIC)?;
    w.write_u32_le(CHECKPOINT_VERSION)?;
    w.write_u32_le(0)?; // flags/reserved
    Ok(())
}

fn read_header(r: &mut ByteReader<'_>) -> Result<()> {
    let magic = r.read_array::<8>("header")?;
    if &magic != CHECKPOINT_MAGIC {
        return Err(CheckpointError::InvalidMagic);
    }
    let version = r.read_u32_le("header")?;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(version));
    }
    let _flags = r.read_u32_le("header")?;
    Ok(())
}
