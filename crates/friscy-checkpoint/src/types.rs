use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use crate::error::{CheckpointError, Result};
use crate::format::{FP_REGS, INT_REGS, SCHED_MAX_THREADS};
use crate::io::{ByteReader, WriteLeExt};

/// Architectural register file of the guest hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    pub pc: u64,
    /// Floating-point control/status register (rounding mode + accrued exceptions).
    pub fcsr: u32,
    pub x: [u64; INT_REGS],
    /// Raw 64-bit contents of `f0..f31` (NaN-boxed singles are kept as-is).
    pub f: [u64; FP_REGS],
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            pc: 0,
            fcsr: 0,
            x: [0; INT_REGS],
            f: [0; FP_REGS],
        }
    }
}

impl CpuState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.pc)?;
        w.write_u32_le(self.fcsr)?;
        w.write_u32_le(0)?; // pad
        for reg in self.x {
            w.write_u64_le(reg)?;
        }
        for reg in self.f {
            w.write_u64_le(reg)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let pc = r.read_u64_le("program counter")?;
        let fcsr = r.read_u32_le("fcsr")?;
        r.skip(4, "fcsr padding")?;
        let mut cpu = CpuState {
            pc,
            fcsr,
            ..CpuState::default()
        };
        for reg in cpu.x.iter_mut() {
            *reg = r.read_u64_le("integer registers")?;
        }
        for reg in cpu.f.iter_mut() {
            *reg = r.read_u64_le("floating-point registers")?;
        }
        Ok(cpu)
    }
}

/// Allocator cursors owned by the memory subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryManagementState {
    pub mmap_address: u64,
    pub heap_base: u64,
    pub heap_pointer: u64,
}

impl MemoryManagementState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.mmap_address)?;
        w.write_u64_le(self.heap_base)?;
        w.write_u64_le(self.heap_pointer)?;
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            mmap_address: r.read_u64_le("mmap address")?,
            heap_base: r.read_u64_le("heap base")?,
            heap_pointer: r.read_u64_le("heap pointer")?,
        })
    }
}

/// Layout of the loaded executable and (for dynamic binaries) its interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub exec_base: u64,
    pub exec_rw_start: u64,
    pub exec_rw_end: u64,
    pub interp_base: u64,
    pub interp_rw_start: u64,
    pub interp_rw_end: u64,
    pub interp_entry: u64,
    pub original_stack_top: u64,
    pub heap_start: u64,
    pub heap_size: u64,
    /// The guest moved the program break by hand at least once.
    pub brk_overridden: bool,
    pub dynamic: bool,
}

impl ExecContext {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        for v in [
            self.exec_base,
            self.exec_rw_start,
            self.exec_rw_end,
            self.interp_base,
            self.interp_rw_start,
            self.interp_rw_end,
            self.interp_entry,
            self.original_stack_top,
            self.heap_start,
            self.heap_size,
        ] {
            w.write_u64_le(v)?;
        }
        w.write_u8(u8::from(self.brk_overridden))?;
        w.write_u8(u8::from(self.dynamic))?;
        w.write_bytes(&[0u8; 6])?;
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        const WHAT: &str = "exec context";
        let ctx = ExecContext {
            exec_base: r.read_u64_le(WHAT)?,
            exec_rw_start: r.read_u64_le(WHAT)?,
            exec_rw_end: r.read_u64_le(WHAT)?,
            interp_base: r.read_u64_le(WHAT)?,
            interp_rw_start: r.read_u64_le(WHAT)?,
            interp_rw_end: r.read_u64_le(WHAT)?,
            interp_entry: r.read_u64_le(WHAT)?,
            original_stack_top: r.read_u64_le(WHAT)?,
            heap_start: r.read_u64_le(WHAT)?,
            heap_size: r.read_u64_le(WHAT)?,
            brk_overridden: r.read_u8(WHAT)? != 0,
            dynamic: r.read_u8(WHAT)? != 0,
        };
        r.skip(6, WHAT)?;
        Ok(ctx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    #[default]
    Free = 0,
    Runnable = 1,
    Blocked = 2,
    Exited = 3,
}

impl ThreadStatus {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ThreadStatus::Free),
            1 => Ok(ThreadStatus::Runnable),
            2 => Ok(ThreadStatus::Blocked),
            3 => Ok(ThreadStatus::Exited),
            _ => Err(CheckpointError::Corrupt("invalid thread status")),
        }
    }
}

/// One guest thread parked by the cooperative scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSlot {
    pub tid: i32,
    pub status: ThreadStatus,
    pub pc: u64,
    pub regs: [u64; INT_REGS],
    /// Guest address cleared and futex-woken on thread exit (`CLONE_CHILD_CLEARTID`).
    pub clear_child_tid: u64,
}

/// Scheduler bookkeeping. Always encoded as the full fixed-capacity slot table, one field at a
/// time, so the blob layout does not follow the in-memory layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerState {
    pub count: i32,
    pub current: i32,
    pub next_tid: i32,
    pub threads: [ThreadSlot; SCHED_MAX_THREADS],
}

impl SchedulerState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32_le(self.count)?;
        w.write_i32_le(self.current)?;
        w.write_i32_le(self.next_tid)?;
        w.write_u32_le(0)?; // pad
        for slot in &self.threads {
            w.write_i32_le(slot.tid)?;
            w.write_u8(slot.status as u8)?;
            w.write_bytes(&[0u8; 3])?;
            w.write_u64_le(slot.pc)?;
            for reg in slot.regs {
                w.write_u64_le(reg)?;
            }
            w.write_u64_le(slot.clear_child_tid)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        const WHAT: &str = "scheduler block";
        let mut sched = SchedulerState {
            count: r.read_i32_le(WHAT)?,
            current: r.read_i32_le(WHAT)?,
            next_tid: r.read_i32_le(WHAT)?,
            ..SchedulerState::default()
        };
        r.skip(4, WHAT)?;
        if sched.count < 0 || sched.count as usize > SCHED_MAX_THREADS {
            return Err(CheckpointError::Corrupt("scheduler thread count out of range"));
        }
        for slot in sched.threads.iter_mut() {
            slot.tid = r.read_i32_le(WHAT)?;
            slot.status = ThreadStatus::from_u8(r.read_u8(WHAT)?)?;
            r.skip(3, WHAT)?;
            slot.pc = r.read_u64_le(WHAT)?;
            for reg in slot.regs.iter_mut() {
                *reg = r.read_u64_le(WHAT)?;
            }
            slot.clear_child_tid = r.read_u64_le(WHAT)?;
        }
        Ok(sched)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpollInterest {
    pub events: u32,
    /// Opaque `epoll_data` returned to the guest with each event.
    pub data: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpollInstance {
    pub interests: BTreeMap<i32, EpollInterest>,
}

/// Process-wide state of the emulated kernel: scheduler, id counters, and the synthetic
/// descriptor tables.
///
/// Owned by the syscall-emulation layer and handed by reference to the hypercall dispatcher and
/// the checkpoint code. The descriptor tables are ordered maps, so encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedKernelState {
    pub scheduler: SchedulerState,
    pub next_pid: i32,
    pub next_epoll_fd: i32,
    pub epoll_instances: BTreeMap<i32, EpollInstance>,
    pub eventfd_counters: BTreeMap<i32, u64>,
}

impl EmulatedKernelState {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.scheduler.encode(w)?;
        w.write_i32_le(self.next_pid)?;
        w.write_i32_le(self.next_epoll_fd)?;

        w.write_count_u32(self.epoll_instances.len())?;
        for (&epfd, instance) in &self.epoll_instances {
            w.write_i32_le(epfd)?;
            w.write_count_u32(instance.interests.len())?;
            for (&fd, interest) in &instance.interests {
                w.write_i32_le(fd)?;
                w.write_u32_le(interest.events)?;
                w.write_u64_le(interest.data)?;
            }
        }

        w.write_count_u32(self.eventfd_counters.len())?;
        for (&fd, &counter) in &self.eventfd_counters {
            w.write_i32_le(fd)?;
            w.write_u64_le(counter)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let scheduler = SchedulerState::decode(r)?;
        let next_pid = r.read_i32_le("next pid")?;
        let next_epoll_fd = r.read_i32_le("next epoll fd")?;

        let mut epoll_instances = BTreeMap::new();
        let instances = r.read_count_u32(8, "epoll instances")?;
        for _ in 0..instances {
            let epfd = r.read_i32_le("epoll instances")?;
            let mut instance = EpollInstance::default();
            let interests = r.read_count_u32(16, "epoll interests")?;
            for _ in 0..interests {
                let fd = r.read_i32_le("epoll interests")?;
                let interest = EpollInterest {
                    events: r.read_u32_le("epoll interests")?,
                    data: r.read_u64_le("epoll interests")?,
                };
                if instance.interests.insert(fd, interest).is_some() {
                    return Err(CheckpointError::Corrupt("duplicate epoll interest"));
                }
            }
            if epoll_instances.insert(epfd, instance).is_some() {
                return Err(CheckpointError::Corrupt("duplicate epoll instance"));
            }
        }

        let mut eventfd_counters = BTreeMap::new();
        let eventfds = r.read_count_u32(12, "eventfd counters")?;
        for _ in 0..eventfds {
            let fd = r.read_i32_le("eventfd counters")?;
            let counter = r.read_u64_le("eventfd counters")?;
            if eventfd_counters.insert(fd, counter).is_some() {
                return Err(CheckpointError::Corrupt("duplicate eventfd"));
            }
        }

        Ok(Self {
            scheduler,
            next_pid,
            next_epoll_fd,
            epoll_instances,
            eventfd_counters,
        })
    }
}

/// Page numbers currently mapped with execute permission.
///
/// This is permission metadata, not data: it survives independently of arena contents and has
/// to be reapplied after the arena is rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecPageSet(pub BTreeSet<u64>);

impl ExecPageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page: u64) -> bool {
        self.0.insert(page)
    }

    pub fn contains(&self, page: u64) -> bool {
        self.0.contains(&page)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.0.len() as u64)?;
        for page in &self.0 {
            w.write_u64_le(*page)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.read_count_u64(8, "exec page list")?;
        let mut pages = BTreeSet::new();
        for _ in 0..count {
            pages.insert(r.read_u64_le("exec page list")?);
        }
        Ok(Self(pages))
    }
}

impl FromIterator<u64> for ExecPageSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
