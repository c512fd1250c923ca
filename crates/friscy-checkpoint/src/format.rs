pub const CHECKPOINT_MAGIC: &[u8; 8] = b"FRISCYCK";
pub const CHECKPOINT_VERSION: u32 = 2;

/// Size of the header: magic, version, reserved flags.
pub const HEADER_LEN: usize = 8 + 4 + 4;

/// Window size used by the sparse arena scan.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Offset of the record that terminates the arena chunk stream. Its length is always zero.
pub const SENTINEL_OFFSET: u64 = u64::MAX;

/// Length of an arena record header (`offset: u64`, `len: u64`).
pub const CHUNK_HEADER_LEN: usize = 16;

/// Number of thread slots in the fixed-layout scheduler block.
pub const SCHED_MAX_THREADS: usize = 16;

pub const INT_REGS: usize = 32;
pub const FP_REGS: usize = 32;
