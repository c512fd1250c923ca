use friscy_checkpoint::CheckpointError;
use friscy_hypercall::DispatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid machine config: {0}")]
    InvalidConfig(&'static str),

    #[error("out of memory allocating {len} byte arena")]
    OutOfMemory { len: usize },

    #[error("guest access out of bounds: {addr:#x}+{len}")]
    Fault { addr: u64, len: usize },

    #[error("instruction fetch from non-executable page at {pc:#x}")]
    NotExecutable { pc: u64 },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

pub type Result<T> = std::result::Result<T, MachineError>;
