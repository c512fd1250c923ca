use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid checkpoint magic")]
    InvalidMagic,

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),

    #[error("checkpoint truncated while reading {0}")]
    Truncated(&'static str),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(&'static str),

    #[error("checkpoint requested while a hypercall is suspended")]
    NotQuiescent,
}

impl CheckpointError {
    /// Header rejections. Nothing live has been touched when one of these is returned.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            CheckpointError::InvalidMagic | CheckpointError::UnsupportedVersion(_)
        )
    }

    pub fn is_truncation(&self) -> bool {
        matches!(self, CheckpointError::Truncated(_))
    }
}

/// Failures of the emulated-kernel bookkeeping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("descriptor {0} is already in use")]
    DescriptorExists(i32),

    #[error("no epoll instance {0}")]
    NoSuchEpoll(i32),

    #[error("fd {fd} is already registered with epoll instance {epfd}")]
    InterestExists { epfd: i32, fd: i32 },

    #[error("fd {fd} is not registered with epoll instance {epfd}")]
    NoSuchInterest { epfd: i32, fd: i32 },

    #[error("no eventfd {0}")]
    NoSuchEventFd(i32),

    #[error("eventfd counter overflow")]
    CounterOverflow,

    #[error("eventfd counter is zero")]
    WouldBlock,

    #[error("synthetic descriptor space exhausted")]
    DescriptorSpaceExhausted,
}
