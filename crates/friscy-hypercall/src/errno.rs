use std::io;

use thiserror::Error;

/// Positive Linux errno value. Handlers report failure to the guest as `-errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EIO: Errno = Errno(5);
    pub const E2BIG: Errno = Errno(7);
    pub const EBADF: Errno = Errno(9);
    pub const EAGAIN: Errno = Errno(11);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EFAULT: Errno = Errno(14);
    pub const EBUSY: Errno = Errno(16);
    pub const EINVAL: Errno = Errno(22);
    pub const ERANGE: Errno = Errno(34);
    pub const ENAMETOOLONG: Errno = Errno(36);
    pub const ENOSYS: Errno = Errno(38);
    pub const EILSEQ: Errno = Errno(84);
    pub const EAFNOSUPPORT: Errno = Errno(97);
    pub const ECONNRESET: Errno = Errno(104);
    pub const ENOTCONN: Errno = Errno(107);
    pub const ETIMEDOUT: Errno = Errno(110);
    pub const ECONNREFUSED: Errno = Errno(111);
    pub const EHOSTUNREACH: Errno = Errno(113);

    /// Value written to the guest result register.
    pub const fn result(self) -> i64 {
        -(self.0 as i64)
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            Errno::EPERM => Some("EPERM"),
            Errno::ENOENT => Some("ENOENT"),
            Errno::EIO => Some("EIO"),
            Errno::E2BIG => Some("E2BIG"),
            Errno::EBADF => Some("EBADF"),
            Errno::EAGAIN => Some("EAGAIN"),
            Errno::ENOMEM => Some("ENOMEM"),
            Errno::EACCES => Some("EACCES"),
            Errno::EFAULT => Some("EFAULT"),
            Errno::EBUSY => Some("EBUSY"),
            Errno::EINVAL => Some("EINVAL"),
            Errno::ERANGE => Some("ERANGE"),
            Errno::ENAMETOOLONG => Some("ENAMETOOLONG"),
            Errno::ENOSYS => Some("ENOSYS"),
            Errno::EILSEQ => Some("EILSEQ"),
            Errno::EAFNOSUPPORT => Some("EAFNOSUPPORT"),
            Errno::ECONNRESET => Some("ECONNRESET"),
            Errno::ENOTCONN => Some("ENOTCONN"),
            Errno::ETIMEDOUT => Some("ETIMEDOUT"),
            Errno::ECONNREFUSED => Some("ECONNREFUSED"),
            Errno::EHOSTUNREACH => Some("EHOSTUNREACH"),
            _ => None,
        }
    }

    pub fn from_io(err: &io::Error) -> Errno {
        if let Some(code) = err.raw_os_error().filter(|&code| code > 0) {
            return Errno(code);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::ConnectionRefused => Errno::ECONNREFUSED,
            io::ErrorKind::ConnectionReset => Errno::ECONNRESET,
            io::ErrorKind::NotConnected => Errno::ENOTCONN,
            io::ErrorKind::WouldBlock => Errno::EAGAIN,
            io::ErrorKind::InvalidInput => Errno::EINVAL,
            io::ErrorKind::TimedOut => Errno::ETIMEDOUT,
            io::ErrorKind::OutOfMemory => Errno::ENOMEM,
            io::ErrorKind::Unsupported => Errno::ENOSYS,
            _ => Errno::EIO,
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.name() {
            write!(f, "{name}({})", self.0)
        } else {
            write!(f, "Errno({})", self.0)
        }
    }
}

/// Failure reported by a host primitive. Always collapses to exactly one [`Errno`].
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Errno(Errno),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("host primitive unavailable: {0}")]
    Unsupported(&'static str),

    #[error("host primitive failed: {0}")]
    Failed(String),
}

impl HostError {
    pub fn errno(&self) -> Errno {
        match self {
            HostError::Errno(errno) => *errno,
            HostError::Io(err) => Errno::from_io(err),
            HostError::Unsupported(_) => Errno::ENOSYS,
            HostError::Failed(_) => Errno::EIO,
        }
    }
}

impl From<Errno> for HostError {
    fn from(errno: Errno) -> Self {
        HostError::Errno(errno)
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;
