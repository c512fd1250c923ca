//! Host primitives the dispatcher forwards to.
//!
//! Every primitive reports failure through [`HostError`]; handlers turn that into one negative
//! result. Primitives that may suspend return a [`HostCall`] and take owned arguments so the
//! pending future does not borrow guest memory across the suspension.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::errno::{Errno, HostError, HostResult};

pub type HostFuture<T> = Pin<Box<dyn Future<Output = HostResult<T>>>>;

/// Result of a host primitive that may either finish immediately or suspend the caller.
pub enum HostCall<T> {
    Ready(HostResult<T>),
    Pending(HostFuture<T>),
}

impl<T> HostCall<T> {
    pub fn ready(value: T) -> Self {
        HostCall::Ready(Ok(value))
    }

    pub fn fail(err: impl Into<HostError>) -> Self {
        HostCall::Ready(Err(err.into()))
    }

    pub fn pending(fut: impl Future<Output = HostResult<T>> + 'static) -> Self {
        HostCall::Pending(Box::pin(fut))
    }
}

impl<T> core::fmt::Debug for HostCall<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HostCall::Ready(res) => f
                .debug_tuple("Ready")
                .field(&res.as_ref().map(|_| ()))
                .finish(),
            HostCall::Pending(_) => f.write_str("Pending"),
        }
    }
}

pub trait StorageHost {
    /// Returns a host file descriptor (>= 3).
    fn open(&mut self, path: String) -> HostCall<i32>;

    fn write(&mut self, fd: i32, data: Vec<u8>) -> HostCall<usize>;

    /// Returns at most `len` bytes.
    fn read(&mut self, fd: i32, len: usize) -> HostCall<Vec<u8>>;

    fn pread(&mut self, fd: i32, len: usize, offset: u64) -> HostCall<Vec<u8>>;

    fn close(&mut self, fd: i32) -> HostResult<()>;
}

/// Utility primitives. None of these may suspend.
pub trait ComputeHost {
    /// Host-defined escape hatch operating in place on a guest buffer.
    fn magic(&mut self, kind: i64, buf: &mut [u8]) -> HostResult<i64>;

    /// Milliseconds since the Unix epoch.
    fn now_ms(&mut self) -> HostResult<i64>;

    fn fill_random(&mut self, buf: &mut [u8]) -> HostResult<()>;

    /// Convert `input` into `output`, returning the number of bytes written.
    fn convert_encoding(&mut self, input: &[u8], output: &mut [u8]) -> HostResult<usize>;

    fn validate_structured(&mut self, data: &[u8]) -> HostResult<()>;
}

/// Socket primitives. Every call suspends.
pub trait NetHost {
    /// Returns the synthetic socket descriptor bound to the connection.
    fn connect(&mut self, fd: i32, addr: SocketAddrV4) -> HostFuture<i32>;

    fn resolve(&mut self, node: String) -> HostFuture<Ipv4Addr>;

    fn write(&mut self, fd: i32, data: Vec<u8>) -> HostFuture<usize>;

    fn read(&mut self, fd: i32, len: usize) -> HostFuture<Vec<u8>>;
}

/// The set of host primitives a dispatcher forwards to.
pub struct HostBridge {
    pub storage: Box<dyn StorageHost>,
    pub compute: Box<dyn ComputeHost>,
    pub net: Box<dyn NetHost>,
}

impl HostBridge {
    pub fn new(
        storage: impl StorageHost + 'static,
        compute: impl ComputeHost + 'static,
        net: impl NetHost + 'static,
    ) -> Self {
        Self {
            storage: Box::new(storage),
            compute: Box::new(compute),
            net: Box::new(net),
        }
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new(UnsupportedStorage, NativeCompute, UnsupportedNet)
    }
}

/// Compute primitives backed by the host process: wall clock, OS randomness, JSON validation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCompute;

impl ComputeHost for NativeCompute {
    fn magic(&mut self, _kind: i64, _buf: &mut [u8]) -> HostResult<i64> {
        Err(HostError::Unsupported("magic"))
    }

    fn now_ms(&mut self) -> HostResult<i64> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| HostError::Failed(err.to_string()))?;
        i64::try_from(since_epoch.as_millis()).map_err(|_| HostError::Errno(Errno::ERANGE))
    }

    fn fill_random(&mut self, buf: &mut [u8]) -> HostResult<()> {
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|err| HostError::Failed(err.to_string()))
    }

    fn convert_encoding(&mut self, input: &[u8], output: &mut [u8]) -> HostResult<usize> {
        std::str::from_utf8(input).map_err(|_| HostError::Errno(Errno::EILSEQ))?;
        let dst = output
            .get_mut(..input.len())
            .ok_or(HostError::Errno(Errno::E2BIG))?;
        dst.copy_from_slice(input);
        Ok(input.len())
    }

    fn validate_structured(&mut self, data: &[u8]) -> HostResult<()> {
        serde_json::from_slice::<serde_json::Value>(data)
            .map(drop)
            .map_err(|_| HostError::Errno(Errno::EINVAL))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStorage;

impl StorageHost for UnsupportedStorage {
    fn open(&mut self, _path: String) -> HostCall<i32> {
        HostCall::fail(HostError::Unsupported("storage"))
    }

    fn write(&mut self, _fd: i32, _data: Vec<u8>) -> HostCall<usize> {
        HostCall::fail(HostError::Unsupported("storage"))
    }

    fn read(&mut self, _fd: i32, _len: usize) -> HostCall<Vec<u8>> {
        HostCall::fail(HostError::Unsupported("storage"))
    }

    fn pread(&mut self, _fd: i32, _len: usize, _offset: u64) -> HostCall<Vec<u8>> {
        HostCall::fail(HostError::Unsupported("storage"))
    }

    fn close(&mut self, _fd: i32) -> HostResult<()> {
        Err(HostError::Unsupported("storage"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedNet;

fn unsupported_net<T: 'static>() -> HostFuture<T> {
    Box::pin(std::future::ready(Err(HostError::Unsupported("net"))))
}

impl NetHost for UnsupportedNet {
    fn connect(&mut self, _fd: i32, _addr: SocketAddrV4) -> HostFuture<i32> {
        unsupported_net()
    }

    fn resolve(&mut self, _node: String) -> HostFuture<Ipv4Addr> {
        unsupported_net()
    }

    fn write(&mut self, _fd: i32, _data: Vec<u8>) -> HostFuture<usize> {
        unsupported_net()
    }

    fn read(&mut self, _fd: i32, _len: usize) -> HostFuture<Vec<u8>> {
        unsupported_net()
    }
}
