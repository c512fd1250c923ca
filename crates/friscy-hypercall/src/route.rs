//! Descriptor routing shared with the guest-resident shim.
//!
//! The shim intercepts `read`/`write`/`pread`/`close` and `memmove` inside the guest and turns
//! them into hypercalls using exactly this table. The constants are a wire contract with
//! guest binaries already built against them.

use core::ops::Range;

use crate::numbers::HypercallId;

/// Descriptors below this pass straight through to the native syscall path.
pub const FIRST_ROUTED_FD: i32 = 3;

/// Descriptor the guest writes JSON documents to.
pub const JSON_CHANNEL_FD: i32 = 99;

/// Synthetic socket descriptors handed out by the network band.
pub const SOCKET_FD_WINDOW: Range<i32> = 500..600;

/// `memmove` calls longer than this are offloaded to [`HypercallId::MEMMOVE`].
pub const MEMMOVE_OFFLOAD_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdRoute {
    /// stdio; handled natively.
    Passthrough,
    Storage,
    Socket,
    JsonChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimOp {
    Read,
    Write,
    Pread,
    Close,
}

pub fn is_socket_fd(fd: i32) -> bool {
    SOCKET_FD_WINDOW.contains(&fd)
}

pub fn route_fd(fd: i32) -> FdRoute {
    match fd {
        fd if fd < FIRST_ROUTED_FD => FdRoute::Passthrough,
        JSON_CHANNEL_FD => FdRoute::JsonChannel,
        fd if is_socket_fd(fd) => FdRoute::Socket,
        _ => FdRoute::Storage,
    }
}

/// Hypercall the shim issues for `op` on `fd`, or `None` when it falls back to the native call.
pub fn shim_hypercall(op: ShimOp, fd: i32) -> Option<HypercallId> {
    let route = route_fd(fd);
    match (op, route) {
        (_, FdRoute::Passthrough) => None,
        (ShimOp::Write, FdRoute::JsonChannel) => Some(HypercallId::VALIDATE_JSON),
        (ShimOp::Write, FdRoute::Socket) => Some(HypercallId::NET_WRITE),
        (ShimOp::Write, _) => Some(HypercallId::WRITE),
        (ShimOp::Read, FdRoute::Socket) => Some(HypercallId::NET_READ),
        (ShimOp::Read, _) => Some(HypercallId::READ),
        (ShimOp::Pread, _) => Some(HypercallId::PREAD),
        (ShimOp::Close, _) => Some(HypercallId::CLOSE),
    }
}

pub fn memmove_offloads(len: usize) -> bool {
    len > MEMMOVE_OFFLOAD_THRESHOLD
}
