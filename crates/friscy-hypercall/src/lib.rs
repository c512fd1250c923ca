//! Numeric call boundary between a RISC-V guest and host-native capabilities.
//!
//! A guest issues `ecall` with an identifier in one of three bands (see [`Band`]). The
//! [`Dispatcher`] marshals arguments out of guest registers and memory, starts exactly one host
//! primitive and writes one scalar back: non-negative on success, `-errno` on failure. Host
//! failures and panics are contained at the dispatcher boundary; they never unwind through the
//! execution core.
//!
//! Primitives that need to wait (network, most storage) suspend the execution context. The
//! dispatcher then holds the pending call until the embedder drives [`Dispatcher::resume`], and
//! refuses to start another one in the meantime.

mod dispatch;
mod errno;
mod guest;
mod handlers;
mod host;
mod numbers;
mod route;

pub use crate::dispatch::{
    Call, Completion, CompletionFuture, Dispatch, DispatchError, Dispatcher, DispatcherConfig,
    GuestWrite, Handler, HandlerKind, Outcome,
};
pub use crate::errno::{Errno, HostError, HostResult};
pub use crate::guest::{guest_range, Guest};
pub use crate::host::{
    ComputeHost, HostBridge, HostCall, HostFuture, NativeCompute, NetHost, StorageHost,
    UnsupportedNet, UnsupportedStorage,
};
pub use crate::numbers::{Band, HypercallId};
pub use crate::route::{
    is_socket_fd, memmove_offloads, route_fd, shim_hypercall, FdRoute, ShimOp, FIRST_ROUTED_FD,
    JSON_CHANNEL_FD, MEMMOVE_OFFLOAD_THRESHOLD, SOCKET_FD_WINDOW,
};
