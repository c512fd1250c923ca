use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::errno::{Errno, HostResult};
use crate::guest::Guest;
use crate::host::{HostBridge, HostCall, HostFuture};
use crate::numbers::{Band, HypercallId};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Longest NUL-terminated guest string a handler will scan for (path names, host names).
    pub max_cstr_len: usize,
    /// Size of the guest buffer the resolver writes its dotted-quad answer into.
    pub resolve_result_len: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_cstr_len: 4096,
            resolve_result_len: 128,
        }
    }
}

/// Misuse of the dispatcher by the embedder. Never reaches the guest.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{requested} issued while {pending} is still suspended")]
    Busy {
        pending: HypercallId,
        requested: HypercallId,
    },

    #[error("no suspended hypercall to resume")]
    NothingPending,

    #[error("{id} is outside every hypercall band")]
    OutsideBands { id: HypercallId },

    #[error("{band:?} band does not accept {kind:?} handler for {id}")]
    KindMismatch {
        id: HypercallId,
        band: Band,
        kind: HandlerKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Completes before returning to the execution core.
    Sync,
    /// May suspend the execution context until the host primitive completes.
    Async,
}

impl HandlerKind {
    fn allowed_in(self, band: Band) -> bool {
        !matches!(
            (band, self),
            (Band::Compute, HandlerKind::Async) | (Band::Network, HandlerKind::Sync)
        )
    }
}

/// Marshals guest arguments for one hypercall and starts exactly one host primitive.
///
/// An `Err` is an argument the guest got wrong (bad pointer, wrong descriptor) and becomes the
/// guest-visible result directly.
pub type Handler = fn(&mut Call<'_>) -> Result<Outcome, Errno>;

/// Everything a handler may touch while it runs.
pub struct Call<'a> {
    pub id: HypercallId,
    pub host: &'a mut HostBridge,
    pub guest: &'a mut dyn Guest,
    pub config: &'a DispatcherConfig,
}

impl Call<'_> {
    pub fn arg(&self, index: usize) -> u64 {
        self.guest.sysarg(index)
    }

    /// Descriptors are C `int`s; the upper half of the register is ignored.
    pub fn arg_fd(&self, index: usize) -> i32 {
        self.arg(index) as u32 as i32
    }

    pub fn arg_len(&self, index: usize) -> Result<usize, Errno> {
        usize::try_from(self.arg(index)).map_err(|_| Errno::EFAULT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWrite {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// Final result of a hypercall: the scalar for `a0` plus any guest-memory writes that must land
/// before the guest observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: i64,
    pub writes: Vec<GuestWrite>,
}

impl Completion {
    pub fn value(result: i64) -> Self {
        Self {
            result,
            writes: Vec::new(),
        }
    }

    pub fn count(n: usize) -> Self {
        Self::value(i64::try_from(n).unwrap_or(i64::MAX))
    }

    pub fn errno(errno: Errno) -> Self {
        Self::value(errno.result())
    }

    pub fn with_write(mut self, addr: u64, bytes: impl Into<Vec<u8>>) -> Self {
        self.writes.push(GuestWrite {
            addr,
            bytes: bytes.into(),
        });
        self
    }

    /// Result of a read-style primitive that returned `data` for a guest buffer of `max` bytes.
    pub fn filled(addr: u64, max: usize, data: Vec<u8>) -> Self {
        if data.len() > max {
            return Self::errno(Errno::EIO);
        }
        Self::count(data.len()).with_write(addr, data)
    }

    /// Collapse a host primitive's result, logging the failure conversion.
    pub fn from_host<T>(
        id: HypercallId,
        res: HostResult<T>,
        ok: impl FnOnce(T) -> Completion,
    ) -> Self {
        match res {
            Ok(value) => ok(value),
            Err(err) => {
                let errno = err.errno();
                debug!(hypercall = %id, %errno, error = %err, "host primitive failed");
                Self::errno(errno)
            }
        }
    }
}

pub type CompletionFuture = Pin<Box<dyn Future<Output = Completion>>>;

pub enum Outcome {
    Done(Completion),
    Suspend(CompletionFuture),
}

impl Outcome {
    pub fn value(result: i64) -> Self {
        Outcome::Done(Completion::value(result))
    }

    pub fn from_host<T: 'static>(
        id: HypercallId,
        call: HostCall<T>,
        ok: impl FnOnce(T) -> Completion + 'static,
    ) -> Self {
        match call {
            HostCall::Ready(res) => Outcome::Done(Completion::from_host(id, res, ok)),
            HostCall::Pending(fut) => Self::suspend(id, fut, ok),
        }
    }

    pub fn suspend<T: 'static>(
        id: HypercallId,
        fut: HostFuture<T>,
        ok: impl FnOnce(T) -> Completion + 'static,
    ) -> Self {
        Outcome::Suspend(Box::pin(
            fut.map(move |res| Completion::from_host(id, res, ok)),
        ))
    }
}

impl core::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Outcome::Done(c) => f.debug_tuple("Done").field(c).finish(),
            Outcome::Suspend(_) => f.write_str("Suspend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not in any band; the caller should treat it as a native syscall.
    NotHypercall,
    /// The result is already in the guest's result register.
    Completed(i64),
    /// The execution context must stay parked until [`Dispatcher::resume`] completes.
    Suspended,
}

#[derive(Clone, Copy)]
struct Entry {
    kind: HandlerKind,
    handler: Handler,
}

struct PendingCall {
    id: HypercallId,
    future: CompletionFuture,
}

/// Routes hypercall identifiers to handlers and owns the at-most-one suspended call of its
/// execution context.
pub struct Dispatcher {
    host: HostBridge,
    config: DispatcherConfig,
    handlers: BTreeMap<HypercallId, Entry>,
    pending: Option<PendingCall>,
}

impl Dispatcher {
    /// A dispatcher with no handlers; every in-band identifier returns `-ENOSYS`.
    pub fn new(host: HostBridge, config: DispatcherConfig) -> Self {
        Self {
            host,
            config,
            handlers: BTreeMap::new(),
            pending: None,
        }
    }

    pub fn with_default_handlers(host: HostBridge, config: DispatcherConfig) -> Self {
        let mut dispatcher = Self::new(host, config);
        crate::handlers::install_defaults(&mut dispatcher);
        let per_band = Band::ALL.map(|band| {
            dispatcher
                .handlers
                .keys()
                .filter(|id| id.band() == Some(band))
                .count()
        });
        info!(
            storage = per_band[0],
            compute = per_band[1],
            network = per_band[2],
            "hypercall handlers installed"
        );
        dispatcher
    }

    /// Install or replace the handler for `id`, returning whether one was replaced.
    pub fn install(
        &mut self,
        id: HypercallId,
        kind: HandlerKind,
        handler: Handler,
    ) -> Result<bool, DispatchError> {
        let band = id.band().ok_or(DispatchError::OutsideBands { id })?;
        if !kind.allowed_in(band) {
            return Err(DispatchError::KindMismatch { id, band, kind });
        }
        Ok(self.insert_handler(id, kind, handler))
    }

    pub(crate) fn insert_handler(
        &mut self,
        id: HypercallId,
        kind: HandlerKind,
        handler: Handler,
    ) -> bool {
        debug_assert!(id.band().is_some_and(|band| kind.allowed_in(band)));
        self.handlers
            .insert(id, Entry { kind, handler })
            .is_some()
    }

    pub fn handler_kind(&self, id: HypercallId) -> Option<HandlerKind> {
        self.handlers.get(&id).map(|entry| entry.kind)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn host_mut(&mut self) -> &mut HostBridge {
        &mut self.host
    }

    /// The hypercall currently suspended, if any.
    pub fn suspended(&self) -> Option<HypercallId> {
        self.pending.as_ref().map(|pending| pending.id)
    }

    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }

    /// Handle the `ecall` whose number is `number`.
    ///
    /// Host failures and handler panics never escape: they become a negative result in the
    /// guest's result register.
    pub fn dispatch(
        &mut self,
        number: u64,
        guest: &mut dyn Guest,
    ) -> Result<Dispatch, DispatchError> {
        let id = HypercallId(number);
        let Some(band) = id.band() else {
            return Ok(Dispatch::NotHypercall);
        };
        if let Some(pending) = &self.pending {
            return Err(DispatchError::Busy {
                pending: pending.id,
                requested: id,
            });
        }
        let Some(entry) = self.handlers.get(&id).copied() else {
            debug!(hypercall = %id, ?band, "no handler installed");
            let result = Errno::ENOSYS.result();
            guest.set_result(result);
            return Ok(Dispatch::Completed(result));
        };

        trace!(hypercall = %id, "dispatch");
        let caught = {
            let mut call = Call {
                id,
                host: &mut self.host,
                guest: &mut *guest,
                config: &self.config,
            };
            panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(&mut call)))
        };
        let outcome = match caught {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(errno)) => {
                debug!(hypercall = %id, %errno, "rejected guest arguments");
                Outcome::Done(Completion::errno(errno))
            }
            Err(payload) => {
                warn!(hypercall = %id, panic = panic_message(&*payload), "hypercall handler panicked");
                Outcome::Done(Completion::errno(Errno::EIO))
            }
        };

        match outcome {
            Outcome::Done(completion) => Ok(Dispatch::Completed(apply_completion(
                id, guest, completion,
            ))),
            Outcome::Suspend(_) if entry.kind == HandlerKind::Sync => {
                warn!(hypercall = %id, "synchronous handler attempted to suspend");
                let result = Errno::EIO.result();
                guest.set_result(result);
                Ok(Dispatch::Completed(result))
            }
            Outcome::Suspend(future) => {
                let future = AssertUnwindSafe(future).catch_unwind().map(move |res| {
                    res.unwrap_or_else(|payload| {
                        warn!(hypercall = %id, panic = panic_message(&*payload), "suspended host primitive panicked");
                        Completion::errno(Errno::EIO)
                    })
                });
                self.pending = Some(PendingCall {
                    id,
                    future: Box::pin(future),
                });
                trace!(hypercall = %id, "suspended");
                Ok(Dispatch::Suspended)
            }
        }
    }

    /// Poll the suspended hypercall; once it completes its result is written to the guest and
    /// the context may run again.
    pub fn poll_resume(
        &mut self,
        cx: &mut Context<'_>,
        guest: &mut dyn Guest,
    ) -> Poll<Result<i64, DispatchError>> {
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(Err(DispatchError::NothingPending));
        };
        let completion = ready!(pending.future.as_mut().poll(cx));
        let id = pending.id;
        self.pending = None;
        Poll::Ready(Ok(apply_completion(id, guest, completion)))
    }

    pub async fn resume(&mut self, guest: &mut dyn Guest) -> Result<i64, DispatchError> {
        std::future::poll_fn(|cx| self.poll_resume(cx, guest)).await
    }
}

fn apply_completion(id: HypercallId, guest: &mut dyn Guest, completion: Completion) -> i64 {
    let mut result = completion.result;
    for write in &completion.writes {
        if let Err(errno) = guest.write_bytes(write.addr, &write.bytes) {
            debug!(hypercall = %id, addr = write.addr, len = write.bytes.len(), %errno, "result write-back failed");
            result = errno.result();
            break;
        }
    }
    guest.set_result(result);
    trace!(hypercall = %id, result, "completed");
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}
