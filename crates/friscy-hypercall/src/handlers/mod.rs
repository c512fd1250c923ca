//! Built-in handler table.

mod compute;
mod net;
mod storage;

use crate::dispatch::{Dispatcher, Handler, HandlerKind};
use crate::errno::Errno;
use crate::numbers::HypercallId;
use crate::route::{is_socket_fd, FIRST_ROUTED_FD};

pub(crate) fn install_defaults(dispatcher: &mut Dispatcher) {
    use HandlerKind::{Async, Sync};

    let table: [(HypercallId, HandlerKind, Handler); 15] = [
        (HypercallId::OPEN, Async, storage::open),
        (HypercallId::WRITE, Async, storage::write),
        (HypercallId::READ, Async, storage::read),
        (HypercallId::CLOSE, Sync, storage::close),
        (HypercallId::PREAD, Async, storage::pread),
        (HypercallId::MAGIC, Sync, compute::magic),
        (HypercallId::MEMMOVE, Sync, compute::memmove),
        (HypercallId::GETTIMEOFDAY, Sync, compute::gettimeofday),
        (HypercallId::GETRANDOM, Sync, compute::getrandom),
        (HypercallId::CONVERT_ENCODING, Sync, compute::convert_encoding),
        (HypercallId::VALIDATE_JSON, Sync, compute::validate_json),
        (HypercallId::NET_CONNECT, Async, net::connect),
        (HypercallId::NET_RESOLVE, Async, net::resolve),
        (HypercallId::NET_WRITE, Async, net::write),
        (HypercallId::NET_READ, Async, net::read),
    ];
    for (id, kind, handler) in table {
        dispatcher.insert_handler(id, kind, handler);
    }
}

fn storage_fd(fd: i32) -> Result<i32, Errno> {
    if fd < FIRST_ROUTED_FD {
        return Err(Errno::EBADF);
    }
    Ok(fd)
}

fn socket_fd(fd: i32) -> Result<i32, Errno> {
    if !is_socket_fd(fd) {
        return Err(Errno::EBADF);
    }
    Ok(fd)
}
