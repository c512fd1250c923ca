use crate::dispatch::{Call, Completion, Outcome};
use crate::errno::Errno;

use super::storage_fd;

pub(super) fn open(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let path = call.guest.read_cstr(call.arg(0), call.config.max_cstr_len)?;
    let path = String::from_utf8(path).map_err(|_| Errno::EINVAL)?;
    let pending = call.host.storage.open(path);
    Ok(Outcome::from_host(call.id, pending, |fd| {
        Completion::value(fd.into())
    }))
}

pub(super) fn write(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = storage_fd(call.arg_fd(0))?;
    let len = call.arg_len(2)?;
    let data = call.guest.view(call.arg(1), len)?.to_vec();
    let pending = call.host.storage.write(fd, data);
    Ok(Outcome::from_host(call.id, pending, Completion::count))
}

pub(super) fn read(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = storage_fd(call.arg_fd(0))?;
    let (addr, len) = (call.arg(1), call.arg_len(2)?);
    call.guest.view(addr, len)?;
    let pending = call.host.storage.read(fd, len);
    Ok(Outcome::from_host(call.id, pending, move |data| {
        Completion::filled(addr, len, data)
    }))
}

pub(super) fn pread(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = storage_fd(call.arg_fd(0))?;
    let (addr, len) = (call.arg(1), call.arg_len(2)?);
    let offset = call.arg(3);
    if (offset as i64) < 0 {
        return Err(Errno::EINVAL);
    }
    call.guest.view(addr, len)?;
    let pending = call.host.storage.pread(fd, len, offset);
    Ok(Outcome::from_host(call.id, pending, move |data| {
        Completion::filled(addr, len, data)
    }))
}

pub(super) fn close(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = storage_fd(call.arg_fd(0))?;
    let res = call.host.storage.close(fd);
    if res.is_ok() {
        call.guest.kernel_mut().forget_descriptor(fd);
    }
    Ok(Outcome::Done(Completion::from_host(call.id, res, |()| {
        Completion::value(0)
    })))
}
