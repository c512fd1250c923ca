use crate::dispatch::{Call, Completion, Outcome};
use crate::errno::Errno;

pub(super) fn magic(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let kind = call.arg(0) as i64;
    let (addr, len) = (call.arg(1), call.arg_len(2)?);
    let buf = call.guest.view_mut(addr, len)?;
    let res = call.host.compute.magic(kind, buf);
    Ok(Outcome::Done(Completion::from_host(
        call.id,
        res,
        Completion::value,
    )))
}

pub(super) fn memmove(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let (dst, src, len) = (call.arg(0), call.arg(1), call.arg_len(2)?);
    let result = i64::try_from(dst).map_err(|_| Errno::EFAULT)?;
    call.guest.copy_within(dst, src, len)?;
    Ok(Outcome::value(result))
}

/// Fills a guest `struct timeval { i64 tv_sec; i64 tv_usec; }`. A null pointer is accepted and
/// ignored, as `gettimeofday(NULL, ...)` is.
pub(super) fn gettimeofday(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let addr = call.arg(0);
    if addr == 0 {
        return Ok(Outcome::value(0));
    }
    call.guest.view(addr, 16)?;
    let res = call.host.compute.now_ms();
    Ok(Outcome::Done(Completion::from_host(call.id, res, |ms| {
        let sec = ms.div_euclid(1000);
        let usec = ms.rem_euclid(1000) * 1000;
        Completion::value(0)
            .with_write(addr, sec.to_le_bytes())
            .with_write(addr + 8, usec.to_le_bytes())
    })))
}

pub(super) fn getrandom(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let (addr, len) = (call.arg(0), call.arg_len(1)?);
    let buf = call.guest.view_mut(addr, len)?;
    let res = call.host.compute.fill_random(buf);
    Ok(Outcome::Done(Completion::from_host(call.id, res, |()| {
        Completion::count(len)
    })))
}

pub(super) fn convert_encoding(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let input = call.guest.view(call.arg(0), call.arg_len(1)?)?.to_vec();
    let output = call.guest.view_mut(call.arg(2), call.arg_len(3)?)?;
    let res = call.host.compute.convert_encoding(&input, output);
    Ok(Outcome::Done(Completion::from_host(
        call.id,
        res,
        Completion::count,
    )))
}

pub(super) fn validate_json(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let data = call.guest.view(call.arg(0), call.arg_len(1)?)?;
    let res = call.host.compute.validate_structured(data);
    Ok(Outcome::Done(Completion::from_host(call.id, res, |()| {
        Completion::value(0)
    })))
}
