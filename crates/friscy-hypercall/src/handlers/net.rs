use std::net::{Ipv4Addr, SocketAddrV4};

use crate::dispatch::{Call, Completion, Outcome};
use crate::errno::Errno;
use crate::route::is_socket_fd;

use super::socket_fd;

const AF_INET: u16 = 2;
const SOCKADDR_IN_LEN: usize = 16;

/// Decode a guest `struct sockaddr_in` (family little-endian, port and address big-endian).
fn sockaddr_in(raw: &[u8]) -> Result<SocketAddrV4, Errno> {
    let raw: &[u8; SOCKADDR_IN_LEN] = raw.try_into().map_err(|_| Errno::EINVAL)?;
    if u16::from_le_bytes([raw[0], raw[1]]) != AF_INET {
        return Err(Errno::EAFNOSUPPORT);
    }
    let port = u16::from_be_bytes([raw[2], raw[3]]);
    let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
    Ok(SocketAddrV4::new(ip, port))
}

pub(super) fn connect(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = call.arg_fd(0);
    if call.arg_len(2)? < SOCKADDR_IN_LEN {
        return Err(Errno::EINVAL);
    }
    let addr = sockaddr_in(call.guest.view(call.arg(1), SOCKADDR_IN_LEN)?)?;
    let pending = call.host.net.connect(fd, addr);
    Ok(Outcome::suspend(call.id, pending, |sock| {
        if is_socket_fd(sock) {
            Completion::value(sock.into())
        } else {
            Completion::errno(Errno::EIO)
        }
    }))
}

/// `(node, service, hints, res)`: only `node` and `res` are used. The first IPv4 answer is
/// written to `res` as a NUL-terminated dotted quad. A null `res` still resolves but writes
/// nothing back.
pub(super) fn resolve(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let node = call.guest.read_cstr(call.arg(0), call.config.max_cstr_len)?;
    let node = String::from_utf8(node).map_err(|_| Errno::EINVAL)?;
    let res_addr = call.arg(3);
    let res_len = call.config.resolve_result_len;
    if res_addr != 0 {
        call.guest.view(res_addr, res_len)?;
    }
    let pending = call.host.net.resolve(node);
    Ok(Outcome::suspend(call.id, pending, move |ip| {
        if res_addr == 0 {
            return Completion::value(0);
        }
        let mut text = ip.to_string().into_bytes();
        text.push(0);
        if text.len() > res_len {
            return Completion::errno(Errno::ERANGE);
        }
        Completion::value(0).with_write(res_addr, text)
    }))
}

pub(super) fn write(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = socket_fd(call.arg_fd(0))?;
    let data = call.guest.view(call.arg(1), call.arg_len(2)?)?.to_vec();
    let pending = call.host.net.write(fd, data);
    Ok(Outcome::suspend(call.id, pending, Completion::count))
}

pub(super) fn read(call: &mut Call<'_>) -> Result<Outcome, Errno> {
    let fd = socket_fd(call.arg_fd(0))?;
    let (addr, len) = (call.arg(1), call.arg_len(2)?);
    call.guest.view(addr, len)?;
    let pending = call.host.net.read(fd, len);
    Ok(Outcome::suspend(call.id, pending, move |data| {
        Completion::filled(addr, len, data)
    }))
}
