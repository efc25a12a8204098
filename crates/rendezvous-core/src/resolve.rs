//! Name resolution for the chief's (host, service) address.
//!
//! `std::net::ToSocketAddrs` only accepts a numeric port, but the wire
//! protocol's addressing contract (§6) promises both participants can pass a
//! textual service name, not just a port number. This goes straight to
//! `getaddrinfo(3)`, the same call `std` makes internally, but with
//! `AI_PASSIVE`/service-name support exposed.

use std::{ffi::CString, mem::MaybeUninit, net::SocketAddr, ptr};

use crate::error::OpenError;

/// Resolves `host:svc` to every address the resolver returns, preserving
/// the order `getaddrinfo` produced it in (workers dial in that order; the
/// chief binds the first one that succeeds).
pub(crate) fn resolve(host: &str, svc: &str) -> Result<Vec<SocketAddr>, OpenError> {
    let chost = CString::new(host).map_err(|_| OpenError::ResolveFailed)?;
    let cservice = CString::new(svc).map_err(|_| OpenError::ResolveFailed)?;

    let mut hints: libc::addrinfo = unsafe { MaybeUninit::zeroed().assume_init() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_protocol = libc::IPPROTO_TCP;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: `chost`/`cservice` are valid NUL-terminated C strings for the
    // duration of the call; `res` is freed below on every return path.
    let rc = unsafe {
        libc::getaddrinfo(chost.as_ptr(), cservice.as_ptr(), &hints, &mut res)
    };
    if rc != 0 {
        return Err(OpenError::ResolveFailed);
    }

    let mut addrs = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        // SAFETY: `cur` came from the linked list `getaddrinfo` just built
        // and is non-null; `ai_addr`/`ai_addrlen` describe a valid sockaddr
        // of the advertised family.
        let info = unsafe { &*cur };
        if let Some(addr) = sockaddr_to_socket_addr(info) {
            addrs.push(addr);
        }
        cur = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };

    if addrs.is_empty() { Err(OpenError::ResolveFailed) } else { Ok(addrs) }
}

fn sockaddr_to_socket_addr(info: &libc::addrinfo) -> Option<SocketAddr> {
    // SAFETY: `ai_addr` is valid for `ai_addrlen` bytes for the lifetime of
    // the enclosing addrinfo list entry.
    unsafe {
        match info.ai_family {
            libc::AF_INET => {
                let sa = info.ai_addr.cast::<libc::sockaddr_in>().read_unaligned();
                let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
            }
            libc::AF_INET6 => {
                let sa = info.ai_addr.cast::<libc::sockaddr_in6>().read_unaligned();
                let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
                Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_localhost_numeric_port() {
        let addrs = resolve("localhost", "0").expect("localhost should always resolve");
        assert!(!addrs.is_empty());
    }

    #[test]
    fn unresolvable_host_is_an_error() {
        let err = resolve("this-host-should-never-exist.invalid", "0");
        assert!(err.is_err());
    }
}
