//! Raw TCP socket helpers over libc.
//!
//! Creation, option setting, and address plumbing shared by listeners and
//! connections. Failures surface as `io::Error` and are classified by the
//! caller.

use crate::addr::AddressV4;

use libc::{
    AF_INET, IPPROTO_TCP, SO_LINGER, SO_REUSEADDR, SOCK_STREAM, SOL_SOCKET, TCP_DEFER_ACCEPT,
    TCP_NODELAY, c_int, c_void, sockaddr, sockaddr_in, sockaddr_storage, socklen_t,
};
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Creates a TCP socket whose descriptor closes when the handle drops.
pub(crate) fn tcp_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(AF_INET, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn set_reuse_addr(fd: RawFd, enabled: bool) -> io::Result<()> {
    set_option(fd, SOL_SOCKET, SO_REUSEADDR, &(enabled as c_int))
}

/// Enables lingering close with a bounded grace period.
pub(crate) fn set_linger(fd: RawFd, grace_secs: u16) -> io::Result<()> {
    let value = libc::linger {
        l_onoff: 1,
        l_linger: grace_secs as c_int,
    };

    set_option(fd, SOL_SOCKET, SO_LINGER, &value)
}

pub(crate) fn set_nodelay(fd: RawFd, enabled: bool) -> io::Result<()> {
    set_option(fd, IPPROTO_TCP, TCP_NODELAY, &(enabled as c_int))
}

/// Holds accept completions back until the peer sends data.
pub(crate) fn set_defer_accept(fd: RawFd, seconds: c_int) -> io::Result<()> {
    set_option(fd, IPPROTO_TCP, TCP_DEFER_ACCEPT, &seconds)
}

pub(crate) fn bind(fd: RawFd, address: AddressV4, port: u16) -> io::Result<()> {
    let addr = sockaddr_in_for(address, port);
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Port the socket actually bound to, needed after binding port 0.
pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<sockaddr_in>() as socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut sockaddr, &mut length) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(u16::from_be(addr.sin_port))
}

pub(crate) fn sockaddr_in_for(address: AddressV4, port: u16) -> sockaddr_in {
    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = address.s_addr();

    addr
}

/// Recovers the peer endpoint the kernel wrote during an accept.
pub(crate) fn peer_endpoint(
    storage: &sockaddr_storage,
    length: socklen_t,
) -> Option<(AddressV4, u16)> {
    if storage.ss_family != AF_INET as libc::sa_family_t
        || (length as usize) < mem::size_of::<sockaddr_in>()
    {
        return None;
    }

    let addr = unsafe { *(storage as *const sockaddr_storage as *const sockaddr_in) };

    Some((
        AddressV4::from_s_addr(addr.sin_addr.s_addr),
        u16::from_be(addr.sin_port),
    ))
}

/// Half-closes both directions, forcing outstanding operations to land.
pub(crate) fn shutdown_both(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

/// Closes a descriptor the crate received raw and never wrapped.
pub(crate) fn close_raw(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn set_option<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
