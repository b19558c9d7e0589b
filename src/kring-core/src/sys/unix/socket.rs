use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::{io, mem, ptr};

use libc::{c_int, sockaddr_storage, socklen_t};

/// Backlog used by [`tcp_listener`] callers that have no preference.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Creates a socket. The descriptor is always close-on-exec; pass `libc::SOCK_NONBLOCK` in
/// `ty` for a non-blocking one.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(domain, ty | libc::SOCK_CLOEXEC, protocol))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The address family matching `addr`.
pub fn domain(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Binds `fd` to `addr`.
pub fn bind(fd: impl AsFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = to_raw(addr);
    syscall!(bind(fd.as_fd().as_raw_fd(), ptr::addr_of!(raw).cast(), len))?;

    Ok(())
}

/// Marks `fd` as accepting connections.
pub fn listen(fd: impl AsFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd.as_fd().as_raw_fd(), backlog))?;

    Ok(())
}

/// Connects `fd` to `addr`. On a non-blocking socket this usually fails with
/// `EINPROGRESS`; wait for writability and check [`take_error`] afterwards.
pub fn connect(fd: impl AsFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = to_raw(addr);
    syscall!(connect(fd.as_fd().as_raw_fd(), ptr::addr_of!(raw).cast(), len))?;

    Ok(())
}

/// The address `fd` is bound to.
pub fn local_addr(fd: impl AsFd) -> io::Result<SocketAddr> {
    let mut raw: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    syscall!(getsockname(
        fd.as_fd().as_raw_fd(),
        ptr::addr_of_mut!(raw).cast(),
        ptr::addr_of_mut!(len)
    ))?;

    from_raw(&raw)
}

/// The address `fd` is connected to.
pub fn peer_addr(fd: impl AsFd) -> io::Result<SocketAddr> {
    let mut raw: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    syscall!(getpeername(
        fd.as_fd().as_raw_fd(),
        ptr::addr_of_mut!(raw).cast(),
        ptr::addr_of_mut!(len)
    ))?;

    from_raw(&raw)
}

/// Reads an integer socket option.
pub fn getsockopt_int(fd: impl AsFd, level: c_int, name: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    syscall!(getsockopt(
        fd.as_fd().as_raw_fd(),
        level,
        name,
        ptr::addr_of_mut!(value).cast(),
        ptr::addr_of_mut!(len)
    ))?;

    Ok(value)
}

/// Sets an integer socket option.
pub fn setsockopt_int(fd: impl AsFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    syscall!(setsockopt(
        fd.as_fd().as_raw_fd(),
        level,
        name,
        ptr::addr_of!(value).cast(),
        mem::size_of::<c_int>() as socklen_t,
    ))?;

    Ok(())
}

/// Reads and clears the pending socket error (`SO_ERROR`).
pub fn take_error(fd: impl AsFd) -> io::Result<Option<io::Error>> {
    let errno = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if errno == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(errno)))
    }
}

/// A listening TCP socket on `addr` with `SO_REUSEADDR` and `SO_REUSEPORT` set.
pub fn tcp_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let fd = socket(domain(&addr), libc::SOCK_STREAM, 0)?;
    setsockopt_int(&fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(&fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;

    bind(&fd, &addr)?;
    listen(&fd, backlog)?;

    Ok(TcpListener::from(fd))
}

fn to_raw(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(addr) => {
            let socket_address = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*addr.ip()).to_be(),
                },
                sin_zero: [0u8; 8],
            };
            // sockaddr_storage is large and aligned enough for every address family
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), socket_address) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let socket_address = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast(), socket_address) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

fn from_raw(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
        }
        libc::AF_INET6 => {
            let raw = unsafe { &*(storage as *const sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(raw.sin6_addr.s6_addr),
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
}
