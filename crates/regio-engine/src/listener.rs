//! Listening socket setup.

use regio_core::error::{RegioError, Result};

use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, OwnedFd};

use crate::config::EngineConfig;

fn setsockopt_int(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(RegioError::last_os_error(RegioError::Socket));
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Create, configure, bind and listen on `config.listen_addr`.
///
/// `SO_REUSEADDR` is always set. Unless `use_nagle`, `TCP_NODELAY` is set
/// on the listener as well so accepted sockets inherit it.
pub fn bind(config: &EngineConfig) -> Result<TcpListener> {
    let addr = config.listen_addr;
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };

    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(RegioError::last_os_error(RegioError::Socket));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    setsockopt_int(&fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    if !config.use_nagle {
        setsockopt_int(&fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }

    let (storage, len) = sockaddr_of(&addr);
    let rc = unsafe {
        libc::bind(
            raw,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(RegioError::last_os_error(RegioError::Socket));
    }

    let backlog = config.accept_backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    if unsafe { libc::listen(raw, backlog) } < 0 {
        return Err(RegioError::last_os_error(RegioError::Socket));
    }

    Ok(TcpListener::from(fd))
}
