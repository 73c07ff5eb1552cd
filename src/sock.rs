//! Socket lifecycle: create, adopt, close.
//!
//! Everything here installs or tears down registry entries around the
//! raw descriptor syscalls. All sockets managed by this crate are
//! non-blocking; readiness is the reactor's business, not ours.

use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::ptr;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, is_transient};
use crate::uuid::Uuid;
use crate::{connection, flush, hook};

/// Open a listening non-blocking socket and return its UUID.
///
/// Resolves `host:port`, enables address reuse, binds every resolved
/// address of the socket's family in order (at least one must succeed)
/// and listens with the system's maximum backlog.
pub fn listen(host: &str, port: u16) -> Result<Uuid, Error> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let Some(first) = addrs.first().copied() else {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no addresses resolved",
        )));
    };
    let fd = new_stream_socket(&first)?;

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut bound = false;
    for addr in addrs.iter().filter(|a| a.is_ipv4() == first.is_ipv4()) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
        let ret = unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret == 0 {
            bound = true;
        }
    }
    if !bound {
        return Err(close_with_last_error(fd));
    }

    if unsafe { libc::listen(fd, libc::SOMAXCONN) } < 0 {
        return Err(close_with_last_error(fd));
    }

    connection::clear(fd, true);
    Ok(connection::uuid_of(fd))
}

/// Accept a connection from a listening socket's UUID.
///
/// The new socket is made non-blocking — atomically where the platform
/// supports it — installed in the registry, and its UUID returned.
pub fn accept(srv_uuid: Uuid) -> Result<Uuid, Error> {
    let _ = connection::slot_for(srv_uuid)?;
    let srv_fd = srv_uuid.fd();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let client = unsafe {
        libc::accept4(
            srv_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let client = unsafe { libc::accept(srv_fd, ptr::null_mut(), ptr::null_mut()) };

    if client < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                Error::ResourceLimit("descriptor table full while accepting".into())
            }
            _ => Error::Io(err),
        });
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if let Err(err) = set_non_block(client) {
        unsafe { libc::close(client) };
        return Err(Error::Io(err));
    }

    connection::clear(client, true);
    Ok(connection::uuid_of(client))
}

/// Initiate a non-blocking client connection and return its UUID.
///
/// The connection is usually still in progress when this returns
/// (`EINPROGRESS` is success); use the reactor or a flush/read cycle to
/// learn when it is established.
pub fn connect(host: &str, port: u16) -> Result<Uuid, Error> {
    let Some(addr) = (host, port).to_socket_addrs()?.next() else {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no addresses resolved",
        )));
    };
    let fd = new_stream_socket(&addr)?;

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(&addr, &mut storage);
    let ret = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
    }

    connection::clear(fd, true);
    Ok(connection::uuid_of(fd))
}

/// Adopt an externally created descriptor, re-initialising its registry
/// entry as open. The previous occupant's packets are released and its
/// hooks notified, exactly as on a close.
pub fn open(fd: RawFd) -> Result<Uuid, Error> {
    if fd < 0 {
        return Err(Error::InvalidConnection);
    }
    connection::clear(fd, true);
    Ok(connection::uuid_of(fd))
}

/// Read through the connection's hook.
///
/// `Ok(0)` means no data is available right now (the socket is
/// non-blocking). End-of-stream and fatal errors force-close the
/// connection and return an error. Note that a transport hook may hold
/// buffered data the kernel has already delivered.
pub fn read(uuid: Uuid, buf: &mut [u8]) -> Result<usize, Error> {
    let slot = connection::slot_for(uuid)?;
    let result = {
        let state = slot.state.lock();
        if !state.open {
            return Err(Error::InvalidConnection);
        }
        let hooks = Arc::clone(&state.hooks);
        hooks.read(uuid, buf)
    };
    match result {
        Ok(n) if n > 0 => {
            hook::reactor().touch(uuid);
            Ok(n)
        }
        Ok(_) => {
            // Orderly shutdown by the peer.
            force_close(uuid);
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection closed by peer",
            )))
        }
        Err(err) if is_transient(&err) => Ok(0),
        Err(err) => {
            force_close(uuid);
            Err(Error::Io(err))
        }
    }
}

/// Mark the connection for closure once its queue drains, then flush.
pub fn close(uuid: Uuid) {
    let Ok(slot) = connection::slot_for(uuid) else {
        return;
    };
    {
        let mut state = slot.state.lock();
        if !state.open {
            return;
        }
        state.close_pending = true;
    }
    let _ = flush::flush(uuid);
}

/// Close immediately: shut down both directions, close the descriptor,
/// clear the registry entry. Queued packets are discarded (their release
/// functions still run) and the UUID is invalidated.
pub fn force_close(uuid: Uuid) {
    if connection::slot_for(uuid).is_err() {
        return;
    }
    hook::reactor().remove(uuid);
    let fd = uuid.fd();
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
    connection::clear(fd, false);
    hook::reactor().on_close(uuid);
}

/// Switch a descriptor to non-blocking mode.
pub fn set_non_block(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    let flags = if flags < 0 { 0 } else { flags };
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The highest number of descriptors this process may hold.
///
/// The first call raises the soft `RLIMIT_NOFILE` to the hard limit and
/// caches the resulting ceiling; later calls are memoised.
pub fn max_capacity() -> usize {
    static CEILING: OnceLock<usize> = OnceLock::new();
    *CEILING.get_or_init(|| {
        let mut ceiling = {
            let v = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
            if v > 0 { v as usize } else { 1024 }
        };
        let mut rlim: libc::rlimit = unsafe { mem::zeroed() };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0 {
            rlim.rlim_cur = rlim.rlim_max;
            unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
            if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0
                && rlim.rlim_cur != libc::RLIM_INFINITY
            {
                ceiling = ceiling.max(rlim.rlim_cur as usize);
            }
        }
        ceiling
    })
}

fn new_stream_socket(addr: &SocketAddr) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if let Err(err) = set_non_block(fd) {
        unsafe { libc::close(fd) };
        return Err(Error::Io(err));
    }
    Ok(fd)
}

fn close_with_last_error(fd: RawFd) -> Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    Error::Io(err)
}

/// Fill a `sockaddr_storage` from a Rust `SocketAddr`.
fn socket_addr_to_sockaddr(
    addr: &SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}
