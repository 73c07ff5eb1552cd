//! Read/write hooks and reactor collaborator callbacks.
//!
//! A [`RwHook`] is the seam where a transport layer (e.g., TLS) plugs in:
//! the flush engine and `read` never touch the descriptor directly, they
//! go through the installed hook. [`DefaultHooks`] is the direct-syscall
//! set installed on every fresh registry entry.
//!
//! The [`Reactor`] trait is the inverse seam: process-wide callbacks an
//! event reactor or scheduler registers once to observe closes and
//! activity. Both default to no-ops.

use std::io;
use std::sync::{Arc, OnceLock};

use crate::connection;
use crate::error::Error;
use crate::uuid::Uuid;

/// Pluggable per-connection I/O functions.
///
/// `read` and `write` are required; `flush` and `on_clear` fall back to
/// the defaults below, so a transport layer only implements what it
/// needs. All four may be invoked while the connection lock is held —
/// implementations must not call back into the sockline API for the same
/// connection.
pub trait RwHook: Send + Sync {
    /// Read up to `buf.len()` bytes from the transport.
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` to the transport, returning the bytes accepted.
    fn write(&self, uuid: Uuid, buf: &[u8]) -> io::Result<usize>;

    /// Push transport-internal buffered data toward the kernel.
    ///
    /// Returns the number of bytes still deferred inside the transport:
    /// `Ok(0)` means nothing left to flush.
    fn flush(&self, uuid: Uuid) -> io::Result<usize> {
        let _ = uuid;
        Ok(0)
    }

    /// Release hook-local state. Called exactly once, with the UUID that
    /// is about to expire, when the connection's registry slot is
    /// cleared.
    fn on_clear(&self, uuid: Uuid) {
        let _ = uuid;
    }
}

/// The direct-syscall hook set: plain `read(2)`/`write(2)` on the UUID's
/// descriptor.
pub(crate) struct DefaultHooks;

impl RwHook for DefaultHooks {
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(uuid.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, uuid: Uuid, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(uuid.fd(), buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// The shared default hook instance. A single allocation so hook
/// identity checks in `rw_hook_get` are pointer comparisons.
pub(crate) fn default_hooks() -> Arc<dyn RwHook> {
    static DEFAULT: OnceLock<Arc<dyn RwHook>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(DefaultHooks)).clone()
}

pub(crate) fn is_default(hooks: &Arc<dyn RwHook>) -> bool {
    Arc::ptr_eq(hooks, &default_hooks())
}

/// Get the hook set installed on a connection.
///
/// Returns `None` when the connection is invalid, closed, or still using
/// the default syscall hooks.
pub fn rw_hook_get(uuid: Uuid) -> Option<Arc<dyn RwHook>> {
    let slot = connection::slot_for(uuid).ok()?;
    let state = slot.state.lock();
    if !state.open || is_default(&state.hooks) {
        return None;
    }
    Some(Arc::clone(&state.hooks))
}

/// Install a hook set on a connection, replacing the previous one.
///
/// Methods the implementation does not override keep the trait defaults
/// (no-op `flush` and `on_clear`).
pub fn rw_hook_set(uuid: Uuid, hooks: Arc<dyn RwHook>) -> Result<(), Error> {
    let slot = connection::slot_for(uuid)?;
    let mut state = slot.state.lock();
    if !state.open {
        return Err(Error::InvalidConnection);
    }
    state.hooks = hooks;
    Ok(())
}

/// Process-wide collaborator callbacks, registered once by an event
/// reactor or scheduler. Every method defaults to a no-op.
pub trait Reactor: Send + Sync {
    /// A descriptor was closed and its registry slot cleared.
    fn on_close(&self, uuid: Uuid) {
        let _ = uuid;
    }

    /// A connection is about to be closed; deregister it from event
    /// polling.
    fn remove(&self, uuid: Uuid) {
        let _ = uuid;
    }

    /// Activity was observed on a connection; refresh its timeout.
    fn touch(&self, uuid: Uuid) {
        let _ = uuid;
    }
}

struct NoopReactor;

impl Reactor for NoopReactor {}

static NOOP_REACTOR: NoopReactor = NoopReactor;
static REACTOR: OnceLock<&'static dyn Reactor> = OnceLock::new();

/// Register the process-wide reactor. The first call wins; returns
/// `false` when a reactor was already installed.
pub fn set_reactor(reactor: &'static dyn Reactor) -> bool {
    REACTOR.set(reactor).is_ok()
}

pub(crate) fn reactor() -> &'static dyn Reactor {
    REACTOR.get().copied().unwrap_or(&NOOP_REACTOR)
}
