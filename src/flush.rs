//! The flush engine.
//!
//! Drains a connection's queue under its lock: first the transport
//! hook's own deferred bytes, then the head packet's writer, until the
//! kernel refuses more or the queue empties. Transient errors end a
//! flush cleanly; anything else force-closes the connection.

use std::io;
use std::sync::Arc;

use crate::error::{Error, is_transient};
use crate::uuid::Uuid;
use crate::{connection, hook, metrics, packet, sock};

/// Write queued data toward the kernel.
///
/// Returns `Ok(())` both when everything drained and when the connection
/// blocked part-way (transient conditions are not errors). A fatal I/O
/// error force-closes the connection and is returned. When a graceful
/// close is pending and the queue has drained, the connection is closed
/// before returning.
pub fn flush(uuid: Uuid) -> Result<(), Error> {
    let slot = connection::slot_for(uuid)?;
    let mut progressed = false;
    let mut fatal: Option<io::Error> = None;
    let mut close_now = false;
    {
        let mut state = slot.state.lock();
        if !state.open || slot.generation() != uuid.generation() {
            return Err(Error::InvalidConnection);
        }
        let hooks = Arc::clone(&state.hooks);
        'retry: loop {
            // A transport layer may hold deferred bytes of its own;
            // those go out before the next packet.
            loop {
                match hooks.flush(uuid) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue 'retry,
                    Err(err) if is_transient(&err) => break 'retry,
                    Err(err) => {
                        fatal = Some(err);
                        break 'retry;
                    }
                }
            }
            loop {
                if state.queue.is_empty() {
                    break 'retry;
                }
                match packet::write_step(&mut state, uuid) {
                    Ok(step) => {
                        if step.progress > 0 {
                            progressed = true;
                            metrics::BYTES_SENT.add(step.progress as u64);
                        }
                        if step.progress == 0 && !step.rotated {
                            break 'retry;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue 'retry,
                    Err(err) if is_transient(&err) => break 'retry,
                    Err(err) => {
                        fatal = Some(err);
                        break 'retry;
                    }
                }
            }
        }
        if fatal.is_some() {
            state.err = true;
        } else if state.close_pending && state.queue.is_empty() {
            close_now = true;
        }
    }

    if progressed {
        hook::reactor().touch(uuid);
    }
    if let Some(err) = fatal {
        metrics::FLUSH_FATAL.increment();
        sock::force_close(uuid);
        return Err(Error::Io(err));
    }
    if close_now {
        sock::force_close(uuid);
    }
    Ok(())
}

/// Busy-wait variant of [`flush`] for shutdown paths: loops until the
/// connection closes or its queue drains without error. No polling is
/// performed.
pub fn flush_strong(uuid: Uuid) {
    while connection::is_valid(uuid) && connection::has_pending(uuid) {
        if flush(uuid).is_err() {
            break;
        }
    }
}

/// Flush every open connection with queued data.
///
/// Used by the packet pool to create backpressure when it runs dry, and
/// by reactors on idle pulses.
pub fn flush_all() {
    for uuid in connection::pending_snapshot() {
        let _ = flush(uuid);
    }
}
