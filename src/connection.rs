//! The connection registry.
//!
//! One slot per file descriptor, indexed directly by the raw descriptor
//! value. Each slot carries an 8-bit generation counter that advances on
//! every re-initialisation; a [`Uuid`] minted for a previous occupant of
//! the descriptor stops validating the moment the slot is cleared. The
//! table grows on demand and slots are never relocated.

use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, RwLock};

use crate::error::Error;
use crate::hook::{self, RwHook};
use crate::metrics;
use crate::packet::PacketQueue;
use crate::uuid::Uuid;

/// Mutable per-connection state, guarded by the slot lock.
pub(crate) struct ConnState {
    /// Connection is installed and usable.
    pub(crate) open: bool,
    /// Graceful close requested; completes when the queue drains.
    pub(crate) close_pending: bool,
    /// An unrecoverable I/O failure was observed.
    pub(crate) err: bool,
    /// Bytes of the current head packet already transmitted.
    pub(crate) sent: usize,
    /// Outbound packet queue.
    pub(crate) queue: PacketQueue,
    /// Installed read/write hook set.
    pub(crate) hooks: Arc<dyn RwHook>,
}

impl ConnState {
    pub(crate) fn fresh(open: bool) -> ConnState {
        ConnState {
            open,
            close_pending: false,
            err: false,
            sent: 0,
            queue: PacketQueue::new(),
            hooks: hook::default_hooks(),
        }
    }

    /// Release the fully transmitted head packet and reset the cursor.
    pub(crate) fn rotate(&mut self) {
        let _ = self.queue.pop_head();
        self.sent = 0;
    }
}

/// One registry slot. The generation is atomic so stale-UUID checks
/// never contend with the state lock.
pub(crate) struct ConnSlot {
    generation: AtomicU8,
    pub(crate) state: Mutex<ConnState>,
}

impl ConnSlot {
    fn new() -> ConnSlot {
        ConnSlot {
            generation: AtomicU8::new(0),
            state: Mutex::new(ConnState::fresh(false)),
        }
    }

    pub(crate) fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed)
    }
}

/// Slots are appended, never removed or reordered; growth is rare and
/// serialised by the write lock.
static TABLE: RwLock<Vec<Arc<ConnSlot>>> = RwLock::new(Vec::new());

const MIN_CAPACITY: usize = 8;

fn get(fd: RawFd) -> Option<Arc<ConnSlot>> {
    if fd < 0 {
        return None;
    }
    TABLE.read().get(fd as usize).cloned()
}

fn slot_or_grow(fd: RawFd) -> Arc<ConnSlot> {
    if let Some(slot) = get(fd) {
        return slot;
    }
    let mut table = TABLE.write();
    let needed = fd as usize + 1;
    if table.len() < needed {
        let target = needed.max(table.len() * 2).max(MIN_CAPACITY);
        let start = table.len();
        table.extend((start..target).map(|_| Arc::new(ConnSlot::new())));
    }
    Arc::clone(&table[fd as usize])
}

/// Current table capacity (highest installable descriptor + 1).
#[allow(dead_code)]
pub(crate) fn capacity() -> usize {
    TABLE.read().len()
}

/// Re-initialise a descriptor slot.
///
/// Under the slot lock the old state is swapped for a fresh one (default
/// hooks, empty queue, the new `open` flag) and the generation advances,
/// so the old UUID can never match again. The old queue's packets are
/// released and the old hooks' `on_clear` runs after the lock is
/// dropped, with the UUID that just expired.
pub(crate) fn clear(fd: RawFd, is_open: bool) {
    if fd < 0 {
        return;
    }
    let slot = slot_or_grow(fd);
    let (old_state, old_generation) = {
        let mut state = slot.state.lock();
        let old_generation = slot.generation.load(Ordering::Relaxed);
        slot.generation
            .store(old_generation.wrapping_add(1), Ordering::Relaxed);
        (
            mem::replace(&mut *state, ConnState::fresh(is_open)),
            old_generation,
        )
    };

    match (old_state.open, is_open) {
        (false, true) => {
            metrics::CONNECTIONS_ACTIVE.increment();
        }
        (true, false) => {
            metrics::CONNECTIONS_ACTIVE.decrement();
        }
        _ => {}
    }
    if is_open {
        metrics::CONNECTIONS_OPENED.increment();
    }
    if old_state.open && !is_open {
        metrics::CONNECTIONS_CLOSED.increment();
    }

    let old_uuid = Uuid::encode(fd, old_generation);
    let ConnState { queue, hooks, .. } = old_state;
    drop(queue);
    hooks.on_clear(old_uuid);
}

/// Generation-byte check without the slot lock.
pub(crate) fn validate(uuid: Uuid) -> bool {
    match get(uuid.fd()) {
        Some(slot) => slot.generation() == uuid.generation(),
        None => false,
    }
}

/// Resolve a UUID to its slot, or fail with `InvalidConnection`.
pub(crate) fn slot_for(uuid: Uuid) -> Result<Arc<ConnSlot>, Error> {
    let slot = get(uuid.fd()).ok_or(Error::InvalidConnection)?;
    if slot.generation() != uuid.generation() {
        return Err(Error::InvalidConnection);
    }
    Ok(slot)
}

/// The current UUID of a descriptor, regardless of open state.
pub(crate) fn uuid_of(fd: RawFd) -> Uuid {
    match get(fd) {
        Some(slot) => Uuid::encode(fd, slot.generation()),
        None => Uuid::INVALID,
    }
}

/// True if `uuid` refers to a valid, open connection.
pub fn is_valid(uuid: Uuid) -> bool {
    match slot_for(uuid) {
        Ok(slot) => slot.state.lock().open,
        Err(_) => false,
    }
}

/// True if data is waiting in the connection's user-land queue.
pub fn has_pending(uuid: Uuid) -> bool {
    match slot_for(uuid) {
        Ok(slot) => {
            let state = slot.state.lock();
            state.open && !state.queue.is_empty()
        }
        Err(_) => false,
    }
}

/// The active UUID of a descriptor, or `None` when the descriptor is not
/// registered as open.
///
/// A descriptor closed behind the registry's back can yield a false
/// positive; the next I/O on it updates the registry and closes the
/// entry.
pub fn fd2uuid(fd: RawFd) -> Option<Uuid> {
    let slot = get(fd)?;
    let uuid = Uuid::encode(fd, slot.generation());
    if slot.state.lock().open { Some(uuid) } else { None }
}

/// UUIDs of every open connection with queued data, for `flush_all`.
pub(crate) fn pending_snapshot() -> Vec<Uuid> {
    let slots: Vec<(RawFd, Arc<ConnSlot>)> = TABLE
        .read()
        .iter()
        .enumerate()
        .map(|(fd, slot)| (fd as RawFd, Arc::clone(slot)))
        .collect();
    let mut pending = Vec::new();
    for (fd, slot) in slots {
        let state = slot.state.lock();
        if state.open && !state.queue.is_empty() {
            pending.push(Uuid::encode(fd, slot.generation()));
        }
    }
    pending
}
