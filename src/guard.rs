use std::mem::{self, MaybeUninit};

/// Trait for user-provided zero-copy write guards.
///
/// The guard keeps the memory behind [`as_slice`](SendGuard::as_slice)
/// alive for its own lifetime; its `Drop` impl is the custom deallocator,
/// run exactly once when the queued packet is released. Implement this
/// for cache entries, mmap'd regions, or any buffer with bespoke
/// ownership.
///
/// The returned slice must refer to the same region for the life of the
/// guard — the write pipeline re-derives its window from it on every
/// flush step.
pub trait SendGuard: Send + 'static {
    /// The bytes to transmit.
    fn as_slice(&self) -> &[u8];
}

/// VTable for type-erased GuardBox.
struct GuardVTable {
    drop_fn: unsafe fn(*mut u8),
    as_slice_fn: unsafe fn(*const u8) -> (*const u8, usize),
}

/// Inline type-erased storage for a [`SendGuard`] (64 bytes max, 8-byte
/// aligned). Avoids a heap allocation for typical guards.
pub struct GuardBox {
    storage: [MaybeUninit<u64>; 8], // 64 bytes, 8-byte aligned
    vtable: &'static GuardVTable,
}

impl std::fmt::Debug for GuardBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardBox").finish_non_exhaustive()
    }
}

// Safety: GuardBox only stores `SendGuard: Send` types.
unsafe impl Send for GuardBox {}

impl GuardBox {
    /// Create a new `GuardBox` from a concrete `SendGuard`.
    ///
    /// # Panics
    /// Panics if `size_of::<G>() > 64` or `align_of::<G>() > 8`.
    pub fn new<G: SendGuard>(guard: G) -> Self {
        assert!(
            mem::size_of::<G>() <= 64,
            "SendGuard type {} is {} bytes, max 64",
            std::any::type_name::<G>(),
            mem::size_of::<G>(),
        );
        assert!(
            mem::align_of::<G>() <= 8,
            "SendGuard type {} has alignment {}, max 8",
            std::any::type_name::<G>(),
            mem::align_of::<G>(),
        );

        let mut storage: [MaybeUninit<u64>; 8] = [MaybeUninit::uninit(); 8];

        // Safety: We checked size <= 64 and alignment <= 8 above.
        // [MaybeUninit<u64>; 8] is 64 bytes with 8-byte alignment.
        unsafe {
            let ptr = storage.as_mut_ptr() as *mut G;
            ptr.write(guard);
        }

        GuardBox {
            storage,
            vtable: vtable_for::<G>(),
        }
    }

    /// The guarded bytes.
    pub fn as_slice(&self) -> &[u8] {
        let (ptr, len) = unsafe { (self.vtable.as_slice_fn)(self.storage.as_ptr() as *const u8) };
        // Safety: the pointer/length come from the guard's own `as_slice`,
        // and the guard lives as long as `self`.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

impl Drop for GuardBox {
    fn drop(&mut self) {
        unsafe { (self.vtable.drop_fn)(self.storage.as_mut_ptr() as *mut u8) }
    }
}

unsafe fn guard_drop<G: SendGuard>(ptr: *mut u8) {
    unsafe { std::ptr::drop_in_place(ptr as *mut G) };
}

unsafe fn guard_as_slice<G: SendGuard>(ptr: *const u8) -> (*const u8, usize) {
    let guard = unsafe { &*(ptr as *const G) };
    let slice = guard.as_slice();
    (slice.as_ptr(), slice.len())
}

fn vtable_for<G: SendGuard>() -> &'static GuardVTable {
    trait HasVTable {
        const VTABLE: GuardVTable;
    }
    impl<G: SendGuard> HasVTable for G {
        const VTABLE: GuardVTable = GuardVTable {
            drop_fn: guard_drop::<G>,
            as_slice_fn: guard_as_slice::<G>,
        };
    }
    &<G as HasVTable>::VTABLE
}
