//! sockline — user-land non-blocking socket I/O.
//!
//! sockline sits directly above the stream-socket syscalls and gives an
//! event-driven application three things the kernel does not:
//!
//! - **Stable connection identity.** Every installed descriptor gets a
//!   [`Uuid`] carrying an 8-bit generation counter. When the kernel
//!   recycles a descriptor, the old UUID stops validating — a task
//!   still holding it gets a clean error instead of writing into a
//!   stranger's connection.
//! - **A pooled outbound queue.** Writes land on a per-connection packet
//!   queue drawn from a pre-allocated pool; the flush engine drains it
//!   as the kernel accepts bytes. Memory, moved buffers, shared bytes,
//!   and file regions all queue the same way.
//! - **A transport seam.** Every read and write goes through a
//!   per-connection [`RwHook`], so a TLS (or any other) transport layer
//!   drops in without changing callers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sockline::{Source, WriteOptions};
//!
//! fn main() -> Result<(), sockline::Error> {
//!     let server = sockline::listen("127.0.0.1", 7878)?;
//!     loop {
//!         if let Ok(client) = sockline::accept(server) {
//!             sockline::write(client, b"hello\n")?;
//!             sockline::write2(
//!                 client,
//!                 Source::Move(Vec::from(b"zero-copy tail".as_slice())),
//!                 &WriteOptions::default(),
//!             )?;
//!             sockline::close(client);
//!         }
//!         sockline::flush_all();
//!     }
//! }
//! ```
//!
//! All calls are safe from any thread. Sockets are always non-blocking;
//! pair this crate with an event reactor (see [`Reactor`]) to learn when
//! descriptors are ready.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod connection;
pub(crate) mod metrics;
pub(crate) mod packet;
pub(crate) mod pool;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod flush;
pub mod guard;
pub mod hook;
pub mod sock;
pub mod uuid;
pub mod write;

// ── Re-exports: identity and errors ─────────────────────────────────────

/// Library errors.
pub use error::Error;
/// Process-local connection handle (descriptor + generation).
pub use uuid::Uuid;

// ── Re-exports: lifecycle ───────────────────────────────────────────────

/// Accept a connection from a listening UUID.
pub use sock::accept;
/// Mark a connection for closure once its queue drains.
pub use sock::close;
/// Initiate a non-blocking client connection.
pub use sock::connect;
/// Close immediately, discarding queued data.
pub use sock::force_close;
/// Open a listening non-blocking socket.
pub use sock::listen;
/// Query (and raise) the process descriptor ceiling.
pub use sock::max_capacity;
/// Adopt an externally created descriptor.
pub use sock::open;
/// Read through the connection's hook.
pub use sock::read;
/// Switch a descriptor to non-blocking mode.
pub use sock::set_non_block;

// ── Re-exports: registry queries ────────────────────────────────────────

/// Active UUID of a raw descriptor, if open.
pub use connection::fd2uuid;
/// True if user-land data is queued on the connection.
pub use connection::has_pending;
/// True if the UUID refers to a valid, open connection.
pub use connection::is_valid;

// ── Re-exports: writing ─────────────────────────────────────────────────

/// A packet payload checked out of the pool.
pub use write::Buffer;
/// Byte source for [`write2`].
pub use write::Source;
/// Options for [`write2`].
pub use write::WriteOptions;
/// Check a packet payload out of the pool.
pub use write::buffer_checkout;
/// Return an unused checked-out buffer to the pool.
pub use write::buffer_free;
/// Queue a checked-out buffer on a connection.
pub use write::buffer_send;
/// Queue a copy of a byte slice.
pub use write::write;
/// Queue data from an arbitrary source with options.
pub use write::write2;

// ── Re-exports: flushing ────────────────────────────────────────────────

/// Drain a connection's queue toward the kernel.
pub use flush::flush;
/// Flush every connection with queued data.
pub use flush::flush_all;
/// Busy-wait flush for shutdown paths.
pub use flush::flush_strong;

// ── Re-exports: hooks ───────────────────────────────────────────────────

/// Inline type-erased storage for a [`SendGuard`].
pub use guard::GuardBox;
/// Zero-copy write guard trait.
pub use guard::SendGuard;
/// Process-wide reactor/scheduler callbacks.
pub use hook::Reactor;
/// Pluggable per-connection transport hooks.
pub use hook::RwHook;
/// Get the hook set installed on a connection.
pub use hook::rw_hook_get;
/// Install a hook set on a connection.
pub use hook::rw_hook_set;
/// Register the process-wide reactor.
pub use hook::set_reactor;

// ── Re-exports: build-time sizing ───────────────────────────────────────

/// Bytes read per file-segment iteration.
pub use config::BUFFER_FILE_READ_SIZE;
/// Pre-allocated payload buffers in the pool.
pub use config::BUFFER_PACKET_POOL;
/// Size of each pooled payload buffer.
pub use config::BUFFER_PACKET_SIZE;
