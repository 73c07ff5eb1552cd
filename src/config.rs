//! Build-time buffer sizing.
//!
//! These constants fix the memory layout of the packet pool. They are
//! deliberately compile-time: every pooled payload buffer has the same
//! size, so the pool never fragments and a free buffer always fits any
//! packet shape.

/// Bytes read from a source file per file-segment write iteration.
pub const BUFFER_FILE_READ_SIZE: usize = 16384;

/// Size of each pooled payload buffer in bytes.
///
/// Must leave headroom above [`BUFFER_FILE_READ_SIZE`] so a file-segment
/// packet's scratch region always fits a full read chunk.
pub const BUFFER_PACKET_SIZE: usize = BUFFER_FILE_READ_SIZE + 64;

/// Number of pre-allocated payload buffers in the process-wide pool.
///
/// Writes beyond this bound spill to the general allocator rather than
/// deadlock; see the pool module.
pub const BUFFER_PACKET_POOL: usize = 1024;

const _: () = assert!(
    BUFFER_PACKET_SIZE >= BUFFER_FILE_READ_SIZE + 64,
    "BUFFER_PACKET_SIZE must be at least BUFFER_FILE_READ_SIZE + 64",
);
