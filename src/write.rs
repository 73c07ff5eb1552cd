//! The write API: queueing outbound data.
//!
//! [`write`] copies; [`write2`] gives full control over the source
//! (copied, moved, shared, guarded, or streamed from a file), the window
//! within it, and queue placement. Writes never block: data lands on the
//! connection's queue and an immediate flush pushes as much as the
//! kernel will take.

use std::os::fd::RawFd;

use bytes::Bytes;

use crate::config::BUFFER_PACKET_SIZE;
use crate::error::Error;
use crate::guard::GuardBox;
use crate::packet::{ExtSource, FileSource, Packet};
use crate::pool::{self, PoolBuf};
use crate::uuid::Uuid;
use crate::{connection, flush};

/// Where the bytes of a [`write2`] come from, and who releases them.
pub enum Source<'a> {
    /// Copy into a pooled packet (large copies spill to an owned heap
    /// buffer).
    Copy(&'a [u8]),
    /// Take ownership; the buffer drops when transmission completes.
    Move(Vec<u8>),
    /// Shared zero-copy bytes; the reference drops when transmission
    /// completes.
    Shared(Bytes),
    /// Zero-copy memory with a custom release guard.
    Guard(GuardBox),
    /// Stream a region of this file; the descriptor is closed when the
    /// packet is released.
    File(std::fs::File),
    /// Stream a region of a borrowed descriptor; the caller keeps
    /// ownership and must outlive the transmission.
    FileRef(RawFd),
}

/// Options for [`write2`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Byte offset into the memory region or file.
    pub offset: u64,
    /// Bytes to send from the offset. Defaults to the rest of the memory
    /// region; required for file sources.
    pub length: Option<usize>,
    /// Insert ahead of queued packets — but never inside a packet whose
    /// transmission has started.
    pub urgent: bool,
}

/// Queue a copy of `data` on the connection and flush.
pub fn write(uuid: Uuid, data: &[u8]) -> Result<(), Error> {
    write2(uuid, Source::Copy(data), &WriteOptions::default())
}

/// Queue data from an arbitrary [`Source`] and flush.
///
/// Owned sources are released exactly once on every path, including
/// errors: an invalid UUID or a bad offset still drops the moved buffer,
/// runs the guard, or closes the owned file.
pub fn write2(uuid: Uuid, source: Source<'_>, options: &WriteOptions) -> Result<(), Error> {
    if !connection::validate(uuid) {
        // Park the slot closed so the registry covers this descriptor
        // with a fresh generation; the source drops (releases) here.
        connection::clear(uuid.fd(), false);
        return Err(Error::InvalidConnection);
    }

    let packet = build_packet(source, options)?;

    let slot = connection::slot_for(uuid)?;
    {
        let mut state = slot.state.lock();
        if !state.open || state.err || slot.generation() != uuid.generation() {
            return Err(Error::InvalidConnection);
        }
        if options.urgent {
            let head_in_flight = state.sent > 0;
            state.queue.push_urgent(packet, head_in_flight);
        } else {
            state.queue.push_back(packet);
        }
    }

    // Fatal flush errors close the connection on their own; the write
    // itself was accepted.
    let _ = flush::flush(uuid);
    Ok(())
}

fn build_packet(source: Source<'_>, options: &WriteOptions) -> Result<Box<Packet>, Error> {
    match source {
        Source::Copy(data) => {
            let (start, len) = memory_window(data.len(), options)?;
            let window = &data[start..start + len];
            if window.len() <= BUFFER_PACKET_SIZE {
                let mut buf = pool::grab();
                buf.as_mut_slice()[..window.len()].copy_from_slice(window);
                Ok(Packet::inline(buf, window.len()))
            } else {
                // Too big for a pooled payload; copy once to the heap.
                Ok(Packet::external(
                    ExtSource::Owned(window.to_vec()),
                    0,
                    window.len(),
                ))
            }
        }
        Source::Move(data) => external_packet(ExtSource::Owned(data), options),
        Source::Shared(data) => external_packet(ExtSource::Shared(data), options),
        Source::Guard(guard) => external_packet(ExtSource::Guard(guard), options),
        Source::File(file) => file_packet(FileSource::Owned(file), options),
        Source::FileRef(fd) => file_packet(FileSource::Borrowed(fd), options),
    }
}

fn external_packet(data: ExtSource, options: &WriteOptions) -> Result<Box<Packet>, Error> {
    let (start, len) = memory_window(data.as_slice().len(), options)?;
    Ok(Packet::external(data, start, len))
}

fn file_packet(src: FileSource, options: &WriteOptions) -> Result<Box<Packet>, Error> {
    let len = options.length.ok_or(Error::LengthRequired)?;
    Ok(Packet::file(
        src,
        options.offset,
        len as u64,
        pool::grab(),
    ))
}

/// Validate `options` against a memory region of `total` bytes.
fn memory_window(total: usize, options: &WriteOptions) -> Result<(usize, usize), Error> {
    let start = usize::try_from(options.offset).map_err(|_| Error::OffsetOutOfRange)?;
    if start > total {
        return Err(Error::OffsetOutOfRange);
    }
    let len = options.length.unwrap_or(total - start);
    if len > total - start {
        return Err(Error::OffsetOutOfRange);
    }
    Ok((start, len))
}

/// A packet payload checked out of the pool for zero-copy staging.
///
/// Fill [`as_mut_slice`](Buffer::as_mut_slice), record the payload size
/// with [`set_len`](Buffer::set_len), then hand the buffer to
/// [`buffer_send`]. Dropping (or [`buffer_free`]-ing) an unsent buffer
/// returns it to the pool.
pub struct Buffer {
    buf: PoolBuf,
    len: usize,
}

impl Buffer {
    /// Writable payload area (full capacity).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    /// The bytes staged so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len]
    }

    /// Record how many bytes of the payload area are valid.
    ///
    /// # Panics
    /// Panics if `len` exceeds [`capacity`](Buffer::capacity).
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= BUFFER_PACKET_SIZE,
            "buffer length {len} exceeds packet payload capacity {BUFFER_PACKET_SIZE}",
        );
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        BUFFER_PACKET_SIZE
    }
}

/// Check a packet payload out of the pool.
pub fn buffer_checkout() -> Buffer {
    Buffer {
        buf: pool::grab(),
        len: 0,
    }
}

/// Attach a checked-out buffer to a connection's queue and flush.
///
/// The buffer is always consumed; on an invalid connection it returns to
/// the pool.
pub fn buffer_send(uuid: Uuid, buffer: Buffer) -> Result<(), Error> {
    let packet = Packet::inline(buffer.buf, buffer.len);
    let slot = connection::slot_for(uuid)?;
    {
        let mut state = slot.state.lock();
        if !state.open || state.err || slot.generation() != uuid.generation() {
            return Err(Error::InvalidConnection);
        }
        state.queue.push_back(packet);
    }
    let _ = flush::flush(uuid);
    Ok(())
}

/// Return an unused checked-out buffer to the pool.
pub fn buffer_free(buffer: Buffer) {
    drop(buffer);
}
