//! Packets: the unit of queued outbound work.
//!
//! A connection's outbound queue is a singly linked FIFO of packets.
//! Three shapes exist: an inline copy in a pooled payload buffer, a
//! reference to caller-owned memory (released exactly once when the
//! packet is), and a file segment streamed through a pooled scratch
//! buffer. Each shape knows how to advance its own transmission window;
//! the flush engine just asks the head packet to step until it blocks.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::BUFFER_FILE_READ_SIZE;
use crate::connection::ConnState;
use crate::guard::GuardBox;
use crate::hook::RwHook;
use crate::pool::PoolBuf;
use crate::uuid::Uuid;

#[derive(Debug)]
pub(crate) struct Packet {
    pub(crate) kind: PacketKind,
    pub(crate) next: Option<Box<Packet>>,
}

#[derive(Debug)]
pub(crate) enum PacketKind {
    /// Bytes copied into a pooled payload buffer.
    Inline { buf: PoolBuf, len: usize },
    /// Caller-provided memory; the source's drop is the deallocator.
    External {
        data: ExtSource,
        start: usize,
        len: usize,
    },
    /// A region of a file, streamed read-then-write so transport hooks
    /// always see the bytes.
    File {
        src: FileSource,
        offset: u64,
        remaining: u64,
        scratch: PoolBuf,
    },
}

/// Memory backing an external packet.
#[derive(Debug)]
pub(crate) enum ExtSource {
    Owned(Vec<u8>),
    Shared(Bytes),
    Guard(GuardBox),
}

impl ExtSource {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            ExtSource::Owned(data) => data,
            ExtSource::Shared(data) => data,
            ExtSource::Guard(guard) => guard.as_slice(),
        }
    }
}

/// Descriptor backing a file packet. An owned file is closed when the
/// packet is released; a borrowed descriptor is left to the caller.
#[derive(Debug)]
pub(crate) enum FileSource {
    Owned(std::fs::File),
    Borrowed(RawFd),
}

impl FileSource {
    fn raw_fd(&self) -> RawFd {
        match self {
            FileSource::Owned(file) => file.as_raw_fd(),
            FileSource::Borrowed(fd) => *fd,
        }
    }
}

impl Packet {
    pub(crate) fn inline(buf: PoolBuf, len: usize) -> Box<Packet> {
        Box::new(Packet {
            kind: PacketKind::Inline { buf, len },
            next: None,
        })
    }

    pub(crate) fn external(data: ExtSource, start: usize, len: usize) -> Box<Packet> {
        Box::new(Packet {
            kind: PacketKind::External { data, start, len },
            next: None,
        })
    }

    pub(crate) fn file(src: FileSource, offset: u64, len: u64, scratch: PoolBuf) -> Box<Packet> {
        Box::new(Packet {
            kind: PacketKind::File {
                src,
                offset,
                remaining: len,
                scratch,
            },
            next: None,
        })
    }
}

/// Singly linked FIFO of packets, owned by one connection entry.
pub(crate) struct PacketQueue {
    head: Option<Box<Packet>>,
}

impl PacketQueue {
    pub(crate) const fn new() -> PacketQueue {
        PacketQueue { head: None }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut Packet> {
        self.head.as_deref_mut()
    }

    /// Append at the tail.
    pub(crate) fn push_back(&mut self, packet: Box<Packet>) {
        let mut pos = &mut self.head;
        while let Some(node) = pos {
            pos = &mut node.next;
        }
        *pos = Some(packet);
    }

    /// Insert at the front — or just behind the head when the head is
    /// mid-transmission, so in-flight bytes are not split.
    pub(crate) fn push_urgent(&mut self, mut packet: Box<Packet>, head_in_flight: bool) {
        match &mut self.head {
            Some(head) if head_in_flight => {
                packet.next = head.next.take();
                head.next = Some(packet);
            }
            slot => {
                packet.next = slot.take();
                *slot = Some(packet);
            }
        }
    }

    /// Detach and return the head packet.
    pub(crate) fn pop_head(&mut self) -> Option<Box<Packet>> {
        let mut head = self.head.take()?;
        self.head = head.next.take();
        Some(head)
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        // Unlink iteratively so a long queue cannot overflow the stack
        // with recursive box drops.
        while let Some(mut packet) = self.head.take() {
            self.head = packet.next.take();
        }
    }
}

/// Result of one writer step on the head packet.
pub(crate) struct StepOutcome {
    /// Bytes accepted by the hook in this step.
    pub(crate) progress: usize,
    /// The head packet finished and was released.
    pub(crate) rotated: bool,
}

/// Advance transmission of the head packet by one step.
///
/// `Ok` with zero progress and no rotation means the kernel (or
/// transport) refused more bytes for now. Errors are the hook's own and
/// are classified by the flush engine.
pub(crate) fn write_step(state: &mut ConnState, uuid: Uuid) -> io::Result<StepOutcome> {
    let hooks = Arc::clone(&state.hooks);
    let sent = state.sent;
    let step = match state.queue.head_mut() {
        None => {
            return Ok(StepOutcome {
                progress: 0,
                rotated: false,
            });
        }
        Some(packet) => match &mut packet.kind {
            PacketKind::Inline { buf, len } => {
                memory_step(&*hooks, uuid, &buf.as_slice()[sent..*len], *len - sent)?
            }
            PacketKind::External { data, start, len } => {
                let window = &data.as_slice()[*start + sent..*start + *len];
                memory_step(&*hooks, uuid, window, *len - sent)?
            }
            PacketKind::File {
                src,
                offset,
                remaining,
                scratch,
            } => file_step(&*hooks, uuid, sent, src, *offset, remaining, scratch)?,
        },
    };
    state.sent += step.progress;
    if step.rotated {
        state.rotate();
    }
    Ok(step)
}

fn memory_step(
    hooks: &dyn RwHook,
    uuid: Uuid,
    window: &[u8],
    remaining: usize,
) -> io::Result<StepOutcome> {
    if window.is_empty() {
        return Ok(StepOutcome {
            progress: 0,
            rotated: true,
        });
    }
    let n = hooks.write(uuid, window)?;
    Ok(StepOutcome {
        progress: n,
        rotated: n == remaining,
    })
}

fn file_step(
    hooks: &dyn RwHook,
    uuid: Uuid,
    sent: usize,
    src: &FileSource,
    offset: u64,
    remaining: &mut u64,
    scratch: &mut PoolBuf,
) -> io::Result<StepOutcome> {
    let mut progress = 0usize;
    loop {
        if *remaining == 0 {
            return Ok(StepOutcome {
                progress,
                rotated: true,
            });
        }
        let want = (*remaining).min(BUFFER_FILE_READ_SIZE as u64) as usize;
        let position = offset + (sent + progress) as u64;
        let got = match pread(src.raw_fd(), &mut scratch.as_mut_slice()[..want], position) {
            Ok(got) => got,
            // Once part of this step went through, stop cleanly; the
            // error resurfaces on the next step with consistent state.
            Err(_) if progress > 0 => {
                return Ok(StepOutcome {
                    progress,
                    rotated: false,
                });
            }
            Err(err) => return Err(err),
        };
        if got == 0 {
            // The file ended before `remaining` drained; done.
            return Ok(StepOutcome {
                progress,
                rotated: true,
            });
        }
        let wrote = match hooks.write(uuid, &scratch.as_slice()[..got]) {
            Ok(wrote) => wrote,
            Err(_) if progress > 0 => {
                return Ok(StepOutcome {
                    progress,
                    rotated: false,
                });
            }
            Err(err) => return Err(err),
        };
        progress += wrote;
        *remaining -= wrote as u64;
        if wrote < got || wrote == 0 {
            return Ok(StepOutcome {
                progress,
                rotated: *remaining == 0,
            });
        }
        // Full chunk accepted; keep streaming the next one.
    }
}

/// Positional read, retrying the transient errno set.
fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}
