//! Connection UUIDs.
//!
//! A [`Uuid`] packs a file descriptor and an 8-bit generation counter
//! into one integer: `(fd << 8) | generation`. The registry bumps the
//! generation every time a descriptor slot is re-initialised, so a UUID
//! held across a close/re-open cycle of the same descriptor stops
//! matching — the ABA guard for kernel fd reuse.
//!
//! UUIDs are process-local and predictable. They MUST NOT be sent on the
//! wire or used as secrets.

use std::os::fd::RawFd;

/// Opaque per-connection handle guarding against descriptor reuse.
///
/// Not an RFC 4122 UUID — the name follows the traditional API surface
/// of user-land socket libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid(i64);

impl Uuid {
    /// The reserved "no connection" value.
    pub const INVALID: Uuid = Uuid(-1);

    /// Pack a descriptor and a generation counter.
    pub(crate) fn encode(fd: RawFd, generation: u8) -> Uuid {
        Uuid(((fd as i64) << 8) | generation as i64)
    }

    /// The file descriptor this UUID refers to.
    pub fn fd(self) -> RawFd {
        (self.0 >> 8) as RawFd
    }

    /// The generation byte this UUID was minted with.
    pub(crate) fn generation(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Raw integer form.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for Uuid {
    fn from(raw: i64) -> Self {
        Uuid(raw)
    }
}
