//! Error types for the linking engine.
//!
//! Undefined symbols are deliberately *not* an error: a symbol that is
//! referenced but not yet defined is ordinary, queryable linker state
//! (see [`Linker::list_undefined_symbols`](crate::Linker::list_undefined_symbols)).
//! The variants here cover the fatal conditions that abort a load or unload.

use core::fmt;

/// The error type used throughout the engine.
#[derive(Debug)]
pub enum Error {
    /// The file is unreadable, not a relocatable object, or inconsistent
    /// with what the binary-file library reports for its header.
    Format { msg: Box<str> },
    /// The memory allocator could not satisfy a request.
    OutOfMemory { msg: Box<str> },
    /// Two modules carry non-weak global definitions of the same name.
    DuplicateDefinition { name: Box<str> },
    /// Two common declarations of the same name disagree on size.
    CommonSizeMismatch { name: Box<str>, have: usize, want: usize },
    /// A relocation could not be applied: value overflow, an unsupported
    /// relocation kind, or a corrupt relocation table.
    Relocation { msg: Box<str> },
    /// The synthesized Global Offset Table ran out of addressable slots.
    GotCapacity { msg: Box<str> },
    /// The archive itself (not a member) is malformed.
    Archive { msg: Box<str> },
    /// An underlying I/O operation failed.
    Io { msg: Box<str> },
    /// A memory-mapping syscall failed.
    Mmap { msg: Box<str> },
    /// The operation is not valid in the linker's current state
    /// (e.g. `init` called twice, or an operation before `init`).
    State { msg: Box<str> },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format { msg } => write!(f, "format error: {msg}"),
            Error::OutOfMemory { msg } => write!(f, "out of memory: {msg}"),
            Error::DuplicateDefinition { name } => {
                write!(f, "multiple non-weak definitions of `{name}`")
            }
            Error::CommonSizeMismatch { name, have, want } => write!(
                f,
                "common symbol `{name}` declared with size {want}, already allocated with size {have}"
            ),
            Error::Relocation { msg } => write!(f, "relocation error: {msg}"),
            Error::GotCapacity { msg } => write!(f, "GOT capacity exceeded: {msg}"),
            Error::Archive { msg } => write!(f, "archive error: {msg}"),
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Mmap { msg } => write!(f, "mmap error: {msg}"),
            Error::State { msg } => write!(f, "invalid state: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn format_error(msg: impl Into<String>) -> Error {
    Error::Format {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn oom_error(msg: impl Into<String>) -> Error {
    Error::OutOfMemory {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn duplicate_error(name: &str) -> Error {
    Error::DuplicateDefinition { name: name.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn common_mismatch(name: &str, have: usize, want: usize) -> Error {
    Error::CommonSizeMismatch {
        name: name.into(),
        have,
        want,
    }
}

#[cold]
#[inline(never)]
pub(crate) fn reloc_error(msg: impl Into<String>) -> Error {
    Error::Relocation {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn got_error(msg: impl Into<String>) -> Error {
    Error::GotCapacity {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn archive_error(msg: impl Into<String>) -> Error {
    Error::Archive {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<String>) -> Error {
    Error::Io {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<String>) -> Error {
    Error::Mmap {
        msg: msg.into().into(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn state_error(msg: impl Into<String>) -> Error {
    Error::State {
        msg: msg.into().into(),
    }
}
