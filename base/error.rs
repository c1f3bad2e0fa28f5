// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A single tagged error type shared across the demux/mux/trim pipeline.
//!
//! Every fallible operation in this crate returns `Result<T, Error>`. There
//! is no local recovery: a partial result is never returned, and a failed
//! `Media::get` only poisons the sample it was asked for, not its siblings.

use std::fmt;

/// Coarse classification of a failure, analogous to a gRPC status code.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Container corruption: a field out of range, a required box missing.
    Invalid,
    /// Caller passed an illegal parameter.
    InvalidArguments,
    /// Valid per spec but unimplemented (non-cardinal rotation, >2 channels, ...).
    Unsupported,
    /// A hard security limit (see `crate::limits`) was hit.
    Unsafe,
    /// An index was out of `[a, b)` bounds.
    OutOfRange,
    /// An arithmetic operation would have overflowed.
    Overflow,
    /// Allocation failed.
    OutOfMemory,
    /// Use-after-close, or access after a failed open.
    Uninitialized,
    /// The backing `Reader` returned a short read or I/O error.
    ReaderError,
    /// A compile-time feature (e.g. `webm`) was required but absent.
    MissingDependency,
    /// An internal assertion failed; this indicates a bug.
    InternalInconsistency,
    /// A third-party image/pixel library failed.
    ImageCore,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::InvalidArguments => "invalid arguments",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Unsafe => "unsafe",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::Overflow => "overflow",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Uninitialized => "uninitialized",
            ErrorKind::ReaderError => "reader error",
            ErrorKind::MissingDependency => "missing dependency",
            ErrorKind::InternalInconsistency => "internal inconsistency",
            ErrorKind::ImageCore => "image core",
        };
        f.write_str(s)
    }
}

/// The error type returned by this crate: a kind plus an implementation-defined reason string.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Builder {
        Builder {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Builder returned by [`Error::new`] and the `err!`/`bail!` macros.
pub struct Builder {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Builder {
    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error {
            kind: self.kind,
            msg: self.msg,
            source: self.source,
        }
    }
}

// Builders are accepted anywhere an `Error` is, so `err!(...)` can be used
// both as `return Err(err!(...))` and `.map_err(|_| err!(...))`.
impl From<Builder> for Error {
    fn from(b: Builder) -> Error {
        b.build()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(m), Some(s)) => write!(f, "{}: {} ({})", self.kind, m, s),
            (Some(m), None) => write!(f, "{}: {}", self.kind, m),
            (None, Some(s)) => write!(f, "{}: {}", self.kind, s),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Builds an [`Error`] without returning from the enclosing function.
///
/// ```ignore
/// return Err(err!(Invalid, msg("missing {} box", "moov")));
/// .map_err(|e| err!(ReaderError, source(e)))?;
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind).msg(format!($($arg)+)).build()
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).source($src).build()
    };
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind).build()
    };
}

/// Like `err!`, but returns `Err(...)` from the enclosing function immediately.
#[macro_export]
macro_rules! bail {
    ($($t:tt)+) => {
        return Err($crate::err!($($t)+))
    };
}

/// Fails with [`ErrorKind::InternalInconsistency`] unless `cond` holds. Used for assertions
/// that indicate a bug in this crate, not bad input.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            $crate::bail!(InternalInconsistency, msg("check failed: {}", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::bail!(InternalInconsistency, msg($($arg)+));
        }
    };
}

/// Extension methods for `Result`, mirroring the teacher's `ResultExt`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, discarding the original message as a `source`.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).source(e).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_msg() {
        let e: Error = err!(Invalid, msg("missing {} box", "moov"));
        assert_eq!(e.kind(), ErrorKind::Invalid);
        assert_eq!(e.to_string(), "invalid: missing moov box");
    }

    #[test]
    fn err_kind_wraps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let r: Result<(), _> = Err(io_err).err_kind(ErrorKind::ReaderError);
        assert_eq!(r.unwrap_err().kind(), ErrorKind::ReaderError);
    }
}
