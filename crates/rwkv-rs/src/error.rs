//! Error categories, detail codes and the process-wide last-error slot.
//!
//! Every failure is reported twice: as a typed [`RwkvError`] returned to the caller, and as an
//! [`ErrorFlags`] bitset accumulated on the context (or globally, when no context exists yet) so
//! callers polling the flags-based interface can observe it after the fact.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use thiserror::Error;

use crate::backend::spec::BackendError;
use crate::env;

/// Bitset combining one error category (high byte) with one detail code (low byte).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorFlags(u32);

impl ErrorFlags {
    pub const NONE: ErrorFlags = ErrorFlags(0);

    pub const ARGS: ErrorFlags = ErrorFlags(1 << 8);
    pub const FILE: ErrorFlags = ErrorFlags(2 << 8);
    pub const MODEL: ErrorFlags = ErrorFlags(3 << 8);
    pub const MODEL_PARAMS: ErrorFlags = ErrorFlags(4 << 8);
    pub const GRAPH: ErrorFlags = ErrorFlags(5 << 8);
    pub const CTX: ErrorFlags = ErrorFlags(6 << 8);

    pub const ALLOC: ErrorFlags = ErrorFlags(1);
    pub const FILE_OPEN: ErrorFlags = ErrorFlags(2);
    pub const FILE_STAT: ErrorFlags = ErrorFlags(3);
    pub const FILE_READ: ErrorFlags = ErrorFlags(4);
    pub const FILE_WRITE: ErrorFlags = ErrorFlags(5);
    pub const FILE_MAGIC: ErrorFlags = ErrorFlags(6);
    pub const FILE_VERSION: ErrorFlags = ErrorFlags(7);
    pub const DATA_TYPE: ErrorFlags = ErrorFlags(8);
    pub const UNSUPPORTED: ErrorFlags = ErrorFlags(9);
    pub const SHAPE: ErrorFlags = ErrorFlags(10);
    pub const DIMENSION: ErrorFlags = ErrorFlags(11);
    pub const KEY: ErrorFlags = ErrorFlags(12);
    pub const DATA: ErrorFlags = ErrorFlags(13);
    pub const PARAM_MISSING: ErrorFlags = ErrorFlags(14);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Reports whether every bit of `other` is set in `self`.
    ///
    /// Categories are numbered rather than one bit each; compare them through [`Self::category`].
    pub const fn contains(self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Category part (`ARGS`, `FILE`, ...).
    pub const fn category(self) -> ErrorFlags {
        ErrorFlags(self.0 & 0xff00)
    }

    /// Detail part (`ALLOC`, `SHAPE`, ...).
    pub const fn detail(self) -> ErrorFlags {
        ErrorFlags(self.0 & 0x00ff)
    }
}

impl BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: ErrorFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorFlags({:#06x})", self.0)
    }
}

/// Failure modes surfaced by model loading, graph construction and evaluation.
#[derive(Debug, Error)]
pub enum RwkvError {
    #[error("invalid argument: {message}")]
    InvalidArgument { flags: ErrorFlags, message: String },
    #[error("{message}")]
    Model { flags: ErrorFlags, message: String },
    #[error("failed to allocate {bytes} bytes for {what}")]
    Alloc { what: &'static str, bytes: usize },
    #[error(
        "graph arena exhausted: requested {requested} bytes with {available} of {capacity} available"
    )]
    ArenaExhausted {
        requested: usize,
        available: usize,
        capacity: usize,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RwkvError {
    /// Caller supplied an argument outside the accepted domain.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        RwkvError::InvalidArgument {
            flags: ErrorFlags::ARGS,
            message: message.into(),
        }
    }

    /// Caller supplied a buffer whose length disagrees with the model.
    pub fn buffer_size(what: &str, expected: usize, actual: usize) -> Self {
        RwkvError::InvalidArgument {
            flags: ErrorFlags::ARGS | ErrorFlags::DIMENSION,
            message: format!("{what} holds {actual} elements, expected {expected}"),
        }
    }

    /// Model or tensor problem carrying explicit flags.
    pub fn model(flags: ErrorFlags, message: impl Into<String>) -> Self {
        RwkvError::Model {
            flags,
            message: message.into(),
        }
    }

    /// Flags this error contributes to the context's accumulated last error.
    pub fn flags(&self) -> ErrorFlags {
        match self {
            RwkvError::InvalidArgument { flags, .. } | RwkvError::Model { flags, .. } => *flags,
            RwkvError::Alloc { .. } => ErrorFlags::CTX | ErrorFlags::ALLOC,
            RwkvError::ArenaExhausted { .. } => ErrorFlags::GRAPH | ErrorFlags::ALLOC,
            RwkvError::Backend(_) => ErrorFlags::GRAPH,
        }
    }
}

/// Convenience alias for results returned by this crate.
pub type RwkvResult<T> = std::result::Result<T, RwkvError>;

static GLOBAL_LAST_ERROR: AtomicU32 = AtomicU32::new(0);
// 0 = follow the environment default, 1 = off, 2 = on
static GLOBAL_PRINT_ERRORS: AtomicU8 = AtomicU8::new(0);

/// Returns and clears the flags recorded by failures that happened outside any context.
pub fn take_global_last_error() -> ErrorFlags {
    ErrorFlags(GLOBAL_LAST_ERROR.swap(0, Ordering::AcqRel))
}

/// Controls whether failures outside any context are logged.
pub fn set_global_print_errors(enabled: bool) {
    GLOBAL_PRINT_ERRORS.store(if enabled { 2 } else { 1 }, Ordering::Release);
}

pub fn global_print_errors() -> bool {
    match GLOBAL_PRINT_ERRORS.load(Ordering::Acquire) {
        0 => env::print_errors_default(),
        value => value == 2,
    }
}

pub(crate) fn record_global_error(error: &RwkvError) {
    GLOBAL_LAST_ERROR.fetch_or(error.flags().bits(), Ordering::AcqRel);
    if global_print_errors() {
        log::error!("{error}");
    }
}
