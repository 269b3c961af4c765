//! Error taxonomy shared by every allocator in this crate.

use core::fmt;

/// Everything an allocator entry point can fail with.
///
/// The thin public-facing entry points (`kalloc`, `kfree`, the `GlobalAlloc`
/// impl) collapse this down to null/0, matching the source's "never raise"
/// contract; everything underneath keeps the typed error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KmmError {
    /// No block of the requested size is available anywhere in the chain.
    OutOfMemory,
    /// A watermark region has no space left for the requested bump.
    OutOfRegion,
    /// `free` was called with an address no chained region claims.
    NotFound,
    /// An address is not aligned to the exponent/object size it claims.
    Misaligned,
    /// `link` was called on freelists with differing `object_size`.
    ObjectSizeMismatch,
    /// A buddy node's canary words did not match the expected constants.
    CorruptCanary,
    /// A merge could not find its buddy on the expected free list.
    MergeInconsistent,
    /// Caller-supplied parameters fail a precondition (zero size, bad
    /// exponent range, malformed bias table, ...).
    InvalidParameters,
    /// The pager rejected a map/unmap request.
    PagerFailure,
    /// Operation intentionally not implemented (realloc).
    Unimplemented,
}

impl fmt::Display for KmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KmmError::OutOfMemory => "out of memory",
            KmmError::OutOfRegion => "watermark region exhausted",
            KmmError::NotFound => "address not owned by any chained region",
            KmmError::Misaligned => "address misaligned for its block exponent",
            KmmError::ObjectSizeMismatch => "freelist object_size mismatch",
            KmmError::CorruptCanary => "buddy node canary mismatch",
            KmmError::MergeInconsistent => "buddy merge could not locate buddy on free list",
            KmmError::InvalidParameters => "invalid parameters",
            KmmError::PagerFailure => "pager rejected map/unmap",
            KmmError::Unimplemented => "operation not implemented",
        };
        f.write_str(s)
    }
}

pub type KmmResult<T> = Result<T, KmmError>;
