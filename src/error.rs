use thiserror::Error;

/// Failures reported by the relocation runtime and the address-space layer.
///
/// Everything except [`Error::PermissionViolation`] is detected before any
/// state is touched, so a caller can fix the condition and retry.
/// `PermissionViolation` only ever shows up as the message of a kernel panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no allocation is tracked at {0:#x}")]
    LookupFailure(usize),
    #[error("region {va:#x}+{len:#x} overlaps tracked region {existing_va:#x}+{existing_len:#x}")]
    OverlapViolation {
        va: usize,
        len: usize,
        existing_va: usize,
        existing_len: usize,
    },
    #[error("identity-mapped space expects va == pa, got va={va:#x} pa={pa:#x}")]
    IdentityViolation { va: usize, pa: usize },
    #[error("region at {0:#x} is pinned")]
    PinnedViolation(usize),
    #[error("protection change on region at {va:#x} would revoke an outstanding {latched} access")]
    PermissionViolation { va: usize, latched: &'static str },
    #[error("could not bring the world to a stop")]
    BarrierFailure,
    #[error("no backing memory for {0:#x} bytes")]
    AllocationFailure(usize),
    #[error("region at {0:#x} is not tracked")]
    RegionNotFound(usize),
    #[error("cannot shrink region from {current:#x} to {requested:#x} bytes")]
    ShrinkRejected { current: usize, requested: usize },
    #[error("region lengths differ: {current:#x} != {requested:#x}")]
    LengthMismatch { current: usize, requested: usize },
    #[error("zero-length region at {0:#x}")]
    ZeroLengthRegion(usize),
    #[error("thread {0} is not attached to this address space")]
    UnknownThread(u64),
    #[error("range {va:#x}+{len:#x} is not contained by a single tracked region")]
    NotMapped { va: usize, len: usize },
    #[error("access to {0:#x} exceeds the permissions of its region")]
    AccessDenied(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("frame of {frame:#x} bytes at rsp {rsp:#x} overruns the stack ending at {limit:#x}")]
    StackOverflow { rsp: usize, frame: usize, limit: usize },
}

impl Error {
    /// Negative status code handed across the C boundary.
    pub fn status(&self) -> i32 {
        match self {
            Error::LookupFailure(_) => -1,
            Error::OverlapViolation { .. } => -2,
            Error::IdentityViolation { .. } => -3,
            Error::PinnedViolation(_) => -4,
            Error::PermissionViolation { .. } => -5,
            Error::BarrierFailure => -6,
            Error::AllocationFailure(_) => -7,
            Error::RegionNotFound(_) => -8,
            Error::ShrinkRejected { .. } => -9,
            Error::LengthMismatch { .. } => -10,
            Error::ZeroLengthRegion(_) => -11,
            Error::UnknownThread(_) => -12,
            Error::NotMapped { .. } => -13,
            Error::AccessDenied(_) => -14,
            Error::InvalidArgument(_) => -15,
            Error::StackOverflow { .. } => -16,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collapse a result into the `0` / negative convention of the C API.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}
