pub type OnyxResult<T> = Result<T, OnyxError>;

/// Generic error that contains all the different kinds of errors that may occur when using the API
#[derive(Debug, Clone)]
pub enum OnyxError {
    StringError(String),
    /// A resource was requested by name but was never declared
    UnresolvedResource(String),
    /// A handle's generation no longer matches the resource table
    StaleHandle {
        resource: String,
        expected_write_count: u8,
        actual_write_count: u8,
    },
    /// Physical memory or pool exhausted, possibly after a size-growth retry
    AllocationFailure(String),
    /// A requested state transition cannot be satisfied
    BarrierConflict(String),
    /// A dependency cycle or unresolvable ordering was detected
    SchedulingInvariantViolation(String),
}

impl std::error::Error for OnyxError {}

impl core::fmt::Display for OnyxError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            OnyxError::StringError(ref e) => e.fmt(fmt),
            OnyxError::UnresolvedResource(ref name) => {
                write!(fmt, "unresolved resource {:?}", name)
            }
            OnyxError::StaleHandle {
                ref resource,
                expected_write_count,
                actual_write_count,
            } => write!(
                fmt,
                "stale handle for resource {:?} (handle write_count {}, table write_count {})",
                resource, expected_write_count, actual_write_count
            ),
            OnyxError::AllocationFailure(ref e) => write!(fmt, "allocation failure: {}", e),
            OnyxError::BarrierConflict(ref e) => write!(fmt, "barrier conflict: {}", e),
            OnyxError::SchedulingInvariantViolation(ref e) => {
                write!(fmt, "scheduling invariant violation: {}", e)
            }
        }
    }
}

impl From<&str> for OnyxError {
    fn from(str: &str) -> Self {
        OnyxError::StringError(str.to_string())
    }
}

impl From<String> for OnyxError {
    fn from(string: String) -> Self {
        OnyxError::StringError(string)
    }
}
