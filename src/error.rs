use thiserror::Error;

/// Failures surfaced to callers that asked the collector for memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("out of memory: could not reserve a region of {min_pages} pages")]
    RegionExhausted { min_pages: usize },
    #[error("out of memory: all {0} region slots are in use")]
    NoRegionSlots(usize),
    #[error("out of memory: allocation of {0} bytes failed")]
    OutOfMemory(usize),
    #[error("allocation size overflow")]
    SizeOverflow,
}

pub type GcResult<T> = Result<T, GcError>;

/// Error reported by a finalizer callback. Panics inside managed callbacks are
/// converted into this as well.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FinalizerError {
    pub message: String,
}

impl FinalizerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
