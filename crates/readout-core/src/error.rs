//! Error types for the readout data path.
//!
//! [`ReadoutError`] consolidates the error kinds that can surface on the
//! control path: configuration problems caught at init, DMA channel
//! failures reported by the driver seam, and internal invariant violations
//! that abort the run.
//!
//! The hot data path never unwinds through these types. Per-page problems
//! (a failed frame-header validation, an exhausted pool, a full queue) are
//! reported through counters and sentinel returns so that a single bad page
//! cannot fail a whole scheduling quantum.

use thiserror::Error;

/// Category of a DMA channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Open,
    Reset,
    Start,
    Stop,
    Transfer,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Open => "open",
            DriverErrorKind::Reset => "reset",
            DriverErrorKind::Start => "start",
            DriverErrorKind::Stop => "stop",
            DriverErrorKind::Transfer => "transfer",
        };
        write!(f, "{}", label)
    }
}

/// Structured DMA channel error.
///
/// A failure here marks the owning equipment unusable; the host is expected
/// to tear the equipment down rather than retry the tick.
#[derive(Error, Debug, Clone)]
#[error("DMA channel {kind} error: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the readout error type.
pub type ReadoutResult<T> = std::result::Result<T, ReadoutError>;

/// Primary error type for the readout data path.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Configuration values parsed but failed semantic validation.
    ///
    /// Examples: a page geometry whose usable DMA region rounds down to
    /// zero, a zero queue capacity, a link bound of zero. These are caught
    /// at init and never reached at runtime.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing failed (TOML syntax or type mismatch).
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// DMA channel operation failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// File or OS level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated.
    ///
    /// Indicates a programming or configuration defect (e.g. the slicer
    /// rejected a page the producer should never have emitted). The worker
    /// reporting this stops; the host is expected to stop the run.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}
