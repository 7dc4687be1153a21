use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

/// The result type used across the trainer.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Trainer failures.
///
/// Everything here is fatal for the operation that produced it; the one
/// recoverable condition (no prior checkpoint) is reported as `Ok(false)`
/// by `CheckpointManager::load`, not as an error.
#[derive(Debug)]
pub enum TrainErr {
    /// Invalid setup (unknown generator tag, bad device list, bad shapes at
    /// construction). Caught before any step runs.
    Configuration { detail: String },
    /// A configured compute lane is not backed by the host.
    DeviceUnavailable { device: String },
    /// A replica and the shared parameter set disagree about which
    /// parameters exist or which gradients were produced.
    GradientMismatch { param: String },
    /// A checkpoint exists but cannot be restored.
    CheckpointCorrupt { path: PathBuf, detail: String },
    /// A buffer length doesn't match the parameter it is paired with.
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Io(io::Error),
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Configuration { detail } => write!(f, "invalid configuration: {detail}"),
            TrainErr::DeviceUnavailable { device } => {
                write!(f, "device {device} is not available")
            }
            TrainErr::GradientMismatch { param } => {
                write!(f, "replica/parameter desync on {param}")
            }
            TrainErr::CheckpointCorrupt { path, detail } => {
                write!(f, "corrupt checkpoint at {}: {detail}", path.display())
            }
            TrainErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} length mismatch: got {got}, expected {expected}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
