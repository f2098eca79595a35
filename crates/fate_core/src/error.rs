use thiserror::Error;

/// Input errors callers may want to match on. Everything else surfaces as a
/// plain `anyhow::Error` with a descriptive message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FateError {
    #[error("invalid direction \"{0}\": both, forward, backward are the only valid direction argument strings")]
    InvalidDirection(String),
    #[error("{what} dimension mismatch. Expected {expected}, got {actual}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unknown cell \"{0}\"")]
    UnknownCell(String),
    #[error("cell index {index} out of range for {len} cells")]
    CellIndexOutOfRange { index: usize, len: usize },
}

pub(crate) fn ensure_dimension(
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), FateError> {
    if expected == actual {
        Ok(())
    } else {
        Err(FateError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}
