use std::time::Duration;

use thiserror::Error;

/// Failure to turn one input file into WebP bytes.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("cannot decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("cannot encode WebP: {0}")]
    Encode(#[source] image::ImageError),

    #[error("decode did not finish within {0:?}")]
    Timeout(Duration),

    #[error("decoder thread exited without a result")]
    Aborted,
}

/// Failure while serialising archive entries into a zip container.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("nothing to package: every file in the batch failed")]
    Empty,

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch {0} was superseded by a newer selection")]
    Superseded(u64),

    #[error("batch {0} was cancelled")]
    Cancelled(u64),

    #[error("batch {0} did not complete in time")]
    TimedOut(u64),

    #[error("batch {0} was already collected")]
    Collected(u64),
}
