//! Module containing the universal error type
use crate::job::JobKind;
use std::path::PathBuf;
use thiserror::Error;

/// Universal error type for `taskbot`
#[derive(Error, Debug)]
pub enum Error {
    /// The user's script raised an error
    ///
    /// `line` is zero-indexed, and is `None` if the diagnostic did not name a
    /// line.
    #[error("script evaluation failed{}: {message}", fmt_line(.line))]
    ScriptEvaluation {
        /// Line on which the error occurred, if known
        line: Option<usize>,
        /// Evaluator diagnostic
        message: String,
    },

    /// The design is missing bounds required by the requested operation
    #[error("objects must have valid bounds")]
    UnboundedGeometry,

    /// A job of this kind is already running
    #[error("{0} job is already running")]
    JobAlreadyRunning(JobKind),

    /// A native evaluation was cancelled
    ///
    /// This is not a user-visible error; the reaper discards it silently.
    #[error("evaluation aborted")]
    Aborted,

    /// A refinement was requested, but a sibling file is missing
    #[error("external file {0:?} is missing")]
    ExternalFileMissing(PathBuf),

    /// There is no current design
    #[error("design needs to be successfully rendered first")]
    NoDesign,

    /// The most recent render of the current design failed
    #[error("the most recent render failed")]
    DesignFailed,

    /// The script ran, but did not define any shapes
    #[error("no shape defined")]
    NoShapes,

    /// No export is implemented for the given file extension
    #[error("unsupported export format {0:?}")]
    UnsupportedFormat(String),

    /// The target cell is no longer in the mesh octree
    #[error("cell is not present in the mesh octree")]
    BadCell,

    /// The geometry engine reported a failure
    #[error("geometry engine error: {0}")]
    Engine(String),

    /// A job thread panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Failed to spawn the fab process
    #[error("could not start `{command}`: {source}")]
    FabSpawn {
        /// Command which we tried to run
        command: String,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Snapshot encoding or decoding failed
    #[error("snapshot error: {0}")]
    Snapshot(#[from] bincode::Error),

    /// Image encoding failed
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

fn fmt_line(line: &Option<usize>) -> String {
    match line {
        Some(i) => format!(" (line {})", i + 1),
        None => String::new(),
    }
}

impl Error {
    /// Checks whether this error is the result of cancellation
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
