use std::path::PathBuf;

use thiserror::Error;

/// Configuration and consistency errors raised while building or querying a dataset.
///
/// These are always fatal: the caller has to fix the input files.
#[derive(Debug, Clone, Error)]
pub enum DatasetError {
    /// I/O failure reading a configuration or annotation file
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Source config file could not be parsed
    #[error("Invalid source config {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    /// Requested source is not present in the config file
    #[error("Unable to find source '{name}' in config file {path}")]
    UnknownSource { name: String, path: PathBuf },

    /// Annotation table has a repeated column name
    #[error("Annotations file contains duplicate header '{0}'; all headers must be unique")]
    DuplicateHeader(String),

    /// Annotation table is missing a required column
    #[error("Annotations file is missing required column '{0}'")]
    MissingColumn(String),

    /// A filter, label or blank-filter column does not exist
    #[error("Column '{0}' not found in annotations")]
    UnknownColumn(String),

    /// A filter that is not active was asked to be removed
    #[error("Filter '{name}' not found in dataset (active: {active})")]
    UnknownFilter { name: String, active: String },

    /// An annotated slide has no patient assigned
    #[error("Slide '{0}' has no patient assigned")]
    MissingPatient(String),

    /// The same slide is assigned to two different patients
    #[error("Slide '{slide}' assigned to multiple patients ({first}, {second})")]
    ConflictingPatient {
        slide: String,
        first: String,
        second: String,
    },

    /// A shard belongs to a slide with no annotation row
    #[error("Slide '{0}' has no annotation row")]
    UnannotatedSlide(String),

    /// The same slide name appears twice in the annotations
    #[error("Duplicate slide name '{0}' detected in the annotations")]
    DuplicateSlide(String),

    /// Category balancing/clipping requested on a numeric column
    #[error("Columns {0} appear to be numeric; categorical outcomes are required (pass force to override)")]
    NonCategorical(String),

    /// Values in a column could not be converted to floats
    #[error("Unable to convert all labels of '{0}' to float")]
    NonNumeric(String),

    /// An operation was called with incompatible arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Shard subfolder missing from a source
    #[error("Unable to find subfolder '{subfolder}' in source '{source_name}' ({path})")]
    MissingSubfolder {
        subfolder: String,
        source_name: String,
        path: PathBuf,
    },

    /// Manifest could not be loaded or rebuilt
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Errors from the shard record codec.
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    /// I/O failure on a shard file
    #[error("I/O error on shard {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The shard ends in the middle of a record frame
    #[error("Truncated record in {path} at byte {offset}")]
    Truncated { path: PathBuf, offset: u64 },

    /// A record payload could not be decoded
    #[error("Corrupt record in {path}: {message}")]
    CorruptRecord { path: PathBuf, message: String },

    /// The shard contains no records, so its schema cannot be detected
    #[error("Shard {0} is empty")]
    Empty(PathBuf),
}

/// Errors raised while building or persisting a manifest.
#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    /// I/O failure on a manifest file or shard directory
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Manifest JSON could not be parsed or written
    #[error("Invalid manifest {path}: {message}")]
    Json { path: PathBuf, message: String },

    /// A shard could not be counted
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),
}

/// Errors raised by the extraction scheduler and its workers.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// Neither shard nor loose tile output was requested
    #[error("Either shard or tile output must be enabled to extract tiles")]
    NoOutput,

    /// Dataset lookup failed while preparing the batch
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// Manifest refresh after extraction failed
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// A shard could not be read while exporting tiles
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// Output directory or marker I/O failed
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The slide could not be opened (bad file, missing ROI)
    #[error("Unable to load slide {slide}: {message}")]
    LoadFailed { slide: String, message: String },

    /// A tile failed to decode during extraction
    #[error("Corrupt tile in slide {0}")]
    CorruptTile(String),

    /// The worker process could not be started or exited abnormally
    #[error("Worker for slide {slide} failed: {message}")]
    Worker { slide: String, message: String },

    /// A worker report could not be parsed
    #[error("Invalid worker report for slide {slide}: {message}")]
    InvalidReport { slide: String, message: String },
}

/// Errors raised by the split planner.
#[derive(Debug, Clone, Error)]
pub enum SplitError {
    /// Underlying dataset error
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// Strategy name not recognized
    #[error("Unknown validation strategy '{0}'")]
    UnknownStrategy(String),

    /// Missing or invalid k-fold parameters
    #[error("Invalid k-fold parameters: {0}")]
    InvalidKFold(String),

    /// Validation fraction outside (0, 1)
    #[error("Validation fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),

    /// A patient has slides with different outcome labels
    #[error("Multiple outcome labels found for patient {patient} ({first}, {second})")]
    ConflictingLabels {
        patient: String,
        first: String,
        second: String,
    },

    /// A requested group would be empty
    #[error("Insufficient number of patients to generate validation dataset")]
    InsufficientPatients,

    /// A patient ended up in both training and validation
    #[error("Patient {0} is in both validation and training sets")]
    PatientLeakage(String),

    /// The site solver could not assign sites to folds
    #[error("Site solver failed: {0}")]
    SiteSolver(String),

    /// The validation plan log could not be read or written
    #[error("Validation plan log {path}: {message}")]
    PlanLog { path: PathBuf, message: String },

    /// A split view does not contain the expected number of shards
    #[error("{group} view has {actual} shards, expected {expected}")]
    ShardCountMismatch {
        group: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        DatasetError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ManifestError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ExtractError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
