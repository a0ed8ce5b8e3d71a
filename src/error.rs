use thiserror::Error;

/// Reasons a single flow record is skipped. None of these abort a run; they
/// only bump the ignored-flow counter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("flow start not observed (no SYN in initial flags)")]
    NoSyn,

    #[error("destination port {0} does not match the required port")]
    WrongPort(u16),

    #[error("destination behaves as a source, flow looks reversed")]
    ReversedFlow,
}

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("could not read metadata: {0}")]
    MetadataRead(String),

    #[error("unsupported filetype {0}")]
    UnsupportedFileType(String),

    #[error("decode error on line {line}: {reason}")]
    DecodeStream { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
