use thiserror::Error;

/// Unified error type for every decoder in this crate.
#[derive(Error, Debug)]
pub enum VDiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of data: needed {needed} bytes at offset {offset}")]
    UnexpectedEof { needed: usize, offset: usize },

    #[error("corrupt LDM database: {0}")]
    CorruptDatabase(String),

    #[error("malformed descriptor line: {0}")]
    MalformedLine(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("unknown enum token '{token}' for {field}")]
    UnknownEnum { field: &'static str, token: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("duplicate attribute extent {0}")]
    DuplicateExtent(String),

    #[error("resident attribute has no VCN to resolve")]
    ResidentHasNoVcn,

    #[error("VCN {0} is outside every extent of the attribute")]
    OutOfRange(u64),

    #[error("inconsistent attribute extents: {0}")]
    InconsistentExtents(String),
}

/// Result alias using `VDiskError`.
pub type Result<T> = std::result::Result<T, VDiskError>;
