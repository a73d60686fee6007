#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("archive write failed: {0}")]
    ArchiveWriteFailed(String),

    #[error("archive has no metadata member")]
    MissingMetadata,

    #[error("invalid format info: {0}")]
    InvalidFormatInfo(String),

    #[error("not a recognized document format")]
    InvalidFormat,

    #[error("metadata decoding failed: {0}")]
    MetadataDecodingFailed(#[source] serde_json::Error),

    #[error("payload not available yet")]
    PayloadUnavailable,

    #[error("page {page} is outside 1..={page_count}")]
    PageOutOfRange { page: u32, page_count: u32 },

    #[error("recognition error: {0}")]
    Recognition(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    General(String),
}

impl AppError {
    /// Errors that clear up on their own and are worth another attempt on the next scan.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PayloadUnavailable | Self::Recognition(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
