//! Error type shared by the document model, the buffer builder and the container codec

/// Errors raised while building, reading or writing glTF resources.
///
/// `Format` covers every invariant breach (alignment, min/max cardinality, dangling ids,
/// out-of-range views). I/O failures are propagated unchanged through `Io`.
#[derive(Debug, thiserror::Error)]
pub enum GltfError {
    #[error("invalid glTF: {0}")]
    Format(String),

    #[error("unsupported {kind}: {value}")]
    UnsupportedType { kind: &'static str, value: String },

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("malformed GLB container: {0}")]
    Container(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GltfError {
    pub fn format(message: impl Into<String>) -> Self {
        GltfError::Format(message.into())
    }

    pub fn unsupported_type(kind: &'static str, value: impl ToString) -> Self {
        GltfError::UnsupportedType {
            kind,
            value: value.to_string(),
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, GltfError>;
