use std::fmt;

/// Domain-level failure kinds returned by every fallible operation in the
/// canvas workspace. No handler mutates its input snapshot before
/// returning one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasError {
    /// Out-of-range dimensions, empty effective rectangles, unknown or
    /// invalid blend mode, malformed flag combinations.
    InvalidArgument(String),
    /// Unknown layer_id or sublayer_id.
    NotFound(String),
    /// Duplicate layer_id on create.
    AlreadyExists(String),
    /// Codec rejected the payload, size mismatch, corrupt image.
    DecodeError(String),
    /// Underlying input/output stream failed.
    IoError(String),
    /// Rasterizer pool (or other bounded scratch resource) exceeded its
    /// configured maximum.
    ResourceExhausted(String),
    /// The interpreter received a message variant it does not handle.
    UnknownMessage(String),
}

impl CanvasError {
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn already_exists(detail: impl Into<String>) -> Self {
        Self::AlreadyExists(detail.into())
    }

    pub fn decode_error(detail: impl Into<String>) -> Self {
        Self::DecodeError(detail.into())
    }

    pub fn io_error(detail: impl Into<String>) -> Self {
        Self::IoError(detail.into())
    }

    pub fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::ResourceExhausted(detail.into())
    }

    pub fn unknown_message(detail: impl Into<String>) -> Self {
        Self::UnknownMessage(detail.into())
    }
}

impl fmt::Display for CanvasError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanvasError::InvalidArgument(detail) => {
                write!(formatter, "invalid argument: {detail}")
            }
            CanvasError::NotFound(detail) => write!(formatter, "not found: {detail}"),
            CanvasError::AlreadyExists(detail) => write!(formatter, "already exists: {detail}"),
            CanvasError::DecodeError(detail) => write!(formatter, "decode error: {detail}"),
            CanvasError::IoError(detail) => write!(formatter, "io error: {detail}"),
            CanvasError::ResourceExhausted(detail) => {
                write!(formatter, "resource exhausted: {detail}")
            }
            CanvasError::UnknownMessage(detail) => write!(formatter, "unknown message: {detail}"),
        }
    }
}

impl std::error::Error for CanvasError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let error = CanvasError::not_found("layer_id=7");
        assert_eq!(error.to_string(), "not found: layer_id=7");
    }
}
