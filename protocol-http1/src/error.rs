use thiserror::Error;

/// Errors surfaced by the HTTP/1.1 codec.
///
/// Parse-side errors are protocol violations by the peer; encode-side errors
/// are caller mistakes (missing pseudo-headers, conflicting framing). Both
/// are fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Malformed request or status line.
    #[error("invalid start line")]
    InvalidStartLine,
    /// Malformed header line (bad name byte, missing colon, non-UTF-8 value).
    #[error("invalid header")]
    InvalidHeader,
    /// Accumulated header block exceeds the size limit.
    #[error("headers too large")]
    HeadersTooLarge,
    /// `content-length` value is not a decimal integer.
    #[error("invalid content-length")]
    InvalidContentLength,
    /// Malformed chunk-size line in a chunked body.
    #[error("invalid chunk size")]
    InvalidChunkSize,
    /// A response arrived with no outstanding request on the client side.
    #[error("premature response")]
    PrematureResponse,
    /// Request encoding requires both `:method` and `:path`.
    #[error(":method and :path must be specified")]
    MissingRequiredHeader,
    /// Response encoding requires `:status`.
    #[error(":status must be specified")]
    MissingStatus,
    /// Caller supplied `transfer-encoding` alongside codec-inferred framing.
    #[error("conflicting body framing")]
    FramingConflict,
    /// The peer closed mid-message.
    #[error("connection closed mid-message")]
    PartialMessage,
}
