use thiserror::Error;

/// Failures raised at the wire-library boundary. The library reports usage
/// and configuration problems separately; both are logged and counted at
/// the session boundary, never propagated out of a cycle.
#[derive(Error, Debug, Clone)]
pub enum WireError {
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Failures observed while fetching and vetting one upstream response.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("status code {0}")]
    Status(u16),
    #[error("content-type \"{0}\"")]
    ContentType(String),
    #[error("content size {got} below configured minimum {minimum}")]
    TooSmall { got: usize, minimum: usize },
    #[error("response body exceeds {0} bytes")]
    Oversize(usize),
    #[error("payload magic number mismatch")]
    BadMagic,
    #[error("filetime clock offset {offset}s breaches panic threshold {threshold}s")]
    ClockPanic { offset: i64, threshold: i64 },
    #[error("malformed payload: {0}")]
    Malformed(#[from] ParseError),
}

impl FetchError {
    /// Permanent failures are dropped from the retry carousel for the rest
    /// of the cycle; everything else stays queued.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FetchError::Status(400..=499) | FetchError::ContentType(_) | FetchError::Oversize(_)
        )
    }
}

/// Bulletin payload rejections; the whole response is discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing timestamp header")]
    MissingHeader,
    #[error("malformed header \"{0}\"")]
    MalformedHeader(String),
    #[error("unparseable timestamp \"{0}\"")]
    BadTimestamp(String),
    #[error("malformed table header \"{0}\"")]
    MalformedColumns(String),
}
