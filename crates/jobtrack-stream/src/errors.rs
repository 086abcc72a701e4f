/// Transport failure of one streaming run.
///
/// Reported at most once per run through `StreamSink::on_error`. Cancellation is
/// never reported as a `StreamError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamError {
    /// The request could not be sent or the connection could not be opened.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server answered the run-initiation request with a non-success status.
    #[error("stream request failed with status {status}")]
    Status { status: u16 },
    /// Reading the response body failed after the stream was open.
    #[error("stream read failed: {0}")]
    Read(String),
}

impl StreamError {
    /// True when the failure happened before any frame could be read.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Status { .. })
    }
}

/// Errors returned by the CRUD read side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The server answered with a non-success status.
    #[error("{detail} (status {status})")]
    Http { status: u16, detail: String },
    /// The request could not be sent or its body could not be read.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Top-level error type for the public API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobtrackError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_message_names_the_status() {
        let err = StreamError::Status { status: 500 };
        assert_eq!(err.to_string(), "stream request failed with status 500");
        assert!(err.is_connection_error());
        assert!(!StreamError::Read("reset".into()).is_connection_error());
    }

    #[test]
    fn store_error_converts_into_top_level_error() {
        let err: JobtrackError = StoreError::Http {
            status: 404,
            detail: "Job not found".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Job not found (status 404)");
    }
}
