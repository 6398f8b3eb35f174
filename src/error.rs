//! Error taxonomy shared by the cache, range, and HTTP layers.
//!
//! `StreamError` is `Clone` on purpose: a single-flight fetch publishes one
//! outcome to every waiter, so the error value has to be duplicable without
//! losing information.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The request does not resolve to any configured stream.
    #[error("unknown stream: {0}")]
    NotFound(String),

    /// The external acquisition tool failed to produce an artifact.
    #[error("fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    /// The fetch exceeded its configured bound and the tool was killed.
    #[error("fetch for {key} timed out after {seconds}s")]
    Timeout { key: String, seconds: u64 },

    /// The `Range` request header could not be parsed.
    #[error("invalid Range header: {0}")]
    MalformedRange(String),

    /// The requested range starts beyond the end of the artifact.
    #[error("range start {start} not satisfiable for size {size}")]
    RangeNotSatisfiable { start: u64, size: u64 },

    /// A disk operation on the artifact the caller is waiting for failed.
    #[error("filesystem error at {path}: {message}")]
    Filesystem { path: String, message: String },
}

impl StreamError {
    pub fn filesystem(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_input() {
        let err = StreamError::NotFound("comedy.avi".into());
        assert_eq!(err.to_string(), "unknown stream: comedy.avi");

        let err = StreamError::Timeout {
            key: "comedy.mp4".into(),
            seconds: 600,
        };
        assert!(err.to_string().contains("600s"));
    }

    #[test]
    fn filesystem_helper_keeps_the_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StreamError::filesystem("/data/streams/comedy.mp4", &io);
        assert!(err.to_string().contains("/data/streams/comedy.mp4"));
        assert!(err.to_string().contains("denied"));
    }
}
