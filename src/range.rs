//! Byte-range parsing and range-aware file responses.
//!
//! Serving is a seek plus a bounded read; the artifact is never pulled into
//! memory whole. A malformed `Range` header is a 400, never a silent
//! fallback to the full body, and a start past the end of the file is a 416
//! with `Content-Range: bytes */<size>`.

use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use mime_guess::MimeGuess;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::StreamError;

/// One inclusive byte range, already validated against the artifact size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered, inclusive of both endpoints.
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Parses a `bytes=<start>-<end>` header against a file of `size` bytes.
    /// Supports the open-ended (`bytes=N-`) and suffix (`bytes=-N`) forms.
    /// Multiple ranges are not supported and parse as malformed.
    pub fn parse(header: &str, size: u64) -> Result<Self, StreamError> {
        let malformed = || StreamError::MalformedRange(header.to_owned());

        let spec = header.strip_prefix("bytes=").ok_or_else(malformed)?;
        if spec.contains(',') {
            return Err(malformed());
        }
        let (start_raw, end_raw) = spec.split_once('-').ok_or_else(malformed)?;

        let (start, end) = match (start_raw.is_empty(), end_raw.is_empty()) {
            // bytes=-N : the last N bytes.
            (true, false) => {
                let suffix: u64 = end_raw.parse().map_err(|_| malformed())?;
                if suffix == 0 || size == 0 {
                    return Err(StreamError::RangeNotSatisfiable { start: size, size });
                }
                (size.saturating_sub(suffix), size - 1)
            }
            // bytes=N- : from N to the end.
            (false, true) => {
                let start: u64 = start_raw.parse().map_err(|_| malformed())?;
                (start, size.saturating_sub(1))
            }
            (false, false) => {
                let start: u64 = start_raw.parse().map_err(|_| malformed())?;
                let end: u64 = end_raw.parse().map_err(|_| malformed())?;
                if start > end {
                    return Err(malformed());
                }
                (start, end)
            }
            (true, true) => return Err(malformed()),
        };

        if start >= size {
            return Err(StreamError::RangeNotSatisfiable { start, size });
        }

        Ok(Self {
            start,
            end: end.min(size - 1),
        })
    }
}

/// Streams `path`, honoring an optional `Range` header.
///
/// Returns the 416 response directly (the request was well-formed, the file
/// just is not that big); a malformed header propagates as an error for the
/// caller's uniform status mapping.
pub async fn file_response(
    path: &Path,
    range_header: Option<&str>,
) -> Result<Response, StreamError> {
    let mut file = File::open(path)
        .await
        .map_err(|err| StreamError::filesystem(path, &err))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| StreamError::filesystem(path, &err))?
        .len();
    let mime = MimeGuess::from_path(path).first_or_octet_stream();

    let Some(header_value) = range_header else {
        let stream = ReaderStream::new(file);
        return Ok(build_response(
            StatusCode::OK,
            &mime,
            size,
            None,
            Body::from_stream(stream),
        ));
    };

    let range = match ByteRange::parse(header_value, size) {
        Ok(range) => range,
        Err(StreamError::RangeNotSatisfiable { .. }) => {
            return Ok(unsatisfiable_response(size));
        }
        Err(err) => return Err(err),
    };

    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(|err| StreamError::filesystem(path, &err))?;
    let stream = ReaderStream::new(file.take(range.byte_count()));

    Ok(build_response(
        StatusCode::PARTIAL_CONTENT,
        &mime,
        range.byte_count(),
        Some(format!("bytes {}-{}/{}", range.start, range.end, size)),
        Body::from_stream(stream),
    ))
}

fn build_response(
    status: StatusCode,
    mime: &mime_guess::mime::Mime,
    content_length: u64,
    content_range: Option<String>,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length.to_string());
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn unsatisfiable_response(size: u64) -> Response {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{size}"))
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const CONTENT: &str = "hello-world"; // 11 bytes

    fn write_sample(dir: &Path) -> PathBuf {
        let path = dir.join("comedy.mp4");
        std::fs::write(&path, CONTENT).unwrap();
        path
    }

    fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    #[test]
    fn parse_accepts_bounded_range() {
        let range = ByteRange::parse("bytes=0-0", 11).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 0 });
        assert_eq!(range.byte_count(), 1);
    }

    #[test]
    fn parse_defaults_open_end_to_eof() {
        let range = ByteRange::parse("bytes=6-", 11).unwrap();
        assert_eq!(range, ByteRange { start: 6, end: 10 });
    }

    #[test]
    fn parse_clamps_end_to_eof() {
        let range = ByteRange::parse("bytes=0-999", 11).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 10 });
    }

    #[test]
    fn parse_honors_suffix_form() {
        let range = ByteRange::parse("bytes=-5", 11).unwrap();
        assert_eq!(range, ByteRange { start: 6, end: 10 });
        // Suffix longer than the file means the whole file.
        let range = ByteRange::parse("bytes=-100", 11).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 10 });
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        for header in [
            "0-5",
            "bytes=",
            "bytes=a-b",
            "bytes=5-2",
            "bytes=1-2,4-5",
            "bytes=--3",
        ] {
            let err = ByteRange::parse(header, 11).unwrap_err();
            assert!(
                matches!(err, StreamError::MalformedRange(_)),
                "{header} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn parse_flags_start_past_eof_as_unsatisfiable() {
        let err = ByteRange::parse("bytes=11-", 11).unwrap_err();
        assert_eq!(
            err,
            StreamError::RangeNotSatisfiable {
                start: 11,
                size: 11
            }
        );
        assert!(matches!(
            ByteRange::parse("bytes=-0", 11).unwrap_err(),
            StreamError::RangeNotSatisfiable { .. }
        ));
        assert!(matches!(
            ByteRange::parse("bytes=0-", 0).unwrap_err(),
            StreamError::RangeNotSatisfiable { .. }
        ));
    }

    #[tokio::test]
    async fn no_range_returns_the_full_body() {
        let temp = tempdir().unwrap();
        let path = write_sample(temp.path());

        let response = file_response(&path, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "accept-ranges"), "bytes");
        assert_eq!(header_str(&response, "content-length"), "11");
        assert_eq!(header_str(&response, "content-type"), "video/mp4");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], CONTENT.as_bytes());
    }

    #[tokio::test]
    async fn first_byte_range_returns_206() {
        let temp = tempdir().unwrap();
        let path = write_sample(temp.path());

        let response = file_response(&path, Some("bytes=0-0")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, "content-range"), "bytes 0-0/11");
        assert_eq!(header_str(&response, "content-length"), "1");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"h");
    }

    #[tokio::test]
    async fn tail_range_returns_the_tail() {
        let temp = tempdir().unwrap();
        let path = write_sample(temp.path());

        let response = file_response(&path, Some("bytes=6-")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&response, "content-range"), "bytes 6-10/11");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"world");
    }

    #[tokio::test]
    async fn start_past_eof_returns_416() {
        let temp = tempdir().unwrap();
        let path = write_sample(temp.path());

        let response = file_response(&path, Some("bytes=11-")).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&response, "content-range"), "bytes */11");
    }

    #[tokio::test]
    async fn malformed_header_propagates_as_an_error() {
        let temp = tempdir().unwrap();
        let path = write_sample(temp.path());

        let err = file_response(&path, Some("bytes=oops"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::MalformedRange(_)));
    }

    #[tokio::test]
    async fn missing_file_is_a_filesystem_error() {
        let err = file_response(Path::new("/nonexistent/comedy.mp4"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Filesystem { .. }));
    }
}
