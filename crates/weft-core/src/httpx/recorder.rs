//! Response recorder — an in-memory response under construction.
//!
//! Handlers and the dispatcher build responses through this instead of
//! a live socket: set a status, write headers, write body bytes, then
//! take the finished `http::Response`.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Response, StatusCode};

use super::body::Body;

/// Records status, headers, and body writes.
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Body,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status defaults to 200 when never set.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Insert a header, replacing earlier values. Invalid names or
    /// values are dropped silently, matching write-and-forget use.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// Append bytes to the body.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> &mut Self {
        self.body.push(chunk.into());
        self
    }

    /// Total bytes written so far.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Finish into a response.
    pub fn into_response(self) -> Response<Body> {
        let mut res = Response::new(self.body);
        *res.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *res.headers_mut() = self.headers;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_ok() {
        let rec = ResponseRecorder::new();
        let res = rec.into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.body().is_empty());
    }

    #[test]
    fn records_everything() {
        let mut rec = ResponseRecorder::new();
        rec.set_status(StatusCode::CREATED);
        rec.header("content-type", "text/plain").write("hello ").write("world");
        let res = rec.into_response();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(res.body().to_text(), "hello world");
    }
}
