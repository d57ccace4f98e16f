//! HTTP/1.1 wire codec for the broker payload.
//!
//! Outbound messages are written as RFC 7230 text — requests in proxy
//! (absolute-URI) form, responses as status line + headers — with no
//! extra framing. `Content-Length` always reflects the actual body so
//! the receiving side never needs chunked decoding.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

use super::body::Body;
use crate::error::{Error, Result};

const MAX_HEADERS: usize = 128;

/// Does this buffer start a response (status line) rather than a request?
pub fn is_response(b: &[u8]) -> bool {
    b.starts_with(b"HTTP/")
}

/// Serialize a request in proxy form.
pub fn write_request(req: &Request<Body>) -> Bytes {
    let mut buf = Vec::with_capacity(req.body().len() + 512);
    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(req.uri().to_string().as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    if !req.headers().contains_key(HOST) {
        if let Some(a) = req.uri().authority() {
            buf.extend_from_slice(b"host: ");
            buf.extend_from_slice(a.as_str().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
    write_headers(req.headers(), req.body().len(), &mut buf);
    for part in req.body().parts() {
        buf.extend_from_slice(part);
    }
    Bytes::from(buf)
}

/// Serialize a response.
pub fn write_response(res: &Response<Body>) -> Bytes {
    let mut buf = Vec::with_capacity(res.body().len() + 256);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(res.status().as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(
        res.status().canonical_reason().unwrap_or("Unknown").as_bytes(),
    );
    buf.extend_from_slice(b"\r\n");
    write_headers(res.headers(), res.body().len(), &mut buf);
    for part in res.body().parts() {
        buf.extend_from_slice(part);
    }
    Bytes::from(buf)
}

fn write_headers(headers: &HeaderMap, body_len: usize, buf: &mut Vec<u8>) {
    for (name, value) in headers {
        if name == &CONTENT_LENGTH {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(body_len.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
}

/// Parse a request off the wire.
pub fn parse_request(raw: Bytes) -> Result<Request<Body>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    let consumed = match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(Error::bad_request("truncated request head"))
        }
        Err(e) => return Err(Error::bad_request(format!("malformed request: {e}"))),
    };

    let mut req = Request::new(Body::empty());
    *req.method_mut() = Method::from_bytes(parsed.method.unwrap_or("GET").as_bytes())
        .map_err(|e| Error::bad_request(e.to_string()))?;
    *req.uri_mut() = parsed
        .path
        .unwrap_or("/")
        .parse::<Uri>()
        .map_err(|e| Error::bad_request(e.to_string()))?;
    *req.version_mut() = Version::HTTP_11;
    fill_headers(req.headers_mut(), parsed.headers);
    *req.body_mut() = sliced_body(&raw, consumed, req.headers());
    Ok(req)
}

/// Parse a response off the wire.
pub fn parse_response(raw: Bytes) -> Result<Response<Body>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);
    let consumed = match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(Error::bad_request("truncated response head"))
        }
        Err(e) => return Err(Error::bad_request(format!("malformed response: {e}"))),
    };

    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::from_u16(parsed.code.unwrap_or(200))
        .map_err(|e| Error::bad_request(e.to_string()))?;
    *res.version_mut() = Version::HTTP_11;
    fill_headers(res.headers_mut(), parsed.headers);
    *res.body_mut() = sliced_body(&raw, consumed, res.headers());
    Ok(res)
}

fn fill_headers(dst: &mut HeaderMap, src: &[httparse::Header<'_>]) {
    for h in src {
        let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_bytes(h.value) else {
            continue;
        };
        // append keeps duplicates (multiple baggage headers, cookies).
        dst.append(name, value);
    }
}

fn sliced_body(raw: &Bytes, consumed: usize, headers: &HeaderMap) -> Body {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());
    let end = match declared {
        Some(n) => (consumed + n).min(raw.len()),
        None => raw.len(),
    };
    if end <= consumed {
        Body::empty()
    } else {
        raw.slice(consumed..end).into()
    }
}
