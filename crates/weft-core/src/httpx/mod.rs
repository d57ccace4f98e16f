//! HTTP utilities — in-memory carriers and their wire form.
//!
//! The fabric is not an HTTP server; requests and responses are used
//! purely as in-memory message carriers, serialized as RFC 7230 text
//! when they cross the broker.

pub mod body;
pub mod codec;
pub mod path;
pub mod query;
pub mod read;
pub mod recorder;

pub use body::Body;
pub use path::PathPattern;
pub use read::{read_form, read_json, read_text};
pub use recorder::ResponseRecorder;

use http::{HeaderMap, Request, Response};

/// Common face of the two carriers (request and response) for code that
/// handles either, such as the fragmenter.
pub trait Carrier: Sized + Send + 'static {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    fn body(&self) -> &Body;
    fn body_mut(&mut self) -> &mut Body;
    /// A new message with the same method/URI or status, but the given
    /// headers and body.
    fn shell(&self, headers: HeaderMap, body: Body) -> Self;
}

impl Carrier for Request<Body> {
    fn headers(&self) -> &HeaderMap {
        Request::headers(self)
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        Request::headers_mut(self)
    }

    fn body(&self) -> &Body {
        Request::body(self)
    }

    fn body_mut(&mut self) -> &mut Body {
        Request::body_mut(self)
    }

    fn shell(&self, headers: HeaderMap, body: Body) -> Self {
        let mut r = Request::new(body);
        *r.method_mut() = self.method().clone();
        *r.uri_mut() = self.uri().clone();
        *r.version_mut() = self.version();
        *r.headers_mut() = headers;
        r
    }
}

impl Carrier for Response<Body> {
    fn headers(&self) -> &HeaderMap {
        Response::headers(self)
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        Response::headers_mut(self)
    }

    fn body(&self) -> &Body {
        Response::body(self)
    }

    fn body_mut(&mut self) -> &mut Body {
        Response::body_mut(self)
    }

    fn shell(&self, headers: HeaderMap, body: Body) -> Self {
        let mut r = Response::new(body);
        *r.status_mut() = self.status();
        *r.version_mut() = self.version();
        *r.headers_mut() = headers;
        r
    }
}
