//! Outbound messaging — unicast requests and multicast publishes.
//!
//! A call stamps the frame (message id, sender identity, call depth,
//! time budget, forwarded baggage/actor/clock shift), fragments the
//! request against the payload ceiling, publishes on the target
//! subject, and collects responses on the per-message reply subject
//! `r.<plane>.<msg-id>`.
//!
//! Large requests use a continuation handshake: fragment 1 travels on
//! the load-balanced subject; the instance that receives it acks at
//! once, and the remaining fragments are sent to that instance's
//! id-qualified direct subject so the set reassembles in one place.
//!
//! Multicasts remember who responded: the first publish to a subject
//! waits out its full budget (discovery), later ones complete as soon
//! as every known responder has acked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, Request, Response};
use rand::Rng;
use tokio::sync::mpsc;

use weft_core::frame::{names, Frame, FrameMut, OpCode};
use weft_core::fragment::{fragment, Defrag};
use weft_core::httpx::{Body, Carrier};
use weft_core::{subject, Error, Result};

use crate::connector::{Connector, DEFAULT_TIME_BUDGET, MAX_CALL_DEPTH};
use crate::context::Context;
use crate::transport::{DeliveryHandler, Outbound};

/// Fresh random message / instance id.
pub(crate) fn new_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// An outbound request under construction.
pub struct Req {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
    budget: Option<Duration>,
}

impl Req {
    pub fn new(method: Method, url: &str) -> Req {
        Req {
            method,
            url: url.to_string(),
            headers: HeaderMap::new(),
            body: Body::empty(),
            budget: None,
        }
    }

    pub fn get(url: &str) -> Req {
        Req::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Req {
        Req::new(Method::POST, url)
    }

    pub fn put(url: &str) -> Req {
        Req::new(Method::PUT, url)
    }

    pub fn delete(url: &str) -> Req {
        Req::new(Method::DELETE, url)
    }

    pub fn patch(url: &str) -> Req {
        Req::new(Method::PATCH, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Req {
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::try_from(name),
            http::header::HeaderValue::from_str(value),
        ) {
            self.headers.append(n, v);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Req {
        self.body = body.into();
        self
    }

    /// JSON body with content type.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Req> {
        let raw = serde_json::to_vec(value)?;
        self.body = raw.into();
        Ok(self.header("content-type", "application/json"))
    }

    /// Override the default time budget for this call.
    pub fn budget(mut self, d: Duration) -> Req {
        self.budget = Some(d);
        self
    }

    /// Append a deep-object query string built from a JSON object.
    pub fn query_obj(mut self, value: &serde_json::Value) -> Req {
        let encoded = weft_core::httpx::query::encode(value);
        if !encoded.is_empty() {
            let sep = if self.url.contains('?') { '&' } else { '?' };
            self.url = format!("{}{sep}{encoded}", self.url);
        }
        self
    }

    pub fn baggage(mut self, name: &str, value: &str) -> Req {
        FrameMut::of(&mut self.headers).set_baggage(name, value);
        self
    }

    /// Attach actor claims to this call explicitly (instead of
    /// inheriting the ambient ones).
    pub fn actor<T: serde::Serialize>(mut self, claims: &T) -> Result<Req> {
        FrameMut::of(&mut self.headers).set_actor(claims)?;
        Ok(self)
    }
}

/// One event on a reply subject.
enum ReplyEvent {
    Res(Response<Body>, String),
    Failed(Error, String),
    Ack(String),
}

/// A prepared outbound call.
struct Prepared {
    subject: String,
    msg_id: String,
    budget: Duration,
    frags: Vec<Request<Body>>,
    plane: String,
    port: u16,
    target_host: String,
    method: String,
    path: String,
}

impl Prepared {
    /// The id-qualified subject of one specific instance.
    fn direct_subject(&self, instance_id: &str) -> String {
        subject::for_request(
            &self.plane,
            self.port,
            &format!("{instance_id}.{}", self.target_host),
            &self.method,
            &self.path,
        )
    }
}

/// Lazy sequence of multicast responses. Ends when every known
/// responder acked or the budget lapsed.
pub struct Responses {
    rx: mpsc::UnboundedReceiver<Result<Response<Body>>>,
}

impl Responses {
    /// The next response, in arrival order. `None` ends the sequence.
    pub async fn next(&mut self) -> Option<Result<Response<Body>>> {
        self.rx.recv().await
    }

    /// Drain the sequence, keeping successful responses and surfacing
    /// the first error.
    pub async fn collect(mut self) -> Result<Vec<Response<Body>>> {
        let mut out = Vec::new();
        let mut first_err = None;
        while let Some(item) = self.next().await {
            match item {
                Ok(res) => out.push(res),
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

impl Connector {
    /// Unicast request-response. Exactly one subscriber serves it; the
    /// response (or the error it carried) comes back.
    pub async fn request(&self, ctx: &Context, req: Req) -> Result<Response<Body>> {
        let active = self.active()?;
        let mut prepared = self.prepare(ctx, req, &active.cfg.plane, &active.cfg.locality, active.transport.max_payload())?;
        let reply_subject = subject::for_reply(&prepared.plane, &prepared.msg_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply_sub = active.transport.subscribe(&reply_subject, reply_handler(tx)).await?;

        let counters = &self.inner.counters;
        crate::stats::Counters::bump(&counters.outbound_requests);
        if prepared.frags.len() > 1 {
            crate::stats::Counters::add(&counters.fragments_sent, prepared.frags.len() as u64);
        }

        let deadline = tokio::time::Instant::now() + prepared.budget;
        let mut rest: Vec<Request<Body>> = prepared.frags.split_off(1);
        let first = match prepared.frags.pop() {
            Some(f) => f,
            None => {
                active.transport.unsubscribe(&reply_sub);
                return Err(Error::new("empty fragmentation"));
            }
        };

        let outcome = match active
            .transport
            .request(&prepared.subject, Outbound::Request(first))
            .await
        {
            Err(e) => Err(e),
            Ok(()) => loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Err(_) => break Err(Error::timeout()),
                    Ok(None) => break Err(Error::new("reply stream closed")),
                    Ok(Some(ReplyEvent::Ack(from))) => {
                        // Continuation: route the rest to the instance
                        // that took fragment 1.
                        if !rest.is_empty() {
                            let chunks = std::mem::take(&mut rest);
                            let direct = prepared.direct_subject(&from);
                            if let Err(e) = send_all(&active, &direct, chunks).await {
                                break Err(e);
                            }
                        }
                    }
                    Ok(Some(ReplyEvent::Failed(e, _))) => break Err(e),
                    Ok(Some(ReplyEvent::Res(res, _))) => break Ok(res),
                }
            },
        };
        active.transport.unsubscribe(&reply_sub);
        outcome
    }

    /// Multicast publish. Responses stream in until every known
    /// responder acked or the budget lapses.
    pub async fn publish(&self, ctx: &Context, req: Req) -> Result<Responses> {
        let active = self.active()?;
        let mut prepared = self.prepare(ctx, req, &active.cfg.plane, &active.cfg.locality, active.transport.max_payload())?;
        let reply_subject = subject::for_reply(&prepared.plane, &prepared.msg_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply_sub = active.transport.subscribe(&reply_subject, reply_handler(tx)).await?;

        crate::stats::Counters::bump(&self.inner.counters.outbound_publishes);
        let rest: Vec<Request<Body>> = prepared.frags.split_off(1);
        let first = match prepared.frags.pop() {
            Some(f) => f,
            None => {
                active.transport.unsubscribe(&reply_sub);
                return Err(Error::new("empty fragmentation"));
            }
        };
        if let Err(e) = active.transport.publish(&prepared.subject, Outbound::Request(first)).await
        {
            active.transport.unsubscribe(&reply_sub);
            return Err(e);
        }

        let known: HashSet<String> = self
            .inner
            .responders
            .get(&prepared.subject)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = self.clone();
        let deadline = tokio::time::Instant::now() + prepared.budget;
        tokio::spawn(async move {
            let mut final_acked: HashSet<String> = HashSet::new();
            let mut continued: HashSet<String> = HashSet::new();
            let mut responded: HashSet<String> = HashSet::new();
            loop {
                let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Err(_) => break,
                    Ok(None) => break,
                    Ok(Some(ev)) => ev,
                };
                match event {
                    ReplyEvent::Ack(from) => {
                        if !rest.is_empty() && continued.insert(from.clone()) {
                            let direct = prepared.direct_subject(&from);
                            let chunks: Vec<Request<Body>> =
                                rest.iter().map(clone_request).collect();
                            if let Err(e) = send_all(&active, &direct, chunks).await {
                                tracing::warn!(error = %e, "fragment continuation failed");
                            }
                        } else {
                            final_acked.insert(from);
                            if !known.is_empty()
                                && known.iter().all(|k| final_acked.contains(k))
                            {
                                break;
                            }
                        }
                    }
                    ReplyEvent::Failed(e, from) => {
                        responded.insert(from);
                        let _ = out_tx.send(Err(e));
                    }
                    ReplyEvent::Res(res, from) => {
                        responded.insert(from);
                        let _ = out_tx.send(Ok(res));
                    }
                }
            }
            // Remember this round's responders for the next multicast.
            let seen: HashSet<String> = final_acked.union(&responded).cloned().collect();
            if !seen.is_empty() {
                conn.inner.responders.insert(prepared.subject.clone(), seen);
            }
            active.transport.unsubscribe(&reply_sub);
        });

        Ok(Responses { rx: out_rx })
    }

    /// Stamp the frame, enforce depth and budget, fragment.
    fn prepare(
        &self,
        ctx: &Context,
        req: Req,
        plane: &str,
        locality: &str,
        max_payload: usize,
    ) -> Result<Prepared> {
        let url: url::Url = req.url.parse()?;
        let target_host = url.host_str().ok_or_else(|| Error::bad_request("URL without host"))?.to_string();
        subject::validate_host(&target_host)?;
        let port = url.port().unwrap_or(subject::DEFAULT_PORT);
        let path = url.path().to_string();
        let method = req.method.as_str().to_string();
        let subj = subject::for_request(plane, port, &target_host, &method, &path);

        let parent = ctx.frame();
        let depth = parent.call_depth() + 1;
        if depth > MAX_CALL_DEPTH {
            return Err(Error::cycle(depth));
        }
        let mut budget = req.budget.unwrap_or(DEFAULT_TIME_BUDGET);
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Err(Error::timeout());
            }
            budget = budget.min(remaining);
        }

        let mut hreq = Request::new(req.body);
        *hreq.method_mut() = req.method;
        *hreq.uri_mut() = req
            .url
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::bad_request(e.to_string()))?;
        *hreq.headers_mut() = req.headers;

        let msg_id = new_id();
        {
            let mut f = FrameMut::of(hreq.headers_mut());
            f.set_msg_id(&msg_id);
            f.set_op_code(OpCode::Req);
            f.set_call_depth(depth);
            f.set_time_budget(budget);
            if !locality.is_empty() {
                f.set_locality(locality);
            }
        }
        {
            // FrameMut borrows headers mutably; identity reads borrow
            // self, so stamp in a second scope.
            let host = self.hostname().to_string();
            let id = self.id().to_string();
            let version = self.version();
            let mut f = FrameMut::of(hreq.headers_mut());
            f.set_from_host(&host);
            f.set_from_id(&id);
            f.set_from_version(version);
        }

        // Ambient propagation: baggage, actor, and clock shift flow to
        // the downstream frame unless this call set its own.
        let shift = parent.clock_shift_ms();
        let parent_actor = parent.actor_raw().map(str::to_string);
        let parent_baggage = parent.baggage_all();
        {
            let headers = hreq.headers_mut();
            for (name, value) in parent_baggage {
                let full = format!("{}{}", names::BAGGAGE_PREFIX, name);
                if !headers.contains_key(full.as_str()) {
                    FrameMut::of(headers).set_baggage(&name, &value);
                }
            }
            let mut f = FrameMut::of(headers);
            if f.read().actor_raw().is_none() {
                if let Some(raw) = parent_actor {
                    f.set_actor_raw(&raw);
                }
            }
            if shift != 0 {
                f.set_clock_shift_ms(shift);
            }
        }

        let frags = fragment(hreq, frag_budget(max_payload))?;
        Ok(Prepared {
            subject: subj,
            msg_id,
            budget,
            frags,
            plane: plane.to_string(),
            port,
            target_host,
            method,
            path,
        })
    }
}

/// Fragment budget: three quarters of the payload ceiling, leaving
/// headroom for the head section.
pub(crate) fn frag_budget(max_payload: usize) -> usize {
    (max_payload / 4) * 3
}

fn reply_handler(tx: mpsc::UnboundedSender<ReplyEvent>) -> DeliveryHandler {
    let defrag: Arc<Defrag<Response<Body>>> = Arc::new(Defrag::new());
    Arc::new(move |delivery| {
        let res = match delivery.into_response() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable reply dropped");
                return;
            }
        };
        let frame = Frame::of(res.headers());
        let from = frame.from_id().unwrap_or("").to_string();
        match frame.op_code() {
            OpCode::Ack => {
                let _ = tx.send(ReplyEvent::Ack(from));
            }
            OpCode::Err => {
                let status = res.status().as_u16();
                let err = Error::from_json(&res.body().to_bytes(), status);
                let _ = tx.send(ReplyEvent::Failed(err, from));
            }
            _ => {
                // Responses from distinct responders interleave on the
                // same reply subject; key reassembly by responder.
                let key = format!("{}|{from}", frame.msg_id().unwrap_or(""));
                match defrag.add(&key, res) {
                    Ok(Some(full)) => {
                        let _ = tx.send(ReplyEvent::Res(full, from));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(ReplyEvent::Failed(e.into(), from));
                    }
                }
            }
        }
    })
}

async fn send_all(
    active: &crate::connector::Active,
    subject: &str,
    chunks: Vec<Request<Body>>,
) -> Result<()> {
    for chunk in chunks {
        active.transport.request(subject, Outbound::Request(chunk)).await?;
    }
    Ok(())
}

pub(crate) fn clone_request(r: &Request<Body>) -> Request<Body> {
    r.shell(r.headers().clone(), r.body().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_hex() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn frag_budget_leaves_headroom() {
        assert_eq!(frag_budget(1024 * 1024), 768 * 1024);
        assert!(frag_budget(100) < 100);
    }

    #[test]
    fn req_builder_accumulates() {
        let r = Req::get("https://echo.test/x")
            .header("x-a", "1")
            .baggage("tenant", "acme")
            .body("hi")
            .budget(Duration::from_secs(3));
        assert_eq!(r.method, Method::GET);
        assert_eq!(r.headers.get("x-a").unwrap(), "1");
        assert_eq!(r.headers.get("microbus-baggage-tenant").unwrap(), "acme");
        assert_eq!(r.body.to_text(), "hi");
        assert_eq!(r.budget, Some(Duration::from_secs(3)));
    }
}
